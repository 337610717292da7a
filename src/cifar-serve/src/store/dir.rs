use std::io;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use log::debug;
use tokio::fs;

use super::{ObjectStore, StoreError};

/// Object store backed by a local directory: `<root>/<bucket>/<key>`.
pub struct DirStore {
    root: PathBuf,
}

impl DirStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        DirStore { root: root.into() }
    }

    /// Resolves an object path, refusing keys that escape the bucket.
    pub fn object_path(&self, bucket: &str, key: &str) -> Result<PathBuf, StoreError> {
        let escapes = |p: &str| {
            p.is_empty()
                || Path::new(p)
                    .components()
                    .any(|c| !matches!(c, Component::Normal(_)))
        };

        if escapes(bucket) || escapes(key) {
            return Err(StoreError::Backend(format!(
                "invalid object path `{}/{}`",
                bucket, key
            )));
        }

        Ok(self.root.join(bucket).join(key))
    }

    fn map_missing(err: io::Error, bucket: &str, key: &str) -> StoreError {
        if err.kind() == io::ErrorKind::NotFound {
            StoreError::NotFound {
                bucket: bucket.to_owned(),
                key: key.to_owned(),
            }
        } else {
            StoreError::Io(err)
        }
    }
}

#[async_trait]
impl ObjectStore for DirStore {
    async fn download(&self, bucket: &str, key: &str, dest: &Path) -> Result<(), StoreError> {
        let src = self.object_path(bucket, key)?;
        debug!("Copying {:?} to {:?}", src, dest);

        fs::copy(&src, dest)
            .await
            .map_err(|e| Self::map_missing(e, bucket, key))?;

        Ok(())
    }

    async fn upload(
        &self,
        bucket: &str,
        key: &str,
        body: Vec<u8>,
        _content_type: &str,
    ) -> Result<(), StoreError> {
        let dest = self.object_path(bucket, key)?;

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&dest, body).await?;

        Ok(())
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<(), StoreError> {
        let path = self.object_path(bucket, key)?;

        fs::remove_file(&path)
            .await
            .map_err(|e| Self::map_missing(e, bucket, key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_escaping_keys() {
        let store = DirStore::new("/srv/blobs");
        assert!(store.object_path("images", "../etc/passwd").is_err());
        assert!(store.object_path("images", "/abs").is_err());
        assert!(store.object_path("..", "cat.png").is_err());
        assert!(store.object_path("images", "").is_err());
    }

    #[test]
    fn nested_keys_resolve_under_bucket() {
        let store = DirStore::new("/srv/blobs");
        let path = store.object_path("images", "results/cat.png.json").unwrap();
        assert_eq!(path, PathBuf::from("/srv/blobs/images/results/cat.png.json"));
    }

    #[tokio::test]
    async fn upload_download_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirStore::new(dir.path());

        store
            .upload("b", "nested/key.bin", b"abc".to_vec(), "application/octet-stream")
            .await
            .unwrap();

        let dest = dir.path().join("copy.bin");
        store.download("b", "nested/key.bin", &dest).await.unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"abc");

        store.delete("b", "nested/key.bin").await.unwrap();
        assert!(matches!(
            store.delete("b", "nested/key.bin").await,
            Err(StoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn missing_object_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirStore::new(dir.path());

        let err = store
            .download("b", "missing.png", &dir.path().join("out"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }
}
