//! Object storage access.
//!
//! The handler only sees the [`ObjectStore`] trait; `S3Store` talks to S3 (or
//! any S3-compatible endpoint) and `DirStore` maps buckets onto local
//! directories.

mod dir;
mod s3;

use std::io;
use std::path::Path;

use async_trait::async_trait;
use thiserror::Error;

pub use dir::DirStore;
pub use s3::S3Store;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object `{bucket}/{key}` not found")]
    NotFound { bucket: String, key: String },

    #[error("storage backend error: {0}")]
    Backend(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch `bucket/key` and write it to `dest`, replacing its contents.
    async fn download(&self, bucket: &str, key: &str, dest: &Path) -> Result<(), StoreError>;

    async fn upload(
        &self,
        bucket: &str,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
    ) -> Result<(), StoreError>;

    async fn delete(&self, bucket: &str, key: &str) -> Result<(), StoreError>;
}
