use std::path::Path;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use log::{debug, info};

use super::{ObjectStore, StoreError};
use crate::config::StoreConfig;

const CREDENTIALS_PROVIDER: &str = "cifar-serve-env";

/// S3 (or S3-compatible) object store.
pub struct S3Store {
    client: Client,
}

impl S3Store {
    pub async fn connect(config: &StoreConfig) -> Self {
        let mut loader =
            aws_config::defaults(BehaviorVersion::latest()).region(Region::new(config.region.clone()));

        // Without explicit keys the default provider chain applies.
        if let (Some(key_id), Some(secret)) = (&config.access_key_id, &config.secret_access_key) {
            loader = loader.credentials_provider(Credentials::new(
                key_id,
                secret,
                None,
                None,
                CREDENTIALS_PROVIDER,
            ));
        }

        if let Some(endpoint) = &config.endpoint {
            info!("Using S3 endpoint {}", endpoint);
            loader = loader.endpoint_url(endpoint);
        }

        let sdk_config = loader.load().await;
        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(config.endpoint.is_some())
            .build();

        S3Store {
            client: Client::from_conf(s3_config),
        }
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn download(&self, bucket: &str, key: &str, dest: &Path) -> Result<(), StoreError> {
        let output = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| match e.as_service_error() {
                Some(err) if err.is_no_such_key() => StoreError::NotFound {
                    bucket: bucket.to_owned(),
                    key: key.to_owned(),
                },
                _ => StoreError::Backend(DisplayErrorContext(&e).to_string()),
            })?;

        let data = output
            .body
            .collect()
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?
            .into_bytes();

        debug!("Fetched {} bytes from {}/{}", data.len(), bucket, key);
        tokio::fs::write(dest, &data).await?;

        Ok(())
    }

    async fn upload(
        &self,
        bucket: &str,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
    ) -> Result<(), StoreError> {
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .content_type(content_type)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| StoreError::Backend(DisplayErrorContext(&e).to_string()))?;

        Ok(())
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<(), StoreError> {
        self.client
            .delete_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| StoreError::Backend(DisplayErrorContext(&e).to_string()))?;

        Ok(())
    }
}
