//! Environment-sourced storage configuration.

use std::path::Path;

use log::{info, warn};
use thiserror::Error;

pub const BUCKET_VAR: &str = "S3_BUCKET";
pub const ACCESS_KEY_VAR: &str = "ACCESS_KEY_ID";
pub const SECRET_KEY_VAR: &str = "SECRET_KEY_ID";
pub const REGION_VAR: &str = "S3_REGION";
pub const ENDPOINT_VAR: &str = "S3_ENDPOINT";

pub const DEFAULT_REGION: &str = "us-east-1";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required environment variable `{0}`")]
    Missing(&'static str),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreConfig {
    pub bucket: String,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub region: String,
    /// Custom endpoint for S3-compatible stores
    pub endpoint: Option<String>,
}

impl StoreConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the config from an arbitrary variable source. Empty values
    /// count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        Ok(StoreConfig {
            bucket: get(BUCKET_VAR).ok_or(ConfigError::Missing(BUCKET_VAR))?,
            access_key_id: get(ACCESS_KEY_VAR),
            secret_access_key: get(SECRET_KEY_VAR),
            region: get(REGION_VAR).unwrap_or_else(|| DEFAULT_REGION.to_owned()),
            endpoint: get(ENDPOINT_VAR),
        })
    }
}

/// Loads `path` into the process environment, keeping variables that are
/// already set. A missing file is not an error.
pub fn load_env_file(path: &Path) -> bool {
    match dotenvy::from_path(path) {
        Ok(()) => {
            info!("Loaded environment from {:?}", path);
            true
        }
        Err(e) => {
            warn!("Could not load environment file {:?}: {}", path, e);
            false
        }
    }
}
