//! Backend construction from configuration.

use std::path::PathBuf;
use std::sync::Arc;

use object_store::aws::AmazonS3Builder;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, StorageError};
use crate::{LocalStorage, ObjectStoreStorage, StorageBackend};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StorageConfig {
    Local(LocalConfig),
    S3(S3Config),
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::Local(LocalConfig::default())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalConfig {
    pub root: PathBuf,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./storage"),
        }
    }
}

/// S3 settings. Credentials left unset fall back to the default AWS chain
/// (environment, profile, instance metadata).
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct S3Config {
    pub bucket: String,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub access_key_id: Option<String>,
    #[serde(default)]
    pub secret_access_key: Option<String>,
    /// Custom endpoint for S3-compatible services (MinIO, LocalStack).
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub force_path_style: bool,
}

impl std::fmt::Debug for S3Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Config")
            .field("bucket", &self.bucket)
            .field("region", &self.region)
            .field("prefix", &self.prefix)
            .field("access_key_id", &self.access_key_id)
            .field(
                "secret_access_key",
                &self.secret_access_key.as_ref().map(|_| "<redacted>"),
            )
            .field("endpoint", &self.endpoint)
            .field("force_path_style", &self.force_path_style)
            .finish()
    }
}

fn default_region() -> String {
    "us-east-1".to_string()
}

impl StorageConfig {
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Local(local) if local.root.as_os_str().is_empty() => Err(
                StorageError::InvalidConfig("local storage root must not be empty".to_string()),
            ),
            Self::S3(s3) if s3.bucket.trim().is_empty() => Err(StorageError::InvalidConfig(
                "s3 bucket must not be empty".to_string(),
            )),
            Self::S3(s3)
                if s3.access_key_id.is_some() != s3.secret_access_key.is_some() =>
            {
                Err(StorageError::InvalidConfig(
                    "s3 access_key_id and secret_access_key must be set together".to_string(),
                ))
            }
            _ => Ok(()),
        }
    }
}

/// Builds the backend described by `config`.
pub fn build_backend(config: &StorageConfig) -> Result<StorageBackend> {
    config.validate()?;
    let backend: StorageBackend = match config {
        StorageConfig::Local(local) => LocalStorage::new(&local.root)?.into(),
        StorageConfig::S3(s3) => build_s3(s3)?.into(),
    };
    info!(kind = backend.kind(), root = %backend.get_root(), "storage backend ready");
    Ok(backend)
}

fn build_s3(config: &S3Config) -> Result<ObjectStoreStorage> {
    let mut builder = AmazonS3Builder::from_env()
        .with_bucket_name(&config.bucket)
        .with_region(&config.region)
        .with_virtual_hosted_style_request(!config.force_path_style);

    if let (Some(key_id), Some(secret)) = (&config.access_key_id, &config.secret_access_key) {
        builder = builder
            .with_access_key_id(key_id)
            .with_secret_access_key(secret);
    }
    if let Some(endpoint) = &config.endpoint {
        builder = builder
            .with_endpoint(endpoint)
            .with_allow_http(endpoint.starts_with("http://"));
    }

    let store = builder
        .build()
        .map_err(|err| StorageError::InvalidConfig(format!("s3: {err}")))?;
    Ok(ObjectStoreStorage::new(
        Arc::new(store),
        "s3",
        config.bucket.clone(),
        &config.prefix,
    ))
}
