use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use config::{Config, Environment, File as ConfigFile};
use filemesh_rpc::{ClientTimeouts, MAX_CHUNK_SIZE, MIN_CHUNK_SIZE};
use filemesh_storage::{LocalConfig, S3Config, StorageConfig};

pub const DEFAULT_CONFIG_PATH: &str = "./filemesh.toml";
pub const ENV_PREFIX: &str = "FILEMESH";

#[derive(Debug, Clone)]
pub struct AppConfig {
    // Node identity
    pub node_name: String,

    // Coordination store
    pub etcd_endpoint: String,
    pub advertise_address: String,
    pub ttl_secs: u64,
    pub dial_timeout_secs: u64,
    pub key_prefix: String,

    // File service
    pub rpc_listen: String,
    pub chunk_size: usize,
    pub list_timeout_secs: u64,
    pub download_timeout_secs: u64,

    // Storage
    pub storage: StorageConfig,
    pub data_root: PathBuf,

    // Logging
    pub log_level: String,
    pub log_format: String,

    // Observability
    pub prometheus_listen: Option<String>,
}

impl AppConfig {
    /// Reads the config file (explicit path, or `./filemesh.toml` when it
    /// exists) layered under `FILEMESH_*` environment variables.
    pub fn load(config_path_override: Option<&Path>) -> Result<Self> {
        let resolved_path = match config_path_override {
            Some(path) => {
                if !path.exists() {
                    anyhow::bail!(
                        "Configuration file {} not found (specified via --config)",
                        path.display()
                    );
                }
                Some(path.to_path_buf())
            }
            None => Some(PathBuf::from(DEFAULT_CONFIG_PATH)).filter(|path| path.exists()),
        };

        let mut builder = Config::builder();
        if let Some(path) = &resolved_path {
            builder = builder.add_source(ConfigFile::from(path.as_path()));
        }
        // FILEMESH_ETCD__ENDPOINT -> etcd.endpoint
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__"),
        );

        let config = builder.build().context("failed to read configuration")?;
        Self::from_config(&config)
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let advertise_address = get_string_value(config, "etcd.address").unwrap_or_default();
        let rpc_listen =
            get_string_value(config, "rpc.listen").unwrap_or_else(|| advertise_address.clone());

        Ok(Self {
            node_name: get_string_value(config, "node.name").unwrap_or_default(),
            etcd_endpoint: get_string_value(config, "etcd.endpoint")
                .unwrap_or_else(|| "http://127.0.0.1:2379".to_string()),
            advertise_address,
            ttl_secs: get_u64_value(config, "etcd.ttl", 10)?,
            dial_timeout_secs: get_u64_value(config, "etcd.dial_timeout", 5)?,
            key_prefix: get_string_value(config, "etcd.key_prefix").unwrap_or_default(),
            rpc_listen,
            chunk_size: get_u64_value(config, "rpc.chunk_size", 64 * 1024)? as usize,
            list_timeout_secs: get_u64_value(config, "rpc.list_timeout", 5)?,
            download_timeout_secs: get_u64_value(config, "rpc.download_timeout", 30)?,
            storage: storage_config(config)?,
            data_root: get_string_value(config, "storage.data_root")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data")),
            log_level: get_string_value(config, "log.level").unwrap_or_else(|| "info".to_string()),
            log_format: get_string_value(config, "log.format")
                .unwrap_or_else(|| "compact".to_string()),
            prometheus_listen: get_string_value(config, "metrics.prometheus_listen"),
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.node_name.is_empty() {
            anyhow::bail!("node.name must not be empty");
        }
        if self.node_name.contains('/') {
            anyhow::bail!("node.name must not contain '/'");
        }
        if self.advertise_address.is_empty() {
            anyhow::bail!("etcd.address must not be empty");
        }
        if self.rpc_listen.is_empty() {
            anyhow::bail!("rpc.listen must not be empty");
        }
        if self.ttl_secs == 0 {
            anyhow::bail!("etcd.ttl must be greater than zero");
        }
        if !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&self.chunk_size) {
            anyhow::bail!(
                "rpc.chunk_size must be between {MIN_CHUNK_SIZE} and {MAX_CHUNK_SIZE} bytes"
            );
        }
        if !matches!(self.log_format.as_str(), "compact" | "pretty") {
            anyhow::bail!("log.format must be 'compact' or 'pretty'");
        }
        self.storage
            .validate()
            .context("invalid storage configuration")?;
        Ok(())
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn client_timeouts(&self) -> ClientTimeouts {
        ClientTimeouts {
            list: Duration::from_secs(self.list_timeout_secs),
            download: Duration::from_secs(self.download_timeout_secs),
        }
    }
}

fn storage_config(config: &Config) -> Result<StorageConfig> {
    let kind = get_string_value(config, "storage.type").unwrap_or_else(|| "local".to_string());
    match kind.to_lowercase().as_str() {
        "local" => Ok(StorageConfig::Local(LocalConfig {
            root: get_string_value(config, "storage.local_root")
                .map(PathBuf::from)
                .unwrap_or_else(|| LocalConfig::default().root),
        })),
        "s3" => {
            let bucket = get_string_value(config, "storage.s3.bucket")
                .context("storage.s3.bucket is required for the s3 backend")?;
            let region = get_string_value(config, "storage.s3.region")
                .context("storage.s3.region is required for the s3 backend")?;
            Ok(StorageConfig::S3(S3Config {
                bucket,
                region,
                prefix: get_string_value(config, "storage.s3.prefix").unwrap_or_default(),
                access_key_id: get_string_value(config, "storage.s3.access_key_id"),
                secret_access_key: get_string_value(config, "storage.s3.secret_access_key"),
                endpoint: get_string_value(config, "storage.s3.endpoint"),
                force_path_style: get_bool_value(config, "storage.s3.force_path_style", false),
            }))
        }
        other => anyhow::bail!("unknown storage.type '{other}' (expected 'local' or 's3')"),
    }
}

fn get_string_value(config: &Config, key: &str) -> Option<String> {
    config
        .get_string(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn get_u64_value(config: &Config, key: &str, default: u64) -> Result<u64> {
    match get_string_value(config, key) {
        Some(raw) => raw
            .parse()
            .with_context(|| format!("{key} must be a non-negative integer, got '{raw}'")),
        None => Ok(default),
    }
}

fn get_bool_value(config: &Config, key: &str, default: bool) -> bool {
    if let Ok(value) = config.get_bool(key) {
        return value;
    }
    get_string_value(config, key)
        .and_then(|raw| raw.parse::<bool>().ok())
        .unwrap_or(default)
}
