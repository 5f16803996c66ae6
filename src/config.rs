use std::time::Duration;

use thiserror::Error;

use crate::mode::NodeMode;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub node: NodeConfig,
    pub storage: StorageConfig,
    pub wal: WalConfig,
    pub auth: AuthConfig,
    pub maintenance: MaintenanceConfig,
    /// Maximum upload size in bytes
    pub max_upload_size: u64,
    /// Timeout for pushing a file to another node
    pub transfer_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub bind_address: String,
    pub data_dir: String,
    pub id: String,
    /// Fixed for the lifetime of the process
    pub mode: NodeMode,
    pub capacity_bytes: u64,
    /// Declared for the registry; this node does not replicate
    pub replication_factor: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageBackend {
    Gcs,
    Local,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Directory for local storage backend
    pub local_storage_path: String,
    /// GCS bucket name (required when backend is gcs)
    pub gcs_bucket: Option<String>,
    /// Path to GCS service account JSON (optional, defaults to ADC)
    pub gcs_credentials_file: Option<String>,
}

#[derive(Debug, Clone)]
pub struct WalConfig {
    /// Resolved entries kept in the log before it is compacted
    pub compact_threshold: usize,
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// Ed25519 public key of the registry, PEM or raw
    pub public_key_file: Option<String>,
    pub required: bool,
    pub leeway_seconds: i64,
}

#[derive(Debug, Clone)]
pub struct MaintenanceConfig {
    /// `None` disables the consistency scanner
    pub consistency_scan_interval: Option<Duration>,
    /// `None` disables the retention sweeper
    pub retention_sweep_interval: Option<Duration>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Local,
            local_storage_path: "./files".to_string(),
            gcs_bucket: None,
            gcs_credentials_file: None,
        }
    }
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            compact_threshold: 1024,
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            public_key_file: None,
            required: true,
            leeway_seconds: 30,
        }
    }
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            consistency_scan_interval: Some(Duration::from_secs(6 * 3600)),
            retention_sweep_interval: Some(Duration::from_secs(3600)),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Build configuration from any variable source.
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let parsed = |key: &str, default: u64| -> u64 {
            var(key).and_then(|s| s.trim().parse().ok()).unwrap_or(default)
        };
        let flag = |key: &str, default: bool| -> bool {
            var(key)
                .map(|v| matches!(v.trim().to_lowercase().as_str(), "true" | "1" | "yes"))
                .unwrap_or(default)
        };
        // Zero turns a periodic task off
        let interval = |key: &str, default: Option<Duration>| -> Option<Duration> {
            match var(key).and_then(|s| s.trim().parse::<u64>().ok()) {
                Some(0) => None,
                Some(secs) => Some(Duration::from_secs(secs)),
                None => default,
            }
        };

        let node_id = var("NODE_ID").unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let bind_address = var("BIND_ADDRESS").unwrap_or_else(|| "0.0.0.0:8080".to_string());
        let data_dir = var("DATA_DIR").unwrap_or_else(|| "./data".to_string());

        let mode = match var("NODE_MODE") {
            Some(raw) => raw.parse::<NodeMode>().map_err(ConfigError::ValidationError)?,
            None => NodeMode::Edit,
        };

        let storage_backend = match var("STORAGE_BACKEND")
            .unwrap_or_else(|| "local".to_string())
            .to_lowercase()
            .as_str()
        {
            "gcs" => StorageBackend::Gcs,
            _ => StorageBackend::Local,
        };

        let maintenance_defaults = MaintenanceConfig::default();
        let auth_defaults = AuthConfig::default();

        let config = Config {
            node: NodeConfig {
                id: node_id,
                bind_address,
                data_dir,
                mode,
                capacity_bytes: parsed("CAPACITY_BYTES", 100 * 1024 * 1024 * 1024), // 100GB
                replication_factor: parsed("REPLICATION_FACTOR", 1) as u32,
            },
            storage: StorageConfig {
                backend: storage_backend,
                local_storage_path: var("LOCAL_STORAGE_PATH")
                    .unwrap_or_else(|| "./files".to_string()),
                gcs_bucket: var("GCS_BUCKET"),
                gcs_credentials_file: var("GCS_CREDENTIALS_FILE"),
            },
            wal: WalConfig {
                compact_threshold: parsed(
                    "WAL_COMPACT_THRESHOLD",
                    WalConfig::default().compact_threshold as u64,
                ) as usize,
            },
            auth: AuthConfig {
                public_key_file: var("AUTH_PUBLIC_KEY_FILE"),
                required: flag("AUTH_REQUIRED", auth_defaults.required),
                leeway_seconds: parsed(
                    "AUTH_LEEWAY_SECONDS",
                    auth_defaults.leeway_seconds as u64,
                ) as i64,
            },
            maintenance: MaintenanceConfig {
                consistency_scan_interval: interval(
                    "CONSISTENCY_SCAN_INTERVAL",
                    maintenance_defaults.consistency_scan_interval,
                ),
                retention_sweep_interval: interval(
                    "RETENTION_SWEEP_INTERVAL",
                    maintenance_defaults.retention_sweep_interval,
                ),
            },
            max_upload_size: parsed("MAX_UPLOAD_SIZE", 50 * 1024 * 1024), // 50MB
            transfer_timeout: Duration::from_secs(parsed("TRANSFER_TIMEOUT_SECONDS", 300)),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node.id.is_empty() {
            return Err(ConfigError::ValidationError(
                "NODE_ID cannot be empty".to_string(),
            ));
        }

        if self.storage.backend == StorageBackend::Gcs && self.storage.gcs_bucket.is_none() {
            return Err(ConfigError::ValidationError(
                "GCS_BUCKET is required when STORAGE_BACKEND=gcs".to_string(),
            ));
        }

        if self.auth.required && self.auth.public_key_file.is_none() {
            return Err(ConfigError::ValidationError(
                "AUTH_PUBLIC_KEY_FILE is required unless AUTH_REQUIRED=false".to_string(),
            ));
        }

        if self.wal.compact_threshold == 0 {
            return Err(ConfigError::ValidationError(
                "WAL_COMPACT_THRESHOLD must be at least 1".to_string(),
            ));
        }

        if self.node.replication_factor == 0 {
            return Err(ConfigError::ValidationError(
                "REPLICATION_FACTOR must be at least 1".to_string(),
            ));
        }

        if self.max_upload_size > self.node.capacity_bytes {
            tracing::warn!(
                max_upload_size = self.max_upload_size,
                capacity_bytes = self.node.capacity_bytes,
                "MAX_UPLOAD_SIZE exceeds CAPACITY_BYTES; uploads are bounded by free capacity"
            );
        }

        Ok(())
    }
}
