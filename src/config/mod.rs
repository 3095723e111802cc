//! Layered configuration for entityvault.
//!
//! Configuration is loaded with precedence: overrides > Env vars > Config file > Defaults
//!
//! # Example config file (entityvault.toml)
//! ```toml
//! [storage]
//! data_dir = "/var/lib/entityvault"
//! block_cache_mb = 512
//!
//! [partitions]
//! default_partition_count = 16
//!
//! [linking]
//! match_threshold = 0.8
//! ```

pub mod defaults;

pub use defaults::*;

use crate::linking::LinkingOptions;
use crate::persistence::RocksOpenOptions;
use crate::property_store::StoreOptions;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration for an entityvault instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VaultConfig {
    pub storage: StorageConfig,
    pub partitions: PartitionConfig,
    pub batching: BatchingConfig,
    pub linking: LinkingConfig,
}

impl VaultConfig {
    /// Load configuration with precedence: overrides > Env > File > Defaults
    ///
    /// # Arguments
    /// * `config_path` - Optional path to TOML config file
    /// * `overrides` - Explicit overrides to apply on top
    pub fn load(
        config_path: Option<&Path>,
        overrides: ConfigOverrides,
    ) -> Result<Self, ConfigError> {
        let mut figment = Figment::new().merge(Serialized::defaults(VaultConfig::default()));

        // Layer 1: Config file (if provided)
        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        }

        // Layer 2: Environment variables with ENTITYVAULT_ prefix
        figment = figment.merge(Env::prefixed("ENTITYVAULT_").split("__"));

        // Layer 3: explicit overrides
        figment = figment.merge(Serialized::defaults(overrides));

        let config: VaultConfig = figment.extract().map_err(ConfigError::from)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment and optional config file only
    pub fn from_env(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load(config_path, ConfigOverrides::default())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.partitions.default_partition_count == 0 {
            return Err(ConfigError::new("partitions.default_partition_count must be positive"));
        }
        if !(0.0..=1.0).contains(&self.linking.match_threshold) {
            return Err(ConfigError::new("linking.match_threshold must be within [0, 1]"));
        }
        Ok(())
    }

    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            lock_timeout: Duration::from_millis(self.linking.lock_timeout_ms),
            delete_chunk_size: self.batching.delete_chunk_size.min(MAX_DELETE_CHUNK_SIZE),
            blob_delete_batch_size: self.batching.blob_delete_batch_size,
        }
    }

    pub fn linking_options(&self) -> LinkingOptions {
        LinkingOptions {
            lock_timeout: Duration::from_millis(self.linking.lock_timeout_ms),
            cluster_lookup_retries: self.linking.cluster_lookup_retries,
            page_size: self.batching.read_page_size,
        }
    }

    pub fn rocks_options(&self) -> RocksOpenOptions {
        RocksOpenOptions {
            repair: self.storage.repair,
            block_cache_mb: self.storage.block_cache_mb,
            write_buffer_mb: self.storage.write_buffer_mb,
            ..Default::default()
        }
    }
}

/// Storage configuration. No `data_dir` means an in-memory backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: Option<PathBuf>,
    /// Block cache size in MB
    pub block_cache_mb: usize,
    /// Write buffer size in MB
    pub write_buffer_mb: usize,
    /// Run repair before opening
    pub repair: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            block_cache_mb: DEFAULT_BLOCK_CACHE_MB,
            write_buffer_mb: DEFAULT_WRITE_BUFFER_MB,
            repair: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PartitionConfig {
    pub default_partition_count: usize,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            default_partition_count: DEFAULT_PARTITION_COUNT,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BatchingConfig {
    /// Capped at [`MAX_DELETE_CHUNK_SIZE`]
    pub delete_chunk_size: usize,
    pub blob_delete_batch_size: usize,
    pub read_page_size: usize,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            delete_chunk_size: DEFAULT_DELETE_CHUNK_SIZE,
            blob_delete_batch_size: DEFAULT_BLOB_DELETE_BATCH_SIZE,
            read_page_size: DEFAULT_READ_PAGE_SIZE,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LinkingConfig {
    pub lock_timeout_ms: u64,
    pub match_threshold: f64,
    pub cluster_lookup_retries: usize,
}

impl Default for LinkingConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: DEFAULT_LOCK_TIMEOUT_MS,
            match_threshold: DEFAULT_MATCH_THRESHOLD,
            cluster_lookup_retries: DEFAULT_CLUSTER_LOOKUP_RETRIES,
        }
    }
}

/// Overrides that take precedence over file and env config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageOverrides>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub linking: Option<LinkingOverrides>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repair: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkingOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub match_threshold: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lock_timeout_ms: Option<u64>,
}

/// Configuration error.
#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
}

impl ConfigError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "configuration error: {}", self.message)
    }
}

impl std::error::Error for ConfigError {}

impl From<figment::Error> for ConfigError {
    fn from(e: figment::Error) -> Self {
        Self {
            message: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = VaultConfig::default();
        assert!(config.storage.data_dir.is_none());
        assert_eq!(config.partitions.default_partition_count, 8);
        assert_eq!(config.batching.delete_chunk_size, MAX_DELETE_CHUNK_SIZE);
        assert_eq!(config.linking.match_threshold, DEFAULT_MATCH_THRESHOLD);
    }

    #[test]
    fn test_file_then_overrides() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[batching]\ndelete_chunk_size = 50000\n[linking]\nmatch_threshold = 0.6"
        )
        .unwrap();
        let overrides = ConfigOverrides {
            linking: Some(LinkingOverrides {
                match_threshold: Some(0.9),
                ..Default::default()
            }),
            ..Default::default()
        };
        let config = VaultConfig::load(Some(file.path()), overrides).unwrap();
        assert_eq!(config.linking.match_threshold, 0.9);
        assert_eq!(config.batching.delete_chunk_size, 50_000);
        assert_eq!(config.store_options().delete_chunk_size, MAX_DELETE_CHUNK_SIZE);
    }

    #[test]
    fn test_invalid_threshold_is_rejected() {
        let overrides = ConfigOverrides {
            linking: Some(LinkingOverrides {
                match_threshold: Some(1.5),
                ..Default::default()
            }),
            ..Default::default()
        };
        let err = VaultConfig::load(None, overrides).unwrap_err();
        assert!(err.message.contains("match_threshold"));
    }
}
