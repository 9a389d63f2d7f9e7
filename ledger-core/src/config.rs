//! Configuration for the wallet ledger

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Ledger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Data directory for RocksDB. `None` keeps the ledger in memory only.
    pub data_dir: Option<PathBuf>,

    /// Service name
    pub service_name: String,

    /// How long a hold may stay active before the sweep releases it
    pub hold_ttl_secs: i64,

    /// Maximum wait for a wallet's lock before reporting contention
    pub lock_timeout_ms: u64,

    /// Whether frozen wallets accept credits (topups and refunds)
    pub frozen_accepts_credits: bool,

    /// RocksDB configuration
    pub rocksdb: RocksDBConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: None,
            service_name: "ledger-core".to_string(),
            hold_ttl_secs: 24 * 60 * 60,
            lock_timeout_ms: 250,
            frozen_accepts_credits: false,
            rocksdb: RocksDBConfig::default(),
        }
    }
}

/// RocksDB configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RocksDBConfig {
    /// Write buffer size (MB)
    pub write_buffer_size_mb: usize,

    /// Max write buffers
    pub max_write_buffer_number: i32,

    /// Max background jobs (compaction + flush)
    pub max_background_jobs: i32,

    /// Sync the WAL on every write
    pub sync_writes: bool,
}

impl Default for RocksDBConfig {
    fn default() -> Self {
        Self {
            write_buffer_size_mb: 64,
            max_write_buffer_number: 4,
            max_background_jobs: 4,
            sync_writes: true,
        }
    }
}

impl Config {
    /// In-memory configuration (no journal)
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Config::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Apply `LEDGER_*` environment overrides on top of this configuration
    pub fn apply_env(&mut self) -> crate::Result<()> {
        if let Ok(data_dir) = std::env::var("LEDGER_DATA_DIR") {
            self.data_dir = Some(PathBuf::from(data_dir));
        }

        if let Ok(ttl) = std::env::var("LEDGER_HOLD_TTL_SECS") {
            self.hold_ttl_secs = ttl
                .parse()
                .map_err(|e| crate::Error::Config(format!("LEDGER_HOLD_TTL_SECS: {}", e)))?;
        }

        if let Ok(timeout) = std::env::var("LEDGER_LOCK_TIMEOUT_MS") {
            self.lock_timeout_ms = timeout
                .parse()
                .map_err(|e| crate::Error::Config(format!("LEDGER_LOCK_TIMEOUT_MS: {}", e)))?;
        }

        Ok(())
    }

    /// Hold lifetime as a chrono duration
    pub fn hold_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.hold_ttl_secs)
    }

    /// Lock wait as a std duration
    pub fn lock_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.lock_timeout_ms)
    }
}
