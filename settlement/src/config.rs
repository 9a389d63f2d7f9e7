//! Configuration for the settlement worker

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Settlement configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Service name
    pub service_name: String,

    /// Service version
    pub service_version: String,

    /// Wallet ledger
    pub ledger: ledger_core::Config,

    /// Pricing and quotes
    pub pricing: pricing_core::Config,

    /// Background sweeps and reconciliation schedule
    pub schedule: ScheduleConfig,

    /// JSON export of gateway top-ups used by reconciliation
    pub gateway_export: Option<PathBuf>,

    /// Retry a ledger call once when it loses a lock race
    pub retry_on_contention: bool,

    /// Maximum wait for a shipment's slot (ms)
    pub slot_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service_name: "settlement-worker".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            ledger: ledger_core::Config::default(),
            pricing: pricing_core::Config::default(),
            schedule: ScheduleConfig::default(),
            gateway_export: None,
            retry_on_contention: true,
            slot_timeout_ms: 500,
        }
    }
}

/// Sweep and reconciliation schedule
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Interval between quote and hold expiry sweeps
    pub sweep_interval_secs: u64,

    /// Times of day (UTC, `HH:MM`) when reconciliation runs
    pub reconciliation_times: Vec<String>,

    /// How far back each reconciliation run looks (hours)
    pub reconciliation_lookback_hours: i64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 60,
            reconciliation_times: vec!["02:00".to_string()],
            reconciliation_lookback_hours: 24,
        }
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        Ok(config)
    }

    /// Load from `SETTLEMENT_CONFIG` if set, then apply environment overrides
    pub fn from_env() -> crate::Result<Self> {
        let mut config = match std::env::var("SETTLEMENT_CONFIG") {
            Ok(path) => Config::from_file(path)?,
            Err(_) => Config::default(),
        };

        if let Ok(path) = std::env::var("SETTLEMENT_GATEWAY_EXPORT") {
            config.gateway_export = Some(PathBuf::from(path));
        }

        config.ledger.apply_env()?;
        config.pricing.apply_env()?;
        Ok(config)
    }

    /// Shipment slot wait as a std duration
    pub fn slot_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.slot_timeout_ms)
    }
}
