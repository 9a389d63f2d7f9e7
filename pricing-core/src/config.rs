//! Configuration for pricing and quotes

use crate::rounding::RoundingPolicy;
use crate::types::FxRate;
use serde::{Deserialize, Serialize};

/// Pricing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Service name
    pub service_name: String,

    /// Quote lifetime
    pub quote_ttl_secs: i64,

    /// Rounding policy per billing currency
    pub rounding: Vec<RoundingPolicy>,

    /// Static FX rates
    pub fx_rates: Vec<FxRate>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service_name: "pricing-core".to_string(),
            quote_ttl_secs: 15 * 60,
            rounding: Vec::new(),
            fx_rates: Vec::new(),
        }
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Config::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Apply `PRICING_*` environment overrides
    pub fn apply_env(&mut self) -> crate::Result<()> {
        if let Ok(ttl) = std::env::var("PRICING_QUOTE_TTL_SECS") {
            self.quote_ttl_secs = ttl
                .parse()
                .map_err(|e| crate::Error::Config(format!("PRICING_QUOTE_TTL_SECS: {}", e)))?;
        }
        self.validate()
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> crate::Result<()> {
        if self.quote_ttl_secs <= 0 {
            return Err(crate::Error::Config(format!(
                "quote_ttl_secs must be positive, got {}",
                self.quote_ttl_secs
            )));
        }
        for policy in &self.rounding {
            policy.validate()?;
        }
        Ok(())
    }

    /// Quote lifetime as a chrono duration
    pub fn quote_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.quote_ttl_secs)
    }
}
