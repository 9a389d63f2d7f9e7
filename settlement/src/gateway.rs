//! Gateway top-up export reader
//!
//! The payment gateway drops a JSON array of settled top-ups; reconciliation
//! reads it through [`TopupRecordSource`]. Amounts are decimal strings.

use chrono::{DateTime, Utc};
use ledger_core::{GatewayTopupRecord, TopupRecordSource};
use std::path::PathBuf;

/// Top-up records read from a JSON export file on every call
#[derive(Debug, Clone)]
pub struct JsonFileTopupSource {
    path: PathBuf,
}

impl JsonFileTopupSource {
    /// Source over `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Export file path
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    fn load(&self) -> crate::Result<Vec<GatewayTopupRecord>> {
        let content = std::fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

impl TopupRecordSource for JsonFileTopupSource {
    fn topups(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> ledger_core::Result<Vec<GatewayTopupRecord>> {
        let records = self.load().map_err(|e| {
            ledger_core::Error::Storage(format!("gateway export {}: {}", self.path.display(), e))
        })?;
        tracing::debug!(path = %self.path.display(), records = records.len(), "Gateway export loaded");
        records.topups(from, to)
    }
}
