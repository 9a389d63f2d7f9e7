//! Metrics collection for observability
//!
//! This module provides Prometheus metrics for monitoring the wallet ledger.
//!
//! # Metrics
//!
//! - `ledger_entries_total{type}` - Entries appended, by transaction type
//! - `ledger_idempotent_replays_total` - Requests answered from a recorded outcome
//! - `ledger_rejections_total{reason}` - Mutations refused (funds, frozen, contention)
//! - `ledger_active_holds` - Holds currently reserving funds

use crate::types::TransactionType;
use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};
use std::fmt;
use std::sync::Arc;

/// Metrics collector
#[derive(Clone)]
pub struct Metrics {
    /// Entries appended by transaction type
    pub entries_total: IntCounterVec,

    /// Idempotent replays
    pub idempotent_replays: IntCounter,

    /// Rejected mutations by reason
    pub rejections_total: IntCounterVec,

    /// Active holds
    pub active_holds: IntGauge,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl fmt::Debug for Metrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Metrics")
            .field("idempotent_replays", &self.idempotent_replays.get())
            .field("active_holds", &self.active_holds.get())
            .finish()
    }
}

impl Metrics {
    /// Create new metrics collector with its own registry
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let entries_total = IntCounterVec::new(
            Opts::new("ledger_entries_total", "Ledger entries appended"),
            &["type"],
        )?;
        registry.register(Box::new(entries_total.clone()))?;

        let idempotent_replays = IntCounter::new(
            "ledger_idempotent_replays_total",
            "Requests answered from a recorded idempotent outcome",
        )?;
        registry.register(Box::new(idempotent_replays.clone()))?;

        let rejections_total = IntCounterVec::new(
            Opts::new("ledger_rejections_total", "Ledger mutations rejected"),
            &["reason"],
        )?;
        registry.register(Box::new(rejections_total.clone()))?;

        let active_holds = IntGauge::new("ledger_active_holds", "Holds currently reserving funds")?;
        registry.register(Box::new(active_holds.clone()))?;

        Ok(Self {
            entries_total,
            idempotent_replays,
            rejections_total,
            active_holds,
            registry,
        })
    }

    /// Record an appended entry
    pub fn record_entry(&self, transaction_type: TransactionType) {
        self.entries_total
            .with_label_values(&[transaction_type.as_str()])
            .inc();
    }

    /// Record an idempotent replay
    pub fn record_replay(&self) {
        self.idempotent_replays.inc();
    }

    /// Record a rejected mutation
    pub fn record_rejection(&self, reason: &str) {
        self.rejections_total.with_label_values(&[reason]).inc();
    }

    /// Record a hold being placed
    pub fn hold_opened(&self) {
        self.active_holds.inc();
    }

    /// Record a hold leaving the active state
    pub fn hold_closed(&self) {
        self.active_holds.dec();
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new().expect("Failed to create metrics")
    }
}
