//! Wallet Ledger Core
//!
//! Append-only, per-wallet transaction ledger with holds, captures, refunds
//! and a read-only reconciliation pass against payment-gateway records.
//!
//! # Architecture
//!
//! - **Per-Wallet Writer**: each wallet has its own lock, so sequence
//!   assignment and running balances are race-free while unrelated wallets
//!   never wait on each other
//! - **Idempotency Keys**: every mutation is keyed; a replayed key returns
//!   the original result and mutates nothing
//! - **Write-Through Journal**: optional RocksDB store committed atomically
//!   before the in-memory book changes
//!
//! # Invariants
//!
//! - Σ(entry amounts) == available + locked == total_credited − total_debited
//! - Sequence numbers per wallet start at 1 and increase by exactly 1
//! - Entries are never modified; refunds and reversals point back, never forward
//! - available ≥ 0 and locked ≥ 0 unless the wallet allows negative balances

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod types;
pub mod storage;
pub mod ledger;
pub mod reconciliation;
pub mod error;
pub mod config;
pub mod metrics;

// Re-exports
pub use error::{Error, FailureClass, Result};
pub use types::{
    AccountId, Currency, Hold, HoldId, HoldStatus, IdempotencyKey, LedgerEntry, Reference,
    TransactionType, Wallet, WalletId, WalletStatus,
};
pub use ledger::{WalletAudit, WalletLedger};
pub use reconciliation::{
    Discrepancy, DiscrepancyKind, GatewayTopupRecord, ReconciliationJob, ReconciliationReport,
    TopupRecordSource,
};
pub use storage::LedgerStore;
pub use metrics::Metrics;
pub use config::Config;
