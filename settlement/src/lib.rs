//! Settlement Coordination
//!
//! Moves a shipment from a selected quote option to a final wallet effect,
//! and runs the background work that keeps quotes, holds and the ledger
//! honest.
//!
//! # Flow
//!
//! 1. **Reserve**: select the quote option (write-once) and hold its payable
//!    amount on the account's wallet
//! 2. **Confirm**: capture the hold once the carrier accepts the shipment
//! 3. **Cancel**: release the hold, or refund a capture
//!
//! # Background Work
//!
//! - Expiry sweep: stale quotes expire, lapsed holds are released
//! - Scheduled reconciliation against the payment gateway's top-up export
//!
//! # Example
//!
//! ```no_run
//! use settlement::{Config, SettlementCoordinator, ShipmentId};
//! use ledger_core::WalletLedger;
//! use pricing_core::QuoteStore;
//! use std::sync::Arc;
//!
//! # async fn run(quote_id: uuid::Uuid, wallet_id: ledger_core::WalletId) -> settlement::Result<()> {
//! let config = Config::default();
//! let ledger = Arc::new(WalletLedger::open(config.ledger.clone())?);
//! let quotes = Arc::new(QuoteStore::new(&config.pricing));
//! let coordinator = SettlementCoordinator::new(ledger, quotes, &config);
//!
//! let shipment = ShipmentId::new("shp-1001");
//! coordinator.reserve(shipment.clone(), quote_id, 1, wallet_id).await?;
//! coordinator.confirm(&shipment).await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod types;
pub mod coordinator;
pub mod scheduler;
pub mod gateway;
pub mod error;
pub mod config;

// Re-exports
pub use error::{Error, Result};
pub use types::{SettlementAttempt, SettlementState, ShipmentId};
pub use config::{Config, ScheduleConfig};
pub use coordinator::{derive_key, SettlementCoordinator};
pub use scheduler::{SweepReport, SweepScheduler};
pub use gateway::JsonFileTopupSource;
