//! Error types for the wallet ledger

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, Error>;

/// How a failure should be handled by the caller.
///
/// Shared by every crate in the workspace so that pricing, quote, funds and
/// contention failures are classified the same way end to end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureClass {
    /// Missing rule, rounding policy, FX rate. Halts pricing for the scope.
    Configuration,
    /// Bad input from the caller. Reported, never retried.
    Validation,
    /// Expired or already-selected quote. Caller must requote.
    Quote,
    /// Insufficient balance, frozen wallet, inactive hold. Never auto-retried.
    Funds,
    /// Lost a race for a lock or slot. Safe to retry once.
    Concurrency,
    /// Persistence or encoding failure.
    Storage,
}

impl FailureClass {
    /// Whether an automatic retry is allowed
    pub fn is_retriable(&self) -> bool {
        matches!(self, FailureClass::Concurrency)
    }
}

/// Ledger errors
#[derive(Error, Debug)]
pub enum Error {
    /// Wallet does not exist
    #[error("Wallet not found: {0}")]
    WalletNotFound(String),

    /// Account already has a wallet
    #[error("Wallet already exists for account {0}")]
    WalletExists(String),

    /// Wallet is frozen
    #[error("Wallet is frozen: {0}")]
    WalletFrozen(String),

    /// Wallet is closed
    #[error("Wallet is closed: {0}")]
    WalletClosed(String),

    /// Not enough available balance
    #[error("Insufficient funds: available {available}, requested {requested}")]
    InsufficientFunds {
        /// Available balance at the time of the request
        available: Decimal,
        /// Requested amount
        requested: Decimal,
    },

    /// Hold does not exist
    #[error("Hold not found: {0}")]
    HoldNotFound(String),

    /// Hold was already captured, released or expired
    #[error("Hold {hold_id} is not active (status: {status})")]
    HoldNotActive {
        /// Hold ID
        hold_id: String,
        /// Current status
        status: String,
    },

    /// Another active hold exists for the same reference
    #[error("Active hold already exists for {0}")]
    HoldAlreadyActive(String),

    /// Wallet still holds funds or active holds
    #[error("Wallet {0} has a non-zero balance or active holds")]
    WalletNotEmpty(String),

    /// Ledger entry does not exist
    #[error("Ledger entry not found: {0}")]
    EntryNotFound(String),

    /// Refund would exceed the referenced debit
    #[error("Refund of {requested} exceeds refundable {refundable} on entry {entry_id}")]
    RefundExceedsOriginal {
        /// Referenced debit entry
        entry_id: String,
        /// Amount still refundable
        refundable: Decimal,
        /// Requested refund
        requested: Decimal,
    },

    /// Referenced entry is not a debit
    #[error("Entry {0} is not refundable")]
    NotRefundable(String),

    /// Entry was already reversed
    #[error("Entry {0} was already reversed")]
    AlreadyReversed(String),

    /// Entry already has refunds against it
    #[error("Entry {0} has refunds recorded against it")]
    AlreadyRefunded(String),

    /// Entry type cannot be reversed
    #[error("Entry {0} cannot be reversed")]
    NotReversible(String),

    /// Idempotency key reused for a different request
    #[error("Idempotency key {0} was already used for a different request")]
    IdempotencyConflict(String),

    /// Amount must be positive (or non-zero for adjustments)
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    /// Invariant violation detected on write
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Per-wallet lock could not be acquired in time
    #[error("Concurrency error: {0}")]
    Concurrency(String),

    /// Storage error (RocksDB)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Failure classification
    pub fn class(&self) -> FailureClass {
        match self {
            Error::WalletNotFound(_)
            | Error::WalletExists(_)
            | Error::HoldNotFound(_)
            | Error::HoldAlreadyActive(_)
            | Error::EntryNotFound(_)
            | Error::RefundExceedsOriginal { .. }
            | Error::NotRefundable(_)
            | Error::AlreadyReversed(_)
            | Error::AlreadyRefunded(_)
            | Error::NotReversible(_)
            | Error::IdempotencyConflict(_)
            | Error::InvalidAmount(_)
            | Error::WalletNotEmpty(_) => FailureClass::Validation,
            Error::WalletFrozen(_)
            | Error::WalletClosed(_)
            | Error::InsufficientFunds { .. }
            | Error::HoldNotActive { .. } => FailureClass::Funds,
            Error::Concurrency(_) => FailureClass::Concurrency,
            Error::Config(_) => FailureClass::Configuration,
            Error::InvariantViolation(_)
            | Error::Storage(_)
            | Error::Serialization(_)
            | Error::Io(_) => FailureClass::Storage,
        }
    }

    /// Whether an automatic retry is allowed
    pub fn is_retriable(&self) -> bool {
        self.class().is_retriable()
    }
}

impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_concurrency_is_retriable() {
        assert!(Error::Concurrency("busy".into()).is_retriable());
        assert!(!Error::WalletFrozen("w".into()).is_retriable());
        assert!(!Error::InsufficientFunds {
            available: Decimal::from(50),
            requested: Decimal::from(80),
        }
        .is_retriable());
    }

    #[test]
    fn test_funds_classification() {
        let err = Error::HoldNotActive {
            hold_id: "h".into(),
            status: "captured".into(),
        };
        assert_eq!(err.class(), FailureClass::Funds);
        assert_eq!(Error::Config("x".into()).class(), FailureClass::Configuration);
    }
}
