//! Error types for settlement coordination

use ledger_core::FailureClass;
use thiserror::Error;

/// Result type for settlement operations
pub type Result<T> = std::result::Result<T, Error>;

/// Settlement errors
#[derive(Error, Debug)]
pub enum Error {
    /// Ledger error
    #[error("Ledger error: {0}")]
    Ledger(#[from] ledger_core::Error),

    /// Pricing or quote error
    #[error("Pricing error: {0}")]
    Pricing(#[from] pricing_core::Error),

    /// Shipment already has a reservation for a different request
    #[error("Shipment {0} is already reserved")]
    AlreadyReserved(String),

    /// No settlement attempt for the shipment
    #[error("No settlement attempt for shipment {0}")]
    SettlementNotFound(String),

    /// State machine does not allow the move
    #[error("Shipment {shipment_id} cannot move from {from} to {to}")]
    InvalidTransition {
        /// Shipment ID
        shipment_id: String,
        /// Current state
        from: String,
        /// Requested state
        to: String,
    },

    /// Wallet does not belong to the quoted account
    #[error("Account mismatch: {0}")]
    AccountMismatch(String),

    /// Quote currency differs from the wallet currency
    #[error("Currency mismatch: quote in {quote}, wallet in {wallet}")]
    CurrencyMismatch {
        /// Quote currency
        quote: String,
        /// Wallet currency
        wallet: String,
    },

    /// The hold lapsed and was released by the expiry sweep
    #[error("Hold for shipment {0} expired before confirmation")]
    HoldExpired(String),

    /// Shipment slot busy past the wait limit
    #[error("Shipment {0} is busy")]
    Contention(String),

    /// Blocking ledger task panicked or was cancelled
    #[error("Ledger task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Failure classification
    pub fn class(&self) -> FailureClass {
        match self {
            Error::Ledger(e) => e.class(),
            Error::Pricing(e) => e.class(),
            Error::AlreadyReserved(_)
            | Error::SettlementNotFound(_)
            | Error::InvalidTransition { .. }
            | Error::AccountMismatch(_)
            | Error::CurrencyMismatch { .. } => FailureClass::Validation,
            Error::HoldExpired(_) => FailureClass::Funds,
            Error::Contention(_) => FailureClass::Concurrency,
            Error::Config(_) => FailureClass::Configuration,
            Error::Serialization(_) | Error::Io(_) | Error::Task(_) => FailureClass::Storage,
        }
    }

    /// Whether an automatic retry is allowed
    pub fn is_retriable(&self) -> bool {
        self.class().is_retriable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    #[test]
    fn test_wrapped_errors_keep_their_class() {
        let funds: Error = ledger_core::Error::InsufficientFunds {
            available: Decimal::from(50),
            requested: Decimal::from(80),
        }
        .into();
        assert_eq!(funds.class(), FailureClass::Funds);
        assert!(!funds.is_retriable());

        let busy: Error = ledger_core::Error::Concurrency("wallet busy".into()).into();
        assert!(busy.is_retriable());

        let expired: Error = pricing_core::Error::QuoteExpired(uuid::Uuid::new_v4()).into();
        assert_eq!(expired.class(), FailureClass::Quote);
    }
}
