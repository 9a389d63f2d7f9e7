//! Error types for pricing and quotes

use ledger_core::{Currency, FailureClass};
use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

/// Result type for pricing operations
pub type Result<T> = std::result::Result<T, Error>;

/// Pricing errors
#[derive(Error, Debug)]
pub enum Error {
    /// No rounding policy registered for the billing currency
    #[error("No rounding policy for {0}")]
    NoRoundingPolicy(Currency),

    /// Carrier net rate must be positive
    #[error("Invalid net rate: {0}")]
    InvalidNetRate(Decimal),

    /// No markup rule resolved for the scope, not even a fallback
    #[error("No markup rule resolvable for account {account_id}")]
    MissingFallbackRule {
        /// Account being priced
        account_id: String,
    },

    /// More than one fallback rule for a scope and rule type
    #[error("Duplicate fallback rule for {scope} / {kind}")]
    DuplicateFallbackRule {
        /// Rule scope
        scope: String,
        /// Rule type
        kind: String,
    },

    /// Rule definition rejected at publish
    #[error("Invalid rule {rule_id}: {reason}")]
    InvalidRule {
        /// Rule ID
        rule_id: String,
        /// Reason
        reason: String,
    },

    /// Rounding step must be positive and representable in the currency
    #[error("Invalid rounding step: {0}")]
    InvalidRoundingStep(String),

    /// FX rate not available for a currency pair
    #[error("No FX rate from {from} to {to}")]
    MissingFxRate {
        /// Carrier currency
        from: Currency,
        /// Billing currency
        to: Currency,
    },

    /// Rating context failed validation
    #[error("Invalid rating context: {0}")]
    InvalidContext(String),

    /// Unknown quote
    #[error("Quote not found: {0}")]
    QuoteNotFound(Uuid),

    /// Unknown option on a quote
    #[error("Option {option_id} not found on quote {quote_id}")]
    OptionNotFound {
        /// Quote ID
        quote_id: Uuid,
        /// Option ID
        option_id: u32,
    },

    /// Quote passed its TTL
    #[error("Quote expired: {0}")]
    QuoteExpired(Uuid),

    /// Quote already has a different selection
    #[error("Quote already selected: {0}")]
    QuoteAlreadySelected(Uuid),

    /// Quote is pending or failed
    #[error("Quote {quote_id} cannot be selected in status {status}")]
    QuoteNotSelectable {
        /// Quote ID
        quote_id: Uuid,
        /// Current status
        status: String,
    },

    /// Quote cannot move from its current status
    #[error("Quote {quote_id} cannot move from {from} to {to}")]
    InvalidQuoteTransition {
        /// Quote ID
        quote_id: Uuid,
        /// Current status
        from: String,
        /// Requested status
        to: String,
    },

    /// Rule snapshot version not retained
    #[error("Unknown rule snapshot version {0}")]
    UnknownSnapshot(u64),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Failure classification
    pub fn class(&self) -> FailureClass {
        match self {
            Error::NoRoundingPolicy(_)
            | Error::MissingFallbackRule { .. }
            | Error::DuplicateFallbackRule { .. }
            | Error::InvalidRule { .. }
            | Error::InvalidRoundingStep(_)
            | Error::MissingFxRate { .. }
            | Error::UnknownSnapshot(_)
            | Error::Config(_) => FailureClass::Configuration,
            Error::InvalidNetRate(_)
            | Error::InvalidContext(_)
            | Error::QuoteNotFound(_)
            | Error::OptionNotFound { .. } => FailureClass::Validation,
            Error::QuoteExpired(_)
            | Error::QuoteAlreadySelected(_)
            | Error::QuoteNotSelectable { .. }
            | Error::InvalidQuoteTransition { .. } => FailureClass::Quote,
            Error::Io(_) => FailureClass::Storage,
        }
    }

    /// Whether an automatic retry is allowed
    pub fn is_retriable(&self) -> bool {
        self.class().is_retriable()
    }
}
