//! Pricing Core
//!
//! Rule-based retail pricing over carrier net rates, and the time-bounded
//! quotes that carry the priced options to settlement.
//!
//! # Architecture
//!
//! - **Rule Catalog**: versioned, immutable rule snapshots; a quote pins the
//!   snapshot it was priced with
//! - **Pricing Engine**: pure evaluation of rules, guardrails and rounding
//!   against a rating context
//! - **Quote Store**: TTL-bound quotes with write-once selection
//!
//! # Failure Policy
//!
//! Configuration gaps (no rounding policy, no markup rule, no FX rate) fail
//! closed. Nothing is ever priced at an implicit zero markup.

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod types;
pub mod rules;
pub mod rounding;
pub mod engine;
pub mod quote;
pub mod error;
pub mod config;

// Re-exports
pub use error::{Error, Result};
pub use types::{CarrierRate, FxRate, FxRateTable, RatingContext, ShipmentType};
pub use rules::{
    PricingRule, RuleCatalog, RuleConditions, RuleFamily, RuleKind, RuleScope, RuleSnapshot,
};
pub use rounding::{RoundingMode, RoundingPolicies, RoundingPolicy};
pub use engine::{
    AppliedRule, GuardrailAdjustment, GuardrailStage, PricedBatch, PricingBreakdown,
    PricingEngine, RateQuoteOption,
};
pub use quote::{PricingBreakdownRecord, QuoteSelection, QuoteStatus, QuoteStore, RateQuote};
pub use config::Config;
