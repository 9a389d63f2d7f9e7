//! Core types for settlement coordination

use chrono::{DateTime, Utc};
use ledger_core::{AccountId, Currency, HoldId, WalletId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Shipment identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShipmentId(String);

impl ShipmentId {
    /// Create new shipment ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShipmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Settlement state of one shipment
///
/// ```text
/// Quoted ──▶ Reserved ──▶ Captured ──▶ Refunded
///   │           │
///   ▼           ▼
/// Cancelled  Released
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlementState {
    /// Option chosen; no funds reserved yet
    Quoted,
    /// Hold placed
    Reserved,
    /// Hold captured; financially final
    Captured,
    /// Hold returned before capture (cancel or expiry)
    Released,
    /// Captured amount credited back
    Refunded,
    /// Cancelled before any reservation
    Cancelled,
}

impl SettlementState {
    /// Whether the state machine allows `self → next`
    pub fn can_transition_to(&self, next: SettlementState) -> bool {
        use SettlementState::*;
        matches!(
            (self, next),
            (Quoted, Reserved)
                | (Quoted, Cancelled)
                | (Reserved, Captured)
                | (Reserved, Released)
                | (Captured, Refunded)
        )
    }

    /// No further transitions
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SettlementState::Released | SettlementState::Refunded | SettlementState::Cancelled
        )
    }
}

impl fmt::Display for SettlementState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SettlementState::Quoted => "quoted",
            SettlementState::Reserved => "reserved",
            SettlementState::Captured => "captured",
            SettlementState::Released => "released",
            SettlementState::Refunded => "refunded",
            SettlementState::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// One shipment's path through reservation and capture
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementAttempt {
    /// Shipment
    pub shipment_id: ShipmentId,

    /// Quoted account
    pub account_id: AccountId,

    /// Wallet charged
    pub wallet_id: WalletId,

    /// Quote
    pub quote_id: Uuid,

    /// Selected option
    pub option_id: u32,

    /// Amount reserved (the option's payable amount)
    pub amount: Decimal,

    /// Currency
    pub currency: Currency,

    /// State
    pub state: SettlementState,

    /// Hold, once reserved
    pub hold_id: Option<HoldId>,

    /// Capture entry
    pub capture_entry_id: Option<Uuid>,

    /// Release entry (cancel or expiry)
    pub release_entry_id: Option<Uuid>,

    /// Refund entry
    pub refund_entry_id: Option<Uuid>,

    /// Created timestamp
    pub created_at: DateTime<Utc>,

    /// Last updated timestamp
    pub updated_at: DateTime<Utc>,
}

impl SettlementAttempt {
    /// Whether this attempt was opened for the same request
    pub fn is_same_request(&self, quote_id: Uuid, option_id: u32, wallet_id: WalletId) -> bool {
        self.quote_id == quote_id && self.option_id == option_id && self.wallet_id == wallet_id
    }
}
