//! Core types for the wallet ledger
//!
//! All types are designed for:
//! - Deterministic serialization (bincode)
//! - Exact arithmetic (Decimal for money)
//! - Immutability once written (entries are never updated)

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Customer account identifier (owning organization)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AccountId(String);

impl AccountId {
    /// Create new account ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// ISO 4217 currency code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[non_exhaustive]
pub enum Currency {
    /// Saudi Riyal
    SAR,
    /// UAE Dirham
    AED,
    /// Kuwaiti Dinar
    KWD,
    /// Bahraini Dinar
    BHD,
    /// Qatari Riyal
    QAR,
    /// Omani Rial
    OMR,
    /// Egyptian Pound
    EGP,
    /// Jordanian Dinar
    JOD,
    /// US Dollar
    USD,
    /// Euro
    EUR,
    /// British Pound
    GBP,
}

impl Currency {
    /// ISO 4217 code
    pub fn code(&self) -> &'static str {
        match self {
            Currency::SAR => "SAR",
            Currency::AED => "AED",
            Currency::KWD => "KWD",
            Currency::BHD => "BHD",
            Currency::QAR => "QAR",
            Currency::OMR => "OMR",
            Currency::EGP => "EGP",
            Currency::JOD => "JOD",
            Currency::USD => "USD",
            Currency::EUR => "EUR",
            Currency::GBP => "GBP",
        }
    }

    /// Parse from ISO code
    pub fn from_code(s: &str) -> Option<Self> {
        match s {
            "SAR" => Some(Currency::SAR),
            "AED" => Some(Currency::AED),
            "KWD" => Some(Currency::KWD),
            "BHD" => Some(Currency::BHD),
            "QAR" => Some(Currency::QAR),
            "OMR" => Some(Currency::OMR),
            "EGP" => Some(Currency::EGP),
            "JOD" => Some(Currency::JOD),
            "USD" => Some(Currency::USD),
            "EUR" => Some(Currency::EUR),
            "GBP" => Some(Currency::GBP),
            _ => None,
        }
    }

    /// Number of minor-unit digits (fils, halalas, cents)
    pub fn minor_units(&self) -> u32 {
        match self {
            Currency::KWD | Currency::BHD | Currency::OMR | Currency::JOD => 3,
            _ => 2,
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Wallet identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WalletId(Uuid);

impl WalletId {
    /// Generate a new time-ordered wallet ID
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Wrap an existing UUID
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// Underlying UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for WalletId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for WalletId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Hold identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HoldId(Uuid);

impl HoldId {
    /// Generate a new hold ID
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Wrap an existing UUID
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// Underlying UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for HoldId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for HoldId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Caller-supplied token that makes a mutation safe to retry
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    /// Create new key
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for IdempotencyKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

/// What a ledger entry or hold refers to, rendered as `kind:id`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Reference {
    /// Reference type (shipment, gateway, adjustment, ...)
    pub kind: String,
    /// Reference ID within the type
    pub id: String,
}

impl Reference {
    /// Create a reference
    pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: id.into(),
        }
    }

    /// Shipment reference
    pub fn shipment(id: impl Into<String>) -> Self {
        Self::new("shipment", id)
    }

    /// Payment-gateway transaction reference
    pub fn gateway(txn_id: impl Into<String>) -> Self {
        Self::new("gateway", txn_id)
    }

    /// Parse `kind:id`
    pub fn parse(s: &str) -> Option<Self> {
        let (kind, id) = s.split_once(':')?;
        if kind.is_empty() || id.is_empty() {
            return None;
        }
        Some(Self::new(kind, id))
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// Wallet status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum WalletStatus {
    /// Accepts all operations
    Active = 1,
    /// Under investigation: no debits or holds
    Frozen = 2,
    /// Terminal
    Closed = 3,
}

impl fmt::Display for WalletStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WalletStatus::Active => "active",
            WalletStatus::Frozen => "frozen",
            WalletStatus::Closed => "closed",
        };
        write!(f, "{}", s)
    }
}

/// One wallet per account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Wallet {
    /// Wallet ID
    pub wallet_id: WalletId,

    /// Owning account
    pub account_id: AccountId,

    /// Wallet currency
    pub currency: Currency,

    /// Spendable balance
    pub available_balance: Decimal,

    /// Funds reserved by active holds
    pub locked_balance: Decimal,

    /// Lifetime credits (topups, refunds, positive adjustments)
    pub total_credited: Decimal,

    /// Lifetime debits (captures, debits, negative adjustments)
    pub total_debited: Decimal,

    /// Status
    pub status: WalletStatus,

    /// Permit holds and debits beyond the available balance
    pub allow_negative: bool,

    /// Sequence of the latest entry (0 = no entries)
    pub last_sequence: u64,

    /// Created timestamp
    pub created_at: DateTime<Utc>,

    /// Last updated timestamp
    pub updated_at: DateTime<Utc>,
}

impl Wallet {
    /// available + locked
    pub fn book_balance(&self) -> Decimal {
        self.available_balance + self.locked_balance
    }
}

/// Ledger transaction type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum TransactionType {
    /// Gateway top-up credit
    Topup = 1,
    /// Direct debit
    Debit = 2,
    /// Credit against an earlier debit
    Refund = 3,
    /// Reservation (hold metadata; never written as an entry)
    Hold = 4,
    /// Hold returned to available
    HoldRelease = 5,
    /// Hold converted into a debit
    HoldCapture = 6,
    /// Operator adjustment
    Adjustment = 7,
    /// Reversal of an earlier entry
    Reversal = 8,
}

impl TransactionType {
    /// Lowercase name used in metrics labels and references
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Topup => "topup",
            TransactionType::Debit => "debit",
            TransactionType::Refund => "refund",
            TransactionType::Hold => "hold",
            TransactionType::HoldRelease => "hold_release",
            TransactionType::HoldCapture => "hold_capture",
            TransactionType::Adjustment => "adjustment",
            TransactionType::Reversal => "reversal",
        }
    }

    /// Entries a refund may point back to
    pub fn is_refundable(&self) -> bool {
        matches!(self, TransactionType::Debit | TransactionType::HoldCapture)
    }

    /// Entries a reversal may point back to
    pub fn is_reversible(&self) -> bool {
        matches!(
            self,
            TransactionType::Topup | TransactionType::Debit | TransactionType::Adjustment
        )
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Immutable ledger entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Unique entry ID (UUIDv7 for time-ordering)
    pub entry_id: Uuid,

    /// Wallet this entry belongs to
    pub wallet_id: WalletId,

    /// Per-wallet sequence, strictly increasing from 1
    pub sequence: u64,

    /// Transaction type
    pub transaction_type: TransactionType,

    /// Signed amount (credits positive, debits negative, releases zero)
    pub amount: Decimal,

    /// Book balance (available + locked) immediately after this entry
    pub running_balance: Decimal,

    /// Available balance immediately after this entry
    pub available_after: Decimal,

    /// Locked balance immediately after this entry
    pub locked_after: Decimal,

    /// What the entry refers to
    pub reference: Reference,

    /// Key of the request that produced the entry
    pub idempotency_key: IdempotencyKey,

    /// Hold captured or released by this entry
    pub hold_id: Option<HoldId>,

    /// Entry refunded or reversed by this entry
    pub reverses_entry: Option<Uuid>,

    /// Entry timestamp
    pub created_at: DateTime<Utc>,
}

/// Hold status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum HoldStatus {
    /// Funds reserved
    Active = 1,
    /// Converted into a debit
    Captured = 2,
    /// Returned to available by the caller
    Released = 3,
    /// Returned to available by the expiry sweep
    Expired = 4,
}

impl fmt::Display for HoldStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HoldStatus::Active => "active",
            HoldStatus::Captured => "captured",
            HoldStatus::Released => "released",
            HoldStatus::Expired => "expired",
        };
        write!(f, "{}", s)
    }
}

/// Reserved-but-not-captured funds for one shipment attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hold {
    /// Hold ID
    pub hold_id: HoldId,

    /// Wallet holding the funds
    pub wallet_id: WalletId,

    /// Reserved amount
    pub amount: Decimal,

    /// Shipment (or other) reference
    pub reference: Reference,

    /// Key of the request that created the hold
    pub idempotency_key: IdempotencyKey,

    /// Status
    pub status: HoldStatus,

    /// Created timestamp
    pub created_at: DateTime<Utc>,

    /// Deadline after which the sweep releases the hold
    pub expires_at: DateTime<Utc>,

    /// Capture or release entry
    pub settled_entry_id: Option<Uuid>,

    /// When the hold left the active state
    pub settled_at: Option<DateTime<Utc>>,
}

impl Hold {
    /// Check if hold still reserves funds
    pub fn is_active(&self) -> bool {
        self.status == HoldStatus::Active
    }

    /// Check if hold is past its deadline
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_currency_from_code() {
        assert_eq!(Currency::from_code("SAR"), Some(Currency::SAR));
        assert_eq!(Currency::from_code("KWD"), Some(Currency::KWD));
        assert_eq!(Currency::from_code("INVALID"), None);
    }

    #[test]
    fn test_currency_minor_units() {
        assert_eq!(Currency::SAR.minor_units(), 2);
        assert_eq!(Currency::KWD.minor_units(), 3);
    }

    #[test]
    fn test_reference_roundtrip() {
        let r = Reference::shipment("123");
        assert_eq!(r.to_string(), "shipment:123");
        assert_eq!(Reference::parse("shipment:123"), Some(r));
        assert_eq!(Reference::parse("nocolon"), None);
        assert_eq!(Reference::parse(":x"), None);
    }

    #[test]
    fn test_transaction_type_rules() {
        assert!(TransactionType::HoldCapture.is_refundable());
        assert!(!TransactionType::Topup.is_refundable());
        assert!(TransactionType::Topup.is_reversible());
        assert!(!TransactionType::Refund.is_reversible());
        assert_eq!(TransactionType::HoldCapture.as_str(), "hold_capture");
    }
}
