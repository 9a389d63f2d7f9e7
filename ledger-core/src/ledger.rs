//! Wallet ledger
//!
//! Every wallet owns a `WalletBook` behind its own mutex. Mutations take the
//! wallet's lock (bounded wait), check the idempotency record, build the next
//! entry from the previous one, journal the change and only then apply it in
//! memory. Wallets never share a lock, so traffic on one wallet does not
//! block another.
//!
//! # Example
//!
//! ```no_run
//! use ledger_core::{AccountId, Currency, IdempotencyKey, Reference, WalletLedger};
//! use rust_decimal::Decimal;
//!
//! fn main() -> ledger_core::Result<()> {
//!     let ledger = WalletLedger::in_memory()?;
//!     let wallet = ledger.open_wallet(AccountId::new("acct-42"), Currency::SAR, false)?;
//!
//!     ledger.topup(
//!         wallet.wallet_id,
//!         Decimal::from(100),
//!         Reference::gateway("txn-1"),
//!         IdempotencyKey::new("topup-txn-1"),
//!     )?;
//!
//!     let hold = ledger.hold(
//!         wallet.wallet_id,
//!         Decimal::from(52),
//!         Reference::shipment("123"),
//!         IdempotencyKey::new("reserve-123"),
//!     )?;
//!     ledger.capture_hold(hold.hold_id, IdempotencyKey::new("capture-123"))?;
//!     Ok(())
//! }
//! ```

use crate::{
    metrics::Metrics,
    storage::{LedgerStore, StoredWallet},
    types::{
        AccountId, Currency, Hold, HoldId, HoldStatus, IdempotencyKey, LedgerEntry, Reference,
        TransactionType, Wallet, WalletId, WalletStatus,
    },
    Config, Error, Result,
};
use chrono::{DateTime, Utc};
use dashmap::{mapref::entry::Entry, DashMap};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Mutation kinds an idempotency key can be bound to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum Operation {
    Topup,
    Debit,
    Hold,
    Capture,
    Release,
    Refund,
    Adjust,
    Reverse,
}

/// What a key was first used for; a replay must match it exactly
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Fingerprint {
    pub operation: Operation,
    pub amount: Decimal,
    pub target: String,
}

impl Fingerprint {
    fn new(operation: Operation, amount: Decimal, target: impl Into<String>) -> Self {
        Self {
            operation,
            amount,
            target: target.into(),
        }
    }
}

/// Result recorded under an idempotency key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum Outcome {
    /// Sequence of the entry produced
    Entry(u64),
    /// Hold produced
    Hold(HoldId),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct IdempotencyRecord {
    pub fingerprint: Fingerprint,
    pub outcome: Outcome,
}

/// One atomic change to a wallet
#[derive(Debug)]
pub(crate) struct Mutation {
    pub wallet: Wallet,
    pub entry: Option<LedgerEntry>,
    pub hold: Option<Hold>,
    pub idempotency: Option<(IdempotencyKey, IdempotencyRecord)>,
}

/// Entry under construction
struct EntryDraft {
    transaction_type: TransactionType,
    amount: Decimal,
    available_delta: Decimal,
    locked_delta: Decimal,
    reference: Reference,
    key: IdempotencyKey,
    hold_id: Option<HoldId>,
    reverses_entry: Option<Uuid>,
}

/// In-memory state of one wallet, guarded by that wallet's lock
#[derive(Debug)]
struct WalletBook {
    wallet: Wallet,
    entries: Vec<LedgerEntry>,
    holds: HashMap<HoldId, Hold>,
    // reference -> hold currently reserving funds for it
    active_holds: HashMap<Reference, HoldId>,
    idempotency: HashMap<IdempotencyKey, IdempotencyRecord>,
    // original entry -> amount refunded so far
    refunded: HashMap<Uuid, Decimal>,
    reversed: HashSet<Uuid>,
}

impl WalletBook {
    fn new(wallet: Wallet) -> Self {
        Self {
            wallet,
            entries: Vec::new(),
            holds: HashMap::new(),
            active_holds: HashMap::new(),
            idempotency: HashMap::new(),
            refunded: HashMap::new(),
            reversed: HashSet::new(),
        }
    }

    fn from_stored(stored: StoredWallet) -> Self {
        let mut book = Self::new(stored.wallet);
        for entry in stored.entries {
            book.index_entry(&entry);
            book.entries.push(entry);
        }
        for hold in stored.holds {
            book.index_hold(hold);
        }
        book.idempotency.extend(stored.idempotency);
        book
    }

    fn index_entry(&mut self, entry: &LedgerEntry) {
        if let Some(original) = entry.reverses_entry {
            match entry.transaction_type {
                TransactionType::Refund => {
                    *self.refunded.entry(original).or_insert(Decimal::ZERO) += entry.amount;
                }
                TransactionType::Reversal => {
                    self.reversed.insert(original);
                }
                _ => {}
            }
        }
    }

    fn index_hold(&mut self, hold: Hold) {
        if hold.is_active() {
            self.active_holds.insert(hold.reference.clone(), hold.hold_id);
        } else if self.active_holds.get(&hold.reference) == Some(&hold.hold_id) {
            self.active_holds.remove(&hold.reference);
        }
        self.holds.insert(hold.hold_id, hold);
    }

    fn apply(&mut self, mutation: Mutation) {
        self.wallet = mutation.wallet;
        if let Some(entry) = mutation.entry {
            self.index_entry(&entry);
            self.entries.push(entry);
        }
        if let Some(hold) = mutation.hold {
            self.index_hold(hold);
        }
        if let Some((key, record)) = mutation.idempotency {
            self.idempotency.insert(key, record);
        }
    }

    fn entry_at(&self, sequence: u64) -> Option<&LedgerEntry> {
        let index = usize::try_from(sequence).ok()?.checked_sub(1)?;
        self.entries.get(index)
    }

    fn find_entry(&self, entry_id: Uuid) -> Option<&LedgerEntry> {
        self.entries.iter().rev().find(|e| e.entry_id == entry_id)
    }

    fn last_running_balance(&self) -> Decimal {
        self.entries
            .last()
            .map(|e| e.running_balance)
            .unwrap_or(Decimal::ZERO)
    }

    /// Outcome already recorded under `key`, if the request matches
    fn recorded(&self, key: &IdempotencyKey, fingerprint: &Fingerprint) -> Result<Option<Outcome>> {
        match self.idempotency.get(key) {
            None => Ok(None),
            Some(record) if record.fingerprint == *fingerprint => Ok(Some(record.outcome)),
            Some(_) => Err(Error::IdempotencyConflict(key.to_string())),
        }
    }

    fn replay_entry(&self, outcome: Outcome) -> Result<LedgerEntry> {
        match outcome {
            Outcome::Entry(sequence) => self.entry_at(sequence).cloned().ok_or_else(|| {
                Error::InvariantViolation(format!(
                    "Recorded entry {} missing from wallet {}",
                    sequence, self.wallet.wallet_id
                ))
            }),
            Outcome::Hold(hold_id) => Err(Error::InvariantViolation(format!(
                "Key recorded a hold ({}) where an entry was expected",
                hold_id
            ))),
        }
    }

    fn replay_hold(&self, outcome: Outcome) -> Result<Hold> {
        match outcome {
            Outcome::Hold(hold_id) => self.holds.get(&hold_id).cloned().ok_or_else(|| {
                Error::InvariantViolation(format!("Recorded hold {} missing", hold_id))
            }),
            Outcome::Entry(sequence) => Err(Error::InvariantViolation(format!(
                "Key recorded entry {} where a hold was expected",
                sequence
            ))),
        }
    }

    /// Debits and new holds need an active wallet
    fn ensure_debitable(&self) -> Result<()> {
        match self.wallet.status {
            WalletStatus::Active => Ok(()),
            WalletStatus::Frozen => Err(Error::WalletFrozen(self.wallet.wallet_id.to_string())),
            WalletStatus::Closed => Err(Error::WalletClosed(self.wallet.wallet_id.to_string())),
        }
    }

    fn ensure_creditable(&self, frozen_accepts_credits: bool) -> Result<()> {
        match self.wallet.status {
            WalletStatus::Active => Ok(()),
            WalletStatus::Frozen if frozen_accepts_credits => Ok(()),
            WalletStatus::Frozen => Err(Error::WalletFrozen(self.wallet.wallet_id.to_string())),
            WalletStatus::Closed => Err(Error::WalletClosed(self.wallet.wallet_id.to_string())),
        }
    }

    fn ensure_not_closed(&self) -> Result<()> {
        if self.wallet.status == WalletStatus::Closed {
            return Err(Error::WalletClosed(self.wallet.wallet_id.to_string()));
        }
        Ok(())
    }

    /// Signed operator movements: negative ones are debits, positive ones credits
    fn ensure_direction(&self, amount: Decimal, frozen_accepts_credits: bool) -> Result<()> {
        if amount < Decimal::ZERO {
            self.ensure_debitable()?;
            self.ensure_funds(amount.abs())
        } else {
            self.ensure_creditable(frozen_accepts_credits)
        }
    }

    fn ensure_funds(&self, amount: Decimal) -> Result<()> {
        if !self.wallet.allow_negative && self.wallet.available_balance < amount {
            return Err(Error::InsufficientFunds {
                available: self.wallet.available_balance,
                requested: amount,
            });
        }
        Ok(())
    }

    /// Build the next entry and the wallet state it leaves behind
    fn next_entry(&self, draft: EntryDraft, now: DateTime<Utc>) -> Result<(Wallet, LedgerEntry)> {
        let mut wallet = self.wallet.clone();
        wallet.available_balance += draft.available_delta;
        wallet.locked_balance += draft.locked_delta;
        if draft.amount > Decimal::ZERO {
            wallet.total_credited += draft.amount;
        } else if draft.amount < Decimal::ZERO {
            wallet.total_debited -= draft.amount;
        }
        wallet.last_sequence += 1;
        wallet.updated_at = now;

        // Running balance comes from the prior entry, never from a re-sum
        let running_balance = self.last_running_balance() + draft.amount;
        if running_balance != wallet.book_balance() {
            return Err(Error::InvariantViolation(format!(
                "Running balance {} diverges from book balance {} on wallet {}",
                running_balance,
                wallet.book_balance(),
                wallet.wallet_id
            )));
        }
        if wallet.locked_balance < Decimal::ZERO
            || (!wallet.allow_negative && wallet.available_balance < Decimal::ZERO)
        {
            return Err(Error::InvariantViolation(format!(
                "Negative balance on wallet {}: available {}, locked {}",
                wallet.wallet_id, wallet.available_balance, wallet.locked_balance
            )));
        }

        let entry = LedgerEntry {
            entry_id: Uuid::now_v7(),
            wallet_id: wallet.wallet_id,
            sequence: wallet.last_sequence,
            transaction_type: draft.transaction_type,
            amount: draft.amount,
            running_balance,
            available_after: wallet.available_balance,
            locked_after: wallet.locked_balance,
            reference: draft.reference,
            idempotency_key: draft.key,
            hold_id: draft.hold_id,
            reverses_entry: draft.reverses_entry,
            created_at: now,
        };

        Ok((wallet, entry))
    }
}

fn validate_amount(amount: Decimal, currency: Currency) -> Result<()> {
    if amount <= Decimal::ZERO {
        return Err(Error::InvalidAmount(format!(
            "Amount must be positive, got {}",
            amount
        )));
    }
    if amount.normalize().scale() > currency.minor_units() {
        return Err(Error::InvalidAmount(format!(
            "{} has more than {} decimal places for {}",
            amount,
            currency.minor_units(),
            currency
        )));
    }
    Ok(())
}

/// Result of recomputing a wallet from its entries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalletAudit {
    /// Wallet audited
    pub wallet_id: WalletId,
    /// Number of entries
    pub entry_count: usize,
    /// Σ(entry amounts)
    pub sum_of_entries: Decimal,
    /// available + locked
    pub book_balance: Decimal,
    /// total_credited − total_debited
    pub net_of_totals: Decimal,
    /// Running balance on the latest entry
    pub last_running_balance: Decimal,
    /// Σ(active hold amounts)
    pub active_hold_total: Decimal,
    /// Locked balance on the wallet
    pub locked_balance: Decimal,
    /// Sequences that are not exactly previous + 1
    pub sequence_gaps: Vec<u64>,
    /// Sequences whose stored running balance differs from the recomputed one
    pub running_balance_mismatches: Vec<u64>,
}

impl WalletAudit {
    /// All checks pass
    pub fn is_consistent(&self) -> bool {
        self.sequence_gaps.is_empty()
            && self.running_balance_mismatches.is_empty()
            && self.sum_of_entries == self.book_balance
            && self.sum_of_entries == self.net_of_totals
            && self.last_running_balance == self.book_balance
            && self.active_hold_total == self.locked_balance
    }
}

/// Append-only wallet ledger with per-wallet serialization
pub struct WalletLedger {
    /// Lock arena: one mutex per wallet
    books: DashMap<WalletId, Arc<Mutex<WalletBook>>>,

    /// Account -> wallet
    accounts: DashMap<AccountId, WalletId>,

    /// Hold -> owning wallet
    hold_index: DashMap<HoldId, WalletId>,

    /// Optional journal
    store: Option<LedgerStore>,

    metrics: Metrics,

    config: Config,
}

impl fmt::Debug for WalletLedger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WalletLedger")
            .field("wallets", &self.books.len())
            .field("holds", &self.hold_index.len())
            .field("store", &self.store)
            .finish()
    }
}

impl WalletLedger {
    /// Open ledger with configuration, replaying the journal if one is configured
    pub fn open(config: Config) -> Result<Self> {
        let metrics =
            Metrics::new().map_err(|e| Error::Config(format!("Failed to create metrics: {}", e)))?;
        let store = match &config.data_dir {
            Some(dir) => Some(LedgerStore::open(dir, &config.rocksdb)?),
            None => None,
        };

        let ledger = Self {
            books: DashMap::new(),
            accounts: DashMap::new(),
            hold_index: DashMap::new(),
            store,
            metrics,
            config,
        };

        if let Some(store) = &ledger.store {
            for stored in store.load()? {
                ledger.restore(stored);
            }
            tracing::info!(wallets = ledger.books.len(), "Ledger journal replayed");
        }

        Ok(ledger)
    }

    /// Ledger without a journal
    pub fn in_memory() -> Result<Self> {
        Self::open(Config::in_memory())
    }

    fn restore(&self, stored: StoredWallet) {
        let wallet_id = stored.wallet.wallet_id;
        for hold in &stored.holds {
            self.hold_index.insert(hold.hold_id, wallet_id);
            if hold.is_active() {
                self.metrics.hold_opened();
            }
        }
        self.accounts
            .insert(stored.wallet.account_id.clone(), wallet_id);
        self.books
            .insert(wallet_id, Arc::new(Mutex::new(WalletBook::from_stored(stored))));
    }

    /// Metrics collector
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Run `f` while holding the wallet's lock
    fn with_book<T>(
        &self,
        wallet_id: WalletId,
        f: impl FnOnce(&mut WalletBook) -> Result<T>,
    ) -> Result<T> {
        let slot = self
            .books
            .get(&wallet_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| Error::WalletNotFound(wallet_id.to_string()))?;

        let mut book = slot
            .try_lock_for(self.config.lock_timeout())
            .ok_or_else(|| {
                Error::Concurrency(format!(
                    "Wallet {} busy for more than {}ms",
                    wallet_id, self.config.lock_timeout_ms
                ))
            })?;

        f(&mut *book)
    }

    /// Journal then apply
    fn commit(&self, book: &mut WalletBook, mutation: Mutation) -> Result<()> {
        if let Some(store) = &self.store {
            store.commit(&mutation)?;
        }
        if let Some(entry) = &mutation.entry {
            self.metrics.record_entry(entry.transaction_type);
        }
        book.apply(mutation);
        Ok(())
    }

    /// Build, journal and apply an entry recorded under `key`
    fn append(
        &self,
        book: &mut WalletBook,
        draft: EntryDraft,
        fingerprint: Fingerprint,
        hold: Option<Hold>,
        now: DateTime<Utc>,
    ) -> Result<LedgerEntry> {
        let key = draft.key.clone();
        let (wallet, entry) = book.next_entry(draft, now)?;
        let hold = hold.map(|mut h| {
            h.settled_entry_id = Some(entry.entry_id);
            h.settled_at = Some(now);
            h
        });
        let record = IdempotencyRecord {
            fingerprint,
            outcome: Outcome::Entry(entry.sequence),
        };
        self.commit(
            book,
            Mutation {
                wallet,
                entry: Some(entry.clone()),
                hold,
                idempotency: Some((key, record)),
            },
        )?;
        Ok(entry)
    }

    fn rejected(&self, operation: &'static str, wallet_id: WalletId, err: Error) -> Error {
        let reason = match &err {
            Error::InsufficientFunds { .. } => "insufficient_funds",
            Error::WalletFrozen(_) => "frozen",
            Error::WalletClosed(_) => "closed",
            Error::HoldNotActive { .. } => "hold_not_active",
            Error::HoldAlreadyActive(_) => "hold_already_active",
            Error::IdempotencyConflict(_) => "idempotency_conflict",
            Error::Concurrency(_) => "contention",
            _ => "invalid",
        };
        self.metrics.record_rejection(reason);
        tracing::warn!(wallet_id = %wallet_id, operation, error = %err, "Ledger mutation rejected");
        err
    }

    fn replayed(&self, operation: &'static str, wallet_id: WalletId, key: &IdempotencyKey) {
        self.metrics.record_replay();
        tracing::debug!(wallet_id = %wallet_id, operation, key = %key, "Idempotent replay");
    }

    // Wallet lifecycle

    /// Open the wallet for an account (one per account)
    pub fn open_wallet(
        &self,
        account_id: AccountId,
        currency: Currency,
        allow_negative: bool,
    ) -> Result<Wallet> {
        match self.accounts.entry(account_id.clone()) {
            Entry::Occupied(_) => Err(Error::WalletExists(account_id.to_string())),
            Entry::Vacant(slot) => {
                let now = Utc::now();
                let wallet = Wallet {
                    wallet_id: WalletId::new(),
                    account_id,
                    currency,
                    available_balance: Decimal::ZERO,
                    locked_balance: Decimal::ZERO,
                    total_credited: Decimal::ZERO,
                    total_debited: Decimal::ZERO,
                    status: WalletStatus::Active,
                    allow_negative,
                    last_sequence: 0,
                    created_at: now,
                    updated_at: now,
                };

                if let Some(store) = &self.store {
                    store.commit(&Mutation {
                        wallet: wallet.clone(),
                        entry: None,
                        hold: None,
                        idempotency: None,
                    })?;
                }

                self.books.insert(
                    wallet.wallet_id,
                    Arc::new(Mutex::new(WalletBook::new(wallet.clone()))),
                );
                slot.insert(wallet.wallet_id);

                tracing::info!(
                    wallet_id = %wallet.wallet_id,
                    account_id = %wallet.account_id,
                    currency = %currency,
                    "Wallet opened"
                );
                Ok(wallet)
            }
        }
    }

    /// Freeze: no new debits or holds until unfrozen
    pub fn freeze(&self, wallet_id: WalletId) -> Result<Wallet> {
        self.set_status(wallet_id, WalletStatus::Frozen)
    }

    /// Return a frozen wallet to active
    pub fn unfreeze(&self, wallet_id: WalletId) -> Result<Wallet> {
        self.set_status(wallet_id, WalletStatus::Active)
    }

    /// Close a wallet with zero balance and no active holds
    pub fn close(&self, wallet_id: WalletId) -> Result<Wallet> {
        self.set_status(wallet_id, WalletStatus::Closed)
    }

    fn set_status(&self, wallet_id: WalletId, target: WalletStatus) -> Result<Wallet> {
        self.with_book(wallet_id, |book| {
            book.ensure_not_closed()?;
            if book.wallet.status == target {
                return Ok(book.wallet.clone());
            }
            if target == WalletStatus::Closed
                && (book.wallet.book_balance() != Decimal::ZERO || !book.active_holds.is_empty())
            {
                return Err(Error::WalletNotEmpty(wallet_id.to_string()));
            }

            let mut wallet = book.wallet.clone();
            let previous = wallet.status;
            wallet.status = target;
            wallet.updated_at = Utc::now();
            self.commit(
                book,
                Mutation {
                    wallet: wallet.clone(),
                    entry: None,
                    hold: None,
                    idempotency: None,
                },
            )?;

            tracing::info!(wallet_id = %wallet_id, from = %previous, to = %target, "Wallet status changed");
            Ok(wallet)
        })
    }

    // Mutations

    /// Credit available balance from a gateway top-up
    pub fn topup(
        &self,
        wallet_id: WalletId,
        amount: Decimal,
        reference: Reference,
        key: IdempotencyKey,
    ) -> Result<LedgerEntry> {
        let fingerprint = Fingerprint::new(Operation::Topup, amount, reference.to_string());
        self.with_book(wallet_id, |book| {
            if let Some(outcome) = book.recorded(&key, &fingerprint)? {
                self.replayed("topup", wallet_id, &key);
                return book.replay_entry(outcome);
            }
            validate_amount(amount, book.wallet.currency)?;
            book.ensure_creditable(self.config.frozen_accepts_credits)?;

            let draft = EntryDraft {
                transaction_type: TransactionType::Topup,
                amount,
                available_delta: amount,
                locked_delta: Decimal::ZERO,
                reference,
                key,
                hold_id: None,
                reverses_entry: None,
            };
            let entry = self.append(book, draft, fingerprint, None, Utc::now())?;

            tracing::info!(wallet_id = %wallet_id, sequence = entry.sequence, amount = %amount, "Topup recorded");
            Ok(entry)
        })
        .map_err(|e| self.rejected("topup", wallet_id, e))
    }

    /// Direct debit from available balance
    pub fn debit(
        &self,
        wallet_id: WalletId,
        amount: Decimal,
        reference: Reference,
        key: IdempotencyKey,
    ) -> Result<LedgerEntry> {
        let fingerprint = Fingerprint::new(Operation::Debit, amount, reference.to_string());
        self.with_book(wallet_id, |book| {
            if let Some(outcome) = book.recorded(&key, &fingerprint)? {
                self.replayed("debit", wallet_id, &key);
                return book.replay_entry(outcome);
            }
            validate_amount(amount, book.wallet.currency)?;
            book.ensure_debitable()?;
            book.ensure_funds(amount)?;

            let draft = EntryDraft {
                transaction_type: TransactionType::Debit,
                amount: -amount,
                available_delta: -amount,
                locked_delta: Decimal::ZERO,
                reference,
                key,
                hold_id: None,
                reverses_entry: None,
            };
            let entry = self.append(book, draft, fingerprint, None, Utc::now())?;

            tracing::info!(wallet_id = %wallet_id, sequence = entry.sequence, amount = %amount, "Debit recorded");
            Ok(entry)
        })
        .map_err(|e| self.rejected("debit", wallet_id, e))
    }

    /// Reserve funds for a reference (one active hold per reference)
    pub fn hold(
        &self,
        wallet_id: WalletId,
        amount: Decimal,
        reference: Reference,
        key: IdempotencyKey,
    ) -> Result<Hold> {
        let fingerprint = Fingerprint::new(Operation::Hold, amount, reference.to_string());
        self.with_book(wallet_id, |book| {
            if let Some(outcome) = book.recorded(&key, &fingerprint)? {
                self.replayed("hold", wallet_id, &key);
                return book.replay_hold(outcome);
            }
            validate_amount(amount, book.wallet.currency)?;
            book.ensure_debitable()?;
            if let Some(existing) = book.active_holds.get(&reference) {
                return Err(Error::HoldAlreadyActive(format!(
                    "{} (hold {})",
                    reference, existing
                )));
            }
            book.ensure_funds(amount)?;

            let now = Utc::now();
            let hold = Hold {
                hold_id: HoldId::new(),
                wallet_id,
                amount,
                reference,
                idempotency_key: key.clone(),
                status: HoldStatus::Active,
                created_at: now,
                expires_at: now + self.config.hold_ttl(),
                settled_entry_id: None,
                settled_at: None,
            };

            let mut wallet = book.wallet.clone();
            wallet.available_balance -= amount;
            wallet.locked_balance += amount;
            wallet.updated_at = now;

            let record = IdempotencyRecord {
                fingerprint,
                outcome: Outcome::Hold(hold.hold_id),
            };
            self.commit(
                book,
                Mutation {
                    wallet,
                    entry: None,
                    hold: Some(hold.clone()),
                    idempotency: Some((key, record)),
                },
            )?;
            self.hold_index.insert(hold.hold_id, wallet_id);
            self.metrics.hold_opened();

            tracing::info!(
                wallet_id = %wallet_id,
                hold_id = %hold.hold_id,
                reference = %hold.reference,
                amount = %amount,
                "Hold placed"
            );
            Ok(hold)
        })
        .map_err(|e| self.rejected("hold", wallet_id, e))
    }

    fn wallet_of_hold(&self, hold_id: HoldId) -> Result<WalletId> {
        self.hold_index
            .get(&hold_id)
            .map(|entry| *entry.value())
            .ok_or_else(|| Error::HoldNotFound(hold_id.to_string()))
    }

    /// Move an active hold to `status`, writing its capture or release entry
    fn settle_hold(
        &self,
        book: &mut WalletBook,
        hold_id: HoldId,
        key: IdempotencyKey,
        status: HoldStatus,
        now: DateTime<Utc>,
    ) -> Result<LedgerEntry> {
        let operation = match status {
            HoldStatus::Captured => Operation::Capture,
            _ => Operation::Release,
        };
        let fingerprint = Fingerprint::new(operation, Decimal::ZERO, hold_id.to_string());
        if let Some(outcome) = book.recorded(&key, &fingerprint)? {
            self.replayed(operation_name(operation), book.wallet.wallet_id, &key);
            return book.replay_entry(outcome);
        }

        let mut hold = book
            .holds
            .get(&hold_id)
            .cloned()
            .ok_or_else(|| Error::HoldNotFound(hold_id.to_string()))?;
        if !hold.is_active() {
            return Err(Error::HoldNotActive {
                hold_id: hold_id.to_string(),
                status: hold.status.to_string(),
            });
        }

        let draft = match status {
            // locked -> debited; available untouched
            HoldStatus::Captured => EntryDraft {
                transaction_type: TransactionType::HoldCapture,
                amount: -hold.amount,
                available_delta: Decimal::ZERO,
                locked_delta: -hold.amount,
                reference: hold.reference.clone(),
                key,
                hold_id: Some(hold_id),
                reverses_entry: None,
            },
            // locked -> available; book balance untouched
            _ => EntryDraft {
                transaction_type: TransactionType::HoldRelease,
                amount: Decimal::ZERO,
                available_delta: hold.amount,
                locked_delta: -hold.amount,
                reference: hold.reference.clone(),
                key,
                hold_id: Some(hold_id),
                reverses_entry: None,
            },
        };

        hold.status = status;
        let entry = self.append(book, draft, fingerprint, Some(hold), now)?;
        self.metrics.hold_closed();
        Ok(entry)
    }

    /// Convert a hold into a debit
    pub fn capture_hold(&self, hold_id: HoldId, key: IdempotencyKey) -> Result<LedgerEntry> {
        let wallet_id = self.wallet_of_hold(hold_id)?;
        self.with_book(wallet_id, |book| {
            book.ensure_not_closed()?;
            let entry = self.settle_hold(book, hold_id, key, HoldStatus::Captured, Utc::now())?;
            tracing::info!(wallet_id = %wallet_id, hold_id = %hold_id, sequence = entry.sequence, "Hold captured");
            Ok(entry)
        })
        .map_err(|e| self.rejected("capture_hold", wallet_id, e))
    }

    /// Return a hold's funds to available
    pub fn release_hold(&self, hold_id: HoldId, key: IdempotencyKey) -> Result<LedgerEntry> {
        let wallet_id = self.wallet_of_hold(hold_id)?;
        self.with_book(wallet_id, |book| {
            let entry = self.settle_hold(book, hold_id, key, HoldStatus::Released, Utc::now())?;
            tracing::info!(wallet_id = %wallet_id, hold_id = %hold_id, sequence = entry.sequence, "Hold released");
            Ok(entry)
        })
        .map_err(|e| self.rejected("release_hold", wallet_id, e))
    }

    /// Credit back part or all of an earlier debit
    pub fn refund(
        &self,
        wallet_id: WalletId,
        amount: Decimal,
        reference: Reference,
        original_entry_id: Uuid,
        key: IdempotencyKey,
    ) -> Result<LedgerEntry> {
        let fingerprint = Fingerprint::new(
            Operation::Refund,
            amount,
            format!("{}->{}", reference, original_entry_id),
        );
        self.with_book(wallet_id, |book| {
            if let Some(outcome) = book.recorded(&key, &fingerprint)? {
                self.replayed("refund", wallet_id, &key);
                return book.replay_entry(outcome);
            }
            validate_amount(amount, book.wallet.currency)?;
            book.ensure_creditable(self.config.frozen_accepts_credits)?;

            let original = book
                .find_entry(original_entry_id)
                .ok_or_else(|| Error::EntryNotFound(original_entry_id.to_string()))?;
            if !original.transaction_type.is_refundable() {
                return Err(Error::NotRefundable(original_entry_id.to_string()));
            }
            if book.reversed.contains(&original_entry_id) {
                return Err(Error::AlreadyReversed(original_entry_id.to_string()));
            }
            let already = book
                .refunded
                .get(&original_entry_id)
                .copied()
                .unwrap_or(Decimal::ZERO);
            let refundable = original.amount.abs() - already;
            if amount > refundable {
                return Err(Error::RefundExceedsOriginal {
                    entry_id: original_entry_id.to_string(),
                    refundable,
                    requested: amount,
                });
            }

            let draft = EntryDraft {
                transaction_type: TransactionType::Refund,
                amount,
                available_delta: amount,
                locked_delta: Decimal::ZERO,
                reference,
                key,
                hold_id: None,
                reverses_entry: Some(original_entry_id),
            };
            let entry = self.append(book, draft, fingerprint, None, Utc::now())?;

            tracing::info!(
                wallet_id = %wallet_id,
                sequence = entry.sequence,
                amount = %amount,
                original = %original_entry_id,
                "Refund recorded"
            );
            Ok(entry)
        })
        .map_err(|e| self.rejected("refund", wallet_id, e))
    }

    /// Operator adjustment; `amount` is signed
    pub fn adjust(
        &self,
        wallet_id: WalletId,
        amount: Decimal,
        reason: &str,
        key: IdempotencyKey,
    ) -> Result<LedgerEntry> {
        let reference = Reference::new("adjustment", reason);
        let fingerprint = Fingerprint::new(Operation::Adjust, amount, reference.to_string());
        self.with_book(wallet_id, |book| {
            if let Some(outcome) = book.recorded(&key, &fingerprint)? {
                self.replayed("adjust", wallet_id, &key);
                return book.replay_entry(outcome);
            }
            if amount.is_zero() {
                return Err(Error::InvalidAmount("Adjustment must be non-zero".to_string()));
            }
            validate_amount(amount.abs(), book.wallet.currency)?;
            book.ensure_direction(amount, self.config.frozen_accepts_credits)?;

            let draft = EntryDraft {
                transaction_type: TransactionType::Adjustment,
                amount,
                available_delta: amount,
                locked_delta: Decimal::ZERO,
                reference,
                key,
                hold_id: None,
                reverses_entry: None,
            };
            let entry = self.append(book, draft, fingerprint, None, Utc::now())?;

            tracing::info!(wallet_id = %wallet_id, sequence = entry.sequence, amount = %amount, reason, "Adjustment recorded");
            Ok(entry)
        })
        .map_err(|e| self.rejected("adjust", wallet_id, e))
    }

    /// Reverse a topup, debit or adjustment exactly once
    pub fn reverse(
        &self,
        wallet_id: WalletId,
        entry_id: Uuid,
        key: IdempotencyKey,
    ) -> Result<LedgerEntry> {
        let fingerprint = Fingerprint::new(Operation::Reverse, Decimal::ZERO, entry_id.to_string());
        self.with_book(wallet_id, |book| {
            if let Some(outcome) = book.recorded(&key, &fingerprint)? {
                self.replayed("reverse", wallet_id, &key);
                return book.replay_entry(outcome);
            }
            let original = book
                .find_entry(entry_id)
                .ok_or_else(|| Error::EntryNotFound(entry_id.to_string()))?;
            if !original.transaction_type.is_reversible() {
                return Err(Error::NotReversible(entry_id.to_string()));
            }
            if book.reversed.contains(&entry_id) {
                return Err(Error::AlreadyReversed(entry_id.to_string()));
            }
            // Refunds and a reversal must never both credit one debit
            if book.refunded.contains_key(&entry_id) {
                return Err(Error::AlreadyRefunded(entry_id.to_string()));
            }

            let amount = -original.amount;
            book.ensure_direction(amount, self.config.frozen_accepts_credits)?;

            let draft = EntryDraft {
                transaction_type: TransactionType::Reversal,
                amount,
                available_delta: amount,
                locked_delta: Decimal::ZERO,
                reference: Reference::new("reversal", entry_id.to_string()),
                key,
                hold_id: None,
                reverses_entry: Some(entry_id),
            };
            let entry = self.append(book, draft, fingerprint, None, Utc::now())?;

            tracing::info!(wallet_id = %wallet_id, sequence = entry.sequence, original = %entry_id, "Entry reversed");
            Ok(entry)
        })
        .map_err(|e| self.rejected("reverse", wallet_id, e))
    }

    /// Release every hold past its deadline
    pub fn expire_holds(&self) -> Vec<LedgerEntry> {
        self.expire_holds_at(Utc::now())
    }

    /// Release every hold past its deadline as of `now`
    pub fn expire_holds_at(&self, now: DateTime<Utc>) -> Vec<LedgerEntry> {
        let slots: Vec<(WalletId, Arc<Mutex<WalletBook>>)> = self
            .books
            .iter()
            .map(|entry| (*entry.key(), Arc::clone(entry.value())))
            .collect();

        let mut released = Vec::new();
        for (wallet_id, slot) in slots {
            let Some(mut book) = slot.try_lock_for(self.config.lock_timeout()) else {
                tracing::warn!(wallet_id = %wallet_id, "Wallet busy, hold expiry deferred");
                continue;
            };

            let due: Vec<HoldId> = book
                .active_holds
                .values()
                .copied()
                .filter(|id| book.holds.get(id).map_or(false, |h| h.is_expired_at(now)))
                .collect();

            for hold_id in due {
                let key = IdempotencyKey::new(format!("expire:{}", hold_id));
                match self.settle_hold(&mut book, hold_id, key, HoldStatus::Expired, now) {
                    Ok(entry) => {
                        tracing::info!(wallet_id = %wallet_id, hold_id = %hold_id, "Hold expired");
                        released.push(entry);
                    }
                    Err(e) => {
                        tracing::warn!(wallet_id = %wallet_id, hold_id = %hold_id, error = %e, "Hold expiry failed");
                    }
                }
            }
        }

        if !released.is_empty() {
            tracing::info!(count = released.len(), "Hold expiry sweep released funds");
        }
        released
    }

    // Reads

    /// Wallet snapshot
    pub fn wallet(&self, wallet_id: WalletId) -> Result<Wallet> {
        self.with_book(wallet_id, |book| Ok(book.wallet.clone()))
    }

    /// Wallet owned by an account
    pub fn wallet_for_account(&self, account_id: &AccountId) -> Result<Wallet> {
        let wallet_id = self
            .accounts
            .get(account_id)
            .map(|entry| *entry.value())
            .ok_or_else(|| Error::WalletNotFound(format!("account {}", account_id)))?;
        self.wallet(wallet_id)
    }

    /// All wallet IDs, sorted
    pub fn wallet_ids(&self) -> Vec<WalletId> {
        let mut ids: Vec<WalletId> = self.books.iter().map(|entry| *entry.key()).collect();
        ids.sort();
        ids
    }

    /// Every entry of a wallet in sequence order
    pub fn entries(&self, wallet_id: WalletId) -> Result<Vec<LedgerEntry>> {
        self.with_book(wallet_id, |book| Ok(book.entries.clone()))
    }

    /// Entries with sequence greater than `after_sequence`
    pub fn entries_since(&self, wallet_id: WalletId, after_sequence: u64) -> Result<Vec<LedgerEntry>> {
        self.with_book(wallet_id, |book| {
            let start = usize::try_from(after_sequence)
                .unwrap_or(usize::MAX)
                .min(book.entries.len());
            Ok(book.entries[start..].to_vec())
        })
    }

    /// One entry by ID
    pub fn entry(&self, wallet_id: WalletId, entry_id: Uuid) -> Result<LedgerEntry> {
        self.with_book(wallet_id, |book| {
            book.find_entry(entry_id)
                .cloned()
                .ok_or_else(|| Error::EntryNotFound(entry_id.to_string()))
        })
    }

    /// Hold by ID
    pub fn hold_by_id(&self, hold_id: HoldId) -> Result<Hold> {
        let wallet_id = self.wallet_of_hold(hold_id)?;
        self.with_book(wallet_id, |book| {
            book.holds
                .get(&hold_id)
                .cloned()
                .ok_or_else(|| Error::HoldNotFound(hold_id.to_string()))
        })
    }

    /// Active hold for a reference, if any
    pub fn active_hold_for(&self, wallet_id: WalletId, reference: &Reference) -> Result<Option<Hold>> {
        self.with_book(wallet_id, |book| {
            Ok(book
                .active_holds
                .get(reference)
                .and_then(|id| book.holds.get(id))
                .cloned())
        })
    }

    /// Recompute a wallet from its entries; never modifies anything
    pub fn verify_wallet(&self, wallet_id: WalletId) -> Result<WalletAudit> {
        self.with_book(wallet_id, |book| {
            let mut sum = Decimal::ZERO;
            let mut sequence_gaps = Vec::new();
            let mut running_balance_mismatches = Vec::new();

            for (index, entry) in book.entries.iter().enumerate() {
                let expected = index as u64 + 1;
                if entry.sequence != expected {
                    sequence_gaps.push(entry.sequence);
                }
                sum += entry.amount;
                if entry.running_balance != sum {
                    running_balance_mismatches.push(entry.sequence);
                }
            }

            let active_hold_total = book
                .active_holds
                .values()
                .filter_map(|id| book.holds.get(id))
                .map(|h| h.amount)
                .sum();

            Ok(WalletAudit {
                wallet_id,
                entry_count: book.entries.len(),
                sum_of_entries: sum,
                book_balance: book.wallet.book_balance(),
                net_of_totals: book.wallet.total_credited - book.wallet.total_debited,
                last_running_balance: book.last_running_balance(),
                active_hold_total,
                locked_balance: book.wallet.locked_balance,
                sequence_gaps,
                running_balance_mismatches,
            })
        })
    }
}

fn operation_name(operation: Operation) -> &'static str {
    match operation {
        Operation::Topup => "topup",
        Operation::Debit => "debit",
        Operation::Hold => "hold",
        Operation::Capture => "capture_hold",
        Operation::Release => "release_hold",
        Operation::Refund => "refund",
        Operation::Adjust => "adjust",
        Operation::Reverse => "reverse",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal_macros::dec;
    use std::thread;

    fn ledger() -> WalletLedger {
        WalletLedger::in_memory().unwrap()
    }

    fn funded(ledger: &WalletLedger, amount: Decimal) -> WalletId {
        let wallet = ledger
            .open_wallet(AccountId::new(Uuid::new_v4().to_string()), Currency::SAR, false)
            .unwrap();
        ledger
            .topup(
                wallet.wallet_id,
                amount,
                Reference::gateway("seed"),
                IdempotencyKey::new("seed"),
            )
            .unwrap();
        wallet.wallet_id
    }

    #[test]
    fn test_one_wallet_per_account() {
        let ledger = ledger();
        let account = AccountId::new("acct-1");
        ledger.open_wallet(account.clone(), Currency::SAR, false).unwrap();
        let err = ledger.open_wallet(account, Currency::SAR, false).unwrap_err();
        assert!(matches!(err, Error::WalletExists(_)));
    }

    #[test]
    fn test_topup_is_idempotent() {
        let ledger = ledger();
        let wallet = ledger
            .open_wallet(AccountId::new("acct-1"), Currency::SAR, false)
            .unwrap();

        let first = ledger
            .topup(wallet.wallet_id, dec!(100), Reference::gateway("t1"), "k1".into())
            .unwrap();
        let second = ledger
            .topup(wallet.wallet_id, dec!(100), Reference::gateway("t1"), "k1".into())
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(ledger.entries(wallet.wallet_id).unwrap().len(), 1);
        assert_eq!(ledger.wallet(wallet.wallet_id).unwrap().available_balance, dec!(100));
        assert_eq!(ledger.metrics().idempotent_replays.get(), 1);
    }

    #[test]
    fn test_key_reuse_with_different_request_conflicts() {
        let ledger = ledger();
        let wallet_id = funded(&ledger, dec!(100));
        let err = ledger
            .topup(wallet_id, dec!(5), Reference::gateway("other"), "seed".into())
            .unwrap_err();
        assert!(matches!(err, Error::IdempotencyConflict(_)));
    }

    #[test]
    fn test_hold_insufficient_funds_leaves_balance() {
        let ledger = ledger();
        let wallet_id = funded(&ledger, dec!(50));

        let err = ledger
            .hold(wallet_id, dec!(80), Reference::shipment("1"), "h1".into())
            .unwrap_err();
        assert!(matches!(err, Error::InsufficientFunds { .. }));
        assert_eq!(err.class(), crate::FailureClass::Funds);

        let wallet = ledger.wallet(wallet_id).unwrap();
        assert_eq!(wallet.available_balance, dec!(50));
        assert_eq!(wallet.locked_balance, dec!(0));
    }

    #[test]
    fn test_hold_then_capture() {
        let ledger = ledger();
        let wallet_id = funded(&ledger, dec!(100));

        let hold = ledger
            .hold(wallet_id, dec!(52), Reference::shipment("123"), "h1".into())
            .unwrap();
        let wallet = ledger.wallet(wallet_id).unwrap();
        assert_eq!(wallet.available_balance, dec!(48));
        assert_eq!(wallet.locked_balance, dec!(52));
        // Holds are metadata only
        assert_eq!(ledger.entries(wallet_id).unwrap().len(), 1);

        let entry = ledger.capture_hold(hold.hold_id, "c1".into()).unwrap();
        assert_eq!(entry.transaction_type, TransactionType::HoldCapture);
        assert_eq!(entry.amount, dec!(-52));
        assert_eq!(entry.running_balance, dec!(48));

        let wallet = ledger.wallet(wallet_id).unwrap();
        assert_eq!(wallet.available_balance, dec!(48));
        assert_eq!(wallet.locked_balance, dec!(0));
        assert_eq!(wallet.total_debited, dec!(52));
        assert_eq!(ledger.entries(wallet_id).unwrap().len(), 2);
        assert!(ledger.verify_wallet(wallet_id).unwrap().is_consistent());
    }

    #[test]
    fn test_hold_replay_returns_existing_hold() {
        let ledger = ledger();
        let wallet_id = funded(&ledger, dec!(100));

        let a = ledger
            .hold(wallet_id, dec!(30), Reference::shipment("7"), "h".into())
            .unwrap();
        let b = ledger
            .hold(wallet_id, dec!(30), Reference::shipment("7"), "h".into())
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(ledger.wallet(wallet_id).unwrap().locked_balance, dec!(30));

        let err = ledger
            .hold(wallet_id, dec!(30), Reference::shipment("7"), "other".into())
            .unwrap_err();
        assert!(matches!(err, Error::HoldAlreadyActive(_)));
    }

    #[test]
    fn test_capture_twice_with_same_key_is_noop() {
        let ledger = ledger();
        let wallet_id = funded(&ledger, dec!(100));
        let hold = ledger
            .hold(wallet_id, dec!(40), Reference::shipment("9"), "h".into())
            .unwrap();

        let first = ledger.capture_hold(hold.hold_id, "c".into()).unwrap();
        let second = ledger.capture_hold(hold.hold_id, "c".into()).unwrap();
        assert_eq!(first, second);
        assert_eq!(ledger.wallet(wallet_id).unwrap().total_debited, dec!(40));

        let err = ledger.capture_hold(hold.hold_id, "c2".into()).unwrap_err();
        assert!(matches!(err, Error::HoldNotActive { .. }));
        let err = ledger.release_hold(hold.hold_id, "r".into()).unwrap_err();
        assert!(matches!(err, Error::HoldNotActive { .. }));
    }

    #[test]
    fn test_release_restores_available() {
        let ledger = ledger();
        let wallet_id = funded(&ledger, dec!(100));
        let hold = ledger
            .hold(wallet_id, dec!(60), Reference::shipment("5"), "h".into())
            .unwrap();

        let entry = ledger.release_hold(hold.hold_id, "r".into()).unwrap();
        assert_eq!(entry.transaction_type, TransactionType::HoldRelease);
        assert_eq!(entry.amount, dec!(0));
        assert_eq!(entry.available_after, dec!(100));

        let wallet = ledger.wallet(wallet_id).unwrap();
        assert_eq!(wallet.available_balance, dec!(100));
        assert_eq!(wallet.locked_balance, dec!(0));
        assert_eq!(
            ledger.hold_by_id(hold.hold_id).unwrap().status,
            HoldStatus::Released
        );
        // A new hold for the same shipment is allowed once the first is gone
        ledger
            .hold(wallet_id, dec!(60), Reference::shipment("5"), "h2".into())
            .unwrap();
    }

    #[test]
    fn test_refund_bounded_by_original() {
        let ledger = ledger();
        let wallet_id = funded(&ledger, dec!(100));
        let hold = ledger
            .hold(wallet_id, dec!(52), Reference::shipment("1"), "h".into())
            .unwrap();
        let capture = ledger.capture_hold(hold.hold_id, "c".into()).unwrap();

        ledger
            .refund(wallet_id, dec!(30), Reference::shipment("1"), capture.entry_id, "r1".into())
            .unwrap();
        let err = ledger
            .refund(wallet_id, dec!(30), Reference::shipment("1"), capture.entry_id, "r2".into())
            .unwrap_err();
        assert!(matches!(err, Error::RefundExceedsOriginal { .. }));

        let last = ledger
            .refund(wallet_id, dec!(22), Reference::shipment("1"), capture.entry_id, "r3".into())
            .unwrap();
        assert_eq!(last.reverses_entry, Some(capture.entry_id));
        assert_eq!(ledger.wallet(wallet_id).unwrap().available_balance, dec!(100));

        // Original entry is untouched
        let original = ledger.entry(wallet_id, capture.entry_id).unwrap();
        assert_eq!(original, capture);
    }

    #[test]
    fn test_refund_requires_debit() {
        let ledger = ledger();
        let wallet_id = funded(&ledger, dec!(100));
        let topup = ledger.entries(wallet_id).unwrap()[0].clone();
        let err = ledger
            .refund(wallet_id, dec!(1), Reference::shipment("1"), topup.entry_id, "r".into())
            .unwrap_err();
        assert!(matches!(err, Error::NotRefundable(_)));
    }

    #[test]
    fn test_frozen_wallet_rejects_debits_and_credits() {
        let ledger = ledger();
        let wallet_id = funded(&ledger, dec!(100));
        ledger.freeze(wallet_id).unwrap();

        let err = ledger
            .hold(wallet_id, dec!(10), Reference::shipment("1"), "h".into())
            .unwrap_err();
        assert!(matches!(err, Error::WalletFrozen(_)));
        let err = ledger
            .topup(wallet_id, dec!(10), Reference::gateway("t"), "t".into())
            .unwrap_err();
        assert!(matches!(err, Error::WalletFrozen(_)));

        ledger.unfreeze(wallet_id).unwrap();
        ledger
            .hold(wallet_id, dec!(10), Reference::shipment("1"), "h".into())
            .unwrap();
    }

    #[test]
    fn test_frozen_wallet_accepts_credits_when_configured() {
        let config = Config {
            frozen_accepts_credits: true,
            ..Config::default()
        };
        let ledger = WalletLedger::open(config).unwrap();
        let wallet_id = funded(&ledger, dec!(10));
        ledger.freeze(wallet_id).unwrap();
        ledger
            .topup(wallet_id, dec!(5), Reference::gateway("t"), "t".into())
            .unwrap();
        assert_eq!(ledger.wallet(wallet_id).unwrap().available_balance, dec!(15));
    }

    #[test]
    fn test_allow_negative_wallet() {
        let ledger = ledger();
        let wallet = ledger
            .open_wallet(AccountId::new("credit-acct"), Currency::SAR, true)
            .unwrap();
        ledger
            .hold(wallet.wallet_id, dec!(25), Reference::shipment("1"), "h".into())
            .unwrap();
        let wallet = ledger.wallet(wallet.wallet_id).unwrap();
        assert_eq!(wallet.available_balance, dec!(-25));
        assert_eq!(wallet.locked_balance, dec!(25));
    }

    #[test]
    fn test_invalid_amounts() {
        let ledger = ledger();
        let wallet_id = funded(&ledger, dec!(10));
        assert!(matches!(
            ledger.topup(wallet_id, dec!(0), Reference::gateway("a"), "a".into()),
            Err(Error::InvalidAmount(_))
        ));
        assert!(matches!(
            ledger.topup(wallet_id, dec!(1.005), Reference::gateway("b"), "b".into()),
            Err(Error::InvalidAmount(_))
        ));
    }

    #[test]
    fn test_expire_holds() {
        let ledger = ledger();
        let wallet_id = funded(&ledger, dec!(100));
        let hold = ledger
            .hold(wallet_id, dec!(70), Reference::shipment("1"), "h".into())
            .unwrap();

        assert!(ledger.expire_holds_at(Utc::now()).is_empty());

        let later = Utc::now() + Duration::hours(25);
        let released = ledger.expire_holds_at(later);
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].hold_id, Some(hold.hold_id));

        let hold = ledger.hold_by_id(hold.hold_id).unwrap();
        assert_eq!(hold.status, HoldStatus::Expired);
        assert_eq!(ledger.wallet(wallet_id).unwrap().available_balance, dec!(100));
        assert!(ledger.expire_holds_at(later).is_empty());
        assert_eq!(ledger.metrics().active_holds.get(), 0);
    }

    #[test]
    fn test_reverse_once() {
        let ledger = ledger();
        let wallet_id = funded(&ledger, dec!(100));
        let topup = ledger.entries(wallet_id).unwrap()[0].clone();

        let reversal = ledger.reverse(wallet_id, topup.entry_id, "rv".into()).unwrap();
        assert_eq!(reversal.amount, dec!(-100));
        assert_eq!(reversal.reverses_entry, Some(topup.entry_id));

        let err = ledger.reverse(wallet_id, topup.entry_id, "rv2".into()).unwrap_err();
        assert!(matches!(err, Error::AlreadyReversed(_)));
        let err = ledger.reverse(wallet_id, reversal.entry_id, "rv3".into()).unwrap_err();
        assert!(matches!(err, Error::NotReversible(_)));
    }

    #[test]
    fn test_adjustment_and_close() {
        let ledger = ledger();
        let wallet_id = funded(&ledger, dec!(10));
        assert!(matches!(ledger.close(wallet_id), Err(Error::WalletNotEmpty(_))));

        ledger.adjust(wallet_id, dec!(-10), "write-off", "adj".into()).unwrap();
        let wallet = ledger.close(wallet_id).unwrap();
        assert_eq!(wallet.status, WalletStatus::Closed);
        assert!(matches!(
            ledger.topup(wallet_id, dec!(1), Reference::gateway("x"), "x".into()),
            Err(Error::WalletClosed(_))
        ));
    }

    #[test]
    fn test_sequences_strictly_increase() {
        let ledger = ledger();
        let wallet_id = funded(&ledger, dec!(100));
        for i in 0..5 {
            ledger
                .debit(wallet_id, dec!(1), Reference::shipment(i.to_string()), format!("d{}", i).as_str().into())
                .unwrap();
        }
        let entries = ledger.entries(wallet_id).unwrap();
        let sequences: Vec<u64> = entries.iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(ledger.entries_since(wallet_id, 4).unwrap().len(), 2);
    }

    #[test]
    fn test_concurrent_holds_on_one_wallet() {
        let ledger = Arc::new(ledger());
        let wallet_id = funded(&ledger, dec!(100));

        let handles: Vec<_> = (0..20)
            .map(|i| {
                let ledger = Arc::clone(&ledger);
                thread::spawn(move || {
                    ledger.hold(
                        wallet_id,
                        dec!(10),
                        Reference::shipment(i.to_string()),
                        IdempotencyKey::new(format!("h{}", i)),
                    )
                })
            })
            .collect();

        let placed = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|r| r.is_ok())
            .count();

        assert_eq!(placed, 10);
        let wallet = ledger.wallet(wallet_id).unwrap();
        assert_eq!(wallet.available_balance, dec!(0));
        assert_eq!(wallet.locked_balance, dec!(100));
    }

    #[test]
    fn test_journal_replay() {
        let temp = tempfile::TempDir::new().unwrap();
        let config = Config {
            data_dir: Some(temp.path().to_path_buf()),
            ..Config::default()
        };

        let (wallet_id, hold_id) = {
            let ledger = WalletLedger::open(config.clone()).unwrap();
            let wallet_id = funded(&ledger, dec!(100));
            let hold = ledger
                .hold(wallet_id, dec!(52), Reference::shipment("1"), "h".into())
                .unwrap();
            (wallet_id, hold.hold_id)
        };

        let ledger = WalletLedger::open(config).unwrap();
        let wallet = ledger.wallet(wallet_id).unwrap();
        assert_eq!(wallet.available_balance, dec!(48));
        assert_eq!(wallet.locked_balance, dec!(52));

        // Keys survive the restart
        let again = ledger
            .hold(wallet_id, dec!(52), Reference::shipment("1"), "h".into())
            .unwrap();
        assert_eq!(again.hold_id, hold_id);

        ledger.capture_hold(hold_id, "c".into()).unwrap();
        assert!(ledger.verify_wallet(wallet_id).unwrap().is_consistent());
    }
}
