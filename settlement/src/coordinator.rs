//! Settlement coordinator
//!
//! Drives one shipment from a selected quote option to a final ledger effect:
//!
//! - `reserve`: select the option (write-once) and hold its payable amount
//! - `confirm`: capture the hold
//! - `cancel`: release the hold, or refund the capture
//!
//! Every ledger call carries an idempotency key derived from the shipment,
//! so a retried request returns the original result instead of charging
//! twice. Requests for the same shipment are serialized through a
//! per-shipment slot; different shipments never wait on each other.

use crate::{
    config::Config,
    types::{SettlementAttempt, SettlementState, ShipmentId},
    Error, Result,
};
use chrono::Utc;
use dashmap::DashMap;
use ledger_core::{Hold, HoldStatus, IdempotencyKey, LedgerEntry, Reference, WalletId, WalletLedger};
use pricing_core::QuoteStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

type Slot = Arc<Mutex<Option<SettlementAttempt>>>;

/// Idempotency key for one step of one shipment
///
/// `blake3(operation ‖ shipment ‖ scope)`, so the same request always maps to
/// the same key and different shipments never collide.
pub fn derive_key(operation: &str, shipment_id: &ShipmentId, scope: &str) -> IdempotencyKey {
    let mut hasher = blake3::Hasher::new();
    hasher.update(operation.as_bytes());
    hasher.update(&[0]);
    hasher.update(shipment_id.as_str().as_bytes());
    hasher.update(&[0]);
    hasher.update(scope.as_bytes());
    IdempotencyKey::new(format!("{}:{}", operation, hasher.finalize().to_hex()))
}

/// Settlement coordinator
pub struct SettlementCoordinator {
    ledger: Arc<WalletLedger>,
    quotes: Arc<QuoteStore>,
    attempts: DashMap<ShipmentId, Slot>,
    retry_on_contention: bool,
    slot_timeout: Duration,
}

impl std::fmt::Debug for SettlementCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SettlementCoordinator")
            .field("attempts", &self.attempts.len())
            .field("retry_on_contention", &self.retry_on_contention)
            .finish()
    }
}

impl SettlementCoordinator {
    /// Create coordinator
    pub fn new(ledger: Arc<WalletLedger>, quotes: Arc<QuoteStore>, config: &Config) -> Self {
        Self {
            ledger,
            quotes,
            attempts: DashMap::new(),
            retry_on_contention: config.retry_on_contention,
            slot_timeout: config.slot_timeout(),
        }
    }

    /// Wallet ledger
    pub fn ledger(&self) -> &Arc<WalletLedger> {
        &self.ledger
    }

    /// Quote store
    pub fn quotes(&self) -> &Arc<QuoteStore> {
        &self.quotes
    }

    /// Select a quote option for a shipment and reserve its payable amount
    pub async fn reserve(
        &self,
        shipment_id: ShipmentId,
        quote_id: Uuid,
        option_id: u32,
        wallet_id: WalletId,
    ) -> Result<Hold> {
        let slot = self.slot(&shipment_id);
        let mut guard = self.lock(&shipment_id, slot).await?;

        if let Some(existing) = guard.as_mut() {
            // Replay only while the hold still stands or was captured
            if let (SettlementState::Reserved | SettlementState::Captured, Some(hold_id), true) = (
                existing.state,
                existing.hold_id,
                existing.is_same_request(quote_id, option_id, wallet_id),
            ) {
                let hold = self.ledger.hold_by_id(hold_id)?;
                match hold.status {
                    HoldStatus::Active | HoldStatus::Captured => {
                        tracing::debug!(shipment_id = %shipment_id, hold_id = %hold_id, "Reservation replayed");
                        return Ok(hold);
                    }
                    // Swept while reserved
                    HoldStatus::Expired => {
                        advance(existing, SettlementState::Released)?;
                        existing.release_entry_id = hold.settled_entry_id;
                        tracing::warn!(shipment_id = %shipment_id, hold_id = %hold_id, "Reservation replayed after hold expiry");
                        return Err(Error::HoldExpired(shipment_id.to_string()));
                    }
                    HoldStatus::Released => {
                        return Err(invalid_transition(&shipment_id, existing.state, SettlementState::Reserved))
                    }
                }
            }
            // Quoted means a previous attempt failed before the hold; start over
            if !existing.state.can_transition_to(SettlementState::Reserved) {
                return Err(self.reserve_refused(existing));
            }
        }

        let quote = self.quotes.quote(quote_id)?;
        let option = quote
            .option(option_id)
            .ok_or(pricing_core::Error::OptionNotFound { quote_id, option_id })?;
        let (amount, currency) = (option.payable_amount, option.currency);

        let wallet = match self.ledger.wallet_for_account(&quote.account_id) {
            Ok(wallet) if wallet.wallet_id == wallet_id => wallet,
            Ok(_) | Err(ledger_core::Error::WalletNotFound(_)) => {
                let wallet = self.ledger.wallet(wallet_id)?;
                return Err(Error::AccountMismatch(format!(
                    "wallet {} belongs to {}, quote {} is for {}",
                    wallet_id, wallet.account_id, quote_id, quote.account_id
                )));
            }
            Err(e) => return Err(e.into()),
        };
        if wallet.currency != currency {
            return Err(Error::CurrencyMismatch {
                quote: currency.to_string(),
                wallet: wallet.currency.to_string(),
            });
        }

        let scope = quote_id.to_string();
        let selection_key = derive_key("select", &shipment_id, &scope);
        self.quotes
            .select_option(quote_id, option_id, selection_key.as_str(), Utc::now())?;

        let now = Utc::now();
        let mut attempt = SettlementAttempt {
            shipment_id: shipment_id.clone(),
            account_id: quote.account_id.clone(),
            wallet_id,
            quote_id,
            option_id,
            amount,
            currency,
            state: SettlementState::Quoted,
            hold_id: None,
            capture_entry_id: None,
            release_entry_id: None,
            refund_entry_id: None,
            created_at: now,
            updated_at: now,
        };
        *guard = Some(attempt.clone());

        let key = derive_key("reserve", &shipment_id, &scope);
        let reference = Reference::shipment(shipment_id.as_str());
        let hold = self
            .ledger_call("hold", &shipment_id, move |ledger| {
                ledger.hold(wallet_id, amount, reference.clone(), key.clone())
            })
            .await?;

        advance(&mut attempt, SettlementState::Reserved)?;
        attempt.hold_id = Some(hold.hold_id);
        *guard = Some(attempt);

        tracing::info!(
            shipment_id = %shipment_id,
            quote_id = %quote_id,
            option_id,
            wallet_id = %wallet_id,
            hold_id = %hold.hold_id,
            amount = %amount,
            "Shipment reserved"
        );
        Ok(hold)
    }

    /// Capture the shipment's hold; the shipment becomes financially final
    pub async fn confirm(&self, shipment_id: &ShipmentId) -> Result<LedgerEntry> {
        let mut guard = self.existing(shipment_id).await?;
        let attempt = guard
            .as_mut()
            .ok_or_else(|| Error::SettlementNotFound(shipment_id.to_string()))?;

        match (attempt.state, attempt.capture_entry_id) {
            (SettlementState::Captured, Some(entry_id)) => {
                tracing::debug!(shipment_id = %shipment_id, "Confirmation replayed");
                return Ok(self.ledger.entry(attempt.wallet_id, entry_id)?);
            }
            (from, _) if !from.can_transition_to(SettlementState::Captured) => {
                return Err(invalid_transition(shipment_id, from, SettlementState::Captured))
            }
            _ => {}
        }

        let hold_id = attempt
            .hold_id
            .ok_or_else(|| Error::SettlementNotFound(shipment_id.to_string()))?;
        let key = derive_key("confirm", shipment_id, &hold_id.to_string());

        let captured = self
            .ledger_call("capture_hold", shipment_id, move |ledger| {
                ledger.capture_hold(hold_id, key.clone())
            })
            .await;
        match captured {
            Ok(entry) => {
                advance(attempt, SettlementState::Captured)?;
                attempt.capture_entry_id = Some(entry.entry_id);
                tracing::info!(
                    shipment_id = %shipment_id,
                    hold_id = %hold_id,
                    sequence = entry.sequence,
                    "Shipment confirmed"
                );
                Ok(entry)
            }
            Err(e @ Error::Ledger(ledger_core::Error::HoldNotActive { .. })) => {
                let hold = self.ledger.hold_by_id(hold_id)?;
                if hold.status != HoldStatus::Expired {
                    return Err(e);
                }
                advance(attempt, SettlementState::Released)?;
                attempt.release_entry_id = hold.settled_entry_id;
                tracing::warn!(shipment_id = %shipment_id, hold_id = %hold_id, "Confirmation after hold expiry");
                Err(Error::HoldExpired(shipment_id.to_string()))
            }
            Err(e) => Err(e),
        }
    }

    /// Cancel the shipment
    ///
    /// Before capture the hold is released; after capture the charge is
    /// refunded. Both leave the account with zero net cost. Returns the
    /// release or refund entry, or `None` when nothing was reserved.
    pub async fn cancel(&self, shipment_id: &ShipmentId) -> Result<Option<LedgerEntry>> {
        let mut guard = self.existing(shipment_id).await?;
        let attempt = guard
            .as_mut()
            .ok_or_else(|| Error::SettlementNotFound(shipment_id.to_string()))?;

        match attempt.state {
            SettlementState::Quoted => {
                advance(attempt, SettlementState::Cancelled)?;
                tracing::info!(shipment_id = %shipment_id, "Shipment cancelled before reservation");
                Ok(None)
            }
            SettlementState::Cancelled => Ok(None),
            SettlementState::Released => self.recorded_entry(attempt.wallet_id, attempt.release_entry_id),
            SettlementState::Refunded => self.recorded_entry(attempt.wallet_id, attempt.refund_entry_id),
            SettlementState::Reserved => self.release_reserved(attempt).await,
            SettlementState::Captured => self.refund_captured(attempt).await.map(Some),
        }
    }

    /// Current attempt for a shipment
    pub async fn attempt(&self, shipment_id: &ShipmentId) -> Result<SettlementAttempt> {
        let guard = self.existing(shipment_id).await?;
        guard
            .as_ref()
            .cloned()
            .ok_or_else(|| Error::SettlementNotFound(shipment_id.to_string()))
    }

    async fn release_reserved(&self, attempt: &mut SettlementAttempt) -> Result<Option<LedgerEntry>> {
        let shipment_id = attempt.shipment_id.clone();
        let hold_id = attempt
            .hold_id
            .ok_or_else(|| Error::SettlementNotFound(shipment_id.to_string()))?;

        if self.ledger.hold_by_id(hold_id)?.is_active() {
            let key = derive_key("cancel", &shipment_id, &hold_id.to_string());
            let released = self
                .ledger_call("release_hold", &shipment_id, move |ledger| {
                    ledger.release_hold(hold_id, key.clone())
                })
                .await;
            match released {
                Ok(entry) => {
                    advance(attempt, SettlementState::Released)?;
                    attempt.release_entry_id = Some(entry.entry_id);
                    tracing::info!(shipment_id = %shipment_id, hold_id = %hold_id, "Reservation released");
                    return Ok(Some(entry));
                }
                // Settled underneath us; fall through and observe how
                Err(Error::Ledger(ledger_core::Error::HoldNotActive { .. })) => {}
                Err(e) => return Err(e),
            }
        }

        let hold = self.ledger.hold_by_id(hold_id)?;
        match hold.status {
            HoldStatus::Expired | HoldStatus::Released => {
                advance(attempt, SettlementState::Released)?;
                attempt.release_entry_id = hold.settled_entry_id;
                tracing::info!(shipment_id = %shipment_id, hold_id = %hold_id, status = %hold.status, "Reservation already released");
                self.recorded_entry(attempt.wallet_id, hold.settled_entry_id)
            }
            HoldStatus::Captured => {
                advance(attempt, SettlementState::Captured)?;
                attempt.capture_entry_id = hold.settled_entry_id;
                self.refund_captured(attempt).await.map(Some)
            }
            HoldStatus::Active => Err(Error::Contention(shipment_id.to_string())),
        }
    }

    async fn refund_captured(&self, attempt: &mut SettlementAttempt) -> Result<LedgerEntry> {
        let shipment_id = attempt.shipment_id.clone();
        let capture_entry_id = attempt
            .capture_entry_id
            .ok_or_else(|| Error::SettlementNotFound(shipment_id.to_string()))?;
        let key = derive_key("refund", &shipment_id, &capture_entry_id.to_string());
        let reference = Reference::shipment(shipment_id.as_str());
        let (wallet_id, amount) = (attempt.wallet_id, attempt.amount);

        let entry = self
            .ledger_call("refund", &shipment_id, move |ledger| {
                ledger.refund(wallet_id, amount, reference.clone(), capture_entry_id, key.clone())
            })
            .await?;

        advance(attempt, SettlementState::Refunded)?;
        attempt.refund_entry_id = Some(entry.entry_id);
        tracing::info!(
            shipment_id = %shipment_id,
            refunds_entry = %capture_entry_id,
            amount = %amount,
            "Captured shipment refunded"
        );
        Ok(entry)
    }

    /// Why a shipment in a non-quoted state cannot reserve again
    fn reserve_refused(&self, attempt: &SettlementAttempt) -> Error {
        let shipment_id = &attempt.shipment_id;
        if !attempt.state.is_terminal() {
            return Error::AlreadyReserved(shipment_id.to_string());
        }
        let lapsed = attempt
            .hold_id
            .and_then(|hold_id| self.ledger.hold_by_id(hold_id).ok())
            .map_or(false, |hold| hold.status == HoldStatus::Expired);
        if lapsed {
            Error::HoldExpired(shipment_id.to_string())
        } else {
            invalid_transition(shipment_id, attempt.state, SettlementState::Reserved)
        }
    }

    fn recorded_entry(&self, wallet_id: WalletId, entry_id: Option<Uuid>) -> Result<Option<LedgerEntry>> {
        entry_id
            .map(|id| self.ledger.entry(wallet_id, id))
            .transpose()
            .map_err(Error::from)
    }

    /// Run a ledger call, retrying once if it lost a lock race
    async fn ledger_call<T, F>(&self, operation: &'static str, shipment_id: &ShipmentId, call: F) -> Result<T>
    where
        T: Send + 'static,
        F: Fn(&WalletLedger) -> ledger_core::Result<T> + Send + Sync + 'static,
    {
        let call = Arc::new(call);
        match self.blocking(Arc::clone(&call)).await? {
            Err(e) if self.retry_on_contention && e.is_retriable() => {
                tracing::warn!(operation, shipment_id = %shipment_id, error = %e, "Contention, retrying once");
                Ok(self.blocking(call).await??)
            }
            other => Ok(other?),
        }
    }

    /// Wallet writes can wait on a wallet lock; run them off the async workers
    async fn blocking<T, F>(&self, call: Arc<F>) -> Result<ledger_core::Result<T>>
    where
        T: Send + 'static,
        F: Fn(&WalletLedger) -> ledger_core::Result<T> + Send + Sync + 'static,
    {
        let ledger = Arc::clone(&self.ledger);
        Ok(tokio::task::spawn_blocking(move || call(&ledger)).await?)
    }

    fn slot(&self, shipment_id: &ShipmentId) -> Slot {
        Arc::clone(
            self.attempts
                .entry(shipment_id.clone())
                .or_insert_with(|| Arc::new(Mutex::new(None)))
                .value(),
        )
    }

    async fn existing(&self, shipment_id: &ShipmentId) -> Result<OwnedMutexGuard<Option<SettlementAttempt>>> {
        let slot = self
            .attempts
            .get(shipment_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| Error::SettlementNotFound(shipment_id.to_string()))?;
        self.lock(shipment_id, slot).await
    }

    async fn lock(
        &self,
        shipment_id: &ShipmentId,
        slot: Slot,
    ) -> Result<OwnedMutexGuard<Option<SettlementAttempt>>> {
        tokio::time::timeout(self.slot_timeout, slot.lock_owned())
            .await
            .map_err(|_| Error::Contention(shipment_id.to_string()))
    }
}

/// Move an attempt along the state machine
fn advance(attempt: &mut SettlementAttempt, next: SettlementState) -> Result<()> {
    if !attempt.state.can_transition_to(next) {
        return Err(invalid_transition(&attempt.shipment_id, attempt.state, next));
    }
    attempt.state = next;
    attempt.updated_at = Utc::now();
    Ok(())
}

fn invalid_transition(shipment_id: &ShipmentId, from: SettlementState, to: SettlementState) -> Error {
    Error::InvalidTransition {
        shipment_id: shipment_id.to_string(),
        from: from.to_string(),
        to: to.to_string(),
    }
}
