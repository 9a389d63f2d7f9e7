//! Gateway top-up reconciliation
//!
//! Compares payment-gateway top-up records with ledger `topup` entries and
//! re-verifies every wallet's balances. The job only reads: discrepancies are
//! reported for human review and nothing in the ledger is changed.

use crate::{
    ledger::WalletLedger,
    types::{AccountId, Currency, LedgerEntry, TransactionType, WalletId},
    Result,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Reference kind that ties a top-up entry to a gateway transaction
pub const GATEWAY_REFERENCE_KIND: &str = "gateway";

/// One settled top-up as reported by the payment gateway
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayTopupRecord {
    /// Gateway transaction ID
    pub gateway_txn_id: String,
    /// Account credited
    pub account_id: AccountId,
    /// Amount settled
    pub amount: Decimal,
    /// Currency settled
    pub currency: Currency,
    /// Settlement time at the gateway
    pub settled_at: DateTime<Utc>,
}

/// Supplier of gateway top-up records
pub trait TopupRecordSource: Send + Sync {
    /// Records settled in `[from, to)`
    fn topups(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<GatewayTopupRecord>>;
}

impl TopupRecordSource for Vec<GatewayTopupRecord> {
    fn topups(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<GatewayTopupRecord>> {
        Ok(self
            .iter()
            .filter(|r| r.settled_at >= from && r.settled_at < to)
            .cloned()
            .collect())
    }
}

/// Discrepancy kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DiscrepancyKind {
    /// Gateway settled a top-up the ledger never recorded
    MissingLedgerEntry,
    /// Ledger recorded a gateway top-up the gateway does not report
    MissingGatewayRecord,
    /// Same transaction recorded more than once
    DuplicateLedgerEntry,
    /// Amounts differ between gateway and ledger
    AmountMismatch,
    /// Ledger credited a different account's wallet
    WalletMismatch,
    /// Gateway settled in a currency other than the credited wallet's
    CurrencyMismatch,
    /// Stored balances differ from the entries
    BalanceDivergence,
    /// Sequence numbers are not contiguous
    SequenceGap,
}

impl fmt::Display for DiscrepancyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DiscrepancyKind::MissingLedgerEntry => "missing_ledger_entry",
            DiscrepancyKind::MissingGatewayRecord => "missing_gateway_record",
            DiscrepancyKind::DuplicateLedgerEntry => "duplicate_ledger_entry",
            DiscrepancyKind::AmountMismatch => "amount_mismatch",
            DiscrepancyKind::WalletMismatch => "wallet_mismatch",
            DiscrepancyKind::CurrencyMismatch => "currency_mismatch",
            DiscrepancyKind::BalanceDivergence => "balance_divergence",
            DiscrepancyKind::SequenceGap => "sequence_gap",
        };
        write!(f, "{}", s)
    }
}

/// A single finding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Discrepancy {
    /// Finding kind
    pub kind: DiscrepancyKind,
    /// Wallet concerned, when known
    pub wallet_id: Option<WalletId>,
    /// Gateway transaction concerned, when known
    pub gateway_txn_id: Option<String>,
    /// Ledger entry concerned, when known
    pub entry_id: Option<Uuid>,
    /// Value on the authoritative side
    pub expected: Option<Decimal>,
    /// Value found
    pub actual: Option<Decimal>,
    /// Human-readable detail
    pub detail: String,
}

/// Outcome of one reconciliation run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationReport {
    /// Run ID
    pub run_id: Uuid,
    /// Window start, if the run was windowed
    pub window_start: Option<DateTime<Utc>>,
    /// Window end, if the run was windowed
    pub window_end: Option<DateTime<Utc>>,
    /// Run start
    pub started_at: DateTime<Utc>,
    /// Run end
    pub completed_at: DateTime<Utc>,
    /// Gateway records examined
    pub gateway_records: usize,
    /// Ledger gateway top-ups examined
    pub ledger_topups: usize,
    /// Records matched exactly
    pub matched: usize,
    /// Wallets re-verified
    pub wallets_checked: usize,
    /// Findings
    pub discrepancies: Vec<Discrepancy>,
}

impl ReconciliationReport {
    /// No discrepancies found
    pub fn is_clean(&self) -> bool {
        self.discrepancies.is_empty()
    }

    /// Number of findings of one kind
    pub fn count(&self, kind: DiscrepancyKind) -> usize {
        self.discrepancies.iter().filter(|d| d.kind == kind).count()
    }
}

/// Read-only reconciliation of the ledger against gateway records
#[derive(Debug, Clone)]
pub struct ReconciliationJob {
    ledger: Arc<WalletLedger>,
}

struct LedgerTopup {
    entry: LedgerEntry,
    account_id: AccountId,
    currency: Currency,
}

impl ReconciliationJob {
    /// Create job over a ledger
    pub fn new(ledger: Arc<WalletLedger>) -> Self {
        Self { ledger }
    }

    /// Reconcile the full ledger against `records`
    pub fn run(&self, records: &[GatewayTopupRecord]) -> Result<ReconciliationReport> {
        self.reconcile(records, None)
    }

    /// Reconcile top-ups settled in `[from, to)`
    pub fn run_window(
        &self,
        source: &dyn TopupRecordSource,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<ReconciliationReport> {
        let records = source.topups(from, to)?;
        self.reconcile(&records, Some((from, to)))
    }

    fn reconcile(
        &self,
        records: &[GatewayTopupRecord],
        window: Option<(DateTime<Utc>, DateTime<Utc>)>,
    ) -> Result<ReconciliationReport> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        tracing::info!(run_id = %run_id, records = records.len(), "Starting reconciliation");

        let mut discrepancies = Vec::new();
        let wallet_ids = self.ledger.wallet_ids();

        // txn id -> ledger top-ups carrying it
        let mut topups: BTreeMap<String, Vec<LedgerTopup>> = BTreeMap::new();
        for wallet_id in &wallet_ids {
            let wallet = self.ledger.wallet(*wallet_id)?;
            for entry in self.ledger.entries(*wallet_id)? {
                if entry.transaction_type == TransactionType::Topup
                    && entry.reference.kind == GATEWAY_REFERENCE_KIND
                {
                    topups
                        .entry(entry.reference.id.clone())
                        .or_default()
                        .push(LedgerTopup {
                            entry,
                            account_id: wallet.account_id.clone(),
                            currency: wallet.currency,
                        });
                }
            }
        }
        let ledger_topups = topups.values().map(Vec::len).sum();

        let mut matched = 0;
        let mut seen = std::collections::HashSet::new();
        for record in records {
            seen.insert(record.gateway_txn_id.as_str());
            let Some(found) = topups.get(&record.gateway_txn_id) else {
                discrepancies.push(Discrepancy {
                    kind: DiscrepancyKind::MissingLedgerEntry,
                    wallet_id: None,
                    gateway_txn_id: Some(record.gateway_txn_id.clone()),
                    entry_id: None,
                    expected: Some(record.amount),
                    actual: None,
                    detail: format!(
                        "Gateway top-up for account {} has no ledger entry",
                        record.account_id
                    ),
                });
                continue;
            };

            if found.len() > 1 {
                let total: Decimal = found.iter().map(|t| t.entry.amount).sum();
                discrepancies.push(Discrepancy {
                    kind: DiscrepancyKind::DuplicateLedgerEntry,
                    wallet_id: Some(found[0].entry.wallet_id),
                    gateway_txn_id: Some(record.gateway_txn_id.clone()),
                    entry_id: Some(found[1].entry.entry_id),
                    expected: Some(record.amount),
                    actual: Some(total),
                    detail: format!("{} ledger entries for one gateway top-up", found.len()),
                });
            }

            let topup = &found[0];
            let mut clean = found.len() == 1;
            if topup.account_id != record.account_id {
                clean = false;
                discrepancies.push(Discrepancy {
                    kind: DiscrepancyKind::WalletMismatch,
                    wallet_id: Some(topup.entry.wallet_id),
                    gateway_txn_id: Some(record.gateway_txn_id.clone()),
                    entry_id: Some(topup.entry.entry_id),
                    expected: None,
                    actual: None,
                    detail: format!(
                        "Gateway credited account {}, ledger credited account {}",
                        record.account_id, topup.account_id
                    ),
                });
            }
            if topup.currency != record.currency {
                clean = false;
                discrepancies.push(Discrepancy {
                    kind: DiscrepancyKind::CurrencyMismatch,
                    wallet_id: Some(topup.entry.wallet_id),
                    gateway_txn_id: Some(record.gateway_txn_id.clone()),
                    entry_id: Some(topup.entry.entry_id),
                    expected: Some(record.amount),
                    actual: Some(topup.entry.amount),
                    detail: format!(
                        "Gateway settled {}, ledger credited a {} wallet",
                        record.currency, topup.currency
                    ),
                });
            }
            if topup.entry.amount != record.amount {
                clean = false;
                discrepancies.push(Discrepancy {
                    kind: DiscrepancyKind::AmountMismatch,
                    wallet_id: Some(topup.entry.wallet_id),
                    gateway_txn_id: Some(record.gateway_txn_id.clone()),
                    entry_id: Some(topup.entry.entry_id),
                    expected: Some(record.amount),
                    actual: Some(topup.entry.amount),
                    detail: "Ledger top-up amount differs from gateway".to_string(),
                });
            }
            if clean {
                matched += 1;
            }
        }

        for (txn_id, found) in &topups {
            if seen.contains(txn_id.as_str()) {
                continue;
            }
            for topup in found {
                let in_window = window.map_or(true, |(from, to)| {
                    topup.entry.created_at >= from && topup.entry.created_at < to
                });
                if !in_window {
                    continue;
                }
                discrepancies.push(Discrepancy {
                    kind: DiscrepancyKind::MissingGatewayRecord,
                    wallet_id: Some(topup.entry.wallet_id),
                    gateway_txn_id: Some(txn_id.clone()),
                    entry_id: Some(topup.entry.entry_id),
                    expected: None,
                    actual: Some(topup.entry.amount),
                    detail: "Ledger top-up not reported by gateway".to_string(),
                });
            }
        }

        for wallet_id in &wallet_ids {
            let audit = self.ledger.verify_wallet(*wallet_id)?;
            for sequence in &audit.sequence_gaps {
                discrepancies.push(Discrepancy {
                    kind: DiscrepancyKind::SequenceGap,
                    wallet_id: Some(*wallet_id),
                    gateway_txn_id: None,
                    entry_id: None,
                    expected: None,
                    actual: Some(Decimal::from(*sequence)),
                    detail: format!("Unexpected sequence {}", sequence),
                });
            }
            for sequence in &audit.running_balance_mismatches {
                discrepancies.push(Discrepancy {
                    kind: DiscrepancyKind::BalanceDivergence,
                    wallet_id: Some(*wallet_id),
                    gateway_txn_id: None,
                    entry_id: None,
                    expected: None,
                    actual: None,
                    detail: format!("Running balance snapshot diverges at sequence {}", sequence),
                });
            }
            if audit.sum_of_entries != audit.book_balance
                || audit.sum_of_entries != audit.net_of_totals
            {
                discrepancies.push(Discrepancy {
                    kind: DiscrepancyKind::BalanceDivergence,
                    wallet_id: Some(*wallet_id),
                    gateway_txn_id: None,
                    entry_id: None,
                    expected: Some(audit.sum_of_entries),
                    actual: Some(audit.book_balance),
                    detail: format!(
                        "Entries sum to {}, wallet holds {}, totals net {}",
                        audit.sum_of_entries, audit.book_balance, audit.net_of_totals
                    ),
                });
            }
            if audit.active_hold_total != audit.locked_balance {
                discrepancies.push(Discrepancy {
                    kind: DiscrepancyKind::BalanceDivergence,
                    wallet_id: Some(*wallet_id),
                    gateway_txn_id: None,
                    entry_id: None,
                    expected: Some(audit.active_hold_total),
                    actual: Some(audit.locked_balance),
                    detail: "Locked balance differs from active holds".to_string(),
                });
            }
        }

        for d in &discrepancies {
            tracing::warn!(
                run_id = %run_id,
                kind = %d.kind,
                wallet_id = ?d.wallet_id,
                gateway_txn_id = ?d.gateway_txn_id,
                detail = %d.detail,
                "Reconciliation discrepancy"
            );
        }

        let report = ReconciliationReport {
            run_id,
            window_start: window.map(|(from, _)| from),
            window_end: window.map(|(_, to)| to),
            started_at,
            completed_at: Utc::now(),
            gateway_records: records.len(),
            ledger_topups,
            matched,
            wallets_checked: wallet_ids.len(),
            discrepancies,
        };

        tracing::info!(
            run_id = %run_id,
            matched = report.matched,
            discrepancies = report.discrepancies.len(),
            wallets = report.wallets_checked,
            "Reconciliation complete"
        );

        Ok(report)
    }
}
