//! Background sweeps and scheduled reconciliation
//!
//! - Every `sweep_interval_secs`: expire stale quotes and lapsed holds
//! - At each configured UTC time of day: reconcile the ledger against the
//!   gateway export for the preceding lookback window

use crate::{config::ScheduleConfig, Error, Result};
use chrono::{DateTime, Duration, NaiveTime, Utc};
use ledger_core::{ReconciliationJob, ReconciliationReport, TopupRecordSource, WalletLedger};
use pricing_core::QuoteStore;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

impl ScheduleConfig {
    /// Parse reconciliation times into NaiveTime, sorted
    fn parse_times(&self) -> Result<Vec<NaiveTime>> {
        if self.reconciliation_times.is_empty() {
            return Err(Error::Config("No reconciliation times configured".to_string()));
        }
        let mut times = self
            .reconciliation_times
            .iter()
            .map(|time_str| {
                NaiveTime::parse_from_str(time_str, "%H:%M").map_err(|e| {
                    Error::Config(format!("Invalid time format '{}': {}", time_str, e))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        times.sort();
        Ok(times)
    }

    /// Next reconciliation run strictly after `now`
    pub fn next_reconciliation_time(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let times = self.parse_times()?;
        let current_time = now.time();

        // Next run today
        for run_time in &times {
            if current_time < *run_time {
                return now
                    .date_naive()
                    .and_time(*run_time)
                    .and_local_timezone(Utc)
                    .single()
                    .ok_or_else(|| Error::Config("Invalid timezone conversion".to_string()));
            }
        }

        // No more runs today, first run tomorrow
        let tomorrow = (now + Duration::days(1)).date_naive();
        let first_run = times
            .first()
            .ok_or_else(|| Error::Config("No reconciliation times configured".to_string()))?;

        tomorrow
            .and_time(*first_run)
            .and_local_timezone(Utc)
            .single()
            .ok_or_else(|| Error::Config("Invalid timezone conversion".to_string()))
    }

    /// Sweep period as a std duration
    pub fn sweep_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

/// Outcome of one expiry sweep
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SweepReport {
    /// Quotes moved to expired or failed
    pub quotes_expired: usize,
    /// Holds released by expiry
    pub holds_expired: usize,
}

/// Runs the expiry sweeps and reconciliation on schedule
pub struct SweepScheduler {
    ledger: Arc<WalletLedger>,
    quotes: Arc<QuoteStore>,
    reconciliation: ReconciliationJob,
    source: Option<Arc<dyn TopupRecordSource>>,
    config: ScheduleConfig,
}

impl std::fmt::Debug for SweepScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SweepScheduler")
            .field("config", &self.config)
            .field("has_gateway_source", &self.source.is_some())
            .finish()
    }
}

impl SweepScheduler {
    /// Create scheduler; without a gateway source reconciliation is skipped
    pub fn new(
        ledger: Arc<WalletLedger>,
        quotes: Arc<QuoteStore>,
        source: Option<Arc<dyn TopupRecordSource>>,
        config: ScheduleConfig,
    ) -> Result<Self> {
        // Fail at startup rather than at the first scheduled run
        config.parse_times()?;
        Ok(Self {
            reconciliation: ReconciliationJob::new(Arc::clone(&ledger)),
            ledger,
            quotes,
            source,
            config,
        })
    }

    /// Expire stale quotes and lapsed holds as of `now`
    pub fn sweep_once(&self, now: DateTime<Utc>) -> SweepReport {
        let report = SweepReport {
            quotes_expired: self.quotes.expire_stale(now),
            holds_expired: self.ledger.expire_holds_at(now).len(),
        };
        if report != SweepReport::default() {
            info!(
                quotes_expired = report.quotes_expired,
                holds_expired = report.holds_expired,
                "Expiry sweep complete"
            );
        } else {
            debug!("Expiry sweep found nothing");
        }
        report
    }

    /// Reconcile the lookback window ending at `now`
    pub fn reconcile_once(&self, now: DateTime<Utc>) -> Result<Option<ReconciliationReport>> {
        let Some(source) = self.source.as_deref() else {
            debug!("No gateway export configured, reconciliation skipped");
            return Ok(None);
        };
        let from = now - Duration::hours(self.config.reconciliation_lookback_hours);
        let report = self.reconciliation.run_window(source, from, now)?;

        if report.is_clean() {
            info!(run_id = %report.run_id, matched = report.matched, "Reconciliation clean");
        } else {
            for discrepancy in &report.discrepancies {
                warn!(
                    run_id = %report.run_id,
                    kind = %discrepancy.kind,
                    gateway_txn_id = ?discrepancy.gateway_txn_id,
                    detail = %discrepancy.detail,
                    "Reconciliation discrepancy"
                );
            }
        }
        Ok(Some(report))
    }

    /// Run until `shutdown` flips to true
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(
            sweep_interval_secs = self.config.sweep_interval_secs,
            reconciliation_times = ?self.config.reconciliation_times,
            "Starting sweep scheduler"
        );

        let mut sweep = tokio::time::interval(self.config.sweep_interval());
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let next_run = self.config.next_reconciliation_time(Utc::now())?;
            let wait = (next_run - Utc::now()).to_std().unwrap_or_default();
            let reconcile = tokio::time::sleep(wait);
            tokio::pin!(reconcile);

            loop {
                tokio::select! {
                    _ = sweep.tick() => {
                        self.sweep_once(Utc::now());
                    }
                    _ = &mut reconcile => {
                        if let Err(e) = self.reconcile_once(Utc::now()) {
                            warn!(error = %e, "Reconciliation failed");
                        }
                        break;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            info!("Sweep scheduler stopped");
                            return Ok(());
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;
    use ledger_core::{AccountId, Currency, GatewayTopupRecord, Reference};
    use rust_decimal_macros::dec;

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc::now()
            .date_naive()
            .and_hms_opt(hour, minute, 0)
            .unwrap()
            .and_local_timezone(Utc)
            .unwrap()
    }

    #[test]
    fn test_next_reconciliation_time() {
        let config = ScheduleConfig {
            reconciliation_times: vec!["14:00".to_string(), "02:00".to_string()],
            ..ScheduleConfig::default()
        };

        let next = config.next_reconciliation_time(at(10, 0)).unwrap();
        assert_eq!(next.hour(), 14);

        let next = config.next_reconciliation_time(at(20, 0)).unwrap();
        assert_eq!(next.hour(), 2);
        assert!(next > at(20, 0));
    }

    #[test]
    fn test_invalid_times_rejected() {
        let config = ScheduleConfig {
            reconciliation_times: vec!["25:99".to_string()],
            ..ScheduleConfig::default()
        };
        let ledger = Arc::new(WalletLedger::in_memory().unwrap());
        let quotes = Arc::new(QuoteStore::with_ttl(Duration::minutes(15)));
        assert!(matches!(
            SweepScheduler::new(ledger, quotes, None, config),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_empty_times_rejected() {
        let config = ScheduleConfig {
            reconciliation_times: Vec::new(),
            ..ScheduleConfig::default()
        };
        assert!(matches!(
            config.next_reconciliation_time(Utc::now()),
            Err(Error::Config(_))
        ));
        let ledger = Arc::new(WalletLedger::in_memory().unwrap());
        let quotes = Arc::new(QuoteStore::with_ttl(Duration::minutes(15)));
        assert!(matches!(
            SweepScheduler::new(ledger, quotes, None, config),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_sweep_releases_lapsed_holds() {
        let ledger = Arc::new(WalletLedger::in_memory().unwrap());
        let quotes = Arc::new(QuoteStore::with_ttl(Duration::minutes(15)));
        let wallet = ledger
            .open_wallet(AccountId::new("acct-1"), Currency::SAR, false)
            .unwrap();
        ledger
            .topup(wallet.wallet_id, dec!(100), Reference::gateway("txn-1"), "t1".into())
            .unwrap();
        ledger
            .hold(wallet.wallet_id, dec!(40), Reference::shipment("shp-1"), "h1".into())
            .unwrap();

        let scheduler =
            SweepScheduler::new(Arc::clone(&ledger), quotes, None, ScheduleConfig::default()).unwrap();

        assert_eq!(scheduler.sweep_once(Utc::now()).holds_expired, 0);
        let later = Utc::now() + ledger.config().hold_ttl() + Duration::minutes(1);
        assert_eq!(scheduler.sweep_once(later).holds_expired, 1);
        assert_eq!(ledger.wallet(wallet.wallet_id).unwrap().available_balance, dec!(100));
    }

    #[test]
    fn test_reconcile_once() {
        let ledger = Arc::new(WalletLedger::in_memory().unwrap());
        let quotes = Arc::new(QuoteStore::with_ttl(Duration::minutes(15)));
        let wallet = ledger
            .open_wallet(AccountId::new("acct-1"), Currency::SAR, false)
            .unwrap();
        ledger
            .topup(wallet.wallet_id, dec!(100), Reference::gateway("txn-1"), "t1".into())
            .unwrap();

        let records: Vec<GatewayTopupRecord> = vec![
            GatewayTopupRecord {
                gateway_txn_id: "txn-1".to_string(),
                account_id: AccountId::new("acct-1"),
                amount: dec!(100),
                currency: Currency::SAR,
                settled_at: Utc::now() - Duration::minutes(5),
            },
            GatewayTopupRecord {
                gateway_txn_id: "txn-2".to_string(),
                account_id: AccountId::new("acct-1"),
                amount: dec!(30),
                currency: Currency::SAR,
                settled_at: Utc::now() - Duration::minutes(5),
            },
        ];
        let source: Arc<dyn TopupRecordSource> = Arc::new(records);

        let none = SweepScheduler::new(Arc::clone(&ledger), Arc::clone(&quotes), None, ScheduleConfig::default())
            .unwrap();
        assert!(none.reconcile_once(Utc::now()).unwrap().is_none());

        let scheduler =
            SweepScheduler::new(ledger, quotes, Some(source), ScheduleConfig::default()).unwrap();
        let report = scheduler.reconcile_once(Utc::now()).unwrap().unwrap();
        assert_eq!(report.matched, 1);
        assert_eq!(report.count(ledger_core::DiscrepancyKind::MissingLedgerEntry), 1);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let ledger = Arc::new(WalletLedger::in_memory().unwrap());
        let quotes = Arc::new(QuoteStore::with_ttl(Duration::minutes(15)));
        let scheduler = Arc::new(
            SweepScheduler::new(ledger, quotes, None, ScheduleConfig::default()).unwrap(),
        );

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(Arc::clone(&scheduler).run(rx));
        tx.send(true).unwrap();

        let result = tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }
}
