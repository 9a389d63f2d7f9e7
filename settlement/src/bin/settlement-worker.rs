//! Settlement worker binary
//!
//! Opens the wallet ledger and quote store, then runs the expiry sweeps and
//! scheduled reconciliation until interrupted.

use anyhow::Context;
use ledger_core::{TopupRecordSource, WalletLedger};
use pricing_core::QuoteStore;
use settlement::{Config, JsonFileTopupSource, SweepScheduler};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if std::env::var("LOG_FORMAT").map(|f| f == "json").unwrap_or(false) {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let config = Config::from_env().context("failed to load configuration")?;
    tracing::info!(
        service = %config.service_name,
        version = %config.service_version,
        "Starting settlement worker"
    );

    let ledger = Arc::new(WalletLedger::open(config.ledger.clone()).context("failed to open ledger")?);
    tracing::info!(wallets = ledger.wallet_ids().len(), "Ledger opened");

    let quotes = Arc::new(QuoteStore::new(&config.pricing));

    let source = config.gateway_export.as_ref().map(|path| {
        tracing::info!(path = %path.display(), "Reconciling against gateway export");
        Arc::new(JsonFileTopupSource::new(path)) as Arc<dyn TopupRecordSource>
    });

    let scheduler = Arc::new(
        SweepScheduler::new(ledger, quotes, source, config.schedule.clone())
            .context("invalid schedule")?,
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let worker = tokio::spawn(scheduler.run(shutdown_rx));

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down settlement worker");
    shutdown_tx.send(true).ok();

    worker.await??;
    Ok(())
}
