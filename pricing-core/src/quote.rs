//! Time-bounded rate quotes
//!
//! A quote groups the priced options for one shipment request. Lifecycle:
//!
//! ```text
//! Pending ──▶ Completed ──▶ Selected
//!    │            │
//!    ▼            ▼
//!  Failed      Expired
//! ```
//!
//! Selection is write-once. The check-and-set happens under the map shard's
//! write guard, so two concurrent selections cannot both win. Expired quotes
//! stay readable for audit.

use crate::{
    config::Config,
    engine::{PricingBreakdown, RateQuoteOption},
    types::RatingContext,
    Error, Result,
};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use ledger_core::AccountId;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Quote status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuoteStatus {
    /// Pricing in progress
    Pending,
    /// Options priced; selectable until expiry
    Completed,
    /// Pricing failed
    Failed,
    /// Past TTL without a selection
    Expired,
    /// An option was selected
    Selected,
}

impl fmt::Display for QuoteStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            QuoteStatus::Pending => "pending",
            QuoteStatus::Completed => "completed",
            QuoteStatus::Failed => "failed",
            QuoteStatus::Expired => "expired",
            QuoteStatus::Selected => "selected",
        };
        write!(f, "{}", s)
    }
}

/// Committed selection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuoteSelection {
    /// Selected option (1-based)
    pub option_id: u32,
    /// Caller token; the same key re-selecting the same option is a no-op
    pub selection_key: String,
    /// Selection timestamp
    pub selected_at: DateTime<Utc>,
}

/// Rate quote
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateQuote {
    /// Quote ID
    pub quote_id: Uuid,
    /// Account quoted
    pub account_id: AccountId,
    /// Rating context
    pub context: RatingContext,
    /// Rule snapshot the options were priced with
    pub snapshot_version: Option<u64>,
    /// Options, in carrier-rate order; option IDs are 1..=N
    pub options: Vec<RateQuoteOption>,
    /// Status
    pub status: QuoteStatus,
    /// Failure reason when `Failed`
    pub failure: Option<String>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Selection deadline
    pub expires_at: DateTime<Utc>,
    /// Committed selection
    pub selection: Option<QuoteSelection>,
}

impl RateQuote {
    /// Option by 1-based ID
    pub fn option(&self, option_id: u32) -> Option<&RateQuoteOption> {
        let index = usize::try_from(option_id).ok()?.checked_sub(1)?;
        self.options.get(index)
    }

    /// The selected option, if any
    pub fn selected_option(&self) -> Option<&RateQuoteOption> {
        self.selection.as_ref().and_then(|s| self.option(s.option_id))
    }

    /// Past its selection deadline
    pub fn is_past_ttl(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// Breakdown keyed for audit lookups
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricingBreakdownRecord {
    /// `{quote_id}:{option_id}`
    pub correlation_id: String,
    /// Quote ID
    pub quote_id: Uuid,
    /// Option ID
    pub option_id: u32,
    /// Breakdown
    pub breakdown: PricingBreakdown,
}

/// In-memory quote store
#[derive(Debug)]
pub struct QuoteStore {
    quotes: DashMap<Uuid, RateQuote>,
    ttl: Duration,
}

impl QuoteStore {
    /// Store with the configured TTL
    pub fn new(config: &Config) -> Self {
        Self::with_ttl(config.quote_ttl())
    }

    /// Store with an explicit TTL
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            quotes: DashMap::new(),
            ttl,
        }
    }

    /// Quote lifetime
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Number of quotes held
    pub fn len(&self) -> usize {
        self.quotes.len()
    }

    /// Store is empty
    pub fn is_empty(&self) -> bool {
        self.quotes.is_empty()
    }

    /// Register a pending quote
    pub fn open_quote(&self, context: RatingContext, now: DateTime<Utc>) -> RateQuote {
        let quote = RateQuote {
            quote_id: Uuid::now_v7(),
            account_id: context.account_id.clone(),
            context,
            snapshot_version: None,
            options: Vec::new(),
            status: QuoteStatus::Pending,
            failure: None,
            created_at: now,
            expires_at: now + self.ttl,
            selection: None,
        };
        self.quotes.insert(quote.quote_id, quote.clone());
        tracing::debug!(quote_id = %quote.quote_id, account_id = %quote.account_id, "Quote opened");
        quote
    }

    /// Attach priced options to a pending quote
    pub fn complete_quote(
        &self,
        quote_id: Uuid,
        options: Vec<RateQuoteOption>,
        snapshot_version: u64,
    ) -> Result<RateQuote> {
        if options.is_empty() {
            return Err(Error::InvalidContext("a quote needs at least one option".to_string()));
        }
        self.transition(quote_id, QuoteStatus::Completed, |quote| {
            quote.options = options;
            quote.snapshot_version = Some(snapshot_version);
        })
        .map(|quote| {
            tracing::info!(
                quote_id = %quote.quote_id,
                account_id = %quote.account_id,
                options = quote.options.len(),
                snapshot = snapshot_version,
                expires_at = %quote.expires_at,
                "Quote completed"
            );
            quote
        })
    }

    /// Mark a pending quote failed
    pub fn fail_quote(&self, quote_id: Uuid, reason: impl Into<String>) -> Result<RateQuote> {
        let reason = reason.into();
        self.transition(quote_id, QuoteStatus::Failed, |quote| {
            quote.failure = Some(reason);
        })
    }

    /// Create a completed quote in one step
    pub fn create_quote(
        &self,
        context: RatingContext,
        options: Vec<RateQuoteOption>,
        snapshot_version: u64,
        now: DateTime<Utc>,
    ) -> Result<RateQuote> {
        let pending = self.open_quote(context, now);
        match self.complete_quote(pending.quote_id, options, snapshot_version) {
            Ok(quote) => Ok(quote),
            Err(e) => {
                self.quotes.remove(&pending.quote_id);
                Err(e)
            }
        }
    }

    fn transition(
        &self,
        quote_id: Uuid,
        to: QuoteStatus,
        update: impl FnOnce(&mut RateQuote),
    ) -> Result<RateQuote> {
        let mut quote = self
            .quotes
            .get_mut(&quote_id)
            .ok_or(Error::QuoteNotFound(quote_id))?;
        if quote.status != QuoteStatus::Pending {
            return Err(Error::InvalidQuoteTransition {
                quote_id,
                from: quote.status.to_string(),
                to: to.to_string(),
            });
        }
        update(&mut *quote);
        quote.status = to;
        Ok(quote.clone())
    }

    /// Read a quote, including expired ones
    pub fn quote(&self, quote_id: Uuid) -> Result<RateQuote> {
        self.quotes
            .get(&quote_id)
            .map(|q| q.clone())
            .ok_or(Error::QuoteNotFound(quote_id))
    }

    /// Commit a selection (write-once)
    ///
    /// Re-selecting the same option with the same key returns the original
    /// selection. Any other second selection fails with `QuoteAlreadySelected`.
    pub fn select_option(
        &self,
        quote_id: Uuid,
        option_id: u32,
        selection_key: &str,
        now: DateTime<Utc>,
    ) -> Result<RateQuote> {
        let mut quote = self
            .quotes
            .get_mut(&quote_id)
            .ok_or(Error::QuoteNotFound(quote_id))?;

        if let Some(selection) = &quote.selection {
            if selection.option_id == option_id && selection.selection_key == selection_key {
                tracing::debug!(quote_id = %quote_id, option_id, "Selection replayed");
                return Ok(quote.clone());
            }
            return Err(Error::QuoteAlreadySelected(quote_id));
        }

        let status = quote.status;
        match status {
            QuoteStatus::Completed if quote.is_past_ttl(now) => {
                quote.status = QuoteStatus::Expired;
                return Err(Error::QuoteExpired(quote_id));
            }
            QuoteStatus::Completed => {}
            QuoteStatus::Expired => return Err(Error::QuoteExpired(quote_id)),
            QuoteStatus::Pending | QuoteStatus::Failed | QuoteStatus::Selected => {
                return Err(Error::QuoteNotSelectable {
                    quote_id,
                    status: status.to_string(),
                });
            }
        }

        if quote.option(option_id).is_none() {
            return Err(Error::OptionNotFound { quote_id, option_id });
        }

        quote.selection = Some(QuoteSelection {
            option_id,
            selection_key: selection_key.to_string(),
            selected_at: now,
        });
        quote.status = QuoteStatus::Selected;

        tracing::info!(
            quote_id = %quote_id,
            account_id = %quote.account_id,
            option_id,
            "Quote option selected"
        );
        Ok(quote.clone())
    }

    /// Expire completed quotes and fail pending ones past their TTL
    pub fn expire_stale(&self, now: DateTime<Utc>) -> usize {
        let mut swept = 0;
        for mut entry in self.quotes.iter_mut() {
            let quote = entry.value_mut();
            if !quote.is_past_ttl(now) {
                continue;
            }
            match quote.status {
                QuoteStatus::Completed => {
                    quote.status = QuoteStatus::Expired;
                    swept += 1;
                }
                QuoteStatus::Pending => {
                    quote.status = QuoteStatus::Failed;
                    quote.failure = Some("pricing did not complete before expiry".to_string());
                    swept += 1;
                }
                QuoteStatus::Failed | QuoteStatus::Expired | QuoteStatus::Selected => {}
            }
        }
        if swept > 0 {
            tracing::info!(swept, "Stale quotes expired");
        }
        swept
    }

    /// Audit records for every option on a quote
    pub fn breakdowns(&self, quote_id: Uuid) -> Result<Vec<PricingBreakdownRecord>> {
        let quote = self.quote(quote_id)?;
        Ok(quote
            .options
            .into_iter()
            .zip(1u32..)
            .map(|(option, option_id)| PricingBreakdownRecord {
                correlation_id: format!("{}:{}", quote_id, option_id),
                quote_id,
                option_id,
                breakdown: option.breakdown,
            })
            .collect())
    }
}
