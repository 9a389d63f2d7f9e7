//! Pricing engine
//!
//! Turns a carrier net rate into a retail price:
//!
//! 1. Resolve matching rules from a pinned [`RuleSnapshot`]
//! 2. Select rules per family (non-cumulative and fallback handling)
//! 3. Walk the selected rules in order, recording each delta
//! 4. Apply guardrails in fixed order: min-profit, min-price, max-price
//! 5. Round with the billing currency's policy
//! 6. Add pre-resolved tax
//!
//! There is no clock or randomness in the math: the same context, rate,
//! snapshot, FX rate and rounding policy always produce the same option.
//!
//! # Non-cumulative rules
//!
//! A matching non-cumulative rule stops later rules of the *same family*
//! (markup, service fee, discount, surcharge). Other families are not
//! affected. Fallback rules of a family apply only when no regular rule of
//! that family applied.

use crate::{
    config::Config,
    quote::{QuoteStore, RateQuote},
    rounding::{RoundingPolicies, RoundingPolicy},
    rules::{PricingRule, RuleCatalog, RuleFamily, RuleKind, RuleScope, RuleSnapshot},
    types::{CarrierRate, FxRateTable, RatingContext},
    Error, Result,
};
use chrono::{DateTime, Utc};
use ledger_core::Currency;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

/// One rule as applied, in evaluation order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedRule {
    /// Rule ID
    pub rule_id: String,
    /// Rule scope
    pub scope: RuleScope,
    /// Rule type
    pub kind: RuleKind,
    /// Configured value
    pub value: Decimal,
    /// Applied as a fallback
    pub fallback: bool,
    /// Change to the running total
    pub delta: Decimal,
    /// Running total after this rule
    pub total_after: Decimal,
}

/// Where a guardrail adjustment happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardrailStage {
    /// Clamp of the pre-rounding total
    Clamp,
    /// Rounding result re-rounded to respect a limit
    Rounding,
}

/// Safety-net price change, kept apart from rule deltas
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardrailAdjustment {
    /// Guardrail rule ID
    pub rule_id: String,
    /// Guardrail type
    pub kind: RuleKind,
    /// Stage
    pub stage: GuardrailStage,
    /// Value before
    pub before: Decimal,
    /// Value after
    pub after: Decimal,
    /// after − before
    pub delta: Decimal,
}

impl GuardrailAdjustment {
    fn new(rule: &PricingRule, stage: GuardrailStage, before: Decimal, after: Decimal) -> Self {
        Self {
            rule_id: rule.id.clone(),
            kind: rule.kind,
            stage,
            before,
            after,
            delta: after - before,
        }
    }
}

/// Everything needed to explain, and replay, one price
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricingBreakdown {
    /// Rule snapshot version priced against
    pub snapshot_version: u64,
    /// Rating context as received
    pub context: RatingContext,
    /// Carrier rate as received
    pub carrier_rate: CarrierRate,
    /// FX rate applied to the carrier amounts (1 when no conversion)
    pub fx_rate: Decimal,
    /// Rules applied, in evaluation order
    pub applied_rules: Vec<AppliedRule>,
    /// Guardrail adjustments, in application order
    pub guardrail_adjustments: Vec<GuardrailAdjustment>,
    /// Rounding policy used
    pub rounding_policy: RoundingPolicy,
    /// retail − pre-rounding total
    pub rounding_adjustment: Decimal,
}

/// A priced carrier option; immutable once created
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateQuoteOption {
    /// Carrier code
    pub carrier: String,
    /// Service code
    pub service: String,
    /// Billing currency
    pub currency: Currency,
    /// Net rate in billing currency
    pub net_rate: Decimal,
    /// Carrier fuel surcharge in billing currency
    pub fuel_surcharge: Decimal,
    /// Other carrier surcharges in billing currency
    pub other_surcharges: Decimal,
    /// Σ markup deltas
    pub markup: Decimal,
    /// Σ service fee deltas
    pub service_fee: Decimal,
    /// Σ rule surcharge deltas
    pub surcharges: Decimal,
    /// Σ discount deltas (≤ 0)
    pub discounts: Decimal,
    /// Total after rules, before guardrails
    pub rules_total: Decimal,
    /// Total after guardrails, before rounding
    pub pre_rounding_total: Decimal,
    /// Customer-facing price
    pub retail_rate: Decimal,
    /// retail − (net + carrier surcharges)
    pub profit_margin: Decimal,
    /// Tax on the retail rate
    pub tax_amount: Decimal,
    /// retail + tax; the amount reserved from the wallet
    pub payable_amount: Decimal,
    /// Audit breakdown
    pub breakdown: PricingBreakdown,
}

/// Options priced against one pinned snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricedBatch {
    /// Snapshot version
    pub snapshot_version: u64,
    /// One option per carrier rate, in input order
    pub options: Vec<RateQuoteOption>,
}

/// Guardrail rules selected for one price
#[derive(Debug, Default)]
struct Guardrails<'a> {
    min_profit: Option<&'a PricingRule>,
    min_price: Option<&'a PricingRule>,
    max_price: Option<&'a PricingRule>,
}

impl<'a> Guardrails<'a> {
    /// First matching rule per kind; fallbacks only when no regular rule matched
    fn select(ordered: &[&'a PricingRule]) -> Self {
        let pick = |kind: RuleKind| {
            let mut candidates = ordered.iter().filter(|r| r.kind == kind);
            candidates
                .clone()
                .find(|r| !r.fallback)
                .or_else(|| candidates.find(|r| r.fallback))
                .copied()
        };
        Self {
            min_profit: pick(RuleKind::MinProfit),
            min_price: pick(RuleKind::MinPrice),
            max_price: pick(RuleKind::MaxPrice),
        }
    }
}

/// Rules (non-guardrail) that apply, in evaluation order
fn select_rules<'a>(ordered: &[&'a PricingRule]) -> Vec<&'a PricingRule> {
    let mut selected = vec![false; ordered.len()];

    let mut blocked = BTreeSet::new();
    let mut applied = BTreeSet::new();
    for (i, rule) in ordered.iter().enumerate() {
        let family = rule.kind.family();
        if rule.fallback || family == RuleFamily::Guardrail || blocked.contains(&family) {
            continue;
        }
        selected[i] = true;
        applied.insert(family);
        if !rule.cumulative {
            blocked.insert(family);
        }
    }

    let mut fallback_blocked = BTreeSet::new();
    for (i, rule) in ordered.iter().enumerate() {
        let family = rule.kind.family();
        if !rule.fallback
            || family == RuleFamily::Guardrail
            || applied.contains(&family)
            || fallback_blocked.contains(&family)
        {
            continue;
        }
        selected[i] = true;
        if !rule.cumulative {
            fallback_blocked.insert(family);
        }
    }

    ordered
        .iter()
        .zip(selected)
        .filter_map(|(rule, keep)| keep.then_some(*rule))
        .collect()
}

/// Delta for one rule against the running total
fn rule_delta(rule: &PricingRule, net_rate: Decimal, total: Decimal) -> Decimal {
    let percent = |base: Decimal| base * rule.value / Decimal::ONE_HUNDRED;
    match rule.kind {
        RuleKind::MarkupPercentage | RuleKind::ServiceFeePercent => percent(net_rate),
        RuleKind::MarkupFixed | RuleKind::ServiceFeeFixed | RuleKind::Surcharge => rule.value,
        // Discounts never take the total below zero
        RuleKind::DiscountPercentage => -percent(total).min(total),
        RuleKind::DiscountFixed => -rule.value.min(total),
        // Applied after all rule deltas
        RuleKind::MinPrice | RuleKind::MaxPrice | RuleKind::MinProfit => Decimal::ZERO,
    }
}

/// Pricing engine
#[derive(Debug)]
pub struct PricingEngine {
    catalog: Arc<RuleCatalog>,
    rounding: RwLock<RoundingPolicies>,
    fx: RwLock<FxRateTable>,
}

impl PricingEngine {
    /// Create engine
    pub fn new(catalog: Arc<RuleCatalog>, rounding: RoundingPolicies, fx: FxRateTable) -> Self {
        Self {
            catalog,
            rounding: RwLock::new(rounding),
            fx: RwLock::new(fx),
        }
    }

    /// Create engine with rounding and FX from configuration
    pub fn from_config(catalog: Arc<RuleCatalog>, config: &Config) -> Result<Self> {
        let rounding = RoundingPolicies::from_policies(&config.rounding)?;
        let fx = FxRateTable::from_rates(&config.fx_rates)?;
        Ok(Self::new(catalog, rounding, fx))
    }

    /// Rule catalog
    pub fn catalog(&self) -> &Arc<RuleCatalog> {
        &self.catalog
    }

    /// Register or replace a currency's rounding policy
    pub fn set_rounding_policy(&self, policy: RoundingPolicy) -> Result<()> {
        self.rounding.write().register(policy)
    }

    /// Set an FX rate
    pub fn set_fx_rate(&self, from: Currency, to: Currency, rate: Decimal) -> Result<()> {
        self.fx.write().set(from, to, rate)
    }

    /// Price one carrier rate against the latest snapshot
    pub fn price(&self, ctx: &RatingContext, rate: &CarrierRate) -> Result<RateQuoteOption> {
        let snapshot = self.catalog.current();
        self.price_with_snapshot(&snapshot, ctx, rate)
    }

    /// Price several carrier rates against one pinned snapshot
    ///
    /// Fails as a whole if any rate fails: a quote never carries a partially
    /// priced option set.
    pub fn price_batch(&self, ctx: &RatingContext, rates: &[CarrierRate]) -> Result<PricedBatch> {
        if rates.is_empty() {
            return Err(Error::InvalidContext("no carrier rates to price".to_string()));
        }
        let snapshot = self.catalog.current();
        let options = rates
            .iter()
            .map(|rate| self.price_with_snapshot(&snapshot, ctx, rate))
            .collect::<Result<Vec<_>>>()?;

        Ok(PricedBatch {
            snapshot_version: snapshot.version,
            options,
        })
    }

    /// Price, then record the result as a quote (pending, then completed or failed)
    pub fn quote(
        &self,
        store: &QuoteStore,
        ctx: &RatingContext,
        rates: &[CarrierRate],
        now: DateTime<Utc>,
    ) -> Result<RateQuote> {
        let pending = store.open_quote(ctx.clone(), now);
        match self.price_batch(ctx, rates) {
            Ok(batch) => store.complete_quote(pending.quote_id, batch.options, batch.snapshot_version),
            Err(e) => {
                tracing::warn!(
                    quote_id = %pending.quote_id,
                    account_id = %ctx.account_id,
                    error = %e,
                    "Pricing failed"
                );
                store.fail_quote(pending.quote_id, e.to_string())?;
                Err(e)
            }
        }
    }

    /// Price one carrier rate against a given snapshot
    pub fn price_with_snapshot(
        &self,
        snapshot: &RuleSnapshot,
        ctx: &RatingContext,
        rate: &CarrierRate,
    ) -> Result<RateQuoteOption> {
        ctx.validate()?;
        if rate.net_rate <= Decimal::ZERO {
            return Err(Error::InvalidNetRate(rate.net_rate));
        }
        if rate.fuel_surcharge < Decimal::ZERO || rate.other_surcharges < Decimal::ZERO {
            return Err(Error::InvalidContext("carrier surcharges must not be negative".to_string()));
        }

        let currency = ctx.billing_currency;
        let policy = self.rounding.read().get(currency)?.clone();

        let (fx_rate, net_rate, fuel_surcharge, other_surcharges) = {
            let fx = self.fx.read();
            (
                fx.rate(rate.currency, currency)?,
                fx.convert(rate.net_rate, rate.currency, currency)?,
                fx.convert(rate.fuel_surcharge, rate.currency, currency)?,
                fx.convert(rate.other_surcharges, rate.currency, currency)?,
            )
        };
        if net_rate <= Decimal::ZERO {
            return Err(Error::InvalidNetRate(net_rate));
        }

        let ordered = snapshot.resolve_applicable_rules(ctx, rate);
        let selected = select_rules(&ordered);
        if !selected.iter().any(|r| r.kind.family() == RuleFamily::Markup) {
            return Err(Error::MissingFallbackRule {
                account_id: ctx.account_id.to_string(),
            });
        }

        // Carrier surcharges pass through and are part of cost
        let cost_basis = net_rate + fuel_surcharge + other_surcharges;
        let mut total = cost_basis;
        let mut applied_rules = Vec::with_capacity(selected.len());
        let (mut markup, mut service_fee, mut surcharges, mut discounts) =
            (Decimal::ZERO, Decimal::ZERO, Decimal::ZERO, Decimal::ZERO);

        for rule in selected {
            let delta = rule_delta(rule, net_rate, total);
            total += delta;
            match rule.kind.family() {
                RuleFamily::Markup => markup += delta,
                RuleFamily::ServiceFee => service_fee += delta,
                RuleFamily::Surcharge => surcharges += delta,
                RuleFamily::Discount => discounts += delta,
                RuleFamily::Guardrail => {}
            }
            applied_rules.push(AppliedRule {
                rule_id: rule.id.clone(),
                scope: rule.scope.clone(),
                kind: rule.kind,
                value: rule.value,
                fallback: rule.fallback,
                delta,
                total_after: total,
            });
        }
        let rules_total = total;

        // Guardrails: fixed order regardless of priority
        let guardrails = Guardrails::select(&ordered);
        let mut guardrail_adjustments = Vec::new();
        let mut floor: Option<(Decimal, &PricingRule)> = None;

        if let Some(rule) = guardrails.min_profit {
            let minimum = cost_basis + rule.value;
            floor = Some((minimum, rule));
            if total < minimum {
                guardrail_adjustments.push(GuardrailAdjustment::new(rule, GuardrailStage::Clamp, total, minimum));
                total = minimum;
            }
        }
        if let Some(rule) = guardrails.min_price {
            if floor.map_or(true, |(f, _)| rule.value > f) {
                floor = Some((rule.value, rule));
            }
            if total < rule.value {
                guardrail_adjustments.push(GuardrailAdjustment::new(rule, GuardrailStage::Clamp, total, rule.value));
                total = rule.value;
            }
        }
        if let Some(rule) = guardrails.max_price {
            // A floor wins over the ceiling
            let ceiling = floor.map_or(rule.value, |(f, _)| rule.value.max(f));
            if total > ceiling {
                guardrail_adjustments.push(GuardrailAdjustment::new(rule, GuardrailStage::Clamp, total, ceiling));
                total = ceiling;
            }
        }
        let pre_rounding_total = total;

        let mut retail_rate = policy.apply(pre_rounding_total)?;
        let mut raised = false;
        if let Some((minimum, rule)) = floor {
            if retail_rate < minimum {
                let up = policy.round_up(pre_rounding_total)?;
                guardrail_adjustments.push(GuardrailAdjustment::new(rule, GuardrailStage::Rounding, retail_rate, up));
                retail_rate = up;
                raised = true;
            }
        }
        if let (Some(rule), false) = (guardrails.max_price, raised) {
            if retail_rate > rule.value {
                let down = policy.round_down(pre_rounding_total)?;
                if floor.map_or(true, |(minimum, _)| down >= minimum) {
                    guardrail_adjustments.push(GuardrailAdjustment::new(rule, GuardrailStage::Rounding, retail_rate, down));
                    retail_rate = down;
                }
            }
        }

        let profit_margin = retail_rate - cost_basis;
        let tax_amount = match ctx.tax_rate_percent {
            Some(percent) => policy.to_minor_units(retail_rate * percent / Decimal::ONE_HUNDRED),
            None => policy.to_minor_units(Decimal::ZERO),
        };
        let payable_amount = retail_rate + tax_amount;

        tracing::debug!(
            account_id = %ctx.account_id,
            carrier = %rate.carrier,
            service = %rate.service,
            snapshot = snapshot.version,
            net_rate = %net_rate,
            retail_rate = %retail_rate,
            rules = applied_rules.len(),
            guardrails = guardrail_adjustments.len(),
            "Rate priced"
        );

        Ok(RateQuoteOption {
            carrier: rate.carrier.clone(),
            service: rate.service.clone(),
            currency,
            net_rate,
            fuel_surcharge,
            other_surcharges,
            markup,
            service_fee,
            surcharges,
            discounts,
            rules_total,
            pre_rounding_total,
            retail_rate,
            profit_margin,
            tax_amount,
            payable_amount,
            breakdown: PricingBreakdown {
                snapshot_version: snapshot.version,
                context: ctx.clone(),
                carrier_rate: rate.clone(),
                fx_rate,
                applied_rules,
                guardrail_adjustments,
                rounding_adjustment: retail_rate - pre_rounding_total,
                rounding_policy: policy,
            },
        })
    }
}
