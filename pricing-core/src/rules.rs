//! Pricing rules and the versioned rule catalog
//!
//! Rules are never edited in place: every change publishes a new immutable
//! [`RuleSnapshot`]. Quotes pin the version they were priced with, and old
//! versions stay retrievable for audit.
//!
//! # Resolution order
//!
//! Matching active rules are ordered by `(priority, scope, insertion)`:
//! lower priority first, account rules before platform defaults on equal
//! priority, then the order rules were published in.

use crate::{
    types::{CarrierRate, RatingContext, ShipmentType},
    Error, Result,
};
use chrono::{DateTime, Utc};
use ledger_core::AccountId;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

/// Who a rule belongs to
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleScope {
    /// Account-specific rule
    Account(AccountId),
    /// Platform default
    Platform,
}

impl RuleScope {
    /// Account rules sort before platform rules
    fn rank(&self) -> u8 {
        match self {
            RuleScope::Account(_) => 0,
            RuleScope::Platform => 1,
        }
    }

    /// Whether this scope applies to an account
    pub fn covers(&self, account_id: &AccountId) -> bool {
        match self {
            RuleScope::Account(owner) => owner == account_id,
            RuleScope::Platform => true,
        }
    }
}

impl fmt::Display for RuleScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleScope::Account(id) => write!(f, "account:{}", id),
            RuleScope::Platform => write!(f, "platform"),
        }
    }
}

/// Rule type. Percentages are in percent units (15 means 15%).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RuleKind {
    /// Percentage of the net rate
    MarkupPercentage,
    /// Fixed amount
    MarkupFixed,
    /// Fixed service fee
    ServiceFeeFixed,
    /// Service fee as a percentage of the net rate
    ServiceFeePercent,
    /// Percentage off the running total
    DiscountPercentage,
    /// Fixed amount off the running total
    DiscountFixed,
    /// Fixed surcharge
    Surcharge,
    /// Minimum retail price
    MinPrice,
    /// Maximum retail price
    MaxPrice,
    /// Minimum profit over cost
    MinProfit,
}

/// Rule families; non-cumulative resolution is per family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleFamily {
    /// Markups
    Markup,
    /// Service fees
    ServiceFee,
    /// Discounts
    Discount,
    /// Rule surcharges
    Surcharge,
    /// Min/max clamps, applied after all other rules
    Guardrail,
}

impl RuleKind {
    /// Family this kind belongs to
    pub fn family(&self) -> RuleFamily {
        match self {
            RuleKind::MarkupPercentage | RuleKind::MarkupFixed => RuleFamily::Markup,
            RuleKind::ServiceFeeFixed | RuleKind::ServiceFeePercent => RuleFamily::ServiceFee,
            RuleKind::DiscountPercentage | RuleKind::DiscountFixed => RuleFamily::Discount,
            RuleKind::Surcharge => RuleFamily::Surcharge,
            RuleKind::MinPrice | RuleKind::MaxPrice | RuleKind::MinProfit => RuleFamily::Guardrail,
        }
    }

    /// Kebab-case name
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleKind::MarkupPercentage => "markup-percentage",
            RuleKind::MarkupFixed => "markup-fixed",
            RuleKind::ServiceFeeFixed => "service-fee-fixed",
            RuleKind::ServiceFeePercent => "service-fee-percent",
            RuleKind::DiscountPercentage => "discount-percentage",
            RuleKind::DiscountFixed => "discount-fixed",
            RuleKind::Surcharge => "surcharge",
            RuleKind::MinPrice => "min-price",
            RuleKind::MaxPrice => "max-price",
            RuleKind::MinProfit => "min-profit",
        }
    }
}

impl fmt::Display for RuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Conditions; each is optional and all present ones must match
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleConditions {
    /// Carrier code
    pub carrier: Option<String>,
    /// Service code
    pub service: Option<String>,
    /// Origin country
    pub origin_country: Option<String>,
    /// Destination country
    pub destination_country: Option<String>,
    /// Origin zone
    pub origin_zone: Option<String>,
    /// Destination zone
    pub destination_zone: Option<String>,
    /// Inclusive lower weight bound (kg)
    pub min_weight_kg: Option<Decimal>,
    /// Inclusive upper weight bound (kg)
    pub max_weight_kg: Option<Decimal>,
    /// Shipment type
    pub shipment_type: Option<ShipmentType>,
    /// Cash on delivery
    pub cod: Option<bool>,
    /// Subscription plan slug
    pub plan: Option<String>,
}

fn text_matches(condition: &Option<String>, value: &str) -> bool {
    condition
        .as_deref()
        .map_or(true, |expected| expected.eq_ignore_ascii_case(value))
}

fn optional_text_matches(condition: &Option<String>, value: Option<&str>) -> bool {
    match (condition.as_deref(), value) {
        (None, _) => true,
        (Some(expected), Some(actual)) => expected.eq_ignore_ascii_case(actual),
        (Some(_), None) => false,
    }
}

impl RuleConditions {
    /// Whether the rule applies to this shipment and carrier rate
    pub fn matches(&self, ctx: &RatingContext, rate: &CarrierRate) -> bool {
        text_matches(&self.carrier, &rate.carrier)
            && text_matches(&self.service, &rate.service)
            && text_matches(&self.origin_country, &ctx.origin_country)
            && text_matches(&self.destination_country, &ctx.destination_country)
            && optional_text_matches(&self.origin_zone, ctx.origin_zone.as_deref())
            && optional_text_matches(&self.destination_zone, ctx.destination_zone.as_deref())
            && optional_text_matches(&self.plan, ctx.plan.as_deref())
            && self.min_weight_kg.map_or(true, |min| ctx.weight_kg >= min)
            && self.max_weight_kg.map_or(true, |max| ctx.weight_kg <= max)
            && self.shipment_type.map_or(true, |t| t == ctx.shipment_type)
            && self.cod.map_or(true, |cod| cod == ctx.cod)
    }
}

/// A pricing rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricingRule {
    /// Rule ID
    pub id: String,
    /// Owning scope
    pub scope: RuleScope,
    /// Rule type
    pub kind: RuleKind,
    /// Amount or percentage
    pub value: Decimal,
    /// Match conditions
    #[serde(default)]
    pub conditions: RuleConditions,
    /// Lower is evaluated first
    pub priority: i32,
    /// If false, the first match blocks later rules of the same family
    pub cumulative: bool,
    /// Applies only when no regular rule of its family applied
    pub fallback: bool,
    /// Inactive rules are ignored
    pub active: bool,
}

impl PricingRule {
    /// Active, cumulative, non-fallback rule with no conditions
    pub fn new(id: impl Into<String>, scope: RuleScope, kind: RuleKind, value: Decimal, priority: i32) -> Self {
        Self {
            id: id.into(),
            scope,
            kind,
            value,
            conditions: RuleConditions::default(),
            priority,
            cumulative: true,
            fallback: false,
            active: true,
        }
    }

    /// Mark as fallback
    pub fn as_fallback(mut self) -> Self {
        self.fallback = true;
        self
    }

    /// Mark as non-cumulative
    pub fn exclusive(mut self) -> Self {
        self.cumulative = false;
        self
    }

    /// Replace conditions
    pub fn with_conditions(mut self, conditions: RuleConditions) -> Self {
        self.conditions = conditions;
        self
    }

    fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| Error::InvalidRule {
            rule_id: self.id.clone(),
            reason: reason.to_string(),
        };
        if self.id.is_empty() {
            return Err(invalid("empty id"));
        }
        if self.value < Decimal::ZERO {
            return Err(invalid("value must not be negative"));
        }
        if self.kind == RuleKind::DiscountPercentage && self.value > Decimal::ONE_HUNDRED {
            return Err(invalid("discount above 100%"));
        }
        if let (Some(min), Some(max)) = (self.conditions.min_weight_kg, self.conditions.max_weight_kg) {
            if min > max {
                return Err(invalid("weight range is empty"));
            }
        }
        Ok(())
    }
}

/// Immutable published rule set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSnapshot {
    /// Version, starting at 1 for the first publish
    pub version: u64,
    /// Rules in insertion order
    pub rules: Vec<PricingRule>,
    /// When it was published
    pub published_at: DateTime<Utc>,
}

impl RuleSnapshot {
    fn empty() -> Self {
        Self {
            version: 0,
            rules: Vec::new(),
            published_at: DateTime::<Utc>::MIN_UTC,
        }
    }

    /// Active rules for the account that match the context, in evaluation order
    pub fn resolve_applicable_rules(
        &self,
        ctx: &RatingContext,
        rate: &CarrierRate,
    ) -> Vec<&PricingRule> {
        let mut matching: Vec<(usize, &PricingRule)> = self
            .rules
            .iter()
            .enumerate()
            .filter(|(_, rule)| {
                rule.active
                    && rule.scope.covers(&ctx.account_id)
                    && rule.conditions.matches(ctx, rate)
            })
            .collect();

        matching.sort_by_key(|(index, rule)| (rule.priority, rule.scope.rank(), *index));
        matching.into_iter().map(|(_, rule)| rule).collect()
    }

    fn validate(&self) -> Result<()> {
        let mut ids = BTreeSet::new();
        let mut fallbacks = BTreeSet::new();
        for rule in &self.rules {
            rule.validate()?;
            if !ids.insert(rule.id.as_str()) {
                return Err(Error::InvalidRule {
                    rule_id: rule.id.clone(),
                    reason: "duplicate id".to_string(),
                });
            }
            if rule.active && rule.fallback && !fallbacks.insert((&rule.scope, rule.kind)) {
                return Err(Error::DuplicateFallbackRule {
                    scope: rule.scope.to_string(),
                    kind: rule.kind.to_string(),
                });
            }
        }
        Ok(())
    }
}

/// Versioned rule catalog
#[derive(Debug)]
pub struct RuleCatalog {
    snapshots: RwLock<BTreeMap<u64, Arc<RuleSnapshot>>>,
}

impl Default for RuleCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl RuleCatalog {
    /// Catalog holding only the empty version 0
    pub fn new() -> Self {
        let mut snapshots = BTreeMap::new();
        snapshots.insert(0, Arc::new(RuleSnapshot::empty()));
        Self {
            snapshots: RwLock::new(snapshots),
        }
    }

    /// Catalog with an initial rule set published as version 1
    pub fn with_rules(rules: Vec<PricingRule>) -> Result<Self> {
        let catalog = Self::new();
        catalog.publish(rules)?;
        Ok(catalog)
    }

    /// Latest snapshot
    pub fn current(&self) -> Arc<RuleSnapshot> {
        let snapshots = self.snapshots.read();
        snapshots
            .values()
            .next_back()
            .cloned()
            .unwrap_or_else(|| Arc::new(RuleSnapshot::empty()))
    }

    /// Snapshot by version
    pub fn snapshot(&self, version: u64) -> Result<Arc<RuleSnapshot>> {
        self.snapshots
            .read()
            .get(&version)
            .cloned()
            .ok_or(Error::UnknownSnapshot(version))
    }

    /// Replace the whole rule set, publishing a new version
    pub fn publish(&self, rules: Vec<PricingRule>) -> Result<Arc<RuleSnapshot>> {
        self.edit(move |current| *current = rules)
    }

    /// Add a rule or replace the rule with the same ID
    pub fn upsert_rule(&self, rule: PricingRule) -> Result<Arc<RuleSnapshot>> {
        self.edit(|rules| match rules.iter_mut().find(|r| r.id == rule.id) {
            Some(existing) => *existing = rule,
            None => rules.push(rule),
        })
    }

    /// Deactivate a rule by ID
    pub fn deactivate_rule(&self, rule_id: &str) -> Result<Arc<RuleSnapshot>> {
        let current = self.current();
        if !current.rules.iter().any(|r| r.id == rule_id) {
            return Err(Error::InvalidRule {
                rule_id: rule_id.to_string(),
                reason: "not found".to_string(),
            });
        }
        self.edit(|rules| {
            for rule in rules.iter_mut().filter(|r| r.id == rule_id) {
                rule.active = false;
            }
        })
    }

    fn edit(&self, f: impl FnOnce(&mut Vec<PricingRule>)) -> Result<Arc<RuleSnapshot>> {
        // Write lock held across read-modify-publish
        let mut snapshots = self.snapshots.write();
        let (version, mut rules) = snapshots
            .iter()
            .next_back()
            .map(|(v, s)| (*v, s.rules.clone()))
            .unwrap_or((0, Vec::new()));
        f(&mut rules);

        let snapshot = RuleSnapshot {
            version: version + 1,
            rules,
            published_at: Utc::now(),
        };
        snapshot.validate()?;
        let snapshot = Arc::new(snapshot);
        snapshots.insert(snapshot.version, Arc::clone(&snapshot));
        tracing::info!(version = snapshot.version, rules = snapshot.rules.len(), "Rule snapshot published");
        Ok(snapshot)
    }

    /// Resolve against the latest snapshot
    pub fn resolve_applicable_rules(
        &self,
        ctx: &RatingContext,
        rate: &CarrierRate,
    ) -> Vec<PricingRule> {
        self.current()
            .resolve_applicable_rules(ctx, rate)
            .into_iter()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledger_core::Currency;
    use rust_decimal_macros::dec;

    fn ctx() -> RatingContext {
        RatingContext::new(AccountId::new("acct-1"), "SA", "SA", dec!(2.5), Currency::SAR)
    }

    fn rate() -> CarrierRate {
        CarrierRate::new("aramex", "express", dec!(100), Currency::SAR)
    }

    #[test]
    fn test_ordering_priority_then_scope_then_insertion() {
        let account = RuleScope::Account(AccountId::new("acct-1"));
        let catalog = RuleCatalog::with_rules(vec![
            PricingRule::new("p-100", RuleScope::Platform, RuleKind::MarkupFixed, dec!(1), 100),
            PricingRule::new("a-100", account.clone(), RuleKind::MarkupFixed, dec!(1), 100),
            PricingRule::new("a-50", account.clone(), RuleKind::MarkupFixed, dec!(1), 50),
            PricingRule::new("a-100-b", account, RuleKind::MarkupFixed, dec!(1), 100),
        ])
        .unwrap();

        let ids: Vec<String> = catalog
            .resolve_applicable_rules(&ctx(), &rate())
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec!["a-50", "a-100", "a-100-b", "p-100"]);
    }

    #[test]
    fn test_conditions_filter() {
        let mut conditions = RuleConditions {
            carrier: Some("ARAMEX".into()),
            min_weight_kg: Some(dec!(1)),
            max_weight_kg: Some(dec!(5)),
            ..RuleConditions::default()
        };
        assert!(conditions.matches(&ctx(), &rate()));

        conditions.cod = Some(true);
        assert!(!conditions.matches(&ctx(), &rate()));

        let zoned = RuleConditions {
            origin_zone: Some("riyadh".into()),
            ..RuleConditions::default()
        };
        assert!(!zoned.matches(&ctx(), &rate()));
    }

    #[test]
    fn test_other_accounts_and_inactive_rules_excluded() {
        let mut inactive = PricingRule::new("off", RuleScope::Platform, RuleKind::MarkupFixed, dec!(1), 1);
        inactive.active = false;
        let catalog = RuleCatalog::with_rules(vec![
            inactive,
            PricingRule::new(
                "other",
                RuleScope::Account(AccountId::new("acct-2")),
                RuleKind::MarkupFixed,
                dec!(1),
                1,
            ),
        ])
        .unwrap();
        assert!(catalog.resolve_applicable_rules(&ctx(), &rate()).is_empty());
    }

    #[test]
    fn test_duplicate_fallback_rejected() {
        let result = RuleCatalog::with_rules(vec![
            PricingRule::new("f1", RuleScope::Platform, RuleKind::MarkupPercentage, dec!(10), 1000).as_fallback(),
            PricingRule::new("f2", RuleScope::Platform, RuleKind::MarkupPercentage, dec!(12), 1000).as_fallback(),
        ]);
        assert!(matches!(result, Err(Error::DuplicateFallbackRule { .. })));
    }

    #[test]
    fn test_snapshots_are_versioned() {
        let catalog = RuleCatalog::new();
        assert_eq!(catalog.current().version, 0);

        let v1 = catalog
            .upsert_rule(PricingRule::new("m", RuleScope::Platform, RuleKind::MarkupPercentage, dec!(10), 100))
            .unwrap();
        let v2 = catalog
            .upsert_rule(PricingRule::new("m", RuleScope::Platform, RuleKind::MarkupPercentage, dec!(20), 100))
            .unwrap();
        assert_eq!(v1.version, 1);
        assert_eq!(v2.version, 2);

        // Old versions stay intact
        assert_eq!(catalog.snapshot(1).unwrap().rules[0].value, dec!(10));
        assert_eq!(catalog.current().rules[0].value, dec!(20));
        assert!(matches!(catalog.snapshot(9), Err(Error::UnknownSnapshot(9))));

        let v3 = catalog.deactivate_rule("m").unwrap();
        assert!(!v3.rules[0].active);
        assert!(catalog.deactivate_rule("missing").is_err());
    }
}
