//! Per-currency rounding policies
//!
//! Results are always rescaled to the currency's minor units so that equal
//! prices have identical representations.

use crate::{Error, Result};
use ledger_core::Currency;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Rounding mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundingMode {
    /// Round to minor units only (midpoint away from zero)
    None,
    /// Up to the next multiple of the step
    Ceiling,
    /// Down to the previous multiple of the step
    Floor,
    /// Nearest multiple of the step, midpoint away from zero
    NearestStep,
}

/// Rounding policy for one currency
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundingPolicy {
    /// Currency this policy applies to
    pub currency: Currency,
    /// Mode
    pub mode: RoundingMode,
    /// Step for the step-based modes (e.g. 0.50, 1.00)
    pub step: Decimal,
}

impl RoundingPolicy {
    /// Validated policy
    pub fn new(currency: Currency, mode: RoundingMode, step: Decimal) -> Result<Self> {
        let policy = Self { currency, mode, step };
        policy.validate()?;
        Ok(policy)
    }

    /// Round to minor units only
    pub fn minor_units(currency: Currency) -> Self {
        Self {
            currency,
            mode: RoundingMode::None,
            step: Self::minor_unit(currency),
        }
    }

    fn minor_unit(currency: Currency) -> Decimal {
        Decimal::new(1, currency.minor_units())
    }

    /// Step must be positive and expressible in the currency's minor units
    pub fn validate(&self) -> Result<()> {
        if self.mode == RoundingMode::None {
            return Ok(());
        }
        if self.step <= Decimal::ZERO {
            return Err(Error::InvalidRoundingStep(format!(
                "{} step must be positive, got {}",
                self.currency, self.step
            )));
        }
        if self.step.normalize().scale() > self.currency.minor_units() {
            return Err(Error::InvalidRoundingStep(format!(
                "{} step {} is finer than {} minor units",
                self.currency,
                self.step,
                self.currency.minor_units()
            )));
        }
        Ok(())
    }

    /// Apply the policy's own mode
    pub fn apply(&self, amount: Decimal) -> Result<Decimal> {
        self.apply_mode(amount, self.mode)
    }

    /// Round up with the policy's step (minor unit when the mode has no step)
    pub fn round_up(&self, amount: Decimal) -> Result<Decimal> {
        self.apply_mode(amount, RoundingMode::Ceiling)
    }

    /// Round down with the policy's step (minor unit when the mode has no step)
    pub fn round_down(&self, amount: Decimal) -> Result<Decimal> {
        self.apply_mode(amount, RoundingMode::Floor)
    }

    /// Round to minor units, midpoint away from zero
    pub fn to_minor_units(&self, amount: Decimal) -> Decimal {
        let mut rounded = amount.round_dp_with_strategy(
            self.currency.minor_units(),
            RoundingStrategy::MidpointAwayFromZero,
        );
        rounded.rescale(self.currency.minor_units());
        rounded
    }

    fn apply_mode(&self, amount: Decimal, mode: RoundingMode) -> Result<Decimal> {
        self.validate()?;
        let step = match self.mode {
            RoundingMode::None => Self::minor_unit(self.currency),
            _ => self.step,
        };

        let steps = amount / step;
        let whole = match mode {
            RoundingMode::None => return Ok(self.to_minor_units(amount)),
            RoundingMode::Ceiling => steps.ceil(),
            RoundingMode::Floor => steps.floor(),
            RoundingMode::NearestStep => {
                steps.round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
            }
        };

        let mut rounded = whole * step;
        rounded.rescale(self.currency.minor_units());
        Ok(rounded)
    }
}

/// Rounding policies keyed by currency
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoundingPolicies {
    policies: BTreeMap<Currency, RoundingPolicy>,
}

impl RoundingPolicies {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry from a list, validating each policy
    pub fn from_policies(policies: &[RoundingPolicy]) -> Result<Self> {
        let mut registry = Self::new();
        for policy in policies {
            registry.register(policy.clone())?;
        }
        Ok(registry)
    }

    /// Register or replace the policy for its currency
    pub fn register(&mut self, policy: RoundingPolicy) -> Result<()> {
        policy.validate()?;
        self.policies.insert(policy.currency, policy);
        Ok(())
    }

    /// Policy for a currency
    pub fn get(&self, currency: Currency) -> Result<&RoundingPolicy> {
        self.policies
            .get(&currency)
            .ok_or(Error::NoRoundingPolicy(currency))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn policy(mode: RoundingMode, step: Decimal) -> RoundingPolicy {
        RoundingPolicy::new(Currency::SAR, mode, step).unwrap()
    }

    #[test]
    fn test_nearest_step() {
        let p = policy(RoundingMode::NearestStep, dec!(1.00));
        assert_eq!(p.apply(dec!(117)).unwrap().to_string(), "117.00");
        assert_eq!(p.apply(dec!(116.5)).unwrap(), dec!(117));
        assert_eq!(p.apply(dec!(116.49)).unwrap(), dec!(116));

        let p = policy(RoundingMode::NearestStep, dec!(0.50));
        assert_eq!(p.apply(dec!(117.30)).unwrap(), dec!(117.50));
        assert_eq!(p.apply(dec!(117.20)).unwrap(), dec!(117.00));
    }

    #[test]
    fn test_ceiling_and_floor() {
        let p = policy(RoundingMode::Ceiling, dec!(0.25));
        assert_eq!(p.apply(dec!(10.01)).unwrap(), dec!(10.25));
        assert_eq!(p.apply(dec!(10.25)).unwrap(), dec!(10.25));

        let p = policy(RoundingMode::Floor, dec!(5));
        assert_eq!(p.apply(dec!(14.99)).unwrap(), dec!(10));
    }

    #[test]
    fn test_none_rounds_to_minor_units() {
        let p = RoundingPolicy::minor_units(Currency::KWD);
        assert_eq!(p.apply(dec!(1.2345)).unwrap().to_string(), "1.235");
        assert_eq!(p.round_up(dec!(1.2341)).unwrap(), dec!(1.235));
    }

    #[test]
    fn test_invalid_steps() {
        assert!(matches!(
            RoundingPolicy::new(Currency::SAR, RoundingMode::NearestStep, dec!(0)),
            Err(Error::InvalidRoundingStep(_))
        ));
        assert!(matches!(
            RoundingPolicy::new(Currency::SAR, RoundingMode::Ceiling, dec!(0.005)),
            Err(Error::InvalidRoundingStep(_))
        ));
    }

    #[test]
    fn test_missing_policy() {
        let policies = RoundingPolicies::new();
        assert!(matches!(
            policies.get(Currency::SAR),
            Err(Error::NoRoundingPolicy(Currency::SAR))
        ));
    }
}
