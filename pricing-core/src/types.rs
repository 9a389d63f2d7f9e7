//! Rating inputs: the shipment being priced, the carrier's quoted rate and FX

use crate::{Error, Result};
use ledger_core::{AccountId, Currency};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Shipment type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShipmentType {
    /// Origin and destination in one country
    Domestic,
    /// Cross-border
    International,
    /// Return to sender
    Return,
}

impl fmt::Display for ShipmentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ShipmentType::Domestic => "domestic",
            ShipmentType::International => "international",
            ShipmentType::Return => "return",
        };
        write!(f, "{}", s)
    }
}

/// Everything about the shipment that rule conditions can match on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RatingContext {
    /// Account being priced
    pub account_id: AccountId,
    /// Subscription plan slug
    pub plan: Option<String>,
    /// ISO country code of origin
    pub origin_country: String,
    /// ISO country code of destination
    pub destination_country: String,
    /// Origin zone, if the account uses zones
    pub origin_zone: Option<String>,
    /// Destination zone, if the account uses zones
    pub destination_zone: Option<String>,
    /// Chargeable weight in kilograms
    pub weight_kg: Decimal,
    /// Shipment type
    pub shipment_type: ShipmentType,
    /// Cash on delivery
    pub cod: bool,
    /// Currency the account is billed in
    pub billing_currency: Currency,
    /// Pre-resolved tax rate in percent
    pub tax_rate_percent: Option<Decimal>,
}

impl RatingContext {
    /// Context with the required fields; everything optional left empty
    pub fn new(
        account_id: AccountId,
        origin_country: impl Into<String>,
        destination_country: impl Into<String>,
        weight_kg: Decimal,
        billing_currency: Currency,
    ) -> Self {
        let origin_country = origin_country.into();
        let destination_country = destination_country.into();
        let shipment_type = if origin_country == destination_country {
            ShipmentType::Domestic
        } else {
            ShipmentType::International
        };
        Self {
            account_id,
            plan: None,
            origin_country,
            destination_country,
            origin_zone: None,
            destination_zone: None,
            weight_kg,
            shipment_type,
            cod: false,
            billing_currency,
            tax_rate_percent: None,
        }
    }

    /// Validate shape (not business rules)
    pub fn validate(&self) -> Result<()> {
        if self.weight_kg <= Decimal::ZERO {
            return Err(Error::InvalidContext(format!(
                "weight must be positive, got {}",
                self.weight_kg
            )));
        }
        if self.origin_country.is_empty() || self.destination_country.is_empty() {
            return Err(Error::InvalidContext("origin and destination required".to_string()));
        }
        if let Some(rate) = self.tax_rate_percent {
            if rate < Decimal::ZERO {
                return Err(Error::InvalidContext(format!("negative tax rate {}", rate)));
            }
        }
        Ok(())
    }
}

/// A carrier's quoted net rate for one service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CarrierRate {
    /// Carrier code
    pub carrier: String,
    /// Service code
    pub service: String,
    /// Base price before any markup
    pub net_rate: Decimal,
    /// Carrier fuel surcharge
    pub fuel_surcharge: Decimal,
    /// Other carrier surcharges
    pub other_surcharges: Decimal,
    /// Currency the carrier quoted in
    pub currency: Currency,
}

impl CarrierRate {
    /// Rate with no carrier surcharges
    pub fn new(
        carrier: impl Into<String>,
        service: impl Into<String>,
        net_rate: Decimal,
        currency: Currency,
    ) -> Self {
        Self {
            carrier: carrier.into(),
            service: service.into(),
            net_rate,
            fuel_surcharge: Decimal::ZERO,
            other_surcharges: Decimal::ZERO,
            currency,
        }
    }

    /// Set carrier surcharges
    pub fn with_surcharges(mut self, fuel: Decimal, other: Decimal) -> Self {
        self.fuel_surcharge = fuel;
        self.other_surcharges = other;
        self
    }
}

/// One configured exchange rate
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FxRate {
    /// Source currency
    pub from: Currency,
    /// Target currency
    pub to: Currency,
    /// Units of `to` per unit of `from`
    pub rate: Decimal,
}

/// Exchange-rate lookup table
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FxRateTable {
    rates: BTreeMap<(Currency, Currency), Decimal>,
}

impl FxRateTable {
    /// Empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Table from configured rates
    pub fn from_rates(rates: &[FxRate]) -> Result<Self> {
        let mut table = Self::new();
        for rate in rates {
            table.set(rate.from, rate.to, rate.rate)?;
        }
        Ok(table)
    }

    /// Set rate for a pair
    pub fn set(&mut self, from: Currency, to: Currency, rate: Decimal) -> Result<()> {
        if rate <= Decimal::ZERO {
            return Err(Error::Config(format!(
                "FX rate {}->{} must be positive, got {}",
                from, to, rate
            )));
        }
        self.rates.insert((from, to), rate);
        Ok(())
    }

    /// Rate for a pair; identical currencies are always 1
    pub fn rate(&self, from: Currency, to: Currency) -> Result<Decimal> {
        if from == to {
            return Ok(Decimal::ONE);
        }
        self.rates
            .get(&(from, to))
            .copied()
            .ok_or(Error::MissingFxRate { from, to })
    }

    /// Convert an amount, rounded to the target currency's minor units
    pub fn convert(&self, amount: Decimal, from: Currency, to: Currency) -> Result<Decimal> {
        let rate = self.rate(from, to)?;
        Ok((amount * rate)
            .round_dp_with_strategy(to.minor_units(), RoundingStrategy::MidpointAwayFromZero))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_context_infers_shipment_type() {
        let ctx = RatingContext::new(AccountId::new("a"), "SA", "SA", dec!(1), Currency::SAR);
        assert_eq!(ctx.shipment_type, ShipmentType::Domestic);
        let ctx = RatingContext::new(AccountId::new("a"), "SA", "AE", dec!(1), Currency::SAR);
        assert_eq!(ctx.shipment_type, ShipmentType::International);
    }

    #[test]
    fn test_context_validation() {
        let ctx = RatingContext::new(AccountId::new("a"), "SA", "SA", dec!(0), Currency::SAR);
        assert!(matches!(ctx.validate(), Err(Error::InvalidContext(_))));
    }

    #[test]
    fn test_fx_lookup() {
        let mut table = FxRateTable::new();
        table.set(Currency::USD, Currency::SAR, dec!(3.75)).unwrap();

        assert_eq!(table.rate(Currency::SAR, Currency::SAR).unwrap(), Decimal::ONE);
        assert_eq!(
            table.convert(dec!(10.01), Currency::USD, Currency::SAR).unwrap(),
            dec!(37.54)
        );
        assert!(matches!(
            table.rate(Currency::SAR, Currency::USD),
            Err(Error::MissingFxRate { .. })
        ));
        assert!(table.set(Currency::EUR, Currency::SAR, dec!(0)).is_err());
    }
}
