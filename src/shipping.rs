//! Shipping cost calculation.
//!
//! A pure function over a static rate table: no clock, no randomness, no I/O.
//! Checkout recomputes the fee server-side with the same rules the quote used,
//! so identical inputs must always yield identical output.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use crate::domain::value_objects::Money;

/// Carriers offered at checkout.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Carrier {
    Standard,
    Express,
    Economy,
    /// In-person collection; never free-shipped, never surcharged.
    Pickup,
}

impl Carrier {
    pub const ALL: [Carrier; 4] = [Carrier::Standard, Carrier::Express, Carrier::Economy, Carrier::Pickup];

    pub fn as_str(&self) -> &'static str {
        match self {
            Carrier::Standard => "standard",
            Carrier::Express => "express",
            Carrier::Economy => "economy",
            Carrier::Pickup => "pickup",
        }
    }

    pub fn is_pickup(&self) -> bool { matches!(self, Carrier::Pickup) }
}

impl fmt::Display for Carrier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown carrier {0:?}")]
pub struct UnknownCarrier(pub String);

impl FromStr for Carrier {
    type Err = UnknownCarrier;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Carrier::ALL.into_iter().find(|c| c.as_str() == wanted).ok_or_else(|| UnknownCarrier(s.to_string()))
    }
}

/// Base rate per carrier.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CarrierRates {
    pub standard: Money,
    pub express: Money,
    pub economy: Money,
    pub pickup: Money,
}

impl CarrierRates {
    pub fn base_rate(&self, carrier: Carrier) -> Money {
        match carrier {
            Carrier::Standard => self.standard,
            Carrier::Express => self.express,
            Carrier::Economy => self.economy,
            Carrier::Pickup => self.pickup,
        }
    }
}

impl Default for CarrierRates {
    fn default() -> Self {
        Self {
            standard: Money::from_minor(600),
            express: Money::from_minor(1500),
            economy: Money::from_minor(400),
            pickup: Money::ZERO,
        }
    }
}

/// The static rule table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShippingRules {
    /// Subtotals at or above this ship free (except pickup), surcharge included.
    pub free_shipping_threshold: Money,
    pub remote_surcharge: Money,
    pub rates: CarrierRates,
    remote_districts: BTreeSet<String>,
}

impl Default for ShippingRules {
    fn default() -> Self {
        Self::new(
            Money::from_minor(10_000),
            Money::from_minor(300),
            CarrierRates::default(),
            ["Badagry", "Epe", "Ibeju-Lekki", "Ikorodu"],
        )
    }
}

impl ShippingRules {
    pub fn new<I, S>(free_shipping_threshold: Money, remote_surcharge: Money, rates: CarrierRates, remote_districts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let remote_districts = remote_districts
            .into_iter()
            .map(|d| normalize_district(d.as_ref()))
            .filter(|d| !d.is_empty())
            .collect();
        Self { free_shipping_threshold, remote_surcharge, rates, remote_districts }
    }

    pub fn is_remote(&self, district: &str) -> bool { self.remote_districts.contains(&normalize_district(district)) }

    pub fn remote_districts(&self) -> impl Iterator<Item = &str> { self.remote_districts.iter().map(String::as_str) }

    /// Fee for delivering an order of `subtotal` to `district` with `carrier`.
    pub fn shipping_cost(&self, district: &str, carrier: Carrier, subtotal: Money) -> Money {
        if carrier.is_pickup() {
            return self.rates.base_rate(carrier);
        }
        if subtotal >= self.free_shipping_threshold {
            return Money::ZERO;
        }
        let cost = self.rates.base_rate(carrier);
        if self.is_remote(district) {
            cost + self.remote_surcharge
        } else {
            cost
        }
    }
}

fn normalize_district(district: &str) -> String { district.trim().to_lowercase() }
