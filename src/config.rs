//! Service configuration, read from the environment (and `.env` via dotenvy).

use std::collections::HashMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use crate::checkout::PaymentPolicy;
use crate::domain::aggregates::PaymentMethod;
use crate::domain::value_objects::Money;
use crate::shipping::{CarrierRates, ShippingRules};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{name} has invalid value {value:?}")]
    Invalid { name: &'static str, value: String },
}

#[derive(Clone, Debug)]
pub struct Config {
    /// `None` runs against the in-memory store.
    pub database_url: Option<String>,
    pub nats_url: Option<String>,
    pub port: u16,
    pub db_max_connections: u32,
    pub db_acquire_timeout: Duration,
    pub checkout_tx_timeout: Duration,
    pub shipping: ShippingRules,
    pub payments: PaymentPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: None,
            nats_url: None,
            port: 8083,
            db_max_connections: 10,
            db_acquire_timeout: Duration::from_millis(3_000),
            checkout_tx_timeout: Duration::from_millis(5_000),
            shipping: ShippingRules::default(),
            payments: PaymentPolicy::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build from any key lookup; unset keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let free_threshold = parse_amount(&get, "FREE_SHIPPING_THRESHOLD", defaults.shipping.free_shipping_threshold.minor())?;
        let surcharge = parse_amount(&get, "REMOTE_SURCHARGE", defaults.shipping.remote_surcharge.minor())?;
        let shipping = match get("REMOTE_DISTRICTS") {
            Some(list) => ShippingRules::new(
                Money::from_minor(free_threshold),
                Money::from_minor(surcharge),
                CarrierRates::default(),
                list.split(','),
            ),
            None => ShippingRules::new(
                Money::from_minor(free_threshold),
                Money::from_minor(surcharge),
                CarrierRates::default(),
                defaults.shipping.remote_districts(),
            ),
        };

        let default_cod = defaults.payments.ceiling(PaymentMethod::CashOnDelivery).map_or(0, |m| m.minor());
        let cod_ceiling = parse_amount(&get, "COD_CEILING", default_cod)?;
        let payments = PaymentPolicy::new(HashMap::from([(PaymentMethod::CashOnDelivery, Money::from_minor(cod_ceiling))]));

        Ok(Self {
            database_url: get("DATABASE_URL"),
            nats_url: get("NATS_URL"),
            port: parse_or(&get, "PORT", defaults.port)?,
            db_max_connections: parse_or(&get, "DB_MAX_CONNECTIONS", defaults.db_max_connections)?,
            db_acquire_timeout: Duration::from_millis(parse_or(&get, "DB_ACQUIRE_TIMEOUT_MS", 3_000)?),
            checkout_tx_timeout: Duration::from_millis(parse_or(&get, "CHECKOUT_TX_TIMEOUT_MS", 5_000)?),
            shipping,
            payments,
        })
    }
}

fn parse_or<T, G>(get: &G, name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(name) {
        Some(value) => value.parse().map_err(|_| ConfigError::Invalid { name, value }),
        None => Ok(default),
    }
}

/// Money amounts in minor units; negative values are malformed.
fn parse_amount<G>(get: &G, name: &'static str, default: i64) -> Result<i64, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    let amount: i64 = parse_or(get, name, default)?;
    if amount < 0 {
        return Err(ConfigError::Invalid { name, value: amount.to_string() });
    }
    Ok(amount)
}
