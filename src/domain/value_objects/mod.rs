//! Value Objects for checkout

use serde::{Deserialize, Serialize};
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, Sub};
use std::str::FromStr;
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type)]
        #[serde(transparent)]
        #[sqlx(transparent)]
        pub struct $name(Uuid);

        impl $name {
            pub fn new() -> Self { Self(Uuid::now_v7()) }
            pub fn from_uuid(id: Uuid) -> Self { Self(id) }
            pub fn into_uuid(self) -> Uuid { self.0 }
        }

        impl Default for $name { fn default() -> Self { Self::new() } }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}", self.0) }
        }

        impl FromStr for $name {
            type Err = uuid::Error;
            fn from_str(s: &str) -> Result<Self, Self::Err> { Uuid::parse_str(s.trim()).map(Self) }
        }

        impl From<Uuid> for $name { fn from(id: Uuid) -> Self { Self(id) } }
    };
}

uuid_id!(
    /// Server-resolved identity of the buyer.
    CustomerId
);
uuid_id!(ProductId);
uuid_id!(VendorId);
uuid_id!(CartItemId);
uuid_id!(
    /// Internal order primary key, never shown to customers.
    OrderId
);

/// Money value object, an integer count of minor currency units.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(transparent)]
#[sqlx(transparent)]
pub struct Money(i64);

impl Money {
    pub const ZERO: Money = Money(0);

    pub const fn from_minor(amount: i64) -> Self { Self(amount) }
    pub const fn minor(&self) -> i64 { self.0 }
    pub fn is_zero(&self) -> bool { self.0 == 0 }

    /// Line total; `None` on overflow.
    pub fn checked_mul(&self, qty: u32) -> Option<Money> { self.0.checked_mul(i64::from(qty)).map(Money) }
    pub fn checked_add(&self, other: Money) -> Option<Money> { self.0.checked_add(other.0).map(Money) }
}

impl Add for Money {
    type Output = Money;
    fn add(self, rhs: Money) -> Money { Money(self.0.saturating_add(rhs.0)) }
}

impl Sub for Money {
    type Output = Money;
    fn sub(self, rhs: Money) -> Money { Money(self.0.saturating_sub(rhs.0)) }
}

impl Sum for Money {
    fn sum<I: Iterator<Item = Money>>(iter: I) -> Money { iter.fold(Money::ZERO, Add::add) }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{sign}{}.{:02}", abs / 100, abs % 100)
    }
}

/// Customer-facing order number, e.g. `ORD-000042`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderNumber(String);

impl OrderNumber {
    pub const PREFIX: &'static str = "ORD-";

    /// Derive the display number from a sequence value.
    pub fn from_sequence(seq: i64) -> Self { Self(format!("{}{:06}", Self::PREFIX, seq)) }

    pub fn parse(value: impl Into<String>) -> Result<Self, OrderNumberError> {
        let value = value.into();
        let digits = value.strip_prefix(Self::PREFIX).ok_or(OrderNumberError::MissingPrefix)?;
        if digits.len() < 6 || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(OrderNumberError::BadSequence);
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for OrderNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}", self.0) }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OrderNumberError {
    #[error("order number must start with ORD-")]
    MissingPrefix,
    #[error("order number must end in at least six digits")]
    BadSequence,
}

/// Client-supplied key used to collapse duplicate checkout submissions.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    pub const MAX_LEN: usize = 128;

    pub fn new(value: impl Into<String>) -> Option<Self> {
        let value = value.into().trim().to_string();
        if value.is_empty() || value.len() > Self::MAX_LEN { return None; }
        Some(Self(value))
    }

    pub fn as_str(&self) -> &str { &self.0 }
}
