//! Order Aggregate

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use validator::{Validate, ValidationError};
use crate::domain::value_objects::{CustomerId, IdempotencyKey, Money, OrderId, OrderNumber, ProductId, VendorId};
use crate::shipping::Carrier;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub order_number: OrderNumber,
    pub customer_id: CustomerId,
    pub status: OrderStatus,
    pub subtotal: Money,
    pub shipping_cost: Money,
    pub total_amount: Money,
    pub carrier: Carrier,
    pub shipping_address: ShippingAddress,
    pub payment_method: PaymentMethod,
    #[serde(skip)]
    pub idempotency_key: Option<IdempotencyKey>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// What a vendor sees of an order: no customer identity, no delivery address.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct VendorOrder {
    pub id: OrderId,
    pub order_number: OrderNumber,
    pub status: OrderStatus,
    pub carrier: Carrier,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Order> for VendorOrder {
    fn from(o: Order) -> Self {
        Self { id: o.id, order_number: o.order_number, status: o.status, carrier: o.carrier, created_at: o.created_at, updated_at: o.updated_at }
    }
}

/// Snapshot of a purchased line. `unit_price` is frozen at purchase time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderItem {
    pub order_id: OrderId,
    pub product_id: ProductId,
    pub vendor_id: VendorId,
    pub quantity: u32,
    pub unit_price: Money,
}

impl OrderItem {
    pub fn line_total(&self) -> Money { self.unit_price.checked_mul(self.quantity).unwrap_or(Money::from_minor(i64::MAX)) }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderDetails {
    #[serde(flatten)]
    pub order: Order,
    pub items: Vec<OrderItem>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus { #[default] Pending, Confirmed, Processing, Shipped, Delivered, Cancelled }

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING", Self::Confirmed => "CONFIRMED", Self::Processing => "PROCESSING",
            Self::Shipped => "SHIPPED", Self::Delivered => "DELIVERED", Self::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool { matches!(self, Self::Delivered | Self::Cancelled) }

    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        matches!(
            (self, next),
            (Pending, Confirmed) | (Confirmed, Processing) | (Processing, Shipped) | (Shipped, Delivered)
                | (Pending | Confirmed | Processing, Cancelled)
        )
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl FromStr for OrderStatus {
    type Err = OrderError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PENDING" => Ok(Self::Pending), "CONFIRMED" => Ok(Self::Confirmed), "PROCESSING" => Ok(Self::Processing),
            "SHIPPED" => Ok(Self::Shipped), "DELIVERED" => Ok(Self::Delivered), "CANCELLED" => Ok(Self::Cancelled),
            other => Err(OrderError::UnknownStatus(other.to_string())),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod { CashOnDelivery, Card, MobileWallet, BankTransfer }

impl PaymentMethod {
    pub const ALL: [PaymentMethod; 4] = [Self::CashOnDelivery, Self::Card, Self::MobileWallet, Self::BankTransfer];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CashOnDelivery => "cash_on_delivery", Self::Card => "card",
            Self::MobileWallet => "mobile_wallet", Self::BankTransfer => "bank_transfer",
        }
    }
}

impl fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl FromStr for PaymentMethod {
    type Err = OrderError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL.into_iter().find(|m| m.as_str() == s).ok_or_else(|| OrderError::UnknownPaymentMethod(s.to_string()))
    }
}

static PHONE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\+?[0-9][0-9 \-]{6,19}$").unwrap());

fn not_blank(value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() { return Err(ValidationError::new("blank")); }
    Ok(())
}

/// Immutable delivery snapshot stored verbatim on the order.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct ShippingAddress {
    #[validate(length(max = 120), custom = "not_blank")]
    pub full_name: String,
    #[validate(regex = "PHONE_RE")]
    pub phone: String,
    #[validate(length(max = 80), custom = "not_blank")]
    pub district: String,
    #[validate(length(max = 500), custom = "not_blank")]
    pub street_address: String,
    #[validate(length(max = 20))]
    pub postal_code: Option<String>,
}

impl Order {
    /// `total_amount == subtotal + shipping_cost` and the subtotal matches the items.
    pub fn is_consistent(&self, items: &[OrderItem]) -> bool {
        let items_total: Money = items.iter().map(OrderItem::line_total).sum();
        self.total_amount == self.subtotal + self.shipping_cost && items_total == self.subtotal
    }

    /// Status changes belong to vendor/admin tooling; this only enforces the state machine.
    pub fn transition(&mut self, next: OrderStatus) -> Result<(), OrderError> {
        if !self.status.can_transition_to(next) {
            return Err(OrderError::InvalidTransition { from: self.status, to: next });
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OrderError {
    #[error("cannot move order from {from} to {to}")]
    InvalidTransition { from: OrderStatus, to: OrderStatus },
    #[error("unknown order status {0:?}")]
    UnknownStatus(String),
    #[error("unknown payment method {0:?}")]
    UnknownPaymentMethod(String),
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn address() -> ShippingAddress {
        ShippingAddress {
            full_name: "Ada Obi".into(), phone: "+234 801 234 5678".into(), district: "Ikeja".into(),
            street_address: "12 Allen Avenue".into(), postal_code: None,
        }
    }

    fn order(status: OrderStatus) -> Order {
        Order {
            id: OrderId::new(), order_number: OrderNumber::from_sequence(1), customer_id: CustomerId::new(), status,
            subtotal: Money::from_minor(2000), shipping_cost: Money::from_minor(600), total_amount: Money::from_minor(2600),
            carrier: Carrier::Standard, shipping_address: address(), payment_method: PaymentMethod::Card,
            idempotency_key: None, created_at: Utc::now(), updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_order_workflow() {
        let mut o = order(OrderStatus::Pending);
        o.transition(OrderStatus::Confirmed).unwrap();
        o.transition(OrderStatus::Processing).unwrap();
        o.transition(OrderStatus::Shipped).unwrap();
        assert_eq!(
            o.transition(OrderStatus::Cancelled),
            Err(OrderError::InvalidTransition { from: OrderStatus::Shipped, to: OrderStatus::Cancelled })
        );
        o.transition(OrderStatus::Delivered).unwrap();
        assert!(o.status.is_terminal());
        assert!(!OrderStatus::Cancelled.can_transition_to(OrderStatus::Pending));
        assert!(!OrderStatus::Pending.can_transition_to(OrderStatus::Shipped));
    }

    #[test]
    fn test_cancel_before_shipping() {
        for status in [OrderStatus::Pending, OrderStatus::Confirmed, OrderStatus::Processing] {
            let mut o = order(status);
            assert!(o.transition(OrderStatus::Cancelled).is_ok(), "{status} should be cancellable");
        }
    }

    #[test]
    fn test_consistency() {
        let o = order(OrderStatus::Pending);
        let items = vec![OrderItem { order_id: o.id, product_id: ProductId::new(), vendor_id: VendorId::new(), quantity: 2, unit_price: Money::from_minor(1000) }];
        assert!(o.is_consistent(&items));
        assert!(!o.is_consistent(&items[..0]));
    }

    #[test]
    fn test_address_validation() {
        assert!(address().validate().is_ok());
        let mut bad = address();
        bad.phone = "call me".into();
        bad.district = "   ".into();
        let errors = bad.validate().unwrap_err();
        let fields = errors.field_errors();
        assert!(fields.contains_key("phone"));
        assert!(fields.contains_key("district"));
    }

    #[test]
    fn test_status_parsing() {
        assert_eq!("shipped".parse::<OrderStatus>(), Ok(OrderStatus::Shipped));
        assert!("lost".parse::<OrderStatus>().is_err());
        assert_eq!("cash_on_delivery".parse::<PaymentMethod>(), Ok(PaymentMethod::CashOnDelivery));
    }
}
