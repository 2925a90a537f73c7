//! Cart Aggregate

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use crate::domain::value_objects::{CartItemId, CustomerId, Money, ProductId, VendorId};

/// Persisted cart row. The quantity is advisory, not a reservation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartItem {
    pub id: CartItemId,
    pub customer_id: CustomerId,
    pub product_id: ProductId,
    pub quantity: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A cart row joined with live product data for display.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartLine {
    pub id: CartItemId,
    pub product_id: ProductId,
    pub quantity: u32,
    pub name: String,
    pub image_url: Option<String>,
    pub unit_price: Money,
    pub stock_count: i32,
    pub in_stock: bool,
    pub vendor_id: VendorId,
}

impl CartLine {
    pub fn line_total(&self) -> Money { self.unit_price.checked_mul(self.quantity).unwrap_or(Money::from_minor(i64::MAX)) }

    /// Current stock no longer covers this line.
    pub fn exceeds_stock(&self) -> bool { !self.in_stock || i64::from(self.stock_count) < i64::from(self.quantity) }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cart {
    pub customer_id: CustomerId,
    pub lines: Vec<CartLine>,
    pub subtotal: Money,
}

impl Cart {
    pub fn new(customer_id: CustomerId, lines: Vec<CartLine>) -> Self {
        let subtotal = lines.iter().map(CartLine::line_total).sum();
        Self { customer_id, lines, subtotal }
    }

    pub fn is_empty(&self) -> bool { self.lines.is_empty() }
    pub fn item_count(&self) -> usize { self.lines.len() }

    pub fn quantity_of(&self, product_id: ProductId) -> Option<u32> {
        self.lines.iter().find(|l| l.product_id == product_id).map(|l| l.quantity)
    }
}
