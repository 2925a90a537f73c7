//! Product Aggregate
//!
//! Read-only catalog view used by the cart and checkout. Vendor CRUD owns the
//! rest of the product lifecycle; the only write this crate performs is the
//! guarded stock decrement inside the order transaction.

use serde::{Deserialize, Serialize};
use crate::domain::value_objects::{Money, ProductId, VendorId};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Product {
    pub id: ProductId,
    pub vendor_id: VendorId,
    pub name: String,
    pub image_url: Option<String>,
    pub price: Money,
    pub stock_count: i32,
    pub in_stock: bool,
}

impl Product {
    pub fn new(vendor_id: VendorId, name: impl Into<String>, price: Money, stock_count: i32) -> Self {
        let stock_count = stock_count.max(0);
        Self {
            id: ProductId::new(), vendor_id, name: name.into(), image_url: None,
            price, stock_count, in_stock: stock_count > 0,
        }
    }

    /// Whether `quantity` units can be taken from current stock.
    pub fn can_supply(&self, quantity: u32) -> bool {
        self.in_stock && i64::from(self.stock_count) >= i64::from(quantity)
    }

    pub fn available(&self) -> u32 { u32::try_from(self.stock_count).unwrap_or(0) }

    /// Conditional decrement: only applies when enough stock remains, and keeps
    /// `in_stock` in step with `stock_count` on the same row.
    pub fn decrement_stock(&mut self, quantity: u32) -> Result<(), ProductError> {
        if !self.can_supply(quantity) {
            return Err(ProductError::InsufficientStock { available: self.available() });
        }
        let quantity = i32::try_from(quantity).map_err(|_| ProductError::InsufficientStock { available: self.available() })?;
        self.stock_count -= quantity;
        self.in_stock = self.stock_count > 0;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProductError {
    #[error("insufficient stock, {available} available")]
    InsufficientStock { available: u32 },
}
