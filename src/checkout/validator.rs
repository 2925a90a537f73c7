//! Checkout validation.
//!
//! Re-checks every submitted line against current catalog truth right before
//! commit. Client prices and totals are never trusted; a single bad line
//! fails the whole checkout before anything is written.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::domain::aggregates::{PaymentMethod, Product};
use crate::domain::value_objects::{Money, ProductId, VendorId};
use crate::shipping::{Carrier, ShippingRules};
use crate::store::Catalog;
use crate::{CommerceError, Result};

/// A line as the client submitted it, with the price the customer saw.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmittedLine {
    pub product_id: ProductId,
    pub quantity: u32,
    pub unit_price: Money,
}

/// A line confirmed against the catalog; its price is the one to snapshot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ValidatedLine {
    pub product_id: ProductId,
    pub vendor_id: VendorId,
    pub quantity: u32,
    pub unit_price: Money,
}

impl ValidatedLine {
    pub fn line_total(&self) -> Option<Money> { self.unit_price.checked_mul(self.quantity) }
}

/// Server-side money for a checkout.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct Totals {
    pub subtotal: Money,
    pub shipping_cost: Money,
    pub total: Money,
}

/// Per-method order value ceilings (e.g. cash on delivery).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PaymentPolicy {
    ceilings: HashMap<PaymentMethod, Money>,
}

impl Default for PaymentPolicy {
    fn default() -> Self { Self::new(HashMap::from([(PaymentMethod::CashOnDelivery, Money::from_minor(100_000))])) }
}

impl PaymentPolicy {
    pub fn new(ceilings: HashMap<PaymentMethod, Money>) -> Self { Self { ceilings } }

    pub fn ceiling(&self, method: PaymentMethod) -> Option<Money> { self.ceilings.get(&method).copied() }

    pub fn allows(&self, method: PaymentMethod, total: Money) -> bool { self.ceiling(method).map_or(true, |c| total <= c) }

    pub fn check(&self, method: PaymentMethod, total: Money) -> Result<()> {
        match self.ceiling(method) {
            Some(ceiling) if total > ceiling => Err(CommerceError::PaymentMethodNotAllowed { method, total, ceiling }),
            _ => Ok(()),
        }
    }
}

#[derive(Clone)]
pub struct CheckoutValidator {
    catalog: Arc<dyn Catalog>,
    shipping: ShippingRules,
    payments: PaymentPolicy,
}

impl CheckoutValidator {
    pub fn new(catalog: Arc<dyn Catalog>, shipping: ShippingRules, payments: PaymentPolicy) -> Self {
        Self { catalog, shipping, payments }
    }

    pub fn shipping_rules(&self) -> &ShippingRules { &self.shipping }
    pub fn payment_policy(&self) -> &PaymentPolicy { &self.payments }

    /// Shape checks that need no catalog read.
    pub fn check_shape(lines: &[SubmittedLine]) -> Result<()> {
        if lines.is_empty() {
            return Err(CommerceError::ValidationFailed("checkout has no line items".into()));
        }
        let mut seen = HashSet::with_capacity(lines.len());
        for line in lines {
            if line.quantity < 1 {
                return Err(CommerceError::InvalidQuantity(i64::from(line.quantity)));
            }
            if !seen.insert(line.product_id) {
                return Err(CommerceError::ValidationFailed(format!("product {} appears more than once", line.product_id)));
            }
        }
        Ok(())
    }

    /// Confirm every line against the catalog, in submission order.
    pub async fn validate_lines(&self, lines: &[SubmittedLine]) -> Result<Vec<ValidatedLine>> {
        Self::check_shape(lines)?;
        let ids: Vec<ProductId> = lines.iter().map(|l| l.product_id).collect();
        let products: HashMap<ProductId, Product> = self.catalog.get_products(&ids).await?.into_iter().map(|p| (p.id, p)).collect();

        lines
            .iter()
            .map(|line| -> Result<ValidatedLine> {
                let product = products.get(&line.product_id).ok_or(CommerceError::ProductNotFound(line.product_id))?;
                check_line(product, line)?;
                Ok(ValidatedLine { product_id: product.id, vendor_id: product.vendor_id, quantity: line.quantity, unit_price: product.price })
            })
            .collect()
    }

    /// Subtotal from validated prices, shipping from the rule table.
    pub fn totals(&self, lines: &[ValidatedLine], district: &str, carrier: Carrier) -> Result<Totals> {
        let subtotal = subtotal(lines)?;
        let shipping_cost = self.shipping.shipping_cost(district, carrier, subtotal);
        let total = subtotal.checked_add(shipping_cost).ok_or_else(overflow)?;
        Ok(Totals { subtotal, shipping_cost, total })
    }

    pub fn check_payment(&self, method: PaymentMethod, total: Money) -> Result<()> { self.payments.check(method, total) }
}

fn check_line(product: &Product, line: &SubmittedLine) -> Result<()> {
    if !product.in_stock {
        return Err(CommerceError::OutOfStock { product_id: product.id });
    }
    if !product.can_supply(line.quantity) {
        return Err(CommerceError::InsufficientStock { product_id: product.id, requested: line.quantity, available: product.available() });
    }
    if product.price != line.unit_price {
        return Err(CommerceError::PriceChanged { product_id: product.id, submitted: line.unit_price, current: product.price });
    }
    Ok(())
}

pub(crate) fn subtotal(lines: &[ValidatedLine]) -> Result<Money> {
    lines.iter().try_fold(Money::ZERO, |acc, line| line.line_total().and_then(|t| acc.checked_add(t)).ok_or_else(overflow))
}

fn overflow() -> CommerceError { CommerceError::ValidationFailed("order total is too large".into()) }
