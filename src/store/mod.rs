//! Storage seam.
//!
//! Three repository traits back the services: a read-only [`Catalog`], the
//! advisory [`CartRepository`], and the [`OrderRepository`] whose `commit` is
//! the single unit of work that creates orders and decrements stock.
//! [`postgres::PgStore`] is the production backend; [`memory::MemoryStore`]
//! implements the same contract in-process.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::domain::aggregates::{CartItem, CartLine, Order, OrderDetails, OrderStatus, PaymentMethod, Product, ShippingAddress};
use crate::domain::value_objects::{CartItemId, CustomerId, IdempotencyKey, Money, OrderId, ProductId, VendorId};
use crate::shipping::Carrier;
use crate::Result;

pub mod memory;
pub mod postgres;

/// Read-only catalog access. Reads reflect the latest committed state.
#[async_trait]
pub trait Catalog: Send + Sync {
    async fn get_product(&self, id: ProductId) -> Result<Option<Product>>;

    /// Products for `ids`; missing ids are simply absent from the result.
    async fn get_products(&self, ids: &[ProductId]) -> Result<Vec<Product>>;
}

/// Single-row cart mutations, always scoped to one customer.
#[async_trait]
pub trait CartRepository: Send + Sync {
    async fn find_by_product(&self, customer: CustomerId, product: ProductId) -> Result<Option<CartItem>>;
    async fn get_item(&self, customer: CustomerId, item: CartItemId) -> Result<Option<CartItem>>;
    /// Insert the row or add `quantity` to the existing one.
    async fn upsert_add(&self, customer: CustomerId, product: ProductId, quantity: u32) -> Result<CartItem>;
    async fn set_quantity(&self, customer: CustomerId, item: CartItemId, quantity: u32) -> Result<Option<CartItem>>;
    /// Returns whether a row was removed.
    async fn remove(&self, customer: CustomerId, item: CartItemId) -> Result<bool>;
    async fn clear(&self, customer: CustomerId) -> Result<u64>;
    /// Cart rows joined with live product data, oldest first.
    async fn list(&self, customer: CustomerId) -> Result<Vec<CartLine>>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OrderRepository: Send + Sync {
    /// Atomically: allocate the order number, insert the order and its items,
    /// decrement each product's stock only where enough remains, and delete
    /// the customer's cart. The cart is re-read under lock and must still hold
    /// exactly the order's lines, else [`crate::CommerceError::CartChanged`]. Any
    /// failure leaves no trace.
    async fn commit(&self, order: NewOrder) -> Result<OrderDetails>;
    async fn find_by_idempotency_key(&self, customer: CustomerId, key: IdempotencyKey) -> Result<Option<OrderDetails>>;
    async fn get(&self, customer: CustomerId, order: OrderId) -> Result<Option<OrderDetails>>;
    async fn list_for_customer(&self, customer: CustomerId, filter: OrderFilter) -> Result<Page<Order>>;
    async fn list_for_vendor(&self, vendor: VendorId, filter: OrderFilter) -> Result<Page<Order>>;
}

/// Everything the order transaction writes, with totals already fixed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewOrder {
    pub customer_id: CustomerId,
    pub items: Vec<NewOrderItem>,
    pub subtotal: Money,
    pub shipping_cost: Money,
    pub total_amount: Money,
    pub carrier: Carrier,
    pub shipping_address: ShippingAddress,
    pub payment_method: PaymentMethod,
    pub idempotency_key: Option<IdempotencyKey>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewOrderItem {
    pub product_id: ProductId,
    pub vendor_id: VendorId,
    pub quantity: u32,
    pub unit_price: Money,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct OrderFilter {
    pub status: Option<OrderStatus>,
    pub page: Option<u32>,
    pub per_page: Option<u32>,
}

impl OrderFilter {
    pub const DEFAULT_PER_PAGE: u32 = 20;
    pub const MAX_PER_PAGE: u32 = 100;

    pub fn page(&self) -> u32 { self.page.unwrap_or(1).max(1) }
    pub fn per_page(&self) -> u32 { self.per_page.unwrap_or(Self::DEFAULT_PER_PAGE).clamp(1, Self::MAX_PER_PAGE) }
    pub fn offset(&self) -> u64 { u64::from(self.page() - 1) * u64::from(self.per_page()) }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Page<T> {
    pub data: Vec<T>,
    pub total: i64,
    pub page: u32,
    pub per_page: u32,
}

impl<T> Page<T> {
    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page { data: self.data.into_iter().map(f).collect(), total: self.total, page: self.page, per_page: self.per_page }
    }
}

/// Whether the cart rows `(product, quantity)` are exactly the order's lines.
pub(crate) fn cart_matches<I>(cart: I, items: &[NewOrderItem]) -> bool
where
    I: IntoIterator<Item = (ProductId, u32)>,
{
    let cart: HashMap<ProductId, u32> = cart.into_iter().collect();
    cart.len() == items.len() && items.iter().all(|i| cart.get(&i.product_id) == Some(&i.quantity))
}

/// The three repositories the services are wired with.
#[derive(Clone)]
pub struct Repositories {
    pub catalog: Arc<dyn Catalog>,
    pub carts: Arc<dyn CartRepository>,
    pub orders: Arc<dyn OrderRepository>,
}

impl Repositories {
    pub fn from_store<S>(store: S) -> Self
    where
        S: Catalog + CartRepository + OrderRepository + 'static,
    {
        let store = Arc::new(store);
        Self { catalog: store.clone(), carts: store.clone(), orders: store }
    }
}
