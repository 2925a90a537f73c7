//! In-process store.
//!
//! One lock guards all tables. `commit` stages its writes on a copy of the
//! state and swaps it in only when every step succeeded, so a failed checkout
//! leaves nothing behind, matching the Postgres transaction.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use super::{cart_matches, CartRepository, Catalog, NewOrder, OrderFilter, OrderRepository, Page};
use crate::domain::aggregates::{CartItem, CartLine, Order, OrderDetails, OrderItem, OrderStatus, Product, ProductError};
use crate::domain::value_objects::{CartItemId, CustomerId, IdempotencyKey, Money, OrderId, OrderNumber, ProductId, VendorId};
use crate::{CommerceError, Result};

#[derive(Clone, Debug, Default)]
struct State {
    products: BTreeMap<ProductId, Product>,
    cart_items: BTreeMap<CartItemId, CartItem>,
    orders: BTreeMap<OrderId, Order>,
    order_items: Vec<OrderItem>,
    last_order_seq: i64,
}

impl State {
    fn details(&self, order: &Order) -> OrderDetails {
        let items = self.order_items.iter().filter(|i| i.order_id == order.id).cloned().collect();
        OrderDetails { order: order.clone(), items }
    }

    fn page<'a, I>(&self, orders: I, filter: &OrderFilter) -> Page<Order>
    where
        I: Iterator<Item = &'a Order>,
    {
        let mut matching: Vec<&Order> = orders.filter(|o| filter.status.map_or(true, |s| o.status == s)).collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        let total = i64::try_from(matching.len()).unwrap_or(i64::MAX);
        let offset = usize::try_from(filter.offset()).unwrap_or(usize::MAX);
        let data = matching.into_iter().skip(offset).take(filter.per_page() as usize).cloned().collect();
        Page { data, total, page: filter.page(), per_page: filter.per_page() }
    }
}

#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    pub fn new() -> Self { Self::default() }

    /// Seed or replace a catalog row (vendor CRUD stand-in).
    pub async fn upsert_product(&self, mut product: Product) -> Product {
        product.stock_count = product.stock_count.max(0);
        product.in_stock = product.stock_count > 0;
        self.state.lock().await.products.insert(product.id, product.clone());
        product
    }

    pub async fn set_price(&self, id: ProductId, price: Money) -> Result<()> {
        let mut state = self.state.lock().await;
        let product = state.products.get_mut(&id).ok_or(CommerceError::ProductNotFound(id))?;
        product.price = price;
        Ok(())
    }

    pub async fn set_stock(&self, id: ProductId, stock_count: i32) -> Result<()> {
        let mut state = self.state.lock().await;
        let product = state.products.get_mut(&id).ok_or(CommerceError::ProductNotFound(id))?;
        product.stock_count = stock_count.max(0);
        product.in_stock = product.stock_count > 0;
        Ok(())
    }

    pub async fn order_count(&self) -> usize { self.state.lock().await.orders.len() }
}

#[async_trait]
impl Catalog for MemoryStore {
    async fn get_product(&self, id: ProductId) -> Result<Option<Product>> {
        Ok(self.state.lock().await.products.get(&id).cloned())
    }

    async fn get_products(&self, ids: &[ProductId]) -> Result<Vec<Product>> {
        let state = self.state.lock().await;
        Ok(ids.iter().filter_map(|id| state.products.get(id).cloned()).collect())
    }
}

#[async_trait]
impl CartRepository for MemoryStore {
    async fn find_by_product(&self, customer: CustomerId, product: ProductId) -> Result<Option<CartItem>> {
        let state = self.state.lock().await;
        Ok(state.cart_items.values().find(|i| i.customer_id == customer && i.product_id == product).cloned())
    }

    async fn get_item(&self, customer: CustomerId, item: CartItemId) -> Result<Option<CartItem>> {
        let state = self.state.lock().await;
        Ok(state.cart_items.get(&item).filter(|i| i.customer_id == customer).cloned())
    }

    async fn upsert_add(&self, customer: CustomerId, product: ProductId, quantity: u32) -> Result<CartItem> {
        let mut state = self.state.lock().await;
        if !state.products.contains_key(&product) {
            return Err(CommerceError::ProductNotFound(product));
        }
        let now = Utc::now();
        if let Some(existing) = state.cart_items.values_mut().find(|i| i.customer_id == customer && i.product_id == product) {
            existing.quantity = existing.quantity.saturating_add(quantity);
            existing.updated_at = now;
            return Ok(existing.clone());
        }
        let item = CartItem { id: CartItemId::new(), customer_id: customer, product_id: product, quantity, created_at: now, updated_at: now };
        state.cart_items.insert(item.id, item.clone());
        Ok(item)
    }

    async fn set_quantity(&self, customer: CustomerId, item: CartItemId, quantity: u32) -> Result<Option<CartItem>> {
        let mut state = self.state.lock().await;
        Ok(state.cart_items.get_mut(&item).filter(|i| i.customer_id == customer).map(|i| {
            i.quantity = quantity;
            i.updated_at = Utc::now();
            i.clone()
        }))
    }

    async fn remove(&self, customer: CustomerId, item: CartItemId) -> Result<bool> {
        let mut state = self.state.lock().await;
        let owned = state.cart_items.get(&item).is_some_and(|i| i.customer_id == customer);
        Ok(owned && state.cart_items.remove(&item).is_some())
    }

    async fn clear(&self, customer: CustomerId) -> Result<u64> {
        let mut state = self.state.lock().await;
        let before = state.cart_items.len();
        state.cart_items.retain(|_, i| i.customer_id != customer);
        Ok((before - state.cart_items.len()) as u64)
    }

    async fn list(&self, customer: CustomerId) -> Result<Vec<CartLine>> {
        let state = self.state.lock().await;
        let mut items: Vec<&CartItem> = state.cart_items.values().filter(|i| i.customer_id == customer).collect();
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(items
            .into_iter()
            .filter_map(|item| {
                let p = state.products.get(&item.product_id)?;
                Some(CartLine {
                    id: item.id, product_id: item.product_id, quantity: item.quantity, name: p.name.clone(),
                    image_url: p.image_url.clone(), unit_price: p.price, stock_count: p.stock_count,
                    in_stock: p.in_stock, vendor_id: p.vendor_id,
                })
            })
            .collect())
    }
}

#[async_trait]
impl OrderRepository for MemoryStore {
    async fn commit(&self, new_order: NewOrder) -> Result<OrderDetails> {
        let mut state = self.state.lock().await;

        if let Some(key) = &new_order.idempotency_key {
            let taken = state.orders.values().any(|o| o.customer_id == new_order.customer_id && o.idempotency_key.as_ref() == Some(key));
            if taken {
                return Err(CommerceError::DuplicateSubmission);
            }
        }

        let cart = state.cart_items.values().filter(|i| i.customer_id == new_order.customer_id).map(|i| (i.product_id, i.quantity));
        if !cart_matches(cart, &new_order.items) {
            return Err(CommerceError::CartChanged);
        }

        let mut staged = state.clone();
        staged.last_order_seq += 1;
        let now = Utc::now();
        let order = Order {
            id: OrderId::new(),
            order_number: OrderNumber::from_sequence(staged.last_order_seq),
            customer_id: new_order.customer_id,
            status: OrderStatus::Pending,
            subtotal: new_order.subtotal,
            shipping_cost: new_order.shipping_cost,
            total_amount: new_order.total_amount,
            carrier: new_order.carrier,
            shipping_address: new_order.shipping_address,
            payment_method: new_order.payment_method,
            idempotency_key: new_order.idempotency_key,
            created_at: now,
            updated_at: now,
        };

        let mut lines = new_order.items;
        lines.sort_by_key(|l| l.product_id);
        for line in &lines {
            let product = staged.products.get_mut(&line.product_id).ok_or(CommerceError::ProductNotFound(line.product_id))?;
            product.decrement_stock(line.quantity).map_err(|ProductError::InsufficientStock { available }| {
                CommerceError::InsufficientStock { product_id: line.product_id, requested: line.quantity, available }
            })?;
            staged.order_items.push(OrderItem {
                order_id: order.id, product_id: line.product_id, vendor_id: line.vendor_id,
                quantity: line.quantity, unit_price: line.unit_price,
            });
        }

        staged.cart_items.retain(|_, i| i.customer_id != order.customer_id);
        staged.orders.insert(order.id, order.clone());
        let details = staged.details(&order);
        *state = staged;
        Ok(details)
    }

    async fn find_by_idempotency_key(&self, customer: CustomerId, key: IdempotencyKey) -> Result<Option<OrderDetails>> {
        let state = self.state.lock().await;
        Ok(state
            .orders
            .values()
            .find(|o| o.customer_id == customer && o.idempotency_key.as_ref() == Some(&key))
            .map(|o| state.details(o)))
    }

    async fn get(&self, customer: CustomerId, order: OrderId) -> Result<Option<OrderDetails>> {
        let state = self.state.lock().await;
        Ok(state.orders.get(&order).filter(|o| o.customer_id == customer).map(|o| state.details(o)))
    }

    async fn list_for_customer(&self, customer: CustomerId, filter: OrderFilter) -> Result<Page<Order>> {
        let state = self.state.lock().await;
        Ok(state.page(state.orders.values().filter(|o| o.customer_id == customer), &filter))
    }

    async fn list_for_vendor(&self, vendor: VendorId, filter: OrderFilter) -> Result<Page<Order>> {
        let state = self.state.lock().await;
        let orders = state
            .orders
            .values()
            .filter(|o| state.order_items.iter().any(|i| i.order_id == o.id && i.vendor_id == vendor));
        Ok(state.page(orders, &filter))
    }
}
