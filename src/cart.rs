//! Cart Store
//!
//! Per-customer, stock-bounded cart. Quantities are advisory: they are checked
//! against stock when written, but checkout re-validates everything.

use std::sync::Arc;
use tracing::{debug, instrument};

use crate::domain::aggregates::{Cart, CartItem};
use crate::domain::value_objects::{CartItemId, CustomerId, ProductId};
use crate::store::{CartRepository, Catalog, Repositories};
use crate::{CommerceError, Result};

#[derive(Clone)]
pub struct CartService {
    catalog: Arc<dyn Catalog>,
    carts: Arc<dyn CartRepository>,
}

impl CartService {
    pub fn new(repos: &Repositories) -> Self { Self { catalog: repos.catalog.clone(), carts: repos.carts.clone() } }

    /// Merge-add: a repeated add of the same product grows the existing row.
    #[instrument(skip(self), fields(customer_id = %customer_id, product_id = %product_id))]
    pub async fn add_item(&self, customer_id: CustomerId, product_id: ProductId, quantity: i64) -> Result<CartItem> {
        let quantity = positive_quantity(quantity)?;
        let product = self.catalog.get_product(product_id).await?.ok_or(CommerceError::ProductNotFound(product_id))?;
        if !product.in_stock {
            return Err(CommerceError::OutOfStock { product_id });
        }

        let existing = self.carts.find_by_product(customer_id, product_id).await?.map_or(0, |i| i.quantity);
        let requested = existing.saturating_add(quantity);
        if !product.can_supply(requested) {
            return Err(CommerceError::InsufficientStock { product_id, requested, available: product.available() });
        }

        let item = self.carts.upsert_add(customer_id, product_id, quantity).await?;
        debug!(quantity = item.quantity, "cart item saved");
        Ok(item)
    }

    #[instrument(skip(self), fields(customer_id = %customer_id, item_id = %item_id))]
    pub async fn update_quantity(&self, customer_id: CustomerId, item_id: CartItemId, quantity: i64) -> Result<CartItem> {
        let quantity = positive_quantity(quantity)?;
        let item = self.carts.get_item(customer_id, item_id).await?.ok_or(CommerceError::NotFound("cart item"))?;
        let product = self.catalog.get_product(item.product_id).await?.ok_or(CommerceError::ProductNotFound(item.product_id))?;
        if !product.can_supply(quantity) {
            return Err(CommerceError::InsufficientStock { product_id: product.id, requested: quantity, available: product.available() });
        }
        self.carts.set_quantity(customer_id, item_id, quantity).await?.ok_or(CommerceError::NotFound("cart item"))
    }

    /// Removing an item that is not there is not an error.
    pub async fn remove_item(&self, customer_id: CustomerId, item_id: CartItemId) -> Result<()> {
        if !self.carts.remove(customer_id, item_id).await? {
            debug!(%item_id, "cart item already gone");
        }
        Ok(())
    }

    pub async fn clear(&self, customer_id: CustomerId) -> Result<()> {
        let removed = self.carts.clear(customer_id).await?;
        debug!(%customer_id, removed, "cart cleared");
        Ok(())
    }

    /// Read-through join with live product data.
    pub async fn list(&self, customer_id: CustomerId) -> Result<Cart> {
        let lines = self.carts.list(customer_id).await?;
        Ok(Cart::new(customer_id, lines))
    }
}

fn positive_quantity(quantity: i64) -> Result<u32> {
    if quantity < 1 {
        return Err(CommerceError::InvalidQuantity(quantity));
    }
    u32::try_from(quantity).map_err(|_| CommerceError::InvalidQuantity(quantity))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::aggregates::Product;
    use crate::domain::value_objects::{Money, VendorId};
    use crate::store::memory::MemoryStore;
    use testresult::TestResult;

    async fn setup(stock: i32) -> (CartService, MemoryStore, Product) {
        let store = MemoryStore::new();
        let product = store.upsert_product(Product::new(VendorId::new(), "Mug", Money::from_minor(1500), stock)).await;
        (CartService::new(&Repositories::from_store(store.clone())), store, product)
    }

    #[tokio::test]
    async fn test_add_merges_quantities() -> TestResult {
        let (cart, _, p) = setup(10).await;
        let customer = CustomerId::new();
        cart.add_item(customer, p.id, 2).await?;
        cart.add_item(customer, p.id, 3).await?;

        let listed = cart.list(customer).await?;
        assert_eq!(listed.item_count(), 1);
        assert_eq!(listed.quantity_of(p.id), Some(5));
        assert_eq!(listed.subtotal, Money::from_minor(7500));
        Ok(())
    }

    #[tokio::test]
    async fn test_add_is_bounded_by_stock() -> TestResult {
        let (cart, store, p) = setup(4).await;
        let customer = CustomerId::new();
        cart.add_item(customer, p.id, 3).await?;

        let err = cart.add_item(customer, p.id, 2).await.unwrap_err();
        assert!(matches!(err, CommerceError::InsufficientStock { requested: 5, available: 4, .. }));
        assert_eq!(cart.list(customer).await?.quantity_of(p.id), Some(3));

        store.set_stock(p.id, 0).await?;
        assert!(matches!(cart.add_item(CustomerId::new(), p.id, 1).await, Err(CommerceError::OutOfStock { .. })));
        assert!(matches!(cart.add_item(customer, ProductId::new(), 1).await, Err(CommerceError::ProductNotFound(_))));
        Ok(())
    }

    #[tokio::test]
    async fn test_update_quantity() -> TestResult {
        let (cart, _, p) = setup(5).await;
        let customer = CustomerId::new();
        let item = cart.add_item(customer, p.id, 1).await?;

        assert_eq!(cart.update_quantity(customer, item.id, 5).await?.quantity, 5);
        assert!(matches!(cart.update_quantity(customer, item.id, 0).await, Err(CommerceError::InvalidQuantity(0))));
        assert!(matches!(cart.update_quantity(customer, item.id, 6).await, Err(CommerceError::InsufficientStock { .. })));
        assert!(matches!(cart.update_quantity(CustomerId::new(), item.id, 1).await, Err(CommerceError::NotFound(_))));
        Ok(())
    }

    #[tokio::test]
    async fn test_remove_and_clear_are_idempotent() -> TestResult {
        let (cart, _, p) = setup(5).await;
        let customer = CustomerId::new();
        let item = cart.add_item(customer, p.id, 1).await?;

        cart.remove_item(customer, item.id).await?;
        cart.remove_item(customer, item.id).await?;
        cart.clear(customer).await?;
        cart.clear(customer).await?;
        assert!(cart.list(customer).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_negative_quantity_rejected() {
        let (cart, _, p) = setup(5).await;
        assert!(matches!(cart.add_item(CustomerId::new(), p.id, -2).await, Err(CommerceError::InvalidQuantity(-2))));
    }
}
