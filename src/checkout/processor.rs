//! Order Transaction Processor
//!
//! The only component that creates orders and decrements stock. Each call is
//! one storage unit of work (see [`OrderRepository::commit`]); the decrement
//! inside it is conditional, so it holds even if validation ran against stale
//! stock.

use std::sync::Arc;
use tracing::{info, instrument, warn};

use super::validator::{subtotal, ValidatedLine};
use crate::domain::aggregates::{OrderDetails, PaymentMethod, ShippingAddress};
use crate::domain::value_objects::{CustomerId, IdempotencyKey, Money};
use crate::shipping::Carrier;
use crate::store::{NewOrder, NewOrderItem, OrderRepository};
use crate::{CommerceError, Result};

/// Delivery details fixed at checkout.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShippingInfo {
    pub address: ShippingAddress,
    pub carrier: Carrier,
    pub cost: Money,
}

/// Result of a placement: a fresh commit, or the order an earlier submission
/// with the same idempotency key already created.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlacedOrder {
    pub details: OrderDetails,
    pub replayed: bool,
}

#[derive(Clone)]
pub struct OrderProcessor {
    orders: Arc<dyn OrderRepository>,
}

impl OrderProcessor {
    /// Commit attempts per call; lock contention gets one retry.
    const MAX_ATTEMPTS: u32 = 2;

    pub fn new(orders: Arc<dyn OrderRepository>) -> Self { Self { orders } }

    #[instrument(skip(self, lines, shipping, idempotency_key), fields(lines = lines.len(), carrier = %shipping.carrier))]
    pub async fn place_order(
        &self,
        customer_id: CustomerId,
        lines: Vec<ValidatedLine>,
        shipping: ShippingInfo,
        payment_method: PaymentMethod,
        idempotency_key: Option<IdempotencyKey>,
    ) -> Result<PlacedOrder> {
        if lines.is_empty() {
            return Err(CommerceError::ValidationFailed("checkout has no line items".into()));
        }
        let subtotal = subtotal(&lines)?;
        let total_amount = subtotal
            .checked_add(shipping.cost)
            .ok_or_else(|| CommerceError::ValidationFailed("order total is too large".into()))?;

        let new_order = NewOrder {
            customer_id,
            items: lines
                .into_iter()
                .map(|l| NewOrderItem { product_id: l.product_id, vendor_id: l.vendor_id, quantity: l.quantity, unit_price: l.unit_price })
                .collect(),
            subtotal,
            shipping_cost: shipping.cost,
            total_amount,
            carrier: shipping.carrier,
            shipping_address: shipping.address,
            payment_method,
            idempotency_key,
        };

        let mut attempt = 1;
        loop {
            match self.commit_detached(new_order.clone()).await {
                Ok(details) => {
                    info!(order_number = %details.order.order_number, total = %details.order.total_amount, "order placed");
                    return Ok(PlacedOrder { details, replayed: false });
                }
                Err(CommerceError::TransactionConflict) if attempt < Self::MAX_ATTEMPTS => {
                    warn!(attempt, "checkout hit lock contention, retrying");
                    attempt += 1;
                }
                Err(CommerceError::DuplicateSubmission) => {
                    let details = self.existing_order(&new_order).await?;
                    return Ok(PlacedOrder { details, replayed: true });
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Runs the commit on its own task so a dropped request cannot abandon the
    /// transaction mid-flight; it still commits or rolls back as a whole.
    async fn commit_detached(&self, new_order: NewOrder) -> Result<OrderDetails> {
        let orders = Arc::clone(&self.orders);
        tokio::spawn(async move { orders.commit(new_order).await })
            .await
            .map_err(|e| CommerceError::StorageUnavailable(format!("commit task failed: {e}")))?
    }

    async fn existing_order(&self, new_order: &NewOrder) -> Result<OrderDetails> {
        let key = new_order.idempotency_key.clone().ok_or(CommerceError::TransactionConflict)?;
        info!("duplicate checkout submission, returning the original order");
        self.orders.find_by_idempotency_key(new_order.customer_id, key).await?.ok_or(CommerceError::TransactionConflict)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::aggregates::order::tests::address;
    use crate::domain::aggregates::{Order, OrderStatus};
    use crate::domain::value_objects::{OrderId, OrderNumber, ProductId, VendorId};
    use crate::store::MockOrderRepository;
    use chrono::Utc;
    use mockall::Sequence;

    fn lines() -> Vec<ValidatedLine> {
        vec![
            ValidatedLine { product_id: ProductId::new(), vendor_id: VendorId::new(), quantity: 2, unit_price: Money::from_minor(1000) },
            ValidatedLine { product_id: ProductId::new(), vendor_id: VendorId::new(), quantity: 1, unit_price: Money::from_minor(500) },
        ]
    }

    fn shipping() -> ShippingInfo { ShippingInfo { address: address(), carrier: Carrier::Standard, cost: Money::from_minor(600) } }

    fn committed(new_order: &NewOrder) -> OrderDetails {
        let order = Order {
            id: OrderId::new(), order_number: OrderNumber::from_sequence(1), customer_id: new_order.customer_id,
            status: OrderStatus::Pending, subtotal: new_order.subtotal, shipping_cost: new_order.shipping_cost,
            total_amount: new_order.total_amount, carrier: new_order.carrier, shipping_address: new_order.shipping_address.clone(),
            payment_method: new_order.payment_method, idempotency_key: new_order.idempotency_key.clone(),
            created_at: Utc::now(), updated_at: Utc::now(),
        };
        OrderDetails { order, items: vec![] }
    }

    #[tokio::test]
    async fn test_totals_come_from_validated_lines() {
        let mut repo = MockOrderRepository::new();
        repo.expect_commit()
            .withf(|o| o.subtotal == Money::from_minor(2500) && o.shipping_cost == Money::from_minor(600) && o.total_amount == Money::from_minor(3100))
            .times(1)
            .returning(|o| Ok(committed(&o)));
        let processor = OrderProcessor::new(Arc::new(repo));

        let placed = processor.place_order(CustomerId::new(), lines(), shipping(), PaymentMethod::Card, None).await.unwrap();
        assert!(!placed.replayed);
        let details = placed.details;
        assert_eq!(details.order.total_amount, Money::from_minor(3100));
        assert_eq!(details.order.status, OrderStatus::Pending);
    }

    #[tokio::test]
    async fn test_conflict_is_retried_once() {
        let mut repo = MockOrderRepository::new();
        let mut seq = Sequence::new();
        repo.expect_commit().times(1).in_sequence(&mut seq).returning(|_| Err(CommerceError::TransactionConflict));
        repo.expect_commit().times(1).in_sequence(&mut seq).returning(|o| Ok(committed(&o)));
        let processor = OrderProcessor::new(Arc::new(repo));

        assert!(processor.place_order(CustomerId::new(), lines(), shipping(), PaymentMethod::Card, None).await.is_ok());
    }

    #[tokio::test]
    async fn test_repeated_conflict_surfaces_retryable_error() {
        let mut repo = MockOrderRepository::new();
        repo.expect_commit().times(2).returning(|_| Err(CommerceError::TransactionConflict));
        let processor = OrderProcessor::new(Arc::new(repo));

        let err = processor.place_order(CustomerId::new(), lines(), shipping(), PaymentMethod::Card, None).await.unwrap_err();
        assert!(matches!(err, CommerceError::TransactionConflict));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_insufficient_stock_is_not_retried() {
        let mut repo = MockOrderRepository::new();
        repo.expect_commit().times(1).returning(|o| {
            Err(CommerceError::InsufficientStock { product_id: o.items[0].product_id, requested: 2, available: 1 })
        });
        let processor = OrderProcessor::new(Arc::new(repo));

        let err = processor.place_order(CustomerId::new(), lines(), shipping(), PaymentMethod::Card, None).await.unwrap_err();
        assert!(matches!(err, CommerceError::InsufficientStock { available: 1, .. }));
    }

    #[tokio::test]
    async fn test_duplicate_key_returns_original_order() {
        let customer = CustomerId::new();
        let key = IdempotencyKey::new("submit-1").unwrap();
        let mut repo = MockOrderRepository::new();
        repo.expect_commit().times(1).returning(|_| Err(CommerceError::DuplicateSubmission));
        repo.expect_find_by_idempotency_key()
            .withf(move |c, k| *c == customer && k.as_str() == "submit-1")
            .times(1)
            .returning(|c, k| {
                let original = NewOrder {
                    customer_id: c, items: vec![], subtotal: Money::from_minor(2500), shipping_cost: Money::from_minor(600),
                    total_amount: Money::from_minor(3100), carrier: Carrier::Standard, shipping_address: address(),
                    payment_method: PaymentMethod::Card, idempotency_key: Some(k),
                };
                Ok(Some(committed(&original)))
            });
        let processor = OrderProcessor::new(Arc::new(repo));

        let placed = processor.place_order(customer, lines(), shipping(), PaymentMethod::Card, Some(key)).await.unwrap();
        assert!(placed.replayed);
        assert_eq!(placed.details.order.customer_id, customer);
    }

    #[tokio::test]
    async fn test_storage_failure_is_never_success() {
        let mut repo = MockOrderRepository::new();
        repo.expect_commit().times(1).returning(|_| Err(CommerceError::StorageUnavailable("connection reset".into())));
        let processor = OrderProcessor::new(Arc::new(repo));

        let result = processor.place_order(CustomerId::new(), lines(), shipping(), PaymentMethod::Card, None).await;
        assert!(matches!(result, Err(CommerceError::StorageUnavailable(_))));
    }
}
