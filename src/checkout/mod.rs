//! Checkout
//!
//! Turns a customer's cart into an order. [`CheckoutService::submit`] runs the
//! full pipeline: address and shape checks, the idempotency short-circuit,
//! cart match, per-line validation against the catalog, server-side totals,
//! the payment ceiling, and finally the atomic commit.

pub mod processor;
pub mod validator;

pub use processor::{OrderProcessor, PlacedOrder, ShippingInfo};
pub use validator::{CheckoutValidator, PaymentPolicy, SubmittedLine, Totals, ValidatedLine};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use ::validator::Validate;

use crate::domain::aggregates::{CartLine, OrderDetails, OrderStatus, PaymentMethod, ShippingAddress};
use crate::domain::events::{DomainEvent, EventPublisher, NoopPublisher};
use crate::domain::value_objects::{CustomerId, IdempotencyKey, Money, OrderId, OrderNumber, ProductId};
use crate::shipping::Carrier;
use crate::store::{CartRepository, OrderRepository, Repositories};
use crate::{CommerceError, Result};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutRequest {
    pub lines: Vec<SubmittedLine>,
    pub shipping_address: ShippingAddress,
    pub carrier: Carrier,
    pub payment_method: PaymentMethod,
    /// Total the client displayed; must equal the server total when present.
    #[serde(default)]
    pub client_total: Option<Money>,
    /// Taken from the `Idempotency-Key` header, never from the body.
    #[serde(skip)]
    pub idempotency_key: Option<IdempotencyKey>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct OrderSummary {
    pub id: OrderId,
    pub order_number: OrderNumber,
    pub subtotal: Money,
    pub shipping_cost: Money,
    pub total: Money,
    pub status: OrderStatus,
}

impl From<&OrderDetails> for OrderSummary {
    fn from(details: &OrderDetails) -> Self {
        let order = &details.order;
        Self {
            id: order.id,
            order_number: order.order_number.clone(),
            subtotal: order.subtotal,
            shipping_cost: order.shipping_cost,
            total: order.total_amount,
            status: order.status,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PaymentOption {
    pub method: PaymentMethod,
    pub allowed: bool,
    pub ceiling: Option<Money>,
}

/// Read-only preview of what a checkout of the current cart would cost.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CheckoutQuote {
    pub district: String,
    pub carrier: Carrier,
    pub remote_district: bool,
    pub lines: Vec<CartLine>,
    pub subtotal: Money,
    pub shipping_cost: Money,
    pub total: Money,
    /// Lines current stock can no longer cover.
    pub unavailable: Vec<ProductId>,
    pub payment_options: Vec<PaymentOption>,
}

#[derive(Clone)]
pub struct CheckoutService {
    carts: Arc<dyn CartRepository>,
    orders: Arc<dyn OrderRepository>,
    validator: CheckoutValidator,
    processor: OrderProcessor,
    events: Arc<dyn EventPublisher>,
}

impl CheckoutService {
    pub fn new(repos: &Repositories, validator: CheckoutValidator) -> Self {
        Self {
            carts: repos.carts.clone(),
            orders: repos.orders.clone(),
            processor: OrderProcessor::new(repos.orders.clone()),
            validator,
            events: Arc::new(NoopPublisher),
        }
    }

    pub fn with_events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = events;
        self
    }

    #[instrument(skip(self, request), fields(customer_id = %customer_id, lines = request.lines.len()))]
    pub async fn submit(&self, customer_id: CustomerId, request: CheckoutRequest) -> Result<OrderSummary> {
        match self.place(customer_id, request).await {
            Ok(placed) => {
                if !placed.replayed {
                    self.publish_placed(&placed.details).await;
                }
                Ok(OrderSummary::from(&placed.details))
            }
            Err(e) => {
                if !e.is_retryable() {
                    warn!(reason = e.code(), error = %e, "checkout rejected");
                }
                Err(e)
            }
        }
    }

    async fn place(&self, customer_id: CustomerId, request: CheckoutRequest) -> Result<PlacedOrder> {
        request.shipping_address.validate()?;
        CheckoutValidator::check_shape(&request.lines)?;

        let key = request.idempotency_key.as_ref();
        if let Some(placed) = self.replay(customer_id, key).await? {
            return Ok(placed);
        }

        let (lines, totals) = match self.prepare(customer_id, &request).await {
            Ok(prepared) => prepared,
            Err(e) => {
                // A concurrent submission with the same key may have just committed and emptied the cart.
                if let Some(placed) = self.replay(customer_id, key).await? {
                    return Ok(placed);
                }
                return Err(e);
            }
        };

        let shipping = ShippingInfo { address: request.shipping_address, carrier: request.carrier, cost: totals.shipping_cost };
        self.processor.place_order(customer_id, lines, shipping, request.payment_method, request.idempotency_key).await
    }

    async fn replay(&self, customer_id: CustomerId, key: Option<&IdempotencyKey>) -> Result<Option<PlacedOrder>> {
        let Some(key) = key else { return Ok(None) };
        let existing = self.orders.find_by_idempotency_key(customer_id, key.clone()).await?;
        Ok(existing.map(|details| {
            info!(order_number = %details.order.order_number, "idempotent resubmission");
            PlacedOrder { details, replayed: true }
        }))
    }

    /// Cart match, per-line validation, totals and the payment ceiling.
    async fn prepare(&self, customer_id: CustomerId, request: &CheckoutRequest) -> Result<(Vec<ValidatedLine>, Totals)> {
        self.ensure_matches_cart(customer_id, &request.lines).await?;
        let lines = self.validator.validate_lines(&request.lines).await?;
        let totals = self.validator.totals(&lines, &request.shipping_address.district, request.carrier)?;
        if let Some(submitted) = request.client_total {
            if submitted != totals.total {
                return Err(CommerceError::TotalMismatch { submitted, computed: totals.total });
            }
        }
        self.validator.check_payment(request.payment_method, totals.total)?;
        Ok((lines, totals))
    }

    /// Submitted lines must be exactly the cart's products and quantities.
    async fn ensure_matches_cart(&self, customer_id: CustomerId, lines: &[SubmittedLine]) -> Result<()> {
        let cart: HashMap<ProductId, u32> = self.carts.list(customer_id).await?.into_iter().map(|l| (l.product_id, l.quantity)).collect();
        let matches = cart.len() == lines.len() && lines.iter().all(|l| cart.get(&l.product_id) == Some(&l.quantity));
        if !matches {
            return Err(CommerceError::CartChanged);
        }
        Ok(())
    }

    async fn publish_placed(&self, details: &OrderDetails) {
        let event = DomainEvent::order_placed(&details.order, &details.items);
        if let Err(e) = self.events.publish(&event).await {
            warn!(error = %e, order_number = %details.order.order_number, "failed to publish order event");
        }
    }

    #[instrument(skip(self), fields(customer_id = %customer_id))]
    pub async fn quote(&self, customer_id: CustomerId, district: &str, carrier: Carrier) -> Result<CheckoutQuote> {
        let lines = self.carts.list(customer_id).await?;
        if lines.is_empty() {
            return Err(CommerceError::ValidationFailed("cart is empty".into()));
        }
        let subtotal = lines
            .iter()
            .try_fold(Money::ZERO, |acc, l| l.unit_price.checked_mul(l.quantity).and_then(|t| acc.checked_add(t)))
            .ok_or_else(|| CommerceError::ValidationFailed("order total is too large".into()))?;
        let rules = self.validator.shipping_rules();
        let shipping_cost = rules.shipping_cost(district, carrier, subtotal);
        let total = subtotal + shipping_cost;
        let policy = self.validator.payment_policy();

        Ok(CheckoutQuote {
            district: district.trim().to_string(),
            carrier,
            remote_district: rules.is_remote(district),
            unavailable: lines.iter().filter(|l| l.exceeds_stock()).map(|l| l.product_id).collect(),
            lines,
            subtotal,
            shipping_cost,
            total,
            payment_options: PaymentMethod::ALL
                .iter()
                .map(|&method| PaymentOption { method, allowed: policy.allows(method, total), ceiling: policy.ceiling(method) })
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::aggregates::order::tests::address;
    use crate::domain::aggregates::Product;
    use crate::domain::events::PublishError;
    use crate::domain::value_objects::VendorId;
    use crate::shipping::ShippingRules;
    use crate::store::memory::MemoryStore;
    use crate::store::Catalog;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use testresult::TestResult;

    #[derive(Default)]
    struct RecordingPublisher(Mutex<Vec<DomainEvent>>);

    #[async_trait]
    impl EventPublisher for RecordingPublisher {
        async fn publish(&self, event: &DomainEvent) -> std::result::Result<(), PublishError> {
            self.0.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    struct Fixture {
        store: MemoryStore,
        service: CheckoutService,
        events: Arc<RecordingPublisher>,
    }

    fn fixture() -> Fixture {
        let store = MemoryStore::new();
        let repos = Repositories::from_store(store.clone());
        let validator = CheckoutValidator::new(repos.catalog.clone(), ShippingRules::default(), PaymentPolicy::default());
        let events = Arc::new(RecordingPublisher::default());
        let service = CheckoutService::new(&repos, validator).with_events(events.clone());
        Fixture { store, service, events }
    }

    async fn stocked(store: &MemoryStore, price: i64, stock: i32) -> Product {
        store.upsert_product(Product::new(VendorId::new(), "Kettle", Money::from_minor(price), stock)).await
    }

    fn request(lines: Vec<SubmittedLine>) -> CheckoutRequest {
        CheckoutRequest {
            lines,
            shipping_address: address(),
            carrier: Carrier::Standard,
            payment_method: PaymentMethod::Card,
            client_total: None,
            idempotency_key: None,
        }
    }

    fn line(p: &Product, quantity: u32) -> SubmittedLine { SubmittedLine { product_id: p.id, quantity, unit_price: p.price } }

    #[tokio::test]
    async fn test_submit_places_order_and_empties_cart() -> TestResult {
        let f = fixture();
        let customer = CustomerId::new();
        let p = stocked(&f.store, 6000, 5).await;
        f.store.upsert_add(customer, p.id, 2).await?;

        let mut req = request(vec![line(&p, 2)]);
        req.client_total = Some(Money::from_minor(12_000));
        let summary = f.service.submit(customer, req).await?;

        assert_eq!(summary.subtotal, Money::from_minor(12_000));
        assert_eq!(summary.shipping_cost, Money::ZERO);
        assert_eq!(summary.total, Money::from_minor(12_000));
        assert_eq!(summary.status, OrderStatus::Pending);
        assert!(f.store.list(customer).await?.is_empty());
        assert_eq!(f.store.get_product(p.id).await?.map(|p| p.stock_count), Some(3));
        assert_eq!(f.events.0.lock().unwrap().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_total_mismatch_rejected() -> TestResult {
        let f = fixture();
        let customer = CustomerId::new();
        let p = stocked(&f.store, 1000, 5).await;
        f.store.upsert_add(customer, p.id, 1).await?;

        let mut req = request(vec![line(&p, 1)]);
        req.client_total = Some(Money::from_minor(1000));
        let err = f.service.submit(customer, req).await.unwrap_err();
        assert!(matches!(err, CommerceError::TotalMismatch { computed, .. } if computed == Money::from_minor(1600)));
        assert_eq!(f.store.order_count().await, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_cart_must_match_submission() -> TestResult {
        let f = fixture();
        let customer = CustomerId::new();
        let p = stocked(&f.store, 1000, 5).await;
        f.store.upsert_add(customer, p.id, 2).await?;

        let err = f.service.submit(customer, request(vec![line(&p, 1)])).await.unwrap_err();
        assert!(matches!(err, CommerceError::CartChanged));
        Ok(())
    }

    #[tokio::test]
    async fn test_invalid_address_rejected_before_anything_else() {
        let f = fixture();
        let p = stocked(&f.store, 1000, 5).await;
        let mut req = request(vec![line(&p, 1)]);
        req.shipping_address.phone = "call me".into();
        let err = f.service.submit(CustomerId::new(), req).await.unwrap_err();
        assert!(matches!(err, CommerceError::ValidationFailed(ref m) if m.contains("phone")));
    }

    #[tokio::test]
    async fn test_cod_ceiling() -> TestResult {
        let f = fixture();
        let customer = CustomerId::new();
        let p = stocked(&f.store, 60_000, 5).await;
        f.store.upsert_add(customer, p.id, 2).await?;

        let mut req = request(vec![line(&p, 2)]);
        req.payment_method = PaymentMethod::CashOnDelivery;
        let err = f.service.submit(customer, req).await.unwrap_err();
        assert!(matches!(err, CommerceError::PaymentMethodNotAllowed { .. }));
        assert_eq!(f.store.list(customer).await?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_idempotent_resubmission_returns_same_order() -> TestResult {
        let f = fixture();
        let customer = CustomerId::new();
        let p = stocked(&f.store, 1000, 5).await;
        f.store.upsert_add(customer, p.id, 1).await?;

        let mut req = request(vec![line(&p, 1)]);
        req.idempotency_key = IdempotencyKey::new("double-click");
        let first = f.service.submit(customer, req.clone()).await?;
        let second = f.service.submit(customer, req).await?;

        assert_eq!(first, second);
        assert_eq!(f.store.order_count().await, 1);
        assert_eq!(f.store.get_product(p.id).await?.map(|p| p.stock_count), Some(4));
        assert_eq!(f.events.0.lock().unwrap().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_quote_flags_payment_options() -> TestResult {
        let f = fixture();
        let customer = CustomerId::new();
        let p = stocked(&f.store, 60_000, 5).await;
        f.store.upsert_add(customer, p.id, 2).await?;

        let quote = f.service.quote(customer, " Epe ", Carrier::Express).await?;
        assert!(quote.remote_district);
        assert_eq!(quote.shipping_cost, Money::ZERO);
        assert_eq!(quote.total, Money::from_minor(120_000));
        let cod = quote.payment_options.iter().find(|o| o.method == PaymentMethod::CashOnDelivery).unwrap();
        assert!(!cod.allowed);
        assert!(quote.unavailable.is_empty());
        Ok(())
    }

    /// Adds `extra` to the customer's cart while the submitted lines are being priced.
    struct AddsDuringValidation {
        store: MemoryStore,
        customer: CustomerId,
        extra: ProductId,
    }

    #[async_trait]
    impl Catalog for AddsDuringValidation {
        async fn get_product(&self, id: ProductId) -> Result<Option<Product>> { self.store.get_product(id).await }

        async fn get_products(&self, ids: &[ProductId]) -> Result<Vec<Product>> {
            self.store.upsert_add(self.customer, self.extra, 1).await?;
            self.store.get_products(ids).await
        }
    }

    #[tokio::test]
    async fn test_item_added_mid_checkout_is_not_dropped() -> TestResult {
        let store = MemoryStore::new();
        let customer = CustomerId::new();
        let p = stocked(&store, 1000, 5).await;
        let extra = stocked(&store, 2500, 5).await;
        store.upsert_add(customer, p.id, 1).await?;

        let catalog = Arc::new(AddsDuringValidation { store: store.clone(), customer, extra: extra.id });
        let repos = Repositories { catalog: catalog.clone(), carts: Arc::new(store.clone()), orders: Arc::new(store.clone()) };
        let service = CheckoutService::new(&repos, CheckoutValidator::new(catalog, ShippingRules::default(), PaymentPolicy::default()));

        let err = service.submit(customer, request(vec![line(&p, 1)])).await.unwrap_err();

        assert!(matches!(err, CommerceError::CartChanged));
        assert_eq!(store.order_count().await, 0);
        let cart = store.list(customer).await?;
        assert_eq!(cart.len(), 2);
        assert!(cart.iter().any(|l| l.product_id == extra.id));
        Ok(())
    }
}
