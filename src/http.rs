//! HTTP surface.
//!
//! JSON routes over the cart, checkout and order services. The customer id
//! comes from the `x-customer-id` header set by the authentication gateway;
//! requests without it never reach a service.

use axum::{
    async_trait,
    extract::{FromRequestParts, Path, Query, State},
    http::{header::RETRY_AFTER, request::Parts, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;

use crate::cart::CartService;
use crate::checkout::{CheckoutQuote, CheckoutRequest, CheckoutService, CheckoutValidator, OrderSummary, PaymentPolicy};
use crate::domain::aggregates::{Cart, CartItem, Order, OrderDetails, VendorOrder};
use crate::domain::events::EventPublisher;
use crate::domain::value_objects::{CartItemId, CustomerId, IdempotencyKey, OrderId, ProductId, VendorId};
use crate::orders::OrderQueryService;
use crate::shipping::{Carrier, ShippingRules};
use crate::store::{OrderFilter, Page, Repositories};
use crate::CommerceError;

pub const CUSTOMER_HEADER: &str = "x-customer-id";
pub const IDEMPOTENCY_HEADER: &str = "idempotency-key";
const RETRY_AFTER_SECS: &str = "1";

type ApiResult<T> = std::result::Result<T, CommerceError>;

#[derive(Clone)]
pub struct AppState {
    pub cart: CartService,
    pub checkout: CheckoutService,
    pub orders: OrderQueryService,
}

impl AppState {
    pub fn new(repos: Repositories, shipping: ShippingRules, payments: PaymentPolicy, events: Arc<dyn EventPublisher>) -> Self {
        let validator = CheckoutValidator::new(repos.catalog.clone(), shipping, payments);
        Self {
            cart: CartService::new(&repos),
            checkout: CheckoutService::new(&repos, validator).with_events(events),
            orders: OrderQueryService::new(&repos),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { Json(json!({"status": "healthy", "service": "marketplace-checkout"})) }))
        .route("/api/v1/cart", get(get_cart).delete(clear_cart))
        .route("/api/v1/cart/items", post(add_cart_item))
        .route("/api/v1/cart/items/:id", put(update_cart_item).delete(remove_cart_item))
        .route("/api/v1/checkout/quote", post(quote))
        .route("/api/v1/checkout", post(checkout))
        .route("/api/v1/orders", get(list_orders))
        .route("/api/v1/orders/:id", get(get_order))
        .route("/api/v1/vendors/:vendor_id/orders", get(list_vendor_orders))
        .with_state(state)
}

// =============================================================================
// Identity
// =============================================================================

/// Customer resolved by the upstream gateway.
#[derive(Clone, Copy, Debug)]
pub struct AuthenticatedCustomer(pub CustomerId);

#[async_trait]
impl<S> FromRequestParts<S> for AuthenticatedCustomer
where
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> std::result::Result<Self, Self::Rejection> {
        parts
            .headers
            .get(CUSTOMER_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<CustomerId>().ok())
            .map(Self)
            .ok_or_else(|| {
                let body = json!({"error": "unauthorized", "message": "missing or malformed customer identity"});
                (StatusCode::UNAUTHORIZED, Json(body)).into_response()
            })
    }
}

// =============================================================================
// Errors
// =============================================================================

impl CommerceError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::NotFound(_) | Self::ProductNotFound(_) => StatusCode::NOT_FOUND,
            Self::OutOfStock { .. }
            | Self::InsufficientStock { .. }
            | Self::PriceChanged { .. }
            | Self::TotalMismatch { .. }
            | Self::CartChanged
            | Self::DuplicateSubmission => StatusCode::CONFLICT,
            Self::InvalidQuantity(_) | Self::PaymentMethodNotAllowed { .. } | Self::ValidationFailed(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::TransactionConflict | Self::StorageTimeout | Self::StorageUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn details(&self) -> Value {
        match self {
            Self::ProductNotFound(product_id) | Self::OutOfStock { product_id } => json!({"product_id": product_id}),
            Self::InsufficientStock { product_id, requested, available } => {
                json!({"product_id": product_id, "requested": requested, "available": available})
            }
            Self::InvalidQuantity(quantity) => json!({"quantity": quantity}),
            Self::PriceChanged { product_id, submitted, current } => {
                json!({"product_id": product_id, "submitted_price": submitted, "current_price": current})
            }
            Self::TotalMismatch { submitted, computed } => json!({"submitted_total": submitted, "computed_total": computed}),
            Self::PaymentMethodNotAllowed { method, total, ceiling } => json!({"payment_method": method, "total": total, "ceiling": ceiling}),
            _ => json!({}),
        }
    }
}

impl IntoResponse for CommerceError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = if self.is_retryable() {
            tracing::error!(error = %self, "request failed on storage");
            "temporarily unavailable, please try again".to_string()
        } else {
            self.to_string()
        };

        let mut body = Map::new();
        body.insert("error".into(), Value::from(self.code()));
        body.insert("message".into(), Value::from(message));
        if let Value::Object(details) = self.details() {
            body.extend(details);
        }

        let mut response = (status, Json(Value::Object(body))).into_response();
        if status == StatusCode::SERVICE_UNAVAILABLE {
            response.headers_mut().insert(RETRY_AFTER, HeaderValue::from_static(RETRY_AFTER_SECS));
        }
        response
    }
}

// =============================================================================
// Cart
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct AddItemRequest {
    pub product_id: ProductId,
    #[serde(default = "default_quantity")]
    pub quantity: i64,
}

fn default_quantity() -> i64 { 1 }

#[derive(Debug, Deserialize)]
pub struct UpdateQuantityRequest {
    pub quantity: i64,
}

async fn get_cart(State(s): State<AppState>, AuthenticatedCustomer(customer): AuthenticatedCustomer) -> ApiResult<Json<Cart>> {
    Ok(Json(s.cart.list(customer).await?))
}

async fn add_cart_item(
    State(s): State<AppState>,
    AuthenticatedCustomer(customer): AuthenticatedCustomer,
    Json(r): Json<AddItemRequest>,
) -> ApiResult<(StatusCode, Json<CartItem>)> {
    let item = s.cart.add_item(customer, r.product_id, r.quantity).await?;
    Ok((StatusCode::CREATED, Json(item)))
}

async fn update_cart_item(
    State(s): State<AppState>,
    AuthenticatedCustomer(customer): AuthenticatedCustomer,
    Path(id): Path<CartItemId>,
    Json(r): Json<UpdateQuantityRequest>,
) -> ApiResult<Json<CartItem>> {
    Ok(Json(s.cart.update_quantity(customer, id, r.quantity).await?))
}

async fn remove_cart_item(
    State(s): State<AppState>,
    AuthenticatedCustomer(customer): AuthenticatedCustomer,
    Path(id): Path<CartItemId>,
) -> ApiResult<StatusCode> {
    s.cart.remove_item(customer, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn clear_cart(State(s): State<AppState>, AuthenticatedCustomer(customer): AuthenticatedCustomer) -> ApiResult<StatusCode> {
    s.cart.clear(customer).await?;
    Ok(StatusCode::NO_CONTENT)
}

// =============================================================================
// Checkout
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct QuoteRequest {
    pub district: String,
    pub carrier: Carrier,
}

async fn quote(
    State(s): State<AppState>,
    AuthenticatedCustomer(customer): AuthenticatedCustomer,
    Json(r): Json<QuoteRequest>,
) -> ApiResult<Json<CheckoutQuote>> {
    Ok(Json(s.checkout.quote(customer, &r.district, r.carrier).await?))
}

async fn checkout(
    State(s): State<AppState>,
    AuthenticatedCustomer(customer): AuthenticatedCustomer,
    headers: HeaderMap,
    Json(mut r): Json<CheckoutRequest>,
) -> ApiResult<(StatusCode, Json<OrderSummary>)> {
    r.idempotency_key = idempotency_key(&headers)?;
    let summary = s.checkout.submit(customer, r).await?;
    Ok((StatusCode::CREATED, Json(summary)))
}

fn idempotency_key(headers: &HeaderMap) -> ApiResult<Option<IdempotencyKey>> {
    let Some(value) = headers.get(IDEMPOTENCY_HEADER) else { return Ok(None) };
    value
        .to_str()
        .ok()
        .and_then(|v| IdempotencyKey::new(v))
        .map(Some)
        .ok_or_else(|| CommerceError::ValidationFailed(format!("invalid {IDEMPOTENCY_HEADER} header")))
}

// =============================================================================
// Orders
// =============================================================================

async fn list_orders(
    State(s): State<AppState>,
    AuthenticatedCustomer(customer): AuthenticatedCustomer,
    Query(filter): Query<OrderFilter>,
) -> ApiResult<Json<Page<Order>>> {
    Ok(Json(s.orders.list_for_customer(customer, filter).await?))
}

async fn get_order(
    State(s): State<AppState>,
    AuthenticatedCustomer(customer): AuthenticatedCustomer,
    Path(id): Path<OrderId>,
) -> ApiResult<Json<OrderDetails>> {
    Ok(Json(s.orders.get_for_customer(customer, id).await?))
}

async fn list_vendor_orders(
    State(s): State<AppState>,
    Path(vendor_id): Path<VendorId>,
    Query(filter): Query<OrderFilter>,
) -> ApiResult<Json<Page<VendorOrder>>> {
    Ok(Json(s.orders.list_for_vendor(vendor_id, filter).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::aggregates::Product;
    use crate::domain::events::NoopPublisher;
    use crate::domain::value_objects::Money;
    use crate::store::memory::MemoryStore;
    use axum::body::{to_bytes, Body};
    use axum::http::{Method, Request};
    use testresult::TestResult;
    use tower::ServiceExt;

    fn app(store: &MemoryStore) -> Router {
        let state = AppState::new(Repositories::from_store(store.clone()), ShippingRules::default(), PaymentPolicy::default(), Arc::new(NoopPublisher));
        router(state)
    }

    fn request(method: Method, uri: &str, customer: Option<CustomerId>, body: Option<Value>) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri).header("content-type", "application/json");
        if let Some(customer) = customer {
            builder = builder.header(CUSTOMER_HEADER, customer.to_string());
        }
        let body = body.map_or_else(Body::empty, |v| Body::from(v.to_string()));
        builder.body(body).unwrap()
    }

    async fn send(app: &Router, req: Request<Body>) -> (StatusCode, HeaderMap, Value) {
        let response = app.clone().oneshot(req).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() { Value::Null } else { serde_json::from_slice(&bytes).unwrap() };
        (status, headers, body)
    }

    fn checkout_body(product: &Product, quantity: u32) -> Value {
        json!({
            "lines": [{"product_id": product.id, "quantity": quantity, "unit_price": product.price}],
            "shipping_address": {
                "full_name": "Ada Obi", "phone": "+234 801 234 5678", "district": "Ikeja",
                "street_address": "12 Allen Avenue"
            },
            "carrier": "standard",
            "payment_method": "card"
        })
    }

    #[tokio::test]
    async fn test_missing_identity_is_unauthorized() {
        let app = app(&MemoryStore::new());
        let (status, _, body) = send(&app, request(Method::GET, "/api/v1/cart", None, None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "unauthorized");
    }

    #[tokio::test]
    async fn test_cart_to_order_flow() -> TestResult {
        let store = MemoryStore::new();
        let product = store.upsert_product(Product::new(VendorId::new(), "Stool", Money::from_minor(2500), 4)).await;
        let app = app(&store);
        let customer = CustomerId::new();

        let add = json!({"product_id": product.id, "quantity": 2});
        let (status, _, _) = send(&app, request(Method::POST, "/api/v1/cart/items", Some(customer), Some(add))).await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, _, cart) = send(&app, request(Method::GET, "/api/v1/cart", Some(customer), None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(cart["subtotal"], 5000);

        let (status, _, order) = send(&app, request(Method::POST, "/api/v1/checkout", Some(customer), Some(checkout_body(&product, 2)))).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(order["total"], 5600);
        assert_eq!(order["status"], "PENDING");
        assert_eq!(order["order_number"], "ORD-000001");

        let uri = format!("/api/v1/orders/{}", order["id"].as_str().unwrap_or_default());
        let (status, _, details) = send(&app, request(Method::GET, &uri, Some(customer), None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(details["items"][0]["unit_price"], 2500);

        let (status, _, _) = send(&app, request(Method::GET, &uri, Some(CustomerId::new()), None)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (_, _, history) = send(&app, request(Method::GET, "/api/v1/orders?status=PENDING", Some(customer), None)).await;
        assert_eq!(history["total"], 1);

        let uri = format!("/api/v1/vendors/{}/orders", product.vendor_id);
        let (_, _, vendor) = send(&app, request(Method::GET, &uri, None, None)).await;
        assert_eq!(vendor["total"], 1);
        assert_eq!(vendor["data"][0]["order_number"], "ORD-000001");
        assert!(vendor["data"][0].get("shipping_address").is_none());
        assert!(vendor["data"][0].get("customer_id").is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_stock_error_reports_available_count() -> TestResult {
        let store = MemoryStore::new();
        let product = store.upsert_product(Product::new(VendorId::new(), "Stool", Money::from_minor(2500), 3)).await;
        let app = app(&store);

        let add = json!({"product_id": product.id, "quantity": 4});
        let (status, _, body) = send(&app, request(Method::POST, "/api/v1/cart/items", Some(CustomerId::new()), Some(add))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "insufficient_stock");
        assert_eq!(body["available"], 3);
        assert_eq!(body["product_id"], product.id.to_string());
        Ok(())
    }

    #[tokio::test]
    async fn test_bad_idempotency_header_rejected() -> TestResult {
        let store = MemoryStore::new();
        let product = store.upsert_product(Product::new(VendorId::new(), "Stool", Money::from_minor(2500), 3)).await;
        let app = app(&store);
        let mut req = request(Method::POST, "/api/v1/checkout", Some(CustomerId::new()), Some(checkout_body(&product, 1)));
        req.headers_mut().insert(IDEMPOTENCY_HEADER, HeaderValue::from_static("   "));

        let (status, _, body) = send(&app, req).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["error"], "validation_failed");
        Ok(())
    }

    #[test]
    fn test_storage_errors_hide_internals_and_ask_for_retry() {
        let response = CommerceError::StorageUnavailable("password authentication failed for user app".into()).into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers().get(RETRY_AFTER).and_then(|v| v.to_str().ok()), Some(RETRY_AFTER_SECS));
        assert_eq!(CommerceError::CartChanged.status(), StatusCode::CONFLICT);
        assert_eq!(CommerceError::InvalidQuantity(0).status(), StatusCode::UNPROCESSABLE_ENTITY);
    }
}
