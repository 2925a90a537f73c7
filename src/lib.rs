//! Marketplace Checkout
//!
//! Cart, checkout and order placement for a multi-vendor marketplace.
//!
//! ## Features
//! - Stock-bounded, merge-on-add customer carts
//! - Deterministic shipping cost calculation
//! - Server-side checkout validation (stock, price, payment ceilings)
//! - Atomic order placement with a guarded stock decrement
//! - Paginated order history for customers and vendors

use std::borrow::Cow;
use thiserror::Error;

pub mod cart;
pub mod checkout;
pub mod config;
pub mod domain;
pub mod http;
pub mod orders;
pub mod shipping;
pub mod store;

pub use domain::aggregates::{Cart, CartItem, CartLine, Order, OrderDetails, OrderItem, OrderStatus, PaymentMethod, Product, ShippingAddress};
pub use domain::value_objects::{CartItemId, CustomerId, IdempotencyKey, Money, OrderId, OrderNumber, ProductId, VendorId};

// =============================================================================
// Error Types
// =============================================================================

#[derive(Error, Debug)]
pub enum CommerceError {
    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("product {0} not found")]
    ProductNotFound(ProductId),

    #[error("product {product_id} is out of stock")]
    OutOfStock { product_id: ProductId },

    #[error("only {available} of product {product_id} available, {requested} requested")]
    InsufficientStock { product_id: ProductId, requested: u32, available: u32 },

    #[error("invalid quantity {0}, must be at least 1")]
    InvalidQuantity(i64),

    #[error("price of product {product_id} changed from {submitted} to {current}")]
    PriceChanged { product_id: ProductId, submitted: Money, current: Money },

    #[error("submitted total {submitted} does not match {computed}")]
    TotalMismatch { submitted: Money, computed: Money },

    #[error("cart changed since checkout was loaded")]
    CartChanged,

    #[error("{method} is not allowed for orders above {ceiling} (total {total})")]
    PaymentMethodNotAllowed { method: PaymentMethod, total: Money, ceiling: Money },

    #[error("validation failed: {0}")]
    ValidationFailed(String),

    #[error("checkout already submitted with this idempotency key")]
    DuplicateSubmission,

    #[error("concurrent checkout conflict")]
    TransactionConflict,

    #[error("storage timed out")]
    StorageTimeout,

    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
}

impl CommerceError {
    /// Failures the caller may retry unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransactionConflict | Self::StorageTimeout | Self::StorageUnavailable(_))
    }

    /// Stable machine-readable code for API clients.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::ProductNotFound(_) => "product_not_found",
            Self::OutOfStock { .. } => "out_of_stock",
            Self::InsufficientStock { .. } => "insufficient_stock",
            Self::InvalidQuantity(_) => "invalid_quantity",
            Self::PriceChanged { .. } => "price_changed",
            Self::TotalMismatch { .. } => "total_mismatch",
            Self::CartChanged => "cart_changed",
            Self::PaymentMethodNotAllowed { .. } => "payment_method_not_allowed",
            Self::ValidationFailed(_) => "validation_failed",
            Self::DuplicateSubmission => "duplicate_submission",
            Self::TransactionConflict => "transaction_conflict",
            Self::StorageTimeout => "storage_timeout",
            Self::StorageUnavailable(_) => "storage_unavailable",
        }
    }
}

/// Name of the unique index that scopes idempotency keys to a customer.
pub const IDEMPOTENCY_CONSTRAINT: &str = "orders_customer_idempotency_key";

const SERIALIZATION_FAILURE: &str = "40001";
const DEADLOCK_DETECTED: &str = "40P01";
const LOCK_NOT_AVAILABLE: &str = "55P03";
const QUERY_CANCELED: &str = "57014";

impl From<sqlx::Error> for CommerceError {
    fn from(error: sqlx::Error) -> Self {
        use sqlx::error::ErrorKind;
        match error {
            sqlx::Error::RowNotFound => Self::NotFound("record"),
            sqlx::Error::PoolTimedOut => Self::StorageTimeout,
            sqlx::Error::Database(ref db) => {
                let code = db.code().unwrap_or(Cow::Borrowed(""));
                match code.as_ref() {
                    SERIALIZATION_FAILURE | DEADLOCK_DETECTED | LOCK_NOT_AVAILABLE => return Self::TransactionConflict,
                    QUERY_CANCELED => return Self::StorageTimeout,
                    _ => {}
                }
                match db.kind() {
                    ErrorKind::UniqueViolation if db.constraint() == Some(IDEMPOTENCY_CONSTRAINT) => Self::DuplicateSubmission,
                    ErrorKind::UniqueViolation => Self::TransactionConflict,
                    _ => Self::StorageUnavailable(error.to_string()),
                }
            }
            other => Self::StorageUnavailable(other.to_string()),
        }
    }
}

impl From<validator::ValidationErrors> for CommerceError {
    fn from(errors: validator::ValidationErrors) -> Self {
        let mut fields: Vec<&str> = errors.field_errors().into_keys().collect();
        fields.sort_unstable();
        Self::ValidationFailed(format!("invalid {}", fields.join(", ")))
    }
}

pub type Result<T> = std::result::Result<T, CommerceError>;
