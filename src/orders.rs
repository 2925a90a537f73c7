//! Order Query Service
//!
//! Read-only order history for customers and vendors, newest first.

use std::sync::Arc;
use tracing::instrument;

use crate::domain::aggregates::{Order, OrderDetails, VendorOrder};
use crate::domain::value_objects::{CustomerId, OrderId, VendorId};
use crate::store::{OrderFilter, OrderRepository, Page, Repositories};
use crate::{CommerceError, Result};

#[derive(Clone)]
pub struct OrderQueryService {
    orders: Arc<dyn OrderRepository>,
}

impl OrderQueryService {
    pub fn new(repos: &Repositories) -> Self { Self { orders: repos.orders.clone() } }

    #[instrument(skip(self), fields(customer_id = %customer_id))]
    pub async fn list_for_customer(&self, customer_id: CustomerId, filter: OrderFilter) -> Result<Page<Order>> {
        self.orders.list_for_customer(customer_id, filter).await
    }

    /// Orders holding at least one line from `vendor_id`, without buyer details.
    #[instrument(skip(self), fields(vendor_id = %vendor_id))]
    pub async fn list_for_vendor(&self, vendor_id: VendorId, filter: OrderFilter) -> Result<Page<VendorOrder>> {
        Ok(self.orders.list_for_vendor(vendor_id, filter).await?.map(VendorOrder::from))
    }

    /// Another customer's order is reported as not found.
    pub async fn get_for_customer(&self, customer_id: CustomerId, order_id: OrderId) -> Result<OrderDetails> {
        self.orders.get(customer_id, order_id).await?.ok_or(CommerceError::NotFound("order"))
    }
}
