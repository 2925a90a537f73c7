//! Domain events
//!
//! Raised after a checkout has committed and published best-effort; a failed
//! publish is logged and never affects the order.
use async_trait::async_trait;
use serde::Serialize;
use crate::domain::aggregates::{Order, OrderItem};
use crate::domain::value_objects::{CustomerId, Money, OrderId, OrderNumber, ProductId, VendorId};

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    Order(OrderEvent),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum OrderEvent {
    Placed {
        order_id: OrderId,
        order_number: OrderNumber,
        customer_id: CustomerId,
        subtotal: Money,
        shipping_cost: Money,
        total_amount: Money,
        lines: Vec<PlacedLine>,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PlacedLine { pub product_id: ProductId, pub vendor_id: VendorId, pub quantity: u32, pub unit_price: Money }

impl DomainEvent {
    pub fn order_placed(order: &Order, items: &[OrderItem]) -> Self {
        DomainEvent::Order(OrderEvent::Placed {
            order_id: order.id,
            order_number: order.order_number.clone(),
            customer_id: order.customer_id,
            subtotal: order.subtotal,
            shipping_cost: order.shipping_cost,
            total_amount: order.total_amount,
            lines: items.iter().map(|i| PlacedLine { product_id: i.product_id, vendor_id: i.vendor_id, quantity: i.quantity, unit_price: i.unit_price }).collect(),
        })
    }

    pub fn subject(&self) -> &'static str {
        match self { DomainEvent::Order(OrderEvent::Placed { .. }) => "orders.placed" }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("event encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("event transport failed: {0}")]
    Transport(String),
}

#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: &DomainEvent) -> Result<(), PublishError>;
}

#[async_trait]
impl EventPublisher for async_nats::Client {
    async fn publish(&self, event: &DomainEvent) -> Result<(), PublishError> {
        let payload = serde_json::to_vec(event)?;
        async_nats::Client::publish(self, event.subject().to_string(), payload.into())
            .await
            .map_err(|e| PublishError::Transport(e.to_string()))
    }
}

/// Drops every event; used when no broker is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopPublisher;

#[async_trait]
impl EventPublisher for NoopPublisher {
    async fn publish(&self, event: &DomainEvent) -> Result<(), PublishError> {
        tracing::debug!(subject = event.subject(), "no event broker configured, dropping event");
        Ok(())
    }
}
