//! Events the checkout announces on the message bus.

use chrono::{DateTime, Utc};
use common::{CheckoutId, OrderId, ProductId, UserId, VariantId};
use domain::{Order, OrderStatus};
use messaging::topology::{NOTIFICATIONS, ORDERS};
use serde::{Deserialize, Serialize};

/// Message type of [`OrderCreated`].
pub const ORDER_CREATED: &str = "order.created";
/// Message type of [`OrderStatusChanged`].
pub const ORDER_STATUS_CHANGED: &str = "order.status_changed";

/// Topic `order.created` is published to.
pub const ORDER_CREATED_TOPIC: &str = ORDERS;
/// Topic `order.status_changed` is published to.
pub const ORDER_STATUS_CHANGED_TOPIC: &str = NOTIFICATIONS;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderCreatedLine {
    pub product_id: ProductId,
    pub variant_id: Option<VariantId>,
    pub quantity: u32,
    pub unit_price_cents: i64,
}

/// Published once an order is durably recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderCreated {
    pub order_id: OrderId,
    pub checkout_id: CheckoutId,
    pub user_id: Option<UserId>,
    pub payment_reference: String,
    pub currency: String,
    pub total_cents: i64,
    pub lines: Vec<OrderCreatedLine>,
    pub created_at: DateTime<Utc>,
}

impl From<&Order> for OrderCreated {
    fn from(order: &Order) -> Self {
        Self {
            order_id: order.order_id,
            checkout_id: order.checkout_id,
            user_id: order.user_id,
            payment_reference: order.payment_reference.clone(),
            currency: order.currency.code().to_string(),
            total_cents: order.totals.total.cents(),
            lines: order
                .lines
                .iter()
                .map(|l| OrderCreatedLine {
                    product_id: l.product_id,
                    variant_id: l.variant_id,
                    quantity: l.quantity,
                    unit_price_cents: l.unit_price.cents(),
                })
                .collect(),
            created_at: order.created_at,
        }
    }
}

/// Published when a payment notification moves an order to a new status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderStatusChanged {
    pub order_id: OrderId,
    pub payment_reference: String,
    pub from: OrderStatus,
    pub to: OrderStatus,
    pub changed_at: DateTime<Utc>,
}
