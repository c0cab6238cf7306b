//! Order ledger record and its status machine.

use chrono::{DateTime, Utc};
use common::{CheckoutId, Currency, Money, OrderId, ProductId, UserId, VariantId};
use serde::{Deserialize, Serialize};

use crate::address::Address;
use crate::checkout::CheckoutSession;
use crate::error::DomainError;
use crate::tax::Totals;

/// A priced line frozen at checkout time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLine {
    pub product_id: ProductId,
    pub variant_id: Option<VariantId>,
    pub quantity: u32,
    pub unit_price: Money,
}

impl OrderLine {
    pub fn new(
        product_id: ProductId,
        variant_id: Option<VariantId>,
        quantity: u32,
        unit_price: Money,
    ) -> Self {
        Self {
            product_id,
            variant_id,
            quantity,
            unit_price,
        }
    }

    /// Returns `unit_price * quantity`.
    pub fn line_total(&self) -> Money {
        self.unit_price.multiply(self.quantity)
    }

    /// Rejects a line that cannot be charged.
    pub fn validate(&self) -> Result<(), DomainError> {
        validate_line(self.product_id, self.quantity, self.unit_price)
    }
}

/// A chargeable line has a positive quantity, a non-negative unit price and
/// a total that fits in [`Money`].
pub(crate) fn validate_line(
    product_id: ProductId,
    quantity: u32,
    unit_price: Money,
) -> Result<(), DomainError> {
    if quantity == 0 {
        return Err(DomainError::InvalidQuantity {
            product_id,
            quantity,
        });
    }
    if unit_price.is_negative() {
        return Err(DomainError::InvalidPrice {
            product_id,
            cents: unit_price.cents(),
        });
    }
    if unit_price.checked_multiply(quantity).is_none() {
        return Err(DomainError::AmountOverflow { product_id });
    }
    Ok(())
}

/// The status of an order in the ledger.
///
/// State transitions (driven by payment-gateway notifications):
/// ```text
/// Pending ──┬──► Confirmed ──┬──► Cancelled
///           │       ▲        └──► Refunded
///           ├──► Failed
///           └──► Cancelled
/// ```
/// `Failed → Confirmed` covers a successful authorisation that arrives after
/// a failed one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    #[default]
    Pending,
    Confirmed,
    Failed,
    Cancelled,
    Refunded,
}

impl OrderStatus {
    /// Returns true if the ledger may move from `self` to `next`.
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        matches!(
            (self, next),
            (Pending, Confirmed | Failed | Cancelled)
                | (Confirmed, Cancelled | Refunded)
                | (Failed, Confirmed)
        )
    }

    /// Returns the status name as stored in the ledger.
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Confirmed => "confirmed",
            OrderStatus::Failed => "failed",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Refunded => "refunded",
        }
    }

    /// Parses a stored status name.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(OrderStatus::Pending),
            "confirmed" => Some(OrderStatus::Confirmed),
            "failed" => Some(OrderStatus::Failed),
            "cancelled" => Some(OrderStatus::Cancelled),
            "refunded" => Some(OrderStatus::Refunded),
            _ => None,
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of an asynchronous payment-gateway notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentEventKind {
    Authorisation,
    Cancellation,
    Refund,
    Other(String),
}

impl PaymentEventKind {
    /// Parses the gateway's event code (`AUTHORISATION`, `CANCELLATION`, `REFUND`).
    pub fn parse(code: &str) -> Self {
        match code.trim().to_ascii_uppercase().as_str() {
            "AUTHORISATION" => PaymentEventKind::Authorisation,
            "CANCELLATION" => PaymentEventKind::Cancellation,
            "REFUND" => PaymentEventKind::Refund,
            _ => PaymentEventKind::Other(code.to_string()),
        }
    }

    /// The order status this event asks for, or `None` for event kinds we ignore.
    pub fn target_status(&self, succeeded: bool) -> Option<OrderStatus> {
        match self {
            PaymentEventKind::Authorisation if succeeded => Some(OrderStatus::Confirmed),
            PaymentEventKind::Authorisation => Some(OrderStatus::Failed),
            PaymentEventKind::Cancellation => Some(OrderStatus::Cancelled),
            PaymentEventKind::Refund => Some(OrderStatus::Refunded),
            PaymentEventKind::Other(_) => None,
        }
    }
}

/// An order as recorded in the ledger. At most one exists per `checkout_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub order_id: OrderId,
    /// Idempotency key; unique in the ledger.
    pub checkout_id: CheckoutId,
    pub status: OrderStatus,
    /// Gateway-assigned payment identifier.
    pub payment_id: String,
    /// Merchant reference the payment session was created with.
    pub payment_reference: String,
    pub user_id: Option<UserId>,
    pub lines: Vec<OrderLine>,
    pub totals: Totals,
    pub currency: Currency,
    pub shipping: Address,
    pub billing: Address,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// Builds a pending order from a verified checkout session's frozen snapshot.
    pub fn from_session(
        session: &CheckoutSession,
        payment_id: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            order_id: OrderId::new(),
            checkout_id: session.checkout_id(),
            status: OrderStatus::Pending,
            payment_id: payment_id.into(),
            payment_reference: session.payment_reference().unwrap_or_default().to_string(),
            user_id: session.user_id(),
            lines: session.lines().to_vec(),
            totals: session.totals(),
            currency: session.currency().clone(),
            shipping: session.shipping().clone(),
            billing: session.billing().clone(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Moves the order to `next` if the status machine allows it.
    pub fn transition(&mut self, next: OrderStatus, now: DateTime<Utc>) -> Result<(), DomainError> {
        if !self.status.can_transition_to(next) {
            return Err(DomainError::InvalidTransition {
                entity: "order",
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions() {
        use OrderStatus::*;
        assert!(Pending.can_transition_to(Confirmed));
        assert!(Pending.can_transition_to(Failed));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(!Pending.can_transition_to(Refunded));
        assert!(Confirmed.can_transition_to(Refunded));
        assert!(Confirmed.can_transition_to(Cancelled));
        assert!(Failed.can_transition_to(Confirmed));
        assert!(!Refunded.can_transition_to(Confirmed));
        assert!(!Cancelled.can_transition_to(Pending));
        assert!(!Confirmed.can_transition_to(Confirmed));
    }

    #[test]
    fn test_status_round_trip_names() {
        for status in [
            OrderStatus::Pending,
            OrderStatus::Confirmed,
            OrderStatus::Failed,
            OrderStatus::Cancelled,
            OrderStatus::Refunded,
        ] {
            assert_eq!(OrderStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(OrderStatus::parse("shipped"), None);
        assert_eq!(
            serde_json::to_string(&OrderStatus::Refunded).unwrap(),
            "\"refunded\""
        );
    }

    #[test]
    fn test_payment_event_mapping() {
        let auth = PaymentEventKind::parse("AUTHORISATION");
        assert_eq!(auth.target_status(true), Some(OrderStatus::Confirmed));
        assert_eq!(auth.target_status(false), Some(OrderStatus::Failed));
        assert_eq!(
            PaymentEventKind::parse("CANCELLATION").target_status(true),
            Some(OrderStatus::Cancelled)
        );
        assert_eq!(
            PaymentEventKind::parse("refund").target_status(true),
            Some(OrderStatus::Refunded)
        );
        assert_eq!(
            PaymentEventKind::parse("CHARGEBACK").target_status(true),
            None
        );
    }

    #[test]
    fn test_line_total() {
        let line = OrderLine::new(ProductId::new(42), None, 2, Money::from_cents(1000));
        assert_eq!(line.line_total().cents(), 2000);
    }

    #[test]
    fn test_validate_line() {
        let product = ProductId::new(42);
        let priced = OrderLine::new(product, None, 2, Money::from_cents(1000));
        assert!(priced.validate().is_ok());
        let free = OrderLine::new(product, None, 1, Money::zero());
        assert!(free.validate().is_ok());

        let empty = OrderLine::new(product, None, 0, Money::from_cents(1000));
        assert!(matches!(
            empty.validate(),
            Err(DomainError::InvalidQuantity { quantity: 0, .. })
        ));
        let negative = OrderLine::new(product, None, 1, Money::from_cents(-1));
        assert!(matches!(
            negative.validate(),
            Err(DomainError::InvalidPrice { cents: -1, .. })
        ));
        let huge = OrderLine::new(product, None, u32::MAX, Money::from_cents(i64::MAX / 1000));
        assert!(matches!(huge.validate(), Err(DomainError::AmountOverflow { .. })));
    }
}
