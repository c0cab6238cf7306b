//! Checkout session model and state machine.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use common::{CartId, CheckoutId, Currency, OrderId, UserId};
use serde::{Deserialize, Serialize};

use crate::address::Address;
use crate::error::DomainError;
use crate::order::OrderLine;
use crate::tax::Totals;

/// The status of a checkout attempt.
///
/// State transitions:
/// ```text
/// Pending ──► AwaitingPayment ──► Processing ──┬──► Completed
///    │              │                          └──► Failed
///    └──────────────┴──► Expired
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CheckoutStatus {
    /// Created, payment session not yet attached.
    #[default]
    Pending,

    /// Payment session exists; waiting for the shopper to pay.
    AwaitingPayment,

    /// Completion in progress.
    Processing,

    /// Order recorded (terminal state).
    Completed,

    /// Payment verification failed (terminal state).
    Failed,

    /// Abandoned before completion started.
    Expired,
}

impl CheckoutStatus {
    /// Returns true if the expiry sweep may expire a session in this state.
    pub fn can_expire(&self) -> bool {
        matches!(
            self,
            CheckoutStatus::Pending | CheckoutStatus::AwaitingPayment
        )
    }

    /// Returns true for `Completed` and `Failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, CheckoutStatus::Completed | CheckoutStatus::Failed)
    }

    /// Returns the state name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckoutStatus::Pending => "pending",
            CheckoutStatus::AwaitingPayment => "awaiting_payment",
            CheckoutStatus::Processing => "processing",
            CheckoutStatus::Completed => "completed",
            CheckoutStatus::Failed => "failed",
            CheckoutStatus::Expired => "expired",
        }
    }
}

impl std::fmt::Display for CheckoutStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Client-side payment session material returned by the gateway.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentSessionData {
    pub session_token: String,
    pub client_config: BTreeMap<String, String>,
}

/// One checkout attempt with its frozen transaction view.
///
/// Lines, totals, currency and addresses are copied in at creation and never
/// re-read from the cart, so the amount verified at completion is exactly the
/// amount priced at initiation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckoutSession {
    checkout_id: CheckoutId,
    cart_id: CartId,
    user_id: Option<UserId>,
    status: CheckoutStatus,
    lines: Vec<OrderLine>,
    totals: Totals,
    currency: Currency,
    payment_reference: Option<String>,
    payment_session: Option<PaymentSessionData>,
    shipping: Address,
    billing: Address,
    order_id: Option<OrderId>,
    failure_reason: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl CheckoutSession {
    /// Creates a pending session expiring `ttl` after `now`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        checkout_id: CheckoutId,
        cart_id: CartId,
        user_id: Option<UserId>,
        lines: Vec<OrderLine>,
        totals: Totals,
        currency: Currency,
        shipping: Address,
        billing: Address,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Self {
        Self {
            checkout_id,
            cart_id,
            user_id,
            status: CheckoutStatus::Pending,
            lines,
            totals,
            currency,
            payment_reference: None,
            payment_session: None,
            shipping,
            billing,
            order_id: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
            expires_at: now + ttl,
        }
    }

    fn move_to(
        &mut self,
        allowed: bool,
        next: CheckoutStatus,
        now: DateTime<Utc>,
    ) -> Result<(), DomainError> {
        if !allowed {
            return Err(DomainError::InvalidTransition {
                entity: "checkout",
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    /// Attaches the gateway's payment session: `Pending → AwaitingPayment`.
    pub fn await_payment(
        &mut self,
        reference: impl Into<String>,
        payment_session: PaymentSessionData,
        now: DateTime<Utc>,
    ) -> Result<(), DomainError> {
        let allowed = self.status == CheckoutStatus::Pending;
        self.move_to(allowed, CheckoutStatus::AwaitingPayment, now)?;
        self.payment_reference = Some(reference.into());
        self.payment_session = Some(payment_session);
        Ok(())
    }

    /// `AwaitingPayment → Processing`. Refused once the session has expired.
    pub fn begin_processing(&mut self, now: DateTime<Utc>) -> Result<(), DomainError> {
        let allowed = self.status == CheckoutStatus::AwaitingPayment && !self.is_expired_at(now);
        self.move_to(allowed, CheckoutStatus::Processing, now)
    }

    /// `Processing → Completed`, recording the order.
    pub fn complete(&mut self, order_id: OrderId, now: DateTime<Utc>) -> Result<(), DomainError> {
        let allowed = self.status == CheckoutStatus::Processing;
        self.move_to(allowed, CheckoutStatus::Completed, now)?;
        self.order_id = Some(order_id);
        Ok(())
    }

    /// `Processing → Failed`.
    pub fn fail(
        &mut self,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<(), DomainError> {
        let allowed = self.status == CheckoutStatus::Processing;
        self.move_to(allowed, CheckoutStatus::Failed, now)?;
        self.failure_reason = Some(reason.into());
        Ok(())
    }

    /// `Pending | AwaitingPayment → Expired`, only once `expires_at` has passed.
    pub fn expire(&mut self, now: DateTime<Utc>) -> Result<(), DomainError> {
        let allowed = self.status.can_expire() && self.is_expired_at(now);
        self.move_to(allowed, CheckoutStatus::Expired, now)
    }

    /// Returns true if `now` is past `expires_at`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    pub fn checkout_id(&self) -> CheckoutId {
        self.checkout_id
    }

    pub fn cart_id(&self) -> &CartId {
        &self.cart_id
    }

    pub fn user_id(&self) -> Option<UserId> {
        self.user_id
    }

    pub fn status(&self) -> CheckoutStatus {
        self.status
    }

    pub fn lines(&self) -> &[OrderLine] {
        &self.lines
    }

    pub fn totals(&self) -> Totals {
        self.totals
    }

    pub fn currency(&self) -> &Currency {
        &self.currency
    }

    pub fn payment_reference(&self) -> Option<&str> {
        self.payment_reference.as_deref()
    }

    pub fn payment_session(&self) -> Option<&PaymentSessionData> {
        self.payment_session.as_ref()
    }

    pub fn shipping(&self) -> &Address {
        &self.shipping
    }

    pub fn billing(&self) -> &Address {
        &self.billing
    }

    /// The order recorded by a completed session.
    pub fn order_id(&self) -> Option<OrderId> {
        self.order_id
    }

    pub fn failure_reason(&self) -> Option<&str> {
        self.failure_reason.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }
}

#[cfg(test)]
mod tests {
    use common::{Money, ProductId};

    use super::*;

    fn session(ttl: Duration) -> CheckoutSession {
        let address = Address::new("Ada", "1 Main St", "Springfield", "12345", "US");
        let line = OrderLine::new(ProductId::new(42), None, 2, Money::from_cents(1000));
        let totals = Totals {
            subtotal: Money::from_cents(2000),
            tax: Money::zero(),
            total: Money::from_cents(2000),
        };
        CheckoutSession::new(
            CheckoutId::new(),
            CartId::new("c1"),
            None,
            vec![line],
            totals,
            Currency::usd(),
            address.clone(),
            address,
            Utc::now(),
            ttl,
        )
    }

    #[test]
    fn test_happy_path_transitions() {
        let now = Utc::now();
        let mut s = session(Duration::minutes(30));
        assert_eq!(s.status(), CheckoutStatus::Pending);

        s.await_payment("ref-1", PaymentSessionData::default(), now)
            .unwrap();
        assert_eq!(s.status(), CheckoutStatus::AwaitingPayment);
        assert_eq!(s.payment_reference(), Some("ref-1"));

        s.begin_processing(now).unwrap();
        assert_eq!(s.status(), CheckoutStatus::Processing);

        let order_id = OrderId::new();
        s.complete(order_id, now).unwrap();
        assert_eq!(s.status(), CheckoutStatus::Completed);
        assert_eq!(s.order_id(), Some(order_id));
        assert!(s.status().is_terminal());
    }

    #[test]
    fn test_terminal_states_refuse_mutation() {
        let now = Utc::now();
        let mut s = session(Duration::minutes(30));
        s.await_payment("ref-1", PaymentSessionData::default(), now)
            .unwrap();
        s.begin_processing(now).unwrap();
        s.fail("declined", now).unwrap();

        assert_eq!(s.failure_reason(), Some("declined"));
        assert!(s.complete(OrderId::new(), now).is_err());
        assert!(s.begin_processing(now).is_err());
        assert!(s.expire(now + Duration::hours(1)).is_err());
        assert_eq!(s.status(), CheckoutStatus::Failed);
    }

    #[test]
    fn test_cannot_skip_awaiting_payment() {
        let mut s = session(Duration::minutes(30));
        let result = s.begin_processing(Utc::now());
        assert!(matches!(result, Err(DomainError::InvalidTransition { .. })));
    }

    #[test]
    fn test_expire_only_after_deadline() {
        let now = Utc::now();
        let mut s = session(Duration::minutes(30));
        s.await_payment("ref-1", PaymentSessionData::default(), now)
            .unwrap();

        assert!(s.expire(now).is_err());
        s.expire(now + Duration::minutes(31)).unwrap();
        assert_eq!(s.status(), CheckoutStatus::Expired);
    }

    #[test]
    fn test_expired_session_cannot_begin_processing() {
        let now = Utc::now();
        let mut s = session(Duration::minutes(30));
        s.await_payment("ref-1", PaymentSessionData::default(), now)
            .unwrap();
        assert!(s.begin_processing(now + Duration::minutes(31)).is_err());
    }

    #[test]
    fn test_processing_never_expires() {
        let now = Utc::now();
        let mut s = session(Duration::minutes(30));
        s.await_payment("ref-1", PaymentSessionData::default(), now)
            .unwrap();
        s.begin_processing(now).unwrap();
        assert!(s.expire(now + Duration::hours(2)).is_err());
    }

    #[test]
    fn test_status_flags() {
        assert!(CheckoutStatus::Pending.can_expire());
        assert!(CheckoutStatus::AwaitingPayment.can_expire());
        assert!(!CheckoutStatus::Processing.can_expire());
        assert!(!CheckoutStatus::Expired.is_terminal());
        assert_eq!(
            CheckoutStatus::AwaitingPayment.to_string(),
            "awaiting_payment"
        );
    }

    #[test]
    fn test_session_serialization() {
        let s = session(Duration::minutes(30));
        let json = serde_json::to_string(&s).unwrap();
        let back: CheckoutSession = serde_json::from_str(&json).unwrap();
        assert_eq!(back.checkout_id(), s.checkout_id());
        assert_eq!(back.totals(), s.totals());
        assert_eq!(back.status(), CheckoutStatus::Pending);
    }
}
