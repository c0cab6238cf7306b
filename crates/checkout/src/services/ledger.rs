//! Order ledger trait and in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{CheckoutId, OrderId};
use domain::{Order, OrderStatus};

use crate::error::AdapterError;

/// Trait for the durable order ledger.
///
/// `checkout_id` is the idempotency key: `create` must refuse a second order
/// for the same checkout with [`AdapterError::DuplicateOrder`], across every
/// process sharing the ledger.
#[async_trait]
pub trait OrderLedger: Send + Sync {
    /// Records a new order.
    async fn create(&self, order: &Order) -> Result<Order, AdapterError>;

    /// Loads an order by ID.
    async fn get(&self, order_id: OrderId) -> Result<Option<Order>, AdapterError>;

    /// Loads the order created for a checkout.
    async fn find_by_checkout(&self, checkout_id: CheckoutId)
    -> Result<Option<Order>, AdapterError>;

    /// Loads the order paid under a merchant payment reference.
    async fn find_by_payment_reference(&self, reference: &str)
    -> Result<Option<Order>, AdapterError>;

    /// Moves an order from `from` to `to` in one conditional write.
    ///
    /// Returns false and leaves the order untouched when its stored status is
    /// no longer `from`. Fails with [`AdapterError::NotFound`] for an unknown
    /// order.
    async fn update_status(
        &self,
        order_id: OrderId,
        from: OrderStatus,
        to: OrderStatus,
        updated_at: DateTime<Utc>,
    ) -> Result<bool, AdapterError>;
}

#[derive(Debug, Default)]
struct InMemoryLedgerState {
    orders: HashMap<OrderId, Order>,
    by_checkout: HashMap<CheckoutId, OrderId>,
    create_calls: usize,
    unavailable: bool,
}

/// In-memory order ledger for testing.
#[derive(Debug, Clone, Default)]
pub struct InMemoryOrderLedger {
    state: Arc<RwLock<InMemoryLedgerState>>,
}

impl InMemoryOrderLedger {
    /// Creates a new in-memory order ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of recorded orders.
    pub fn order_count(&self) -> usize {
        self.read().orders.len()
    }

    /// Returns the number of create calls, including rejected duplicates.
    pub fn create_calls(&self) -> usize {
        self.read().create_calls
    }

    /// Makes every call fail as if the database were unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.write().unavailable = unavailable;
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, InMemoryLedgerState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, InMemoryLedgerState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn check(state: &InMemoryLedgerState) -> Result<(), AdapterError> {
        if state.unavailable {
            return Err(AdapterError::Unavailable("order ledger".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl OrderLedger for InMemoryOrderLedger {
    async fn create(&self, order: &Order) -> Result<Order, AdapterError> {
        let mut state = self.write();
        Self::check(&state)?;
        state.create_calls += 1;

        if let Some(existing) = state
            .by_checkout
            .get(&order.checkout_id)
            .and_then(|id| state.orders.get(id))
        {
            return Err(AdapterError::DuplicateOrder(Box::new(existing.clone())));
        }
        state.by_checkout.insert(order.checkout_id, order.order_id);
        state.orders.insert(order.order_id, order.clone());
        Ok(order.clone())
    }

    async fn get(&self, order_id: OrderId) -> Result<Option<Order>, AdapterError> {
        let state = self.read();
        Self::check(&state)?;
        Ok(state.orders.get(&order_id).cloned())
    }

    async fn find_by_checkout(
        &self,
        checkout_id: CheckoutId,
    ) -> Result<Option<Order>, AdapterError> {
        let state = self.read();
        Self::check(&state)?;
        Ok(state
            .by_checkout
            .get(&checkout_id)
            .and_then(|id| state.orders.get(id))
            .cloned())
    }

    async fn find_by_payment_reference(
        &self,
        reference: &str,
    ) -> Result<Option<Order>, AdapterError> {
        let state = self.read();
        Self::check(&state)?;
        Ok(state
            .orders
            .values()
            .find(|o| o.payment_reference == reference)
            .cloned())
    }

    async fn update_status(
        &self,
        order_id: OrderId,
        from: OrderStatus,
        to: OrderStatus,
        updated_at: DateTime<Utc>,
    ) -> Result<bool, AdapterError> {
        let mut state = self.write();
        Self::check(&state)?;
        let order = state
            .orders
            .get_mut(&order_id)
            .ok_or_else(|| AdapterError::NotFound(format!("order {order_id}")))?;
        if order.status != from {
            return Ok(false);
        }
        order.status = to;
        order.updated_at = updated_at;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use common::{CartId, Currency, Money, ProductId};
    use domain::{Address, CheckoutSession, OrderLine, PaymentSessionData, Totals};

    use super::*;

    fn pending_order() -> Order {
        let now = Utc::now();
        let address = Address::new("Ada", "1 Main St", "Springfield", "12345", "US");
        let line = OrderLine::new(ProductId::new(42), None, 1, Money::from_cents(1000));
        let mut session = CheckoutSession::new(
            CheckoutId::new(),
            CartId::new("c1"),
            None,
            vec![line],
            Totals::default(),
            Currency::usd(),
            address.clone(),
            address,
            now,
            chrono::Duration::minutes(30),
        );
        session
            .await_payment("ref-1", PaymentSessionData::default(), now)
            .unwrap();
        Order::from_session(&session, "psp-1", now)
    }

    #[tokio::test]
    async fn test_create_is_idempotent_per_checkout() {
        let ledger = InMemoryOrderLedger::new();
        let order = ledger.create(&pending_order()).await.unwrap();

        let mut again = order.clone();
        again.order_id = OrderId::new();
        let err = ledger.create(&again).await.unwrap_err();

        match err {
            AdapterError::DuplicateOrder(existing) => {
                assert_eq!(existing.order_id, order.order_id);
            }
            other => panic!("expected a duplicate order, got {other:?}"),
        }
        assert_eq!(ledger.order_count(), 1);
        assert_eq!(ledger.create_calls(), 2);
    }

    #[tokio::test]
    async fn test_update_status_applies_expected_transition() {
        let ledger = InMemoryOrderLedger::new();
        let order = ledger.create(&pending_order()).await.unwrap();

        let updated = ledger
            .update_status(
                order.order_id,
                OrderStatus::Pending,
                OrderStatus::Confirmed,
                Utc::now(),
            )
            .await
            .unwrap();

        assert!(updated);
        let stored = ledger.get(order.order_id).await.unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::Confirmed);
    }

    #[tokio::test]
    async fn test_update_status_refuses_stale_from() {
        let ledger = InMemoryOrderLedger::new();
        let order = ledger.create(&pending_order()).await.unwrap();
        let id = order.order_id;
        let now = Utc::now();

        // Two writers both read `Pending`; the second one must lose.
        let first = ledger
            .update_status(id, OrderStatus::Pending, OrderStatus::Cancelled, now)
            .await
            .unwrap();
        let second = ledger
            .update_status(id, OrderStatus::Pending, OrderStatus::Confirmed, now)
            .await
            .unwrap();

        assert!(first);
        assert!(!second);
        let stored = ledger.get(id).await.unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_update_status_unknown_order() {
        let ledger = InMemoryOrderLedger::new();
        let result = ledger
            .update_status(
                OrderId::new(),
                OrderStatus::Pending,
                OrderStatus::Confirmed,
                Utc::now(),
            )
            .await;
        assert!(matches!(result, Err(AdapterError::NotFound(_))));
    }
}
