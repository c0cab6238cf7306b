//! Checkout orchestrator for turning a cart into a paid order.

use std::collections::HashMap;
use std::future::Future;
use std::time::Instant;

use chrono::{DateTime, Utc};
use common::{CartId, CheckoutId, Currency, ProductId, VariantId};
use domain::{
    Address, CartLine, CheckoutSession, CheckoutStatus, DomainError, Order, OrderLine,
    PaymentEventKind, compute_totals,
};
use messaging::{Message, MessageBus};

use crate::config::CheckoutConfig;
use crate::error::{AdapterError, CheckoutError, Result};
use crate::events::{
    ORDER_CREATED, ORDER_CREATED_TOPIC, ORDER_STATUS_CHANGED, ORDER_STATUS_CHANGED_TOPIC,
    OrderCreated, OrderStatusChanged,
};
use crate::services::{
    CartStore, InventoryService, OrderLedger, PaymentGateway, PaymentProof, PaymentSessionRequest,
    SessionStore,
};

type ItemKey = (ProductId, Option<VariantId>);

/// Outcome of trying to take a session into `Processing`.
enum Claim {
    /// The checkout already finished; this is its order.
    Replayed(Order),
    /// The session is `Processing` and ours to drive.
    Claimed(CheckoutSession),
}

/// Orchestrates checkouts across the cart store, session store, payment
/// gateway, inventory, order ledger and message bus.
///
/// A checkout runs `initiate_checkout` (price, reserve a payment session) and
/// then `complete_checkout` (verify, record the order, then decrement stock and
/// announce it). The ledger's unique `checkout_id` key is the only guard
/// against double completion; no in-process lock is held.
pub struct CheckoutOrchestrator<C, S, P, I, L, M>
where
    C: CartStore,
    S: SessionStore,
    P: PaymentGateway,
    I: InventoryService,
    L: OrderLedger,
    M: MessageBus,
{
    carts: C,
    sessions: S,
    payments: P,
    inventory: I,
    ledger: L,
    bus: M,
    config: CheckoutConfig,
}

impl<C, S, P, I, L, M> CheckoutOrchestrator<C, S, P, I, L, M>
where
    C: CartStore,
    S: SessionStore,
    P: PaymentGateway,
    I: InventoryService,
    L: OrderLedger,
    M: MessageBus,
{
    /// Creates a new orchestrator.
    pub fn new(
        carts: C,
        sessions: S,
        payments: P,
        inventory: I,
        ledger: L,
        bus: M,
        config: CheckoutConfig,
    ) -> Self {
        Self {
            carts,
            sessions,
            payments,
            inventory,
            ledger,
            bus,
            config,
        }
    }

    pub fn config(&self) -> &CheckoutConfig {
        &self.config
    }

    /// Prices a cart and opens a payment session for it.
    ///
    /// Every line is re-resolved through inventory, so the frozen total uses
    /// live prices. Nothing is stored unless the payment session was created.
    #[tracing::instrument(skip(self, shipping, billing), fields(cart_id = %cart_id))]
    pub async fn initiate_checkout(
        &self,
        cart_id: &CartId,
        shipping: Address,
        billing: Address,
        currency: Currency,
    ) -> Result<CheckoutSession> {
        let now = Utc::now();

        // 1. Load and validate the cart
        let cart = self
            .call(self.carts.get(cart_id))
            .await
            .map_err(|e| CheckoutError::adapter("cart.get", cart_id, e))?
            .ok_or_else(|| CheckoutError::CartNotFound(cart_id.clone()))?;

        if cart.is_expired_at(now) {
            return Err(CheckoutError::CartExpired(cart_id.clone()));
        }
        if cart.is_empty() {
            return Err(CheckoutError::EmptyCart(cart_id.clone()));
        }

        // 2. Re-price every line against live inventory
        let requested = requested_quantities(cart.lines())?;
        let mut lines = Vec::with_capacity(cart.lines().len());
        for line in cart.lines() {
            let live = self
                .call(
                    self.inventory
                        .get_price_and_stock(line.product_id, line.variant_id),
                )
                .await
                .map_err(|e| CheckoutError::adapter("inventory.get_price_and_stock", cart_id, e))?
                .ok_or(CheckoutError::ProductUnavailable {
                    product_id: line.product_id,
                    variant_id: line.variant_id,
                })?;

            let wanted = requested
                .get(&(line.product_id, line.variant_id))
                .copied()
                .unwrap_or(line.quantity);
            if wanted > live.stock {
                return Err(CheckoutError::InsufficientStock {
                    product_id: line.product_id,
                    variant_id: line.variant_id,
                    requested: wanted,
                    available: live.stock,
                });
            }
            let priced =
                OrderLine::new(line.product_id, line.variant_id, line.quantity, live.price);
            priced.validate()?;
            lines.push(priced);
        }

        // 3. Freeze the totals
        let totals = compute_totals(&lines, &shipping.country, &self.config.tax_table);
        let checkout_id = CheckoutId::new();
        let country = shipping.country.clone();
        let mut session = CheckoutSession::new(
            checkout_id,
            cart_id.clone(),
            cart.user_id(),
            lines,
            totals,
            currency.clone(),
            shipping,
            billing,
            now,
            self.config.session_ttl,
        );

        // 4. Open the payment session
        let reference = checkout_id.to_string();
        let request = PaymentSessionRequest {
            amount: totals.total,
            currency,
            reference: reference.clone(),
            return_url: self.config.return_url(checkout_id),
            country,
        };
        let payment_session = self
            .call(self.payments.create_session(&request))
            .await
            .map_err(|source| CheckoutError::PaymentGateway {
                cart_id: cart_id.clone(),
                source,
            })?;

        session.await_payment(reference, payment_session, now)?;
        self.call(self.sessions.put(&session, self.live_ttl(&session, now)))
            .await
            .map_err(|e| CheckoutError::adapter("session.put", checkout_id, e))?;

        metrics::counter!("checkout_initiated_total").increment(1);
        tracing::info!(
            checkout_id = %checkout_id,
            total = %totals.total,
            lines = session.lines().len(),
            "checkout initiated"
        );
        Ok(session)
    }

    /// Verifies payment for a session and records its order.
    ///
    /// Replays of a completed checkout return the same order. After the order
    /// exists, stock decrement and the `order.created` publish are logged on
    /// failure and never fail the call.
    #[tracing::instrument(skip(self, proof), fields(checkout_id = %checkout_id))]
    pub async fn complete_checkout(
        &self,
        checkout_id: CheckoutId,
        proof: &PaymentProof,
    ) -> Result<Order> {
        let started = Instant::now();

        // 1. Take the session into Processing
        let session = match self.claim(checkout_id).await? {
            Claim::Replayed(order) => {
                tracing::info!(order_id = %order.order_id, "checkout already completed");
                return Ok(order);
            }
            Claim::Claimed(session) => session,
        };

        // 2. Verify against the frozen amount
        let reference = session.payment_reference().unwrap_or_default().to_string();
        let verification = self
            .call(self.payments.verify(
                proof,
                session.totals().total,
                session.currency(),
                &reference,
            ))
            .await
            .map_err(|e| CheckoutError::adapter("payment.verify", checkout_id, e))?;

        if !verification.succeeded {
            let reason = verification
                .reason
                .unwrap_or_else(|| "payment declined".to_string());
            self.fail_session(session, &reason).await?;
            metrics::counter!("checkout_failed_total").increment(1);
            return Err(CheckoutError::PaymentVerificationFailed {
                checkout_id,
                reason,
            });
        }

        // 3. Record the order; the checkout id is the idempotency key
        let candidate = Order::from_session(&session, verification.payment_id, Utc::now());
        let (order, created) = match self.call(self.ledger.create(&candidate)).await {
            Ok(order) => (order, true),
            Err(AdapterError::DuplicateOrder(existing)) => (*existing, false),
            Err(e) => return Err(CheckoutError::adapter("ledger.create", checkout_id, e)),
        };

        // 4. Side effects, only for the completion that created the order
        if created {
            self.decrement_stock(&order).await;
            self.publish(
                ORDER_CREATED_TOPIC,
                ORDER_CREATED,
                &OrderCreated::from(&order),
            )
            .await;
        } else {
            tracing::info!(
                order_id = %order.order_id,
                "order already recorded by a concurrent completion"
            );
        }

        // 5. Clean up
        self.finish(session, &order).await;

        metrics::counter!("checkout_completed_total").increment(1);
        metrics::histogram!("checkout_duration_seconds").record(started.elapsed().as_secs_f64());
        tracing::info!(
            order_id = %order.order_id,
            total = %order.totals.total,
            "checkout completed"
        );
        Ok(order)
    }

    /// Marks every stale pending or awaiting-payment session as expired.
    ///
    /// Returns how many sessions were expired.
    #[tracing::instrument(skip(self))]
    pub async fn expire_sweep(&self) -> Result<usize> {
        let now = Utc::now();
        let candidates = self
            .call(self.sessions.scan_expirable(now))
            .await
            .map_err(|e| CheckoutError::adapter("session.scan_expirable", "all", e))?;

        let mut expired = 0;
        for session in candidates {
            if !session.status().can_expire() || !session.is_expired_at(now) {
                continue;
            }
            let checkout_id = session.checkout_id();
            match self.expire_session(session, now).await {
                Ok(true) => expired += 1,
                Ok(false) => {
                    tracing::debug!(checkout_id = %checkout_id, "session moved on during sweep");
                }
                Err(e) => {
                    tracing::warn!(
                        checkout_id = %checkout_id,
                        error = %e,
                        "failed to expire session"
                    );
                }
            }
        }

        if expired > 0 {
            metrics::counter!("checkout_expired_total").increment(expired as u64);
            tracing::info!(expired, "expired stale checkout sessions");
        }
        Ok(expired)
    }

    /// Applies an asynchronous payment notification to the matching order.
    ///
    /// Returns `None` for event kinds that carry no status, otherwise the order
    /// as it stands afterwards. Transitions the order's status machine refuses
    /// are logged and leave the order unchanged.
    #[tracing::instrument(skip(self), fields(reference = %reference))]
    pub async fn on_payment_event(
        &self,
        reference: &str,
        kind: &PaymentEventKind,
        succeeded: bool,
    ) -> Result<Option<Order>> {
        let Some(target) = kind.target_status(succeeded) else {
            tracing::debug!(?kind, "ignoring payment event");
            return Ok(None);
        };

        let mut order = self
            .call(self.ledger.find_by_payment_reference(reference))
            .await
            .map_err(|e| CheckoutError::adapter("ledger.find_by_payment_reference", reference, e))?
            .ok_or_else(|| CheckoutError::OrderNotFound(reference.to_string()))?;

        loop {
            let from = order.status;
            if from == target {
                tracing::debug!(status = %from, "order already in requested status");
                return Ok(Some(order));
            }

            let now = Utc::now();
            if let Err(e) = order.transition(target, now) {
                tracing::warn!(order_id = %order.order_id, error = %e, "ignoring payment event");
                return Ok(Some(order));
            }

            let order_id = order.order_id;
            let updated = self
                .call(self.ledger.update_status(order_id, from, target, now))
                .await
                .map_err(|e| CheckoutError::adapter("ledger.update_status", order_id, e))?;
            if !updated {
                // Another delivery moved the order first; decide again from its status.
                tracing::info!(
                    order_id = %order_id,
                    expected = %from,
                    "order status changed concurrently"
                );
                order = self
                    .call(self.ledger.get(order_id))
                    .await
                    .map_err(|e| CheckoutError::adapter("ledger.get", order_id, e))?
                    .ok_or_else(|| CheckoutError::OrderNotFound(reference.to_string()))?;
                continue;
            }

            metrics::counter!("order_status_changes_total", "status" => target.as_str())
                .increment(1);
            tracing::info!(
                order_id = %order_id,
                from = %from,
                to = %target,
                "order status changed"
            );

            let changed = OrderStatusChanged {
                order_id,
                payment_reference: order.payment_reference.clone(),
                from,
                to: target,
                changed_at: now,
            };
            self.publish(ORDER_STATUS_CHANGED_TOPIC, ORDER_STATUS_CHANGED, &changed)
                .await;
            return Ok(Some(order));
        }
    }

    /// Loads a checkout session.
    pub async fn get_session(&self, checkout_id: CheckoutId) -> Result<CheckoutSession> {
        self.call(self.sessions.get(checkout_id))
            .await
            .map_err(|e| CheckoutError::adapter("session.get", checkout_id, e))?
            .ok_or(CheckoutError::SessionNotFound(checkout_id))
    }

    /// Moves the session into `Processing`, or resolves it to its prior terminal result.
    async fn claim(&self, checkout_id: CheckoutId) -> Result<Claim> {
        loop {
            let now = Utc::now();
            let stored = self
                .call(self.sessions.get(checkout_id))
                .await
                .map_err(|e| CheckoutError::adapter("session.get", checkout_id, e))?;

            let Some(mut session) = stored else {
                // Retention ran out; the ledger still knows completed checkouts.
                return match self.find_order(checkout_id).await? {
                    Some(order) => Ok(Claim::Replayed(order)),
                    None => Err(CheckoutError::SessionNotFound(checkout_id)),
                };
            };

            match session.status() {
                CheckoutStatus::Completed => {
                    return self.completed_order(&session).await.map(Claim::Replayed);
                }
                CheckoutStatus::Failed => {
                    return Err(CheckoutError::SessionAlreadyTerminal {
                        checkout_id,
                        status: CheckoutStatus::Failed,
                    });
                }
                CheckoutStatus::Expired => return Err(CheckoutError::SessionExpired(checkout_id)),
                CheckoutStatus::Processing => return Ok(Claim::Claimed(session)),
                status if session.is_expired_at(now) => {
                    tracing::debug!(status = %status, "session expired before completion");
                    if let Err(e) = self.expire_session(session, now).await {
                        tracing::warn!(error = %e, "failed to mark session expired");
                    }
                    return Err(CheckoutError::SessionExpired(checkout_id));
                }
                expected => {
                    session.begin_processing(now)?;
                    let ttl = self.live_ttl(&session, now);
                    let won = self
                        .call(self.sessions.replace(&session, expected, ttl))
                        .await
                        .map_err(|e| CheckoutError::adapter("session.replace", checkout_id, e))?;
                    if won {
                        return Ok(Claim::Claimed(session));
                    }
                    tracing::debug!("session changed concurrently, reloading");
                }
            }
        }
    }

    async fn completed_order(&self, session: &CheckoutSession) -> Result<Order> {
        let checkout_id = session.checkout_id();
        if let Some(order_id) = session.order_id() {
            let order = self
                .call(self.ledger.get(order_id))
                .await
                .map_err(|e| CheckoutError::adapter("ledger.get", order_id, e))?;
            if let Some(order) = order {
                return Ok(order);
            }
        }
        self.find_order(checkout_id)
            .await?
            .ok_or(CheckoutError::SessionNotFound(checkout_id))
    }

    async fn find_order(&self, checkout_id: CheckoutId) -> Result<Option<Order>> {
        self.call(self.ledger.find_by_checkout(checkout_id))
            .await
            .map_err(|e| CheckoutError::adapter("ledger.find_by_checkout", checkout_id, e))
    }

    /// Writes the expired session back if nobody changed it meanwhile.
    async fn expire_session(
        &self,
        mut session: CheckoutSession,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let checkout_id = session.checkout_id();
        let previous = session.status();
        session.expire(now)?;
        self.call(
            self.sessions
                .replace(&session, previous, self.config.session_retention),
        )
        .await
        .map_err(|e| CheckoutError::adapter("session.replace", checkout_id, e))
    }

    async fn fail_session(&self, mut session: CheckoutSession, reason: &str) -> Result<()> {
        let checkout_id = session.checkout_id();
        session.fail(reason, Utc::now())?;
        tracing::info!(reason, "payment verification failed");

        match self
            .call(self.sessions.replace(
                &session,
                CheckoutStatus::Processing,
                self.config.session_retention,
            ))
            .await
        {
            Ok(true) => {}
            Ok(false) => tracing::warn!("session changed while failing it"),
            Err(e) => {
                tracing::warn!(
                    checkout_id = %checkout_id,
                    error = %e,
                    "failed to store failed session"
                );
            }
        }
        Ok(())
    }

    async fn decrement_stock(&self, order: &Order) {
        for line in &order.lines {
            if let Err(e) = self
                .call(
                    self.inventory
                        .decrement(line.product_id, line.variant_id, line.quantity),
                )
                .await
            {
                tracing::warn!(
                    order_id = %order.order_id,
                    product_id = %line.product_id,
                    quantity = line.quantity,
                    error = %e,
                    "inventory decrement failed"
                );
            }
        }
    }

    async fn publish<T: serde::Serialize>(&self, topic: &str, message_type: &str, payload: &T) {
        let message = match Message::encode(message_type, payload) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(message_type, error = %e, "failed to encode event");
                return;
            }
        };
        if let Err(e) = self
            .bus
            .publish(topic, message, self.config.publish_timeout)
            .await
        {
            tracing::warn!(topic, message_type, error = %e, "event publish failed");
        }
    }

    /// Drops the cart and keeps a completed session record for replays.
    async fn finish(&self, mut session: CheckoutSession, order: &Order) {
        let cart_id = session.cart_id().clone();
        if let Err(e) = self.call(self.carts.delete(&cart_id)).await {
            tracing::warn!(cart_id = %cart_id, error = %e, "failed to delete cart");
        }

        if let Err(e) = session.complete(order.order_id, Utc::now()) {
            tracing::warn!(error = %e, "failed to mark session completed");
            return;
        }
        if let Err(e) = self
            .call(self.sessions.put(&session, self.config.session_retention))
            .await
        {
            tracing::warn!(error = %e, "failed to store completed session");
        }
    }

    /// Store TTL for a live session: until expiry plus the retention window.
    fn live_ttl(&self, session: &CheckoutSession, now: DateTime<Utc>) -> chrono::Duration {
        (session.expires_at() - now) + self.config.session_retention
    }

    async fn call<T, F>(&self, fut: F) -> std::result::Result<T, AdapterError>
    where
        F: Future<Output = std::result::Result<T, AdapterError>>,
    {
        let deadline = self.config.call_timeout;
        match tokio::time::timeout(deadline, fut).await {
            Ok(result) => result,
            Err(_) => Err(AdapterError::Timeout(deadline)),
        }
    }
}

/// Total quantity asked for per product/variant across all cart lines.
///
/// A stored cart is not re-validated on load, so empty lines are refused here.
fn requested_quantities(lines: &[CartLine]) -> Result<HashMap<ItemKey, u32>> {
    let mut requested = HashMap::with_capacity(lines.len());
    for line in lines {
        if line.quantity == 0 {
            return Err(DomainError::InvalidQuantity {
                product_id: line.product_id,
                quantity: line.quantity,
            }
            .into());
        }
        let total: &mut u32 = requested
            .entry((line.product_id, line.variant_id))
            .or_default();
        *total = total
            .checked_add(line.quantity)
            .ok_or(DomainError::QuantityOverflow {
                product_id: line.product_id,
            })?;
    }
    Ok(requested)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use common::{Money, OrderId};
    use domain::{Cart, OrderStatus};
    use messaging::{BusError, MessageHandler};

    use super::*;
    use crate::services::{
        InMemoryCartStore, InMemoryInventoryService, InMemoryOrderLedger, InMemoryPaymentGateway,
        InMemorySessionStore,
    };

    #[derive(Clone, Default)]
    struct RecordingBus {
        published: Arc<Mutex<Vec<(String, Message)>>>,
        down: Arc<AtomicBool>,
    }

    impl RecordingBus {
        fn published(&self, topic: &str) -> Vec<Message> {
            self.published
                .lock()
                .unwrap()
                .iter()
                .filter(|(t, _)| t == topic)
                .map(|(_, m)| m.clone())
                .collect()
        }
    }

    #[async_trait]
    impl MessageBus for RecordingBus {
        async fn publish(
            &self,
            topic: &str,
            message: Message,
            _deadline: Duration,
        ) -> messaging::Result<()> {
            if self.down.load(Ordering::SeqCst) {
                return Err(BusError::NotConnected);
            }
            self.published
                .lock()
                .unwrap()
                .push((topic.to_string(), message));
            Ok(())
        }

        async fn subscribe(
            &self,
            _topic: &str,
            _handler: Arc<dyn MessageHandler>,
        ) -> messaging::Result<()> {
            Ok(())
        }

        async fn close(&self) {}
    }

    /// Ledger where a cancellation lands just before the first status update.
    struct CancelFirstLedger {
        inner: InMemoryOrderLedger,
        cancelled: Arc<AtomicBool>,
    }

    #[async_trait]
    impl OrderLedger for CancelFirstLedger {
        async fn create(&self, order: &Order) -> std::result::Result<Order, AdapterError> {
            self.inner.create(order).await
        }

        async fn get(&self, order_id: OrderId) -> std::result::Result<Option<Order>, AdapterError> {
            self.inner.get(order_id).await
        }

        async fn find_by_checkout(
            &self,
            checkout_id: CheckoutId,
        ) -> std::result::Result<Option<Order>, AdapterError> {
            self.inner.find_by_checkout(checkout_id).await
        }

        async fn find_by_payment_reference(
            &self,
            reference: &str,
        ) -> std::result::Result<Option<Order>, AdapterError> {
            self.inner.find_by_payment_reference(reference).await
        }

        async fn update_status(
            &self,
            order_id: OrderId,
            from: OrderStatus,
            to: OrderStatus,
            updated_at: DateTime<Utc>,
        ) -> std::result::Result<bool, AdapterError> {
            if !self.cancelled.swap(true, Ordering::SeqCst) {
                self.inner
                    .update_status(
                        order_id,
                        OrderStatus::Pending,
                        OrderStatus::Cancelled,
                        updated_at,
                    )
                    .await?;
            }
            self.inner
                .update_status(order_id, from, to, updated_at)
                .await
        }
    }

    type TestOrchestrator = CheckoutOrchestrator<
        InMemoryCartStore,
        InMemorySessionStore,
        InMemoryPaymentGateway,
        InMemoryInventoryService,
        InMemoryOrderLedger,
        RecordingBus,
    >;

    struct Fixture {
        carts: InMemoryCartStore,
        sessions: InMemorySessionStore,
        payments: InMemoryPaymentGateway,
        inventory: InMemoryInventoryService,
        ledger: InMemoryOrderLedger,
        bus: RecordingBus,
        orchestrator: TestOrchestrator,
    }

    fn fixture(config: CheckoutConfig) -> Fixture {
        let carts = InMemoryCartStore::new();
        let sessions = InMemorySessionStore::new();
        let payments = InMemoryPaymentGateway::new();
        let inventory = InMemoryInventoryService::new();
        let ledger = InMemoryOrderLedger::new();
        let bus = RecordingBus::default();
        let orchestrator = CheckoutOrchestrator::new(
            carts.clone(),
            sessions.clone(),
            payments.clone(),
            inventory.clone(),
            ledger.clone(),
            bus.clone(),
            config,
        );
        Fixture {
            carts,
            sessions,
            payments,
            inventory,
            ledger,
            bus,
            orchestrator,
        }
    }

    fn address() -> Address {
        Address::new("Ada Lovelace", "1 Main St", "Springfield", "12345", "US")
    }

    fn widget(quantity: u32) -> CartLine {
        CartLine::new(
            ProductId::new(42),
            None,
            quantity,
            Money::from_cents(1000),
            "Widget",
            "WID-42",
        )
    }

    async fn stocked_cart(f: &Fixture, cart_id: &str) -> CartId {
        f.inventory
            .set_item(ProductId::new(42), None, Money::from_cents(1000), 10);
        let mut cart = Cart::new(cart_id, None, chrono::Duration::hours(1));
        cart.add_line(widget(2)).unwrap();
        f.carts.save(&cart).await.unwrap();
        cart.id().clone()
    }

    /// Stores a cart with `lines` as given, skipping `Cart::add_line` checks.
    async fn stored_cart(f: &Fixture, cart_id: &str, lines: Vec<CartLine>) -> CartId {
        f.inventory
            .set_item(ProductId::new(42), None, Money::from_cents(1000), 10);
        let cart = Cart::new(cart_id, None, chrono::Duration::hours(1));
        let mut value = serde_json::to_value(&cart).unwrap();
        value["lines"] = serde_json::to_value(lines).unwrap();
        let cart: Cart = serde_json::from_value(value).unwrap();
        f.carts.save(&cart).await.unwrap();
        cart.id().clone()
    }

    async fn initiate(f: &Fixture, cart_id: &CartId) -> CheckoutSession {
        f.orchestrator
            .initiate_checkout(cart_id, address(), address(), Currency::usd())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_initiate_freezes_live_prices() {
        let f = fixture(CheckoutConfig::default());
        let cart_id = stocked_cart(&f, "c1").await;
        f.inventory
            .set_price(ProductId::new(42), None, Money::from_cents(1250));

        let session = initiate(&f, &cart_id).await;

        assert_eq!(session.status(), CheckoutStatus::AwaitingPayment);
        assert_eq!(session.totals().total.cents(), 2500);
        assert_eq!(
            session.payment_reference(),
            Some(session.checkout_id().to_string().as_str())
        );
        assert_eq!(f.payments.session_count(), 1);
        assert_eq!(f.sessions.session_count(), 1);
    }

    #[tokio::test]
    async fn test_initiate_applies_tax_for_shipping_country() {
        let f = fixture(CheckoutConfig::default().with_tax_table(domain::TaxTable::standard()));
        let cart_id = stocked_cart(&f, "c1").await;

        let session = initiate(&f, &cart_id).await;

        assert_eq!(session.totals().subtotal.cents(), 2000);
        assert_eq!(session.totals().tax.cents(), 165);
        assert_eq!(session.totals().total.cents(), 2165);
    }

    #[tokio::test]
    async fn test_initiate_unknown_cart() {
        let f = fixture(CheckoutConfig::default());
        let result = f
            .orchestrator
            .initiate_checkout(&CartId::new("nope"), address(), address(), Currency::usd())
            .await;
        assert!(matches!(result, Err(CheckoutError::CartNotFound(_))));
    }

    #[tokio::test]
    async fn test_initiate_empty_cart() {
        let f = fixture(CheckoutConfig::default());
        let cart = Cart::new("empty", None, chrono::Duration::hours(1));
        f.carts.save(&cart).await.unwrap();

        let result = f
            .orchestrator
            .initiate_checkout(cart.id(), address(), address(), Currency::usd())
            .await;
        let err = result.unwrap_err();
        assert!(matches!(err, CheckoutError::EmptyCart(_)));
        assert_eq!(err.kind(), crate::ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_initiate_product_gone() {
        let f = fixture(CheckoutConfig::default());
        let cart_id = stocked_cart(&f, "c1").await;
        f.inventory.remove_item(ProductId::new(42), None);

        let result = f
            .orchestrator
            .initiate_checkout(&cart_id, address(), address(), Currency::usd())
            .await;
        assert!(matches!(result, Err(CheckoutError::ProductUnavailable { .. })));
        assert_eq!(f.payments.session_count(), 0);
    }

    #[tokio::test]
    async fn test_initiate_rejects_zero_quantity_line() {
        let f = fixture(CheckoutConfig::default());
        let cart_id = stored_cart(&f, "c1", vec![widget(0)]).await;

        let err = f
            .orchestrator
            .initiate_checkout(&cart_id, address(), address(), Currency::usd())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CheckoutError::Domain(DomainError::InvalidQuantity { quantity: 0, .. })
        ));
        assert_eq!(err.kind(), crate::ErrorKind::Validation);
        assert_eq!(f.payments.session_count(), 0);
    }

    #[tokio::test]
    async fn test_initiate_rejects_negative_live_price() {
        let f = fixture(CheckoutConfig::default());
        let cart_id = stocked_cart(&f, "c1").await;
        f.inventory
            .set_price(ProductId::new(42), None, Money::from_cents(-1));

        let err = f
            .orchestrator
            .initiate_checkout(&cart_id, address(), address(), Currency::usd())
            .await
            .unwrap_err();
        assert!(matches!(err, CheckoutError::Domain(DomainError::InvalidPrice { .. })));
        assert_eq!(err.kind(), crate::ErrorKind::Validation);
        assert_eq!(f.payments.session_count(), 0);
        assert_eq!(f.sessions.session_count(), 0);
    }

    #[tokio::test]
    async fn test_initiate_sums_repeated_lines_before_stock_check() {
        let f = fixture(CheckoutConfig::default());
        let cart_id = stored_cart(&f, "c1", vec![widget(6), widget(6)]).await;

        let err = f
            .orchestrator
            .initiate_checkout(&cart_id, address(), address(), Currency::usd())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CheckoutError::InsufficientStock {
                requested: 12,
                available: 10,
                ..
            }
        ));
        assert_eq!(f.payments.session_count(), 0);
    }

    #[tokio::test]
    async fn test_initiate_gateway_failure_stores_nothing() {
        let f = fixture(CheckoutConfig::default());
        let cart_id = stocked_cart(&f, "c1").await;
        f.payments.set_fail_on_create(true);

        let err = f
            .orchestrator
            .initiate_checkout(&cart_id, address(), address(), Currency::usd())
            .await
            .unwrap_err();
        assert!(matches!(err, CheckoutError::PaymentGateway { .. }));
        assert!(err.is_retryable());
        assert_eq!(f.sessions.session_count(), 0);
    }

    #[tokio::test]
    async fn test_complete_records_order_and_side_effects() {
        let f = fixture(CheckoutConfig::default());
        let cart_id = stocked_cart(&f, "c1").await;
        let session = initiate(&f, &cart_id).await;

        let order = f
            .orchestrator
            .complete_checkout(session.checkout_id(), &PaymentProof::new("ok"))
            .await
            .unwrap();

        assert_eq!(order.checkout_id, session.checkout_id());
        assert_eq!(order.status, OrderStatus::Pending);
        assert_eq!(order.totals.total.cents(), 2000);
        assert_eq!(f.inventory.stock_of(ProductId::new(42), None), Some(8));
        assert_eq!(f.bus.published(ORDER_CREATED_TOPIC).len(), 1);
        assert!(!f.carts.contains(&cart_id));

        let stored = f
            .orchestrator
            .get_session(session.checkout_id())
            .await
            .unwrap();
        assert_eq!(stored.status(), CheckoutStatus::Completed);
        assert_eq!(stored.order_id(), Some(order.order_id));
    }

    #[tokio::test]
    async fn test_complete_twice_returns_same_order() {
        let f = fixture(CheckoutConfig::default());
        let cart_id = stocked_cart(&f, "c1").await;
        let session = initiate(&f, &cart_id).await;
        let proof = PaymentProof::new("ok");

        let first = f
            .orchestrator
            .complete_checkout(session.checkout_id(), &proof)
            .await
            .unwrap();
        let second = f
            .orchestrator
            .complete_checkout(session.checkout_id(), &proof)
            .await
            .unwrap();

        assert_eq!(first.order_id, second.order_id);
        assert_eq!(f.ledger.order_count(), 1);
        assert_eq!(f.payments.verify_count(), 1);
        assert_eq!(f.bus.published(ORDER_CREATED_TOPIC).len(), 1);
    }

    #[tokio::test]
    async fn test_complete_survives_publish_and_decrement_failures() {
        let f = fixture(CheckoutConfig::default());
        let cart_id = stocked_cart(&f, "c1").await;
        let session = initiate(&f, &cart_id).await;
        f.bus.down.store(true, Ordering::SeqCst);
        f.inventory.set_fail_on_decrement(true);

        let order = f
            .orchestrator
            .complete_checkout(session.checkout_id(), &PaymentProof::new("ok"))
            .await
            .unwrap();

        assert_eq!(f.ledger.order_count(), 1);
        assert_eq!(order.checkout_id, session.checkout_id());
        assert!(f.bus.published(ORDER_CREATED_TOPIC).is_empty());
    }

    #[tokio::test]
    async fn test_declined_payment_fails_session() {
        let f = fixture(CheckoutConfig::default());
        let cart_id = stocked_cart(&f, "c1").await;
        let session = initiate(&f, &cart_id).await;
        f.payments.decline("bad-card");

        let err = f
            .orchestrator
            .complete_checkout(session.checkout_id(), &PaymentProof::new("bad-card"))
            .await
            .unwrap_err();
        assert!(matches!(err, CheckoutError::PaymentVerificationFailed { .. }));

        let stored = f
            .orchestrator
            .get_session(session.checkout_id())
            .await
            .unwrap();
        assert_eq!(stored.status(), CheckoutStatus::Failed);
        assert_eq!(f.ledger.create_calls(), 0);
        assert!(f.carts.contains(&cart_id));

        let replay = f
            .orchestrator
            .complete_checkout(session.checkout_id(), &PaymentProof::new("ok"))
            .await
            .unwrap_err();
        assert!(matches!(
            replay,
            CheckoutError::SessionAlreadyTerminal {
                status: CheckoutStatus::Failed,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_verify_transport_error_leaves_session_processing() {
        let f = fixture(CheckoutConfig::default());
        let cart_id = stocked_cart(&f, "c1").await;
        let session = initiate(&f, &cart_id).await;
        f.payments.set_fail_on_verify(true);

        let err = f
            .orchestrator
            .complete_checkout(session.checkout_id(), &PaymentProof::new("ok"))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        let stored = f
            .orchestrator
            .get_session(session.checkout_id())
            .await
            .unwrap();
        assert_eq!(stored.status(), CheckoutStatus::Processing);

        f.payments.set_fail_on_verify(false);
        let order = f
            .orchestrator
            .complete_checkout(session.checkout_id(), &PaymentProof::new("ok"))
            .await
            .unwrap();
        assert_eq!(order.checkout_id, session.checkout_id());
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let f = fixture(CheckoutConfig::default());
        let result = f
            .orchestrator
            .complete_checkout(CheckoutId::new(), &PaymentProof::new("ok"))
            .await;
        assert!(matches!(result, Err(CheckoutError::SessionNotFound(_))));
    }

    #[tokio::test]
    async fn test_payment_event_ignores_unknown_kind() {
        let f = fixture(CheckoutConfig::default());
        let result = f
            .orchestrator
            .on_payment_event("ref", &PaymentEventKind::parse("CHARGEBACK"), true)
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_payment_event_unknown_reference() {
        let f = fixture(CheckoutConfig::default());
        let result = f
            .orchestrator
            .on_payment_event("missing", &PaymentEventKind::Authorisation, true)
            .await;
        assert!(matches!(result, Err(CheckoutError::OrderNotFound(_))));
    }

    #[tokio::test]
    async fn test_payment_event_refused_transition_leaves_order() {
        let f = fixture(CheckoutConfig::default());
        let cart_id = stocked_cart(&f, "c1").await;
        let session = initiate(&f, &cart_id).await;
        let order = f
            .orchestrator
            .complete_checkout(session.checkout_id(), &PaymentProof::new("ok"))
            .await
            .unwrap();

        let refunded = f
            .orchestrator
            .on_payment_event(&order.payment_reference, &PaymentEventKind::Refund, true)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(refunded.status, OrderStatus::Pending);
        assert!(f.bus.published(ORDER_STATUS_CHANGED_TOPIC).is_empty());
    }

    #[tokio::test]
    async fn test_payment_event_decides_again_after_concurrent_change() {
        let f = fixture(CheckoutConfig::default());
        let cart_id = stocked_cart(&f, "c1").await;
        let session = initiate(&f, &cart_id).await;
        let order = f
            .orchestrator
            .complete_checkout(session.checkout_id(), &PaymentProof::new("ok"))
            .await
            .unwrap();

        let ledger = CancelFirstLedger {
            inner: f.ledger.clone(),
            cancelled: Arc::default(),
        };
        let orchestrator = CheckoutOrchestrator::new(
            f.carts.clone(),
            f.sessions.clone(),
            f.payments.clone(),
            f.inventory.clone(),
            ledger,
            f.bus.clone(),
            CheckoutConfig::default(),
        );

        let after = orchestrator
            .on_payment_event(
                &order.payment_reference,
                &PaymentEventKind::Authorisation,
                true,
            )
            .await
            .unwrap()
            .unwrap();

        assert_eq!(after.status, OrderStatus::Cancelled);
        let stored = f.ledger.get(order.order_id).await.unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::Cancelled);
        assert!(f.bus.published(ORDER_STATUS_CHANGED_TOPIC).is_empty());
    }

    #[tokio::test]
    async fn test_call_timeout_is_transient() {
        let config = CheckoutConfig {
            call_timeout: Duration::from_millis(1),
            ..CheckoutConfig::default()
        };
        let f = fixture(config);
        let slow = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok::<_, AdapterError>(())
        };
        let result = f.orchestrator.call(slow).await;
        assert!(matches!(result, Err(AdapterError::Timeout(_))));
    }
}
