//! Periodic expiry of abandoned checkout sessions.

use std::sync::Arc;
use std::time::Duration;

use checkout::CheckoutOrchestrator;
use checkout::services::{CartStore, InventoryService, OrderLedger, PaymentGateway, SessionStore};
use messaging::MessageBus;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Runs `expire_sweep` every `interval` until shut down.
pub struct ExpireSweeper<C, S, P, I, L, M>
where
    C: CartStore,
    S: SessionStore,
    P: PaymentGateway,
    I: InventoryService,
    L: OrderLedger,
    M: MessageBus,
{
    orchestrator: Arc<CheckoutOrchestrator<C, S, P, I, L, M>>,
    interval: Duration,
    shutdown: CancellationToken,
}

impl<C, S, P, I, L, M> ExpireSweeper<C, S, P, I, L, M>
where
    C: CartStore,
    S: SessionStore,
    P: PaymentGateway,
    I: InventoryService,
    L: OrderLedger,
    M: MessageBus,
{
    pub fn new(
        orchestrator: Arc<CheckoutOrchestrator<C, S, P, I, L, M>>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            orchestrator,
            interval,
            shutdown,
        }
    }

    /// Main loop. The first sweep runs immediately.
    pub async fn run(self) {
        tracing::info!(interval = ?self.interval, "expire sweeper started");

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self.orchestrator.expire_sweep().await {
                Ok(expired) => tracing::debug!(expired, "expire sweep finished"),
                Err(e) => tracing::warn!(error = %e, "expire sweep failed"),
            }
        }

        tracing::info!("expire sweeper stopped");
    }
}
