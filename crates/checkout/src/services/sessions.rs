//! Checkout session store trait and in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use common::CheckoutId;
use domain::{CheckoutSession, CheckoutStatus};

use crate::error::AdapterError;

/// Trait for short-lived checkout session storage with per-record TTL.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Loads a session, or `None` if absent or evicted.
    async fn get(&self, checkout_id: CheckoutId) -> Result<Option<CheckoutSession>, AdapterError>;

    /// Stores a session unconditionally, evicting it after `ttl`.
    async fn put(&self, session: &CheckoutSession, ttl: Duration) -> Result<(), AdapterError>;

    /// Stores `session` only if the stored copy is still in `expected` status.
    /// Returns false when another writer got there first.
    async fn replace(
        &self,
        session: &CheckoutSession,
        expected: CheckoutStatus,
        ttl: Duration,
    ) -> Result<bool, AdapterError>;

    /// Sessions past `expires_at` that are still pending or awaiting payment.
    async fn scan_expirable(&self, now: DateTime<Utc>)
    -> Result<Vec<CheckoutSession>, AdapterError>;
}

#[derive(Debug, Default)]
struct InMemorySessionState {
    sessions: HashMap<CheckoutId, (CheckoutSession, DateTime<Utc>)>,
    unavailable: bool,
}

impl InMemorySessionState {
    fn live(&self, checkout_id: CheckoutId, now: DateTime<Utc>) -> Option<&CheckoutSession> {
        self.sessions
            .get(&checkout_id)
            .filter(|(_, evict_at)| now < *evict_at)
            .map(|(session, _)| session)
    }
}

/// In-memory session store for testing.
#[derive(Debug, Clone, Default)]
pub struct InMemorySessionStore {
    state: Arc<RwLock<InMemorySessionState>>,
}

impl InMemorySessionStore {
    /// Creates a new in-memory session store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every call fail as if the store were unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .unavailable = unavailable;
    }

    /// Number of stored (not yet evicted) sessions.
    pub fn session_count(&self) -> usize {
        let now = Utc::now();
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .sessions
            .values()
            .filter(|(_, evict_at)| now < *evict_at)
            .count()
    }

    fn check(&self) -> Result<(), AdapterError> {
        if self
            .state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .unavailable
        {
            return Err(AdapterError::Unavailable("session store".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn get(&self, checkout_id: CheckoutId) -> Result<Option<CheckoutSession>, AdapterError> {
        self.check()?;
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        Ok(state.live(checkout_id, Utc::now()).cloned())
    }

    async fn put(&self, session: &CheckoutSession, ttl: Duration) -> Result<(), AdapterError> {
        self.check()?;
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state
            .sessions
            .insert(session.checkout_id(), (session.clone(), Utc::now() + ttl));
        Ok(())
    }

    async fn replace(
        &self,
        session: &CheckoutSession,
        expected: CheckoutStatus,
        ttl: Duration,
    ) -> Result<bool, AdapterError> {
        self.check()?;
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let current = state
            .live(session.checkout_id(), Utc::now())
            .map(|s| s.status());
        if current != Some(expected) {
            return Ok(false);
        }
        state
            .sessions
            .insert(session.checkout_id(), (session.clone(), Utc::now() + ttl));
        Ok(true)
    }

    async fn scan_expirable(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<CheckoutSession>, AdapterError> {
        self.check()?;
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        // Evicted records are dropped while we are here.
        let wall = Utc::now();
        state.sessions.retain(|_, (_, evict_at)| wall < *evict_at);
        Ok(state
            .sessions
            .values()
            .map(|(session, _)| session)
            .filter(|s| s.status().can_expire() && s.is_expired_at(now))
            .cloned()
            .collect())
    }
}
