//! Cart store trait and in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use common::CartId;
use domain::Cart;

use crate::error::AdapterError;

/// Trait for cart persistence.
#[async_trait]
pub trait CartStore: Send + Sync {
    /// Loads a cart, or `None` if it does not exist.
    async fn get(&self, cart_id: &CartId) -> Result<Option<Cart>, AdapterError>;

    /// Stores a cart, replacing any previous version.
    async fn save(&self, cart: &Cart) -> Result<(), AdapterError>;

    /// Deletes a cart. Deleting a missing cart is not an error.
    async fn delete(&self, cart_id: &CartId) -> Result<(), AdapterError>;
}

#[derive(Debug, Default)]
struct InMemoryCartState {
    carts: HashMap<CartId, Cart>,
    unavailable: bool,
}

/// In-memory cart store for testing.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCartStore {
    state: Arc<RwLock<InMemoryCartState>>,
}

impl InMemoryCartStore {
    /// Creates a new in-memory cart store.
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

    /// Returns true if a cart with the given ID is stored.
    pub fn contains(&self, cart_id: &CartId) -> bool {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .carts
            .contains_key(cart_id)
    }

    fn check(&self) -> Result<(), AdapterError> {
        if self
            .state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .unavailable
        {
            return Err(AdapterError::Unavailable("cart store".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl CartStore for InMemoryCartStore {
    async fn get(&self, cart_id: &CartId) -> Result<Option<Cart>, AdapterError> {
        self.check()?;
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        Ok(state.carts.get(cart_id).cloned())
    }

    async fn save(&self, cart: &Cart) -> Result<(), AdapterError> {
        self.check()?;
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.carts.insert(cart.id().clone(), cart.clone());
        Ok(())
    }

    async fn delete(&self, cart_id: &CartId) -> Result<(), AdapterError> {
        self.check()?;
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.carts.remove(cart_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    #[tokio::test]
    async fn test_save_get_delete() {
        let store = InMemoryCartStore::new();
        let cart = Cart::new("c1", None, Duration::hours(1));

        store.save(&cart).await.unwrap();
        assert!(store.get(cart.id()).await.unwrap().is_some());

        store.delete(cart.id()).await.unwrap();
        assert!(store.get(cart.id()).await.unwrap().is_none());
        store.delete(cart.id()).await.unwrap();
    }

    #[tokio::test]
    async fn test_unavailable() {
        let store = InMemoryCartStore::new();
        store.set_unavailable(true);
        let result = store.get(&CartId::new("c1")).await;
        assert!(matches!(result, Err(AdapterError::Unavailable(_))));
    }
}
