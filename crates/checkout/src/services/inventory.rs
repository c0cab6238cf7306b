//! Inventory service trait and in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use common::{Money, ProductId, VariantId};

use crate::error::AdapterError;

/// Live price and stock for a product or variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriceAndStock {
    pub price: Money,
    pub stock: u32,
}

/// Trait for the inventory system (the ERP's view of products).
#[async_trait]
pub trait InventoryService: Send + Sync {
    /// Resolves the current price and stock, or `None` if the item no longer exists.
    async fn get_price_and_stock(
        &self,
        product_id: ProductId,
        variant_id: Option<VariantId>,
    ) -> Result<Option<PriceAndStock>, AdapterError>;

    /// Removes `quantity` units from stock.
    async fn decrement(
        &self,
        product_id: ProductId,
        variant_id: Option<VariantId>,
        quantity: u32,
    ) -> Result<(), AdapterError>;
}

type ItemKey = (ProductId, Option<VariantId>);

#[derive(Debug, Default)]
struct InMemoryInventoryState {
    items: HashMap<ItemKey, PriceAndStock>,
    decrements: usize,
    unavailable: bool,
    fail_on_decrement: bool,
}

/// In-memory inventory service for testing.
#[derive(Debug, Clone, Default)]
pub struct InMemoryInventoryService {
    state: Arc<RwLock<InMemoryInventoryState>>,
}

impl InMemoryInventoryService {
    /// Creates a new in-memory inventory service.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces an item.
    pub fn set_item(
        &self,
        product_id: ProductId,
        variant_id: Option<VariantId>,
        price: Money,
        stock: u32,
    ) {
        self.write()
            .items
            .insert((product_id, variant_id), PriceAndStock { price, stock });
    }

    /// Changes the price of an existing item.
    pub fn set_price(&self, product_id: ProductId, variant_id: Option<VariantId>, price: Money) {
        if let Some(item) = self.write().items.get_mut(&(product_id, variant_id)) {
            item.price = price;
        }
    }

    /// Removes an item so it no longer resolves.
    pub fn remove_item(&self, product_id: ProductId, variant_id: Option<VariantId>) {
        self.write().items.remove(&(product_id, variant_id));
    }

    /// Returns the current stock for an item.
    pub fn stock_of(&self, product_id: ProductId, variant_id: Option<VariantId>) -> Option<u32> {
        self.read()
            .items
            .get(&(product_id, variant_id))
            .map(|i| i.stock)
    }

    /// Returns the number of successful decrements.
    pub fn decrement_count(&self) -> usize {
        self.read().decrements
    }

    /// Makes every call fail as if the ERP were unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.write().unavailable = unavailable;
    }

    /// Configures decrements to fail.
    pub fn set_fail_on_decrement(&self, fail: bool) {
        self.write().fail_on_decrement = fail;
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, InMemoryInventoryState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, InMemoryInventoryState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl InventoryService for InMemoryInventoryService {
    async fn get_price_and_stock(
        &self,
        product_id: ProductId,
        variant_id: Option<VariantId>,
    ) -> Result<Option<PriceAndStock>, AdapterError> {
        let state = self.read();
        if state.unavailable {
            return Err(AdapterError::Unavailable("inventory".to_string()));
        }
        Ok(state.items.get(&(product_id, variant_id)).copied())
    }

    async fn decrement(
        &self,
        product_id: ProductId,
        variant_id: Option<VariantId>,
        quantity: u32,
    ) -> Result<(), AdapterError> {
        let mut state = self.write();
        if state.unavailable || state.fail_on_decrement {
            return Err(AdapterError::Unavailable("inventory".to_string()));
        }
        let item = state
            .items
            .get_mut(&(product_id, variant_id))
            .ok_or_else(|| AdapterError::NotFound(format!("product {product_id}")))?;
        if item.stock < quantity {
            return Err(AdapterError::Rejected(format!(
                "insufficient stock for product {product_id}: have {}, need {quantity}",
                item.stock
            )));
        }
        item.stock -= quantity;
        state.decrements += 1;
        Ok(())
    }
}
