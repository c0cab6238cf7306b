//! Shopping cart model.

use chrono::{DateTime, Duration, Utc};
use common::{CartId, Money, ProductId, UserId, VariantId};
use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::order::validate_line;

/// One product/variant line in a cart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartLine {
    pub product_id: ProductId,
    pub variant_id: Option<VariantId>,
    pub quantity: u32,
    /// Price captured when the line was added. Display only; checkout re-prices.
    pub unit_price: Money,
    pub display_name: String,
    pub sku: String,
}

impl CartLine {
    /// Creates a new cart line.
    pub fn new(
        product_id: ProductId,
        variant_id: Option<VariantId>,
        quantity: u32,
        unit_price: Money,
        display_name: impl Into<String>,
        sku: impl Into<String>,
    ) -> Self {
        Self {
            product_id,
            variant_id,
            quantity,
            unit_price,
            display_name: display_name.into(),
            sku: sku.into(),
        }
    }

    /// Returns `unit_price * quantity`.
    pub fn line_total(&self) -> Money {
        self.unit_price.multiply(self.quantity)
    }

    /// Rejects an empty, negatively priced or overflowing line.
    pub fn validate(&self) -> Result<(), DomainError> {
        validate_line(self.product_id, self.quantity, self.unit_price)
    }

    fn same_item(&self, product_id: ProductId, variant_id: Option<VariantId>) -> bool {
        self.product_id == product_id && self.variant_id == variant_id
    }
}

/// A shopper's cart.
///
/// `subtotal` and `total` are recomputed on every mutation, so a stored cart
/// never carries stale totals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cart {
    id: CartId,
    user_id: Option<UserId>,
    lines: Vec<CartLine>,
    subtotal: Money,
    total: Money,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl Cart {
    /// Creates an empty cart that expires `ttl` from now.
    pub fn new(id: impl Into<CartId>, user_id: Option<UserId>, ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            user_id,
            lines: Vec::new(),
            subtotal: Money::zero(),
            total: Money::zero(),
            created_at: now,
            updated_at: now,
            expires_at: now + ttl,
        }
    }

    /// Adds a line, merging quantities when the product/variant is already present.
    pub fn add_line(&mut self, line: CartLine) -> Result<(), DomainError> {
        line.validate()?;

        match self
            .lines
            .iter_mut()
            .find(|l| l.same_item(line.product_id, line.variant_id))
        {
            Some(existing) => {
                let quantity = existing
                    .quantity
                    .checked_add(line.quantity)
                    .ok_or(DomainError::QuantityOverflow {
                        product_id: line.product_id,
                    })?;
                validate_line(existing.product_id, quantity, existing.unit_price)?;
                existing.quantity = quantity;
            }
            None => self.lines.push(line),
        }
        self.recalculate();
        Ok(())
    }

    /// Sets the quantity of a line. A quantity of zero removes the line.
    pub fn update_quantity(
        &mut self,
        product_id: ProductId,
        variant_id: Option<VariantId>,
        quantity: u32,
    ) -> Result<(), DomainError> {
        let position = self
            .lines
            .iter()
            .position(|l| l.same_item(product_id, variant_id))
            .ok_or(DomainError::LineNotFound { product_id })?;

        if quantity == 0 {
            self.lines.remove(position);
        } else if let Some(line) = self.lines.get_mut(position) {
            line.quantity = quantity;
        }
        self.recalculate();
        Ok(())
    }

    fn recalculate(&mut self) {
        self.subtotal = self.lines.iter().map(CartLine::line_total).sum();
        // Tax is applied at checkout against the shipping country.
        self.total = self.subtotal;
        self.updated_at = Utc::now();
    }

    pub fn id(&self) -> &CartId {
        &self.id
    }

    pub fn user_id(&self) -> Option<UserId> {
        self.user_id
    }

    pub fn lines(&self) -> &[CartLine] {
        &self.lines
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn subtotal(&self) -> Money {
        self.subtotal
    }

    pub fn total(&self) -> Money {
        self.total
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

    /// Returns true if the cart's expiry has passed at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}
