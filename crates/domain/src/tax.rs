//! Totals computation.
//!
//! [`compute_totals`] is the single place an amount to charge is derived. The
//! checkout session freezes its result, and payment verification reuses the
//! frozen figure, so the charged and verified amounts can never drift apart.

use std::collections::HashMap;

use common::Money;
use serde::{Deserialize, Serialize};

use crate::order::OrderLine;

/// Country-keyed sales tax rates in basis points (825 = 8.25%).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaxTable {
    rates: HashMap<String, u32>,
}

impl TaxTable {
    /// An empty, zero-rated table.
    pub fn new() -> Self {
        Self::default()
    }

    /// The storefront's standard rates: US 8.25%, GB 20% VAT.
    pub fn standard() -> Self {
        Self::new().with_rate("US", 825).with_rate("GB", 2_000)
    }

    /// Adds or replaces the rate for a country.
    pub fn with_rate(mut self, country: &str, basis_points: u32) -> Self {
        self.rates
            .insert(country.to_ascii_uppercase(), basis_points);
        self
    }

    /// Returns the rate for a country; unknown countries are zero-rated.
    pub fn rate_for(&self, country: &str) -> u32 {
        self.rates
            .get(&country.trim().to_ascii_uppercase())
            .copied()
            .unwrap_or(0)
    }
}

/// Result of pricing a set of lines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Totals {
    pub subtotal: Money,
    pub tax: Money,
    pub total: Money,
}

/// Prices `lines` for delivery to `country`.
pub fn compute_totals(lines: &[OrderLine], country: &str, table: &TaxTable) -> Totals {
    let subtotal: Money = lines.iter().map(OrderLine::line_total).sum();
    let tax = subtotal.apply_basis_points(table.rate_for(country));
    Totals {
        subtotal,
        tax,
        total: subtotal + tax,
    }
}

#[cfg(test)]
mod tests {
    use common::ProductId;

    use super::*;

    fn line(product: u64, quantity: u32, cents: i64) -> OrderLine {
        OrderLine::new(
            ProductId::new(product),
            None,
            quantity,
            Money::from_cents(cents),
        )
    }

    #[test]
    fn test_zero_rated_total_is_sum_of_lines() {
        let lines = vec![line(42, 2, 1000), line(7, 3, 333)];
        let totals = compute_totals(&lines, "US", &TaxTable::new());

        assert_eq!(totals.subtotal.cents(), 2999);
        assert_eq!(totals.tax, Money::zero());
        assert_eq!(totals.total.cents(), 2999);
    }

    #[test]
    fn test_standard_rates() {
        let lines = vec![line(42, 2, 1000)];
        let table = TaxTable::standard();

        let us = compute_totals(&lines, "us", &table);
        assert_eq!(us.tax.cents(), 165);
        assert_eq!(us.total.cents(), 2165);

        let gb = compute_totals(&lines, "GB", &table);
        assert_eq!(gb.tax.cents(), 400);
        assert_eq!(gb.total.cents(), 2400);

        let fr = compute_totals(&lines, "FR", &table);
        assert_eq!(fr.total.cents(), 2000);
    }

    #[test]
    fn test_empty_lines() {
        let totals = compute_totals(&[], "GB", &TaxTable::standard());
        assert_eq!(totals, Totals::default());
    }

    #[test]
    fn test_compute_is_deterministic() {
        let lines = vec![line(1, 7, 1999), line(2, 1, 5)];
        let table = TaxTable::standard();
        assert_eq!(
            compute_totals(&lines, "US", &table),
            compute_totals(&lines, "US", &table)
        );
    }
}
