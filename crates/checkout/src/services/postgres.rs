//! PostgreSQL-backed order ledger.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{CheckoutId, Currency, Money, OrderId, UserId};
use domain::{Order, OrderStatus, Totals};
use sqlx::{PgPool, Row, postgres::PgRow};
use uuid::Uuid;

use crate::error::AdapterError;
use crate::services::ledger::OrderLedger;

const UNIQUE_CHECKOUT: &str = "unique_order_checkout";

const SELECT_ORDER: &str = r#"
    SELECT order_id, checkout_id, status, payment_id, payment_reference, user_id, currency,
           subtotal_cents, tax_cents, total_cents, lines, shipping, billing, created_at, updated_at
    FROM orders
"#;

/// PostgreSQL order ledger. The unique constraint on `checkout_id` makes
/// order creation idempotent across processes.
#[derive(Clone)]
pub struct PostgresOrderLedger {
    pool: PgPool,
}

impl PostgresOrderLedger {
    /// Creates a new PostgreSQL order ledger.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await
    }

    fn row_to_order(row: PgRow) -> Result<Order, AdapterError> {
        let status: String = row.try_get("status")?;
        let status = OrderStatus::parse(&status)
            .ok_or_else(|| AdapterError::Rejected(format!("unknown order status '{status}'")))?;
        let currency: String = row.try_get("currency")?;
        let currency = Currency::parse(&currency)
            .map_err(|e| AdapterError::Rejected(e.to_string()))?;

        Ok(Order {
            order_id: OrderId::from_uuid(row.try_get::<Uuid, _>("order_id")?),
            checkout_id: CheckoutId::from_uuid(row.try_get::<Uuid, _>("checkout_id")?),
            status,
            payment_id: row.try_get("payment_id")?,
            payment_reference: row.try_get("payment_reference")?,
            user_id: row
                .try_get::<Option<Uuid>, _>("user_id")?
                .map(UserId::from_uuid),
            lines: serde_json::from_value(row.try_get("lines")?)?,
            totals: Totals {
                subtotal: Money::from_cents(row.try_get("subtotal_cents")?),
                tax: Money::from_cents(row.try_get("tax_cents")?),
                total: Money::from_cents(row.try_get("total_cents")?),
            },
            currency,
            shipping: serde_json::from_value(row.try_get("shipping")?)?,
            billing: serde_json::from_value(row.try_get("billing")?)?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    async fn fetch_one_where(
        &self,
        clause: &str,
        bind: Uuid,
    ) -> Result<Option<Order>, AdapterError> {
        let sql = format!("{SELECT_ORDER} WHERE {clause} = $1");
        let row = sqlx::query(&sql)
            .bind(bind)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Self::row_to_order).transpose()
    }
}

#[async_trait]
impl OrderLedger for PostgresOrderLedger {
    async fn create(&self, order: &Order) -> Result<Order, AdapterError> {
        let result = sqlx::query(
            r#"
            INSERT INTO orders (order_id, checkout_id, status, payment_id, payment_reference, user_id,
                                currency, subtotal_cents, tax_cents, total_cents, lines, shipping,
                                billing, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(order.order_id.as_uuid())
        .bind(order.checkout_id.as_uuid())
        .bind(order.status.as_str())
        .bind(&order.payment_id)
        .bind(&order.payment_reference)
        .bind(order.user_id.map(|u| u.as_uuid()))
        .bind(order.currency.code())
        .bind(order.totals.subtotal.cents())
        .bind(order.totals.tax.cents())
        .bind(order.totals.total.cents())
        .bind(serde_json::to_value(&order.lines)?)
        .bind(serde_json::to_value(&order.shipping)?)
        .bind(serde_json::to_value(&order.billing)?)
        .bind(order.created_at)
        .bind(order.updated_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(order.clone()),
            Err(sqlx::Error::Database(ref db_err))
                if db_err.constraint() == Some(UNIQUE_CHECKOUT) =>
            {
                let existing = self
                    .find_by_checkout(order.checkout_id)
                    .await?
                    .ok_or_else(|| {
                        AdapterError::NotFound(format!("order for checkout {}", order.checkout_id))
                    })?;
                Err(AdapterError::DuplicateOrder(Box::new(existing)))
            }
            Err(e) => Err(AdapterError::Database(e)),
        }
    }

    async fn get(&self, order_id: OrderId) -> Result<Option<Order>, AdapterError> {
        self.fetch_one_where("order_id", order_id.as_uuid()).await
    }

    async fn find_by_checkout(
        &self,
        checkout_id: CheckoutId,
    ) -> Result<Option<Order>, AdapterError> {
        self.fetch_one_where("checkout_id", checkout_id.as_uuid())
            .await
    }

    async fn find_by_payment_reference(
        &self,
        reference: &str,
    ) -> Result<Option<Order>, AdapterError> {
        let sql =
            format!("{SELECT_ORDER} WHERE payment_reference = $1 ORDER BY created_at LIMIT 1");
        let row = sqlx::query(&sql)
            .bind(reference)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Self::row_to_order).transpose()
    }

    async fn update_status(
        &self,
        order_id: OrderId,
        from: OrderStatus,
        to: OrderStatus,
        updated_at: DateTime<Utc>,
    ) -> Result<bool, AdapterError> {
        let result = sqlx::query(
            "UPDATE orders SET status = $1, updated_at = $2 WHERE order_id = $3 AND status = $4",
        )
        .bind(to.as_str())
        .bind(updated_at)
        .bind(order_id.as_uuid())
        .bind(from.as_str())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 1 {
            return Ok(true);
        }

        // Lost the race, or the order never existed.
        match self.get(order_id).await? {
            Some(_) => Ok(false),
            None => Err(AdapterError::NotFound(format!("order {order_id}"))),
        }
    }
}
