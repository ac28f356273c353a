use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use common::{Clock, SystemClock, Version};
use sqlx::{PgConnection, PgPool, Postgres, Row, Transaction, postgres::PgRow};

use super::{CustomerId, Order, OrderId, OrderItem, OrderStatus, OrderStore};
use crate::error::{DbContext, is_unique_violation};
use crate::{Result, StoreError};

const ORDER_COLUMNS: &str =
    "id, customer_id, status, currency, amount_minor, version, created_at, updated_at";

/// PostgreSQL-backed order store.
#[derive(Clone)]
pub struct PostgresOrderStore {
    pool: PgPool,
    clock: Arc<dyn Clock>,
}

impl PostgresOrderStore {
    /// Creates a new PostgreSQL order store.
    pub fn new(pool: PgPool) -> Self {
        Self::with_clock(pool, Arc::new(SystemClock))
    }

    /// Creates a store stamping writes with `clock`.
    pub fn with_clock(pool: PgPool, clock: Arc<dyn Clock>) -> Self {
        Self { pool, clock }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Opens a read-only transaction whose statements all see one snapshot,
    /// so an order header and its items always come from the same commit.
    async fn snapshot(&self, operation: &'static str) -> Result<Transaction<'static, Postgres>> {
        let mut tx = self.pool.begin().await.context(operation)?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ, READ ONLY")
            .execute(&mut *tx)
            .await
            .context(operation)?;
        Ok(tx)
    }

    fn row_to_order(row: &PgRow) -> Result<Order> {
        let status: String = row.try_get("status").context("orders.decode")?;
        Ok(Order {
            id: OrderId::new(row.try_get::<String, _>("id").context("orders.decode")?),
            customer_id: CustomerId::new(
                row.try_get::<String, _>("customer_id")
                    .context("orders.decode")?,
            ),
            status: OrderStatus::parse(&status)?,
            currency: row.try_get("currency").context("orders.decode")?,
            amount_minor: row.try_get("amount_minor").context("orders.decode")?,
            items: Vec::new(),
            version: Version::new(row.try_get("version").context("orders.decode")?),
            created_at: row.try_get("created_at").context("orders.decode")?,
            updated_at: row.try_get("updated_at").context("orders.decode")?,
        })
    }

    fn row_to_item(row: &PgRow) -> Result<OrderItem> {
        Ok(OrderItem {
            id: row.try_get("id").context("order_items.decode")?,
            sku: row.try_get("sku").context("order_items.decode")?,
            qty: row.try_get("qty").context("order_items.decode")?,
            price_minor: row.try_get("price_minor").context("order_items.decode")?,
            created_at: row.try_get("created_at").context("order_items.decode")?,
        })
    }
}

/// Inserts an order and its items on an open connection or transaction.
///
/// Used by [`PostgresOrderStore::create`] and by callers that need the order
/// to land in the same transaction as other writes.
pub async fn insert_order(conn: &mut PgConnection, order: &Order) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO orders (id, customer_id, status, currency, amount_minor, version, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(order.id.as_str())
    .bind(order.customer_id.as_str())
    .bind(order.status.as_str())
    .bind(&order.currency)
    .bind(order.amount_minor)
    .bind(order.version.as_i64())
    .bind(order.created_at)
    .bind(order.updated_at)
    .execute(&mut *conn)
    .await
    .map_err(|e| {
        if is_unique_violation(&e, "orders_pkey") {
            return StoreError::AlreadyExists {
                entity: "order",
                id: order.id.to_string(),
            };
        }
        StoreError::Database {
            operation: "orders.create",
            source: e,
        }
    })?;

    insert_items(conn, &order.id, &order.items).await
}

async fn insert_items(conn: &mut PgConnection, order_id: &OrderId, items: &[OrderItem]) -> Result<()> {
    for item in items {
        sqlx::query(
            r#"
            INSERT INTO order_items (id, order_id, sku, qty, price_minor, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(&item.id)
        .bind(order_id.as_str())
        .bind(&item.sku)
        .bind(item.qty)
        .bind(item.price_minor)
        .bind(item.created_at)
        .execute(&mut *conn)
        .await
        .context("order_items.insert")?;
    }
    Ok(())
}

#[async_trait]
impl OrderStore for PostgresOrderStore {
    #[tracing::instrument(skip(self, order), fields(order_id = %order.id))]
    async fn create(&self, order: &Order) -> Result<()> {
        let mut tx = self.pool.begin().await.context("orders.create")?;
        insert_order(&mut tx, order).await?;
        tx.commit().await.context("orders.create")?;

        metrics::counter!("orders_created_total").increment(1);
        Ok(())
    }

    async fn get(&self, id: &OrderId) -> Result<Order> {
        let mut tx = self.snapshot("orders.get").await?;
        let row = sqlx::query(&format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1"))
            .bind(id.as_str())
            .fetch_optional(&mut *tx)
            .await
            .context("orders.get")?
            .ok_or_else(|| StoreError::NotFound {
                entity: "order",
                id: id.to_string(),
            })?;
        let mut order = Self::row_to_order(&row)?;

        let item_rows = sqlx::query(
            r#"
            SELECT id, sku, qty, price_minor, created_at
            FROM order_items
            WHERE order_id = $1
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(id.as_str())
        .fetch_all(&mut *tx)
        .await
        .context("order_items.get")?;
        tx.commit().await.context("orders.get")?;

        order.items = item_rows
            .iter()
            .map(Self::row_to_item)
            .collect::<Result<_>>()?;
        Ok(order)
    }

    async fn list_by_customer(&self, customer_id: &CustomerId, limit: i64) -> Result<Vec<Order>> {
        // LIMIT NULL is unbounded
        let limit = (limit > 0).then_some(limit);
        let mut tx = self.snapshot("orders.list_by_customer").await?;
        let rows = sqlx::query(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE customer_id = $1 \
             ORDER BY created_at DESC, id DESC LIMIT $2"
        ))
        .bind(customer_id.as_str())
        .bind(limit)
        .fetch_all(&mut *tx)
        .await
        .context("orders.list_by_customer")?;

        let mut orders = rows
            .iter()
            .map(Self::row_to_order)
            .collect::<Result<Vec<_>>>()?;
        if orders.is_empty() {
            return Ok(orders);
        }

        let ids: Vec<String> = orders.iter().map(|o| o.id.as_str().to_string()).collect();
        let item_rows = sqlx::query(
            r#"
            SELECT order_id, id, sku, qty, price_minor, created_at
            FROM order_items
            WHERE order_id = ANY($1)
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(&ids)
        .fetch_all(&mut *tx)
        .await
        .context("order_items.list_by_customer")?;
        tx.commit().await.context("orders.list_by_customer")?;

        let mut items_by_order: HashMap<String, Vec<OrderItem>> = HashMap::new();
        for row in &item_rows {
            let order_id: String = row
                .try_get("order_id")
                .context("order_items.decode")?;
            items_by_order
                .entry(order_id)
                .or_default()
                .push(Self::row_to_item(row)?);
        }
        for order in &mut orders {
            order.items = items_by_order
                .remove(order.id.as_str())
                .unwrap_or_default();
        }
        Ok(orders)
    }

    #[tracing::instrument(skip(self, order), fields(order_id = %order.id, expected = %order.version))]
    async fn save(&self, order: &Order) -> Result<Version> {
        let next = order.version.next();
        let mut tx = self.pool.begin().await.context("orders.save")?;

        let updated = sqlx::query(
            r#"
            UPDATE orders
            SET customer_id = $3, status = $4, currency = $5, amount_minor = $6,
                version = $7, updated_at = $8
            WHERE id = $1 AND version = $2
            "#,
        )
        .bind(order.id.as_str())
        .bind(order.version.as_i64())
        .bind(order.customer_id.as_str())
        .bind(order.status.as_str())
        .bind(&order.currency)
        .bind(order.amount_minor)
        .bind(next.as_i64())
        .bind(self.clock.now())
        .execute(&mut *tx)
        .await
        .context("orders.save")?;

        if updated.rows_affected() == 0 {
            // Tell a missing order apart from a stale version
            let exists: bool =
                sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM orders WHERE id = $1)")
                    .bind(order.id.as_str())
                    .fetch_one(&mut *tx)
                    .await
                    .context("orders.save")?;
            if !exists {
                return Err(StoreError::NotFound {
                    entity: "order",
                    id: order.id.to_string(),
                });
            }
            metrics::counter!("orders_version_conflicts_total").increment(1);
            return Err(StoreError::VersionConflict {
                order_id: order.id.clone(),
                expected: order.version,
            });
        }

        sqlx::query("DELETE FROM order_items WHERE order_id = $1")
            .bind(order.id.as_str())
            .execute(&mut *tx)
            .await
            .context("order_items.replace")?;
        insert_items(&mut tx, &order.id, &order.items).await?;

        tx.commit().await.context("orders.save")?;
        Ok(next)
    }
}
