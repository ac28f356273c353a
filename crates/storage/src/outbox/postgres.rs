use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{Clock, IdGenerator, SystemClock, UuidGenerator};
use sqlx::{PgConnection, PgPool, Row, postgres::PgRow};

use super::{OutboxMessage, OutboxRecord, OutboxStats, OutboxStatus, OutboxStore};
use crate::error::{DbContext, is_unique_violation};
use crate::{OutboxOptions, Result, StoreError};

/// PostgreSQL-backed outbox.
#[derive(Clone)]
pub struct PostgresOutboxStore {
    pool: PgPool,
    options: OutboxOptions,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
}

impl PostgresOutboxStore {
    /// Creates a new PostgreSQL outbox with default options.
    pub fn new(pool: PgPool) -> Self {
        Self::with_options(pool, OutboxOptions::default())
    }

    /// Creates a new PostgreSQL outbox with the given lease and batch settings.
    pub fn with_options(pool: PgPool, options: OutboxOptions) -> Self {
        Self {
            pool,
            options,
            clock: Arc::new(SystemClock),
            ids: Arc::new(UuidGenerator),
        }
    }

    /// Replaces the clock used for lease timestamps.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replaces the generator used for missing message IDs.
    pub fn with_id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Enqueues a message on an open transaction, so it commits or rolls back
    /// together with the state change that produced it.
    pub async fn enqueue_in(
        &self,
        conn: &mut PgConnection,
        mut message: OutboxMessage,
    ) -> Result<OutboxMessage> {
        if message.id.is_empty() {
            message.id = self.ids.next_id();
        }
        insert_message(conn, &message, self.clock.now()).await?;
        metrics::counter!("outbox_enqueued_total").increment(1);
        Ok(message)
    }

    async fn finish(&self, id: &str, status: OutboxStatus) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_messages
            SET status = $2, attempt_count = attempt_count + 1, updated_at = $3
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(self.clock.now())
        .execute(&self.pool)
        .await
        .context("outbox.finish")?;

        if result.rows_affected() == 0 {
            return Err(StoreError::PublishFailed {
                message_id: id.to_string(),
            });
        }
        Ok(())
    }

    fn row_to_record(row: &PgRow) -> Result<OutboxRecord> {
        let status: String = row.try_get("status").context("outbox.decode")?;
        Ok(OutboxRecord {
            message: OutboxMessage {
                id: row.try_get("id").context("outbox.decode")?,
                aggregate_type: row.try_get("aggregate_type").context("outbox.decode")?,
                aggregate_id: row.try_get("aggregate_id").context("outbox.decode")?,
                event_type: row.try_get("event_type").context("outbox.decode")?,
                payload: row.try_get("payload").context("outbox.decode")?,
            },
            status: OutboxStatus::parse(&status)?,
            attempt_count: row.try_get("attempt_count").context("outbox.decode")?,
            created_at: row.try_get("created_at").context("outbox.decode")?,
            updated_at: row.try_get("updated_at").context("outbox.decode")?,
        })
    }
}

async fn insert_message(
    conn: &mut PgConnection,
    message: &OutboxMessage,
    now: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO outbox_messages
            (id, aggregate_type, aggregate_id, event_type, payload, status, attempt_count, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, 'pending', 0, $6, $6)
        "#,
    )
    .bind(&message.id)
    .bind(&message.aggregate_type)
    .bind(&message.aggregate_id)
    .bind(&message.event_type)
    .bind(&message.payload)
    .bind(now)
    .execute(&mut *conn)
    .await
    .map_err(|e| {
        if is_unique_violation(&e, "outbox_messages_pkey") {
            return StoreError::AlreadyExists {
                entity: "outbox message",
                id: message.id.clone(),
            };
        }
        StoreError::Database {
            operation: "outbox.enqueue",
            source: e,
        }
    })?;
    Ok(())
}

#[async_trait]
impl OutboxStore for PostgresOutboxStore {
    #[tracing::instrument(skip(self, message), fields(event_type = %message.event_type))]
    async fn enqueue(&self, message: OutboxMessage) -> Result<OutboxMessage> {
        let mut conn = self.pool.acquire().await.context("outbox.enqueue")?;
        self.enqueue_in(&mut conn, message).await
    }

    async fn pull_pending(&self, limit: i64) -> Result<Vec<OutboxRecord>> {
        let limit = self.options.claim_limit(limit);
        let now = self.clock.now();
        let lease_cutoff = now - self.options.lease_delta();

        // Select and lease in one statement; SKIP LOCKED keeps concurrent
        // claimants off each other's rows and the locked re-check drops rows
        // another claimant leased first.
        let rows = sqlx::query(
            r#"
            UPDATE outbox_messages m
            SET status = 'processing', updated_at = $1
            FROM (
                SELECT id, status AS previous_status
                FROM outbox_messages
                WHERE status = 'pending'
                   OR (status = 'processing' AND updated_at < $2)
                ORDER BY created_at ASC, id ASC
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            ) claimable
            WHERE m.id = claimable.id
            RETURNING m.id, m.aggregate_type, m.aggregate_id, m.event_type, m.payload,
                      m.status, m.attempt_count, m.created_at, m.updated_at,
                      claimable.previous_status
            "#,
        )
        .bind(now)
        .bind(lease_cutoff)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("outbox.pull_pending")?;

        let mut reclaimed = 0u64;
        let mut claimed = Vec::with_capacity(rows.len());
        for row in &rows {
            let previous: String = row.try_get("previous_status").context("outbox.decode")?;
            if previous == OutboxStatus::Processing.as_str() {
                reclaimed += 1;
            }
            claimed.push(Self::row_to_record(row)?);
        }
        // RETURNING order is unspecified
        claimed.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.message.id.cmp(&b.message.id))
        });

        if !claimed.is_empty() {
            tracing::debug!(claimed = claimed.len(), reclaimed, "claimed outbox messages");
        }
        metrics::counter!("outbox_claimed_total").increment(claimed.len() as u64);
        metrics::counter!("outbox_reclaimed_total").increment(reclaimed);
        Ok(claimed)
    }

    async fn mark_sent(&self, id: &str) -> Result<()> {
        self.finish(id, OutboxStatus::Sent).await?;
        metrics::counter!("outbox_sent_total").increment(1);
        Ok(())
    }

    async fn mark_failed(&self, id: &str) -> Result<()> {
        self.finish(id, OutboxStatus::Failed).await?;
        metrics::counter!("outbox_failed_total").increment(1);
        Ok(())
    }

    async fn stats(&self) -> Result<OutboxStats> {
        let (pending, oldest_pending): (i64, Option<DateTime<Utc>>) = sqlx::query_as(
            r#"
            SELECT COUNT(*), MIN(created_at)
            FROM outbox_messages
            WHERE status IN ('pending', 'processing')
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .context("outbox.stats")?;

        Ok(OutboxStats {
            pending,
            oldest_pending,
        })
    }
}
