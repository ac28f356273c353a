use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{Clock, SystemClock};
use sqlx::{PgPool, Row, postgres::PgRow};

use super::{
    IdempotencyRecord, IdempotencyStatus, IdempotencyStore, reuse_error, validate_create,
};
use crate::error::DbContext;
use crate::{IdempotencyOptions, Result, StoreError};

const RECORD_COLUMNS: &str =
    "key, request_hash, response_body, http_status, status, ttl_at, created_at, updated_at";

/// PostgreSQL-backed idempotency store.
///
/// Key creation is serialized by the primary key on `idempotency_keys.key`.
#[derive(Clone)]
pub struct PostgresIdempotencyStore {
    pool: PgPool,
    options: IdempotencyOptions,
    clock: Arc<dyn Clock>,
}

impl PostgresIdempotencyStore {
    /// Creates a new PostgreSQL idempotency store with default options.
    pub fn new(pool: PgPool) -> Self {
        Self::with_options(pool, IdempotencyOptions::default())
    }

    /// Creates a new PostgreSQL idempotency store with the given options.
    pub fn with_options(pool: PgPool, options: IdempotencyOptions) -> Self {
        Self {
            pool,
            options,
            clock: Arc::new(SystemClock),
        }
    }

    /// Replaces the clock used for TTLs and timestamps.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn row_to_record(row: &PgRow) -> Result<IdempotencyRecord> {
        let status: String = row.try_get("status").context("idempotency.decode")?;
        Ok(IdempotencyRecord {
            key: row.try_get("key").context("idempotency.decode")?,
            request_hash: row.try_get("request_hash").context("idempotency.decode")?,
            response_body: row.try_get("response_body").context("idempotency.decode")?,
            status_code: row.try_get("http_status").context("idempotency.decode")?,
            status: IdempotencyStatus::parse(&status)?,
            ttl_at: row.try_get("ttl_at").context("idempotency.decode")?,
            created_at: row.try_get("created_at").context("idempotency.decode")?,
            updated_at: row.try_get("updated_at").context("idempotency.decode")?,
        })
    }

    async fn complete(
        &self,
        key: &str,
        body: Vec<u8>,
        status_code: i32,
        status: IdempotencyStatus,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE idempotency_keys
            SET response_body = $2, http_status = $3, status = $4, updated_at = $5
            WHERE key = $1 AND status = 'processing'
            "#,
        )
        .bind(key)
        .bind(body)
        .bind(status_code)
        .bind(status.as_str())
        .bind(self.clock.now())
        .execute(&self.pool)
        .await
        .context("idempotency.complete")?;

        if result.rows_affected() > 0 {
            return Ok(());
        }

        let current: Option<String> =
            sqlx::query_scalar("SELECT status FROM idempotency_keys WHERE key = $1")
                .bind(key)
                .fetch_optional(&self.pool)
                .await
                .context("idempotency.complete")?;
        match current {
            None => Err(StoreError::NotFound {
                entity: "idempotency key",
                id: key.to_string(),
            }),
            Some(current) => Err(StoreError::AlreadyCompleted {
                key: key.to_string(),
                status: IdempotencyStatus::parse(&current)?.as_str(),
            }),
        }
    }
}

#[async_trait]
impl IdempotencyStore for PostgresIdempotencyStore {
    #[tracing::instrument(skip(self, request_hash))]
    async fn create_processing(
        &self,
        key: &str,
        request_hash: &str,
        ttl: Duration,
    ) -> Result<IdempotencyRecord> {
        validate_create(key, request_hash)?;

        let now = self.clock.now();
        let ttl_at = now + self.options.ttl_delta(ttl);

        // A concurrent sweep may delete the conflicting row between the
        // insert and the lookup; one more insert settles it.
        for _ in 0..2 {
            let inserted = sqlx::query(&format!(
                "INSERT INTO idempotency_keys \
                 (key, request_hash, response_body, http_status, status, ttl_at, created_at, updated_at) \
                 VALUES ($1, $2, ''::bytea, 0, 'processing', $3, $4, $4) \
                 ON CONFLICT (key) DO NOTHING \
                 RETURNING {RECORD_COLUMNS}"
            ))
            .bind(key)
            .bind(request_hash)
            .bind(ttl_at)
            .bind(now)
            .fetch_optional(&self.pool)
            .await
            .context("idempotency.create_processing")?;

            if let Some(row) = inserted {
                return Self::row_to_record(&row);
            }

            let stored_hash: Option<String> =
                sqlx::query_scalar("SELECT request_hash FROM idempotency_keys WHERE key = $1")
                    .bind(key)
                    .fetch_optional(&self.pool)
                    .await
                    .context("idempotency.create_processing")?;
            if let Some(stored_hash) = stored_hash {
                return Err(reuse_error(key, &stored_hash, request_hash));
            }
        }

        Err(StoreError::AlreadyExists {
            entity: "idempotency key",
            id: key.to_string(),
        })
    }

    async fn get(&self, key: &str) -> Result<IdempotencyRecord> {
        let row = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM idempotency_keys WHERE key = $1"
        ))
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .context("idempotency.get")?
        .ok_or_else(|| StoreError::NotFound {
            entity: "idempotency key",
            id: key.to_string(),
        })?;
        Self::row_to_record(&row)
    }

    async fn mark_done(&self, key: &str, body: Vec<u8>, status_code: i32) -> Result<()> {
        self.complete(key, body, status_code, IdempotencyStatus::Done)
            .await
    }

    async fn mark_failed(&self, key: &str, body: Vec<u8>, status_code: i32) -> Result<()> {
        self.complete(key, body, status_code, IdempotencyStatus::Failed)
            .await
    }

    async fn delete_expired(&self, before: Option<DateTime<Utc>>, limit: i64) -> Result<u64> {
        let before = before.unwrap_or_else(|| self.clock.now());
        // LIMIT NULL is unbounded
        let limit = (limit > 0).then_some(limit);

        let result = sqlx::query(
            r#"
            DELETE FROM idempotency_keys
            WHERE key IN (
                SELECT key FROM idempotency_keys
                WHERE ttl_at < $1
                ORDER BY ttl_at ASC, key ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            "#,
        )
        .bind(before)
        .bind(limit)
        .execute(&self.pool)
        .await
        .context("idempotency.delete_expired")?;

        let deleted = result.rows_affected();
        metrics::counter!("idempotency_expired_deleted_total").increment(deleted);
        Ok(deleted)
    }
}
