use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{Clock, SystemClock};
use tokio::sync::RwLock;

use super::{
    IdempotencyRecord, IdempotencyStatus, IdempotencyStore, reuse_error, validate_create,
};
use crate::{IdempotencyOptions, Result, StoreError};

/// In-memory idempotency store.
#[derive(Clone)]
pub struct InMemoryIdempotencyStore {
    records: Arc<RwLock<HashMap<String, IdempotencyRecord>>>,
    options: IdempotencyOptions,
    clock: Arc<dyn Clock>,
}

impl InMemoryIdempotencyStore {
    /// Creates a new empty store with default options.
    pub fn new() -> Self {
        Self::with_options(IdempotencyOptions::default())
    }

    /// Creates a new empty store with the given options.
    pub fn with_options(options: IdempotencyOptions) -> Self {
        Self {
            records: Arc::new(RwLock::new(HashMap::new())),
            options,
            clock: Arc::new(SystemClock),
        }
    }

    /// Replaces the clock used for TTLs and timestamps.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Returns the number of stored records.
    pub async fn record_count(&self) -> usize {
        self.records.read().await.len()
    }

    async fn complete(
        &self,
        key: &str,
        body: Vec<u8>,
        status_code: i32,
        status: IdempotencyStatus,
    ) -> Result<()> {
        let now = self.clock.now();
        let mut records = self.records.write().await;
        let record = records.get_mut(key).ok_or_else(|| StoreError::NotFound {
            entity: "idempotency key",
            id: key.to_string(),
        })?;
        if record.is_complete() {
            return Err(StoreError::AlreadyCompleted {
                key: key.to_string(),
                status: record.status.as_str(),
            });
        }

        record.response_body = body;
        record.status_code = status_code;
        record.status = status;
        record.updated_at = now;
        Ok(())
    }
}

impl Default for InMemoryIdempotencyStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    #[tracing::instrument(skip(self, request_hash))]
    async fn create_processing(
        &self,
        key: &str,
        request_hash: &str,
        ttl: Duration,
    ) -> Result<IdempotencyRecord> {
        validate_create(key, request_hash)?;

        let now = self.clock.now();
        let mut records = self.records.write().await;
        if let Some(existing) = records.get(key) {
            return Err(reuse_error(key, &existing.request_hash, request_hash));
        }

        let record = IdempotencyRecord {
            key: key.to_string(),
            request_hash: request_hash.to_string(),
            response_body: Vec::new(),
            status_code: 0,
            status: IdempotencyStatus::Processing,
            ttl_at: now + self.options.ttl_delta(ttl),
            created_at: now,
            updated_at: now,
        };
        records.insert(record.key.clone(), record.clone());
        Ok(record)
    }

    async fn get(&self, key: &str) -> Result<IdempotencyRecord> {
        let records = self.records.read().await;
        records.get(key).cloned().ok_or_else(|| StoreError::NotFound {
            entity: "idempotency key",
            id: key.to_string(),
        })
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
        let mut records = self.records.write().await;

        let mut expired: Vec<(DateTime<Utc>, String)> = records
            .values()
            .filter(|r| r.ttl_at < before)
            .map(|r| (r.ttl_at, r.key.clone()))
            .collect();
        expired.sort();
        if limit > 0 {
            expired.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
        }

        for (_, key) in &expired {
            records.remove(key);
        }
        let deleted = expired.len() as u64;
        metrics::counter!("idempotency_expired_deleted_total").increment(deleted);
        Ok(deleted)
    }
}
