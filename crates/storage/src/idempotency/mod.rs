//! Idempotency-key deduplication for retried requests.
//!
//! Record lifecycle:
//! ```text
//! processing ──┬──► done
//!              └──► failed
//! ```
//! A key is bound to the fingerprint of the request that created it; reusing
//! the key with another fingerprint is rejected rather than overwritten.

pub mod memory;
pub mod postgres;
pub mod sweep;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Result, StoreError};

/// Lifecycle status of an idempotency record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdempotencyStatus {
    Processing,
    Done,
    Failed,
}

impl IdempotencyStatus {
    /// Returns the persisted name of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            IdempotencyStatus::Processing => "processing",
            IdempotencyStatus::Done => "done",
            IdempotencyStatus::Failed => "failed",
        }
    }

    pub(crate) fn parse(value: &str) -> Result<Self> {
        match value {
            "processing" => Ok(IdempotencyStatus::Processing),
            "done" => Ok(IdempotencyStatus::Done),
            "failed" => Ok(IdempotencyStatus::Failed),
            other => Err(StoreError::Decode {
                column: "idempotency_keys.status",
                value: other.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for IdempotencyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A stored idempotency key with the outcome of its request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: String,
    /// Fingerprint of the original request body.
    pub request_hash: String,
    pub response_body: Vec<u8>,
    /// Result status code of the original request (0 while processing).
    pub status_code: i32,
    pub status: IdempotencyStatus,
    pub ttl_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    /// Returns true once the original request finished and its response can be replayed.
    pub fn is_complete(&self) -> bool {
        self.status != IdempotencyStatus::Processing
    }
}

/// Durable mapping from idempotency key to the response computed for it.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Claims `key` for a new request in the `processing` state.
    ///
    /// Fails with `KeyRequired`/`RequestHashRequired` on empty input,
    /// `AlreadyExists` if the key is stored with the same `request_hash`
    /// (the caller should `get` and replay), and `HashMismatch` if it is
    /// stored with a different one. A zero `ttl` uses the configured default.
    async fn create_processing(
        &self,
        key: &str,
        request_hash: &str,
        ttl: Duration,
    ) -> Result<IdempotencyRecord>;

    /// Loads a record. Fails with `NotFound` if absent.
    async fn get(&self, key: &str) -> Result<IdempotencyRecord>;

    /// Stores the response of a successfully finished request.
    async fn mark_done(&self, key: &str, body: Vec<u8>, status_code: i32) -> Result<()>;

    /// Stores the response of a failed request.
    async fn mark_failed(&self, key: &str, body: Vec<u8>, status_code: i32) -> Result<()>;

    /// Removes up to `limit` records whose TTL is before `before`, oldest TTL
    /// first, and returns how many were removed.
    ///
    /// `before` defaults to now; `limit <= 0` removes every expired record.
    async fn delete_expired(&self, before: Option<DateTime<Utc>>, limit: i64) -> Result<u64>;
}

pub(crate) fn validate_create(key: &str, request_hash: &str) -> Result<()> {
    if key.is_empty() {
        return Err(StoreError::KeyRequired);
    }
    if request_hash.is_empty() {
        return Err(StoreError::RequestHashRequired);
    }
    Ok(())
}

/// Error for a second creation attempt on a stored key.
pub(crate) fn reuse_error(key: &str, stored_hash: &str, request_hash: &str) -> StoreError {
    if stored_hash == request_hash {
        metrics::counter!("idempotency_replays_total").increment(1);
        StoreError::AlreadyExists {
            entity: "idempotency key",
            id: key.to_string(),
        }
    } else {
        metrics::counter!("idempotency_hash_mismatch_total").increment(1);
        StoreError::HashMismatch {
            key: key.to_string(),
        }
    }
}
