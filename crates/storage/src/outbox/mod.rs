//! Transactional outbox: domain events awaiting publication.
//!
//! Messages are claimed with a lease. A publisher that crashes mid-lease does
//! not strand its messages: once the lease expires, the next `pull_pending`
//! reclaims them. Both backends share the lease contract configured through
//! [`OutboxOptions`](crate::OutboxOptions).

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::{Result, StoreError};

/// A domain event to publish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxMessage {
    /// Left empty by callers that want the store to generate one.
    pub id: String,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub event_type: String,
    /// Opaque payload bytes.
    pub payload: Vec<u8>,
}

impl OutboxMessage {
    /// Creates a message without an ID; the store assigns one on enqueue.
    pub fn new(
        aggregate_type: impl Into<String>,
        aggregate_id: impl Into<String>,
        event_type: impl Into<String>,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            id: String::new(),
            aggregate_type: aggregate_type.into(),
            aggregate_id: aggregate_id.into(),
            event_type: event_type.into(),
            payload: payload.into(),
        }
    }

    /// Sets an explicit message ID.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }
}

/// Delivery status of an outbox record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    Pending,
    Processing,
    Sent,
    Failed,
}

impl OutboxStatus {
    /// Returns the persisted name of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Processing => "processing",
            OutboxStatus::Sent => "sent",
            OutboxStatus::Failed => "failed",
        }
    }

    /// Returns true for `sent` and `failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, OutboxStatus::Sent | OutboxStatus::Failed)
    }

    pub(crate) fn parse(value: &str) -> Result<Self> {
        match value {
            "pending" => Ok(OutboxStatus::Pending),
            "processing" => Ok(OutboxStatus::Processing),
            "sent" => Ok(OutboxStatus::Sent),
            "failed" => Ok(OutboxStatus::Failed),
            other => Err(StoreError::Decode {
                column: "outbox_messages.status",
                value: other.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An outbox message together with its queue bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxRecord {
    pub message: OutboxMessage,
    pub status: OutboxStatus,
    pub attempt_count: i32,
    pub created_at: DateTime<Utc>,
    /// Doubles as the lease timestamp while the record is `processing`.
    pub updated_at: DateTime<Utc>,
}

impl OutboxRecord {
    /// Returns true if the record may be claimed at `now`.
    pub(crate) fn is_claimable(&self, now: DateTime<Utc>, lease: TimeDelta) -> bool {
        match self.status {
            OutboxStatus::Pending => true,
            OutboxStatus::Processing => self.updated_at < now - lease,
            OutboxStatus::Sent | OutboxStatus::Failed => false,
        }
    }
}

/// Backlog summary for alerting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OutboxStats {
    /// Records not yet delivered (`pending` or `processing`).
    pub pending: i64,
    /// Creation time of the oldest undelivered record.
    pub oldest_pending: Option<DateTime<Utc>>,
}

impl OutboxStats {
    /// Age of the oldest undelivered record at `now`.
    pub fn oldest_age(&self, now: DateTime<Utc>) -> Option<TimeDelta> {
        self.oldest_pending.map(|t| now - t)
    }
}

/// Durable queue of domain events awaiting publication.
///
/// The store never retries a publication on its own; publishers re-claim
/// through [`pull_pending`](OutboxStore::pull_pending).
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Stores a message as `pending` with no attempts.
    ///
    /// Assigns a generated ID when `message.id` is empty and returns the
    /// stored message.
    async fn enqueue(&self, message: OutboxMessage) -> Result<OutboxMessage>;

    /// Claims up to `limit` deliverable records and marks them `processing`.
    ///
    /// Deliverable means `pending`, or `processing` with a lease older than
    /// the configured lease duration. Records come back oldest first, ties
    /// broken by ID. `limit <= 0` uses the configured batch size.
    async fn pull_pending(&self, limit: i64) -> Result<Vec<OutboxRecord>>;

    /// Marks a record `sent` and counts the attempt.
    ///
    /// Fails with `PublishFailed` if the ID is unknown.
    async fn mark_sent(&self, id: &str) -> Result<()>;

    /// Marks a record `failed` and counts the attempt.
    ///
    /// Fails with `PublishFailed` if the ID is unknown.
    async fn mark_failed(&self, id: &str) -> Result<()>;

    /// Reports the undelivered backlog.
    async fn stats(&self) -> Result<OutboxStats>;
}
