use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use common::{Clock, IdGenerator, SystemClock, UuidGenerator};
use tokio::sync::RwLock;

use super::{OutboxMessage, OutboxRecord, OutboxStats, OutboxStatus, OutboxStore};
use crate::{OutboxOptions, Result, StoreError};

/// In-memory outbox.
///
/// Claims run under the write lock, so selecting and leasing a batch is one
/// atomic step just like the conditional update of the PostgreSQL backend.
#[derive(Clone)]
pub struct InMemoryOutboxStore {
    records: Arc<RwLock<HashMap<String, OutboxRecord>>>,
    options: OutboxOptions,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
}

impl InMemoryOutboxStore {
    /// Creates a new empty outbox with default options.
    pub fn new() -> Self {
        Self::with_options(OutboxOptions::default())
    }

    /// Creates a new empty outbox with the given lease and batch settings.
    pub fn with_options(options: OutboxOptions) -> Self {
        Self {
            records: Arc::new(RwLock::new(HashMap::new())),
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

    /// Returns a stored record regardless of its status.
    pub async fn record(&self, id: &str) -> Option<OutboxRecord> {
        self.records.read().await.get(id).cloned()
    }

    async fn finish(&self, id: &str, status: OutboxStatus) -> Result<()> {
        let now = self.clock.now();
        let mut records = self.records.write().await;
        let record = records
            .get_mut(id)
            .ok_or_else(|| StoreError::PublishFailed {
                message_id: id.to_string(),
            })?;
        record.status = status;
        record.attempt_count += 1;
        record.updated_at = now;
        Ok(())
    }
}

impl Default for InMemoryOutboxStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    #[tracing::instrument(skip(self, message), fields(event_type = %message.event_type))]
    async fn enqueue(&self, mut message: OutboxMessage) -> Result<OutboxMessage> {
        if message.id.is_empty() {
            message.id = self.ids.next_id();
        }

        let now = self.clock.now();
        let mut records = self.records.write().await;
        if records.contains_key(&message.id) {
            return Err(StoreError::AlreadyExists {
                entity: "outbox message",
                id: message.id,
            });
        }
        records.insert(
            message.id.clone(),
            OutboxRecord {
                message: message.clone(),
                status: OutboxStatus::Pending,
                attempt_count: 0,
                created_at: now,
                updated_at: now,
            },
        );

        metrics::counter!("outbox_enqueued_total").increment(1);
        Ok(message)
    }

    async fn pull_pending(&self, limit: i64) -> Result<Vec<OutboxRecord>> {
        let limit = usize::try_from(self.options.claim_limit(limit)).unwrap_or(usize::MAX);
        let now = self.clock.now();
        let lease = self.options.lease_delta();

        let mut records = self.records.write().await;
        let mut claimable: Vec<&mut OutboxRecord> = records
            .values_mut()
            .filter(|r| r.is_claimable(now, lease))
            .collect();
        claimable.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.message.id.cmp(&b.message.id))
        });

        let mut claimed = Vec::with_capacity(limit.min(claimable.len()));
        let mut reclaimed = 0u64;
        for record in claimable.into_iter().take(limit) {
            if record.status == OutboxStatus::Processing {
                reclaimed += 1;
            }
            record.status = OutboxStatus::Processing;
            record.updated_at = now;
            claimed.push(record.clone());
        }

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
        let records = self.records.read().await;
        let undelivered = records.values().filter(|r| !r.status.is_terminal());
        let mut stats = OutboxStats::default();
        for record in undelivered {
            stats.pending += 1;
            stats.oldest_pending = Some(match stats.oldest_pending {
                Some(oldest) => oldest.min(record.created_at),
                None => record.created_at,
            });
        }
        Ok(stats)
    }
}
