//! Background removal of expired idempotency records.

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use super::IdempotencyStore;
use crate::{Result, StoreError};

/// Deletes expired records in batches of `batch` until a batch comes back short.
///
/// Cancellation is observed between batches; a cancelled sweep returns
/// `StoreError::Cancelled` carrying the rows removed so far. A storage error
/// ends the sweep and is returned unchanged; rows removed by earlier batches
/// stay removed and their count is only logged. `batch <= 0` deletes
/// everything expired in a single pass.
///
/// Callers normally pass [`IdempotencyOptions::sweep_batch`](crate::IdempotencyOptions::sweep_batch).
pub async fn sweep_expired<S>(
    store: &S,
    before: Option<DateTime<Utc>>,
    batch: i64,
    cancel: &CancellationToken,
) -> Result<u64>
where
    S: IdempotencyStore + ?Sized,
{
    let mut total = 0u64;
    loop {
        if cancel.is_cancelled() {
            tracing::debug!(deleted = total, "idempotency sweep cancelled");
            return Err(StoreError::Cancelled { completed: total });
        }

        // A batch in flight runs to completion so the count stays exact
        let deleted = match store.delete_expired(before, batch).await {
            Ok(deleted) => deleted,
            Err(err) => {
                tracing::warn!(deleted = total, error = %err, "idempotency sweep failed");
                return Err(err);
            }
        };
        total += deleted;

        if batch <= 0 || deleted < batch as u64 {
            tracing::debug!(deleted = total, "idempotency sweep finished");
            return Ok(total);
        }
    }
}
