//! Storage configuration loaded from environment variables.

use std::time::Duration;

use chrono::TimeDelta;
use sqlx::postgres::PgPoolOptions;

/// Default outbox lease before a `processing` message may be reclaimed.
pub const DEFAULT_OUTBOX_LEASE: Duration = Duration::from_secs(60);

/// Default number of outbox messages claimed per `pull_pending` call.
pub const DEFAULT_OUTBOX_BATCH_SIZE: i64 = 100;

/// Default lifetime of an idempotency record.
pub const DEFAULT_IDEMPOTENCY_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Default number of expired idempotency records removed per sweep batch.
pub const DEFAULT_IDEMPOTENCY_SWEEP_BATCH: i64 = 500;

/// Storage configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `DATABASE_URL`: PostgreSQL connection string (default: unset)
/// - `DATABASE_MAX_CONNECTIONS`: pool size (default: `10`)
/// - `OUTBOX_LEASE_SECS`: outbox claim lease (default: `60`)
/// - `OUTBOX_BATCH_SIZE`: default claim batch (default: `100`)
/// - `IDEMPOTENCY_TTL_HOURS`: record lifetime (default: `24`)
/// - `IDEMPOTENCY_SWEEP_BATCH`: rows removed per sweep call (default: `500`)
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub database_url: Option<String>,
    pub max_connections: u32,
    pub outbox_lease: Duration,
    pub outbox_batch_size: i64,
    pub idempotency_ttl: Duration,
    pub idempotency_sweep_batch: i64,
}

impl StorageConfig {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds configuration from `lookup`, which maps a variable name to its
    /// value. Unset or unparsable values fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let parse = |name: &str| lookup(name).and_then(|v| v.trim().parse::<i64>().ok());
        let defaults = Self::default();
        Self {
            database_url: lookup("DATABASE_URL").filter(|url| !url.is_empty()),
            max_connections: parse("DATABASE_MAX_CONNECTIONS")
                .and_then(|n| u32::try_from(n).ok())
                .filter(|n| *n > 0)
                .unwrap_or(defaults.max_connections),
            outbox_lease: parse("OUTBOX_LEASE_SECS")
                .and_then(|n| u64::try_from(n).ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.outbox_lease),
            outbox_batch_size: parse("OUTBOX_BATCH_SIZE")
                .filter(|n| *n > 0)
                .unwrap_or(defaults.outbox_batch_size),
            idempotency_ttl: parse("IDEMPOTENCY_TTL_HOURS")
                .and_then(|h| u64::try_from(h).ok())
                .map(|h| Duration::from_secs(h.saturating_mul(60 * 60)))
                .unwrap_or(defaults.idempotency_ttl),
            idempotency_sweep_batch: parse("IDEMPOTENCY_SWEEP_BATCH")
                .unwrap_or(defaults.idempotency_sweep_batch),
        }
    }

    /// Returns the outbox options derived from this configuration.
    pub fn outbox_options(&self) -> OutboxOptions {
        OutboxOptions {
            lease: self.outbox_lease,
            batch_size: self.outbox_batch_size,
        }
    }

    /// Returns pool options sized by `max_connections`.
    pub fn pool_options(&self) -> PgPoolOptions {
        PgPoolOptions::new().max_connections(self.max_connections)
    }

    /// Returns the idempotency options derived from this configuration.
    pub fn idempotency_options(&self) -> IdempotencyOptions {
        IdempotencyOptions {
            default_ttl: self.idempotency_ttl,
            sweep_batch: self.idempotency_sweep_batch,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            max_connections: 10,
            outbox_lease: DEFAULT_OUTBOX_LEASE,
            outbox_batch_size: DEFAULT_OUTBOX_BATCH_SIZE,
            idempotency_ttl: DEFAULT_IDEMPOTENCY_TTL,
            idempotency_sweep_batch: DEFAULT_IDEMPOTENCY_SWEEP_BATCH,
        }
    }
}

/// Lease and batch settings shared by both outbox backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutboxOptions {
    pub lease: Duration,
    pub batch_size: i64,
}

impl OutboxOptions {
    pub(crate) fn lease_delta(&self) -> TimeDelta {
        to_delta(self.lease)
    }

    /// Resolves a caller-supplied limit, where `<= 0` means the default batch.
    pub(crate) fn claim_limit(&self, limit: i64) -> i64 {
        if limit > 0 { limit } else { self.batch_size }
    }
}

impl Default for OutboxOptions {
    fn default() -> Self {
        Self {
            lease: DEFAULT_OUTBOX_LEASE,
            batch_size: DEFAULT_OUTBOX_BATCH_SIZE,
        }
    }
}

/// Settings shared by both idempotency backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdempotencyOptions {
    pub default_ttl: Duration,
    /// Batch size to hand to [`sweep_expired`](crate::sweep_expired).
    pub sweep_batch: i64,
}

impl IdempotencyOptions {
    /// Resolves a caller-supplied TTL, where zero means the default.
    pub(crate) fn ttl_delta(&self, ttl: Duration) -> TimeDelta {
        if ttl.is_zero() {
            to_delta(self.default_ttl)
        } else {
            to_delta(ttl)
        }
    }
}

impl Default for IdempotencyOptions {
    fn default() -> Self {
        Self {
            default_ttl: DEFAULT_IDEMPOTENCY_TTL,
            sweep_batch: DEFAULT_IDEMPOTENCY_SWEEP_BATCH,
        }
    }
}

// Caps absurd durations so timestamp arithmetic cannot overflow.
fn to_delta(duration: Duration) -> TimeDelta {
    let cap = TimeDelta::days(365 * 100);
    TimeDelta::from_std(duration).map_or(cap, |d| d.min(cap))
}
