//! Where migrations are applied and recorded.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{Migration, Result};

/// A row of the `schema_migrations` ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedMigration {
    pub version: i64,
    pub name: String,
    pub applied_at: DateTime<Utc>,
}

/// A storage engine that can hold the migration lock.
#[async_trait]
pub trait MigrationBackend: Send + Sync {
    type Session: MigrationSession;

    /// Blocks until the exclusive migration lock is held.
    async fn lock(&self) -> Result<Self::Session>;
}

/// Work done while holding the migration lock.
#[async_trait]
pub trait MigrationSession: Send {
    /// Creates the ledger if it does not exist yet.
    async fn ensure_ledger(&mut self) -> Result<()>;

    /// Lists applied migrations in ascending version order.
    async fn applied(&mut self) -> Result<Vec<AppliedMigration>>;

    /// Runs the forward SQL and records the version, atomically.
    async fn apply(&mut self, migration: &Migration) -> Result<()>;

    /// Runs the reverse SQL and removes the version, atomically.
    async fn revert(&mut self, migration: &Migration) -> Result<()>;

    /// Releases the lock.
    async fn unlock(self) -> Result<()>
    where
        Self: Sized;
}
