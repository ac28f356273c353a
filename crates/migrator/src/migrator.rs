//! Applies and reverts migrations under the exclusive migration lock.

use std::collections::HashSet;

use crate::backend::{MigrationBackend, MigrationSession};
use crate::discovery::{Migration, discover};
use crate::source::MigrationSource;
use crate::{MigrationError, Result};

/// Where the ledger stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MigrationStatus {
    /// Highest applied version, 0 when nothing is applied.
    pub current_version: i64,
    pub applied_count: usize,
    /// Discovered migrations not yet applied.
    pub pending_count: usize,
}

/// Drives versioned schema changes against a [`MigrationBackend`].
///
/// Every operation takes the backend's exclusive lock first, so migrator
/// instances starting at the same time run one after another. The lock is
/// released on every exit path; a dropped operation releases it when its
/// session is dropped.
pub struct SchemaMigrator<B: MigrationBackend> {
    backend: B,
    migrations: Vec<Migration>,
}

impl<B: MigrationBackend> SchemaMigrator<B> {
    /// Discovers the migrations of `source` and binds them to `backend`.
    pub fn new(backend: B, source: &dyn MigrationSource) -> Result<Self> {
        let migrations = discover(source)?;
        Ok(Self {
            backend,
            migrations,
        })
    }

    /// The discovered migrations, in ascending version order.
    pub fn migrations(&self) -> &[Migration] {
        &self.migrations
    }

    /// Gets a reference to the backend.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Applies up to `steps` pending migrations in ascending version order.
    ///
    /// `steps <= 0` applies everything pending. Each migration runs in its
    /// own transaction together with its ledger row. Returns how many were
    /// applied.
    #[tracing::instrument(skip(self))]
    pub async fn migrate_up(&self, steps: i64) -> Result<usize> {
        let mut session = self.backend.lock().await?;
        let result = self.up_locked(&mut session, steps).await;
        release(session).await;
        result
    }

    /// Reverts the `steps` most recently applied migrations, newest first.
    ///
    /// `steps <= 0` reverts a single migration. Fails with
    /// `UnknownAppliedVersion` when the ledger records a version that has no
    /// definition. Returns how many were reverted.
    #[tracing::instrument(skip(self))]
    pub async fn migrate_down(&self, steps: i64) -> Result<usize> {
        let mut session = self.backend.lock().await?;
        let result = self.down_locked(&mut session, steps).await;
        release(session).await;
        result
    }

    /// Reports the highest applied version and the number of applied migrations.
    pub async fn status(&self) -> Result<MigrationStatus> {
        let mut session = self.backend.lock().await?;
        let result = self.status_locked(&mut session).await;
        release(session).await;
        result
    }

    async fn up_locked(&self, session: &mut B::Session, steps: i64) -> Result<usize> {
        session.ensure_ledger().await?;
        let applied: HashSet<i64> = session
            .applied()
            .await?
            .into_iter()
            .map(|m| m.version)
            .collect();

        let limit = if steps > 0 {
            usize::try_from(steps).unwrap_or(usize::MAX)
        } else {
            usize::MAX
        };

        let mut count = 0;
        for migration in self
            .migrations
            .iter()
            .filter(|m| !applied.contains(&m.version))
            .take(limit)
        {
            session.apply(migration).await?;
            metrics::counter!("schema_migrations_applied_total").increment(1);
            tracing::info!(
                version = migration.version,
                name = %migration.name,
                "applied migration"
            );
            count += 1;
        }
        Ok(count)
    }

    async fn down_locked(&self, session: &mut B::Session, steps: i64) -> Result<usize> {
        // Never revert everything by accident
        let steps = if steps > 0 {
            usize::try_from(steps).unwrap_or(usize::MAX)
        } else {
            1
        };

        session.ensure_ledger().await?;
        let applied = session.applied().await?;

        let mut count = 0;
        for record in applied.iter().rev().take(steps) {
            let migration = self
                .migrations
                .iter()
                .find(|m| m.version == record.version)
                .ok_or(MigrationError::UnknownAppliedVersion {
                    version: record.version,
                })?;
            session.revert(migration).await?;
            metrics::counter!("schema_migrations_reverted_total").increment(1);
            tracing::info!(
                version = migration.version,
                name = %migration.name,
                "reverted migration"
            );
            count += 1;
        }
        Ok(count)
    }

    async fn status_locked(&self, session: &mut B::Session) -> Result<MigrationStatus> {
        session.ensure_ledger().await?;
        let applied = session.applied().await?;
        let versions: HashSet<i64> = applied.iter().map(|m| m.version).collect();

        Ok(MigrationStatus {
            current_version: applied.iter().map(|m| m.version).max().unwrap_or(0),
            applied_count: applied.len(),
            pending_count: self
                .migrations
                .iter()
                .filter(|m| !versions.contains(&m.version))
                .count(),
        })
    }
}

async fn release<S: MigrationSession>(session: S) {
    if let Err(e) = session.unlock().await {
        tracing::warn!(error = %e, "failed to release migration lock");
    }
}
