use std::sync::Arc;

use async_trait::async_trait;
use common::{Clock, SystemClock};
use sqlx::{Connection, Executor, PgConnection, PgPool, Row};

use crate::backend::{AppliedMigration, MigrationBackend, MigrationSession};
use crate::error::DbContext;
use crate::{Migration, Result};

/// Advisory lock key shared by every migrator instance.
pub const MIGRATION_LOCK_KEY: i64 = 0x6f72_6465_725f_6d67;

/// PostgreSQL migration backend.
///
/// The advisory lock is session-scoped, so it is taken on a connection
/// detached from the pool: if the migrating task is dropped mid-run the
/// connection closes and the server releases the lock instead of a pooled
/// connection carrying it to the next borrower.
#[derive(Clone)]
pub struct PostgresMigrationBackend {
    pool: PgPool,
    clock: Arc<dyn Clock>,
}

impl PostgresMigrationBackend {
    pub fn new(pool: PgPool) -> Self {
        Self::with_clock(pool, Arc::new(SystemClock))
    }

    pub fn with_clock(pool: PgPool, clock: Arc<dyn Clock>) -> Self {
        Self { pool, clock }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl MigrationBackend for PostgresMigrationBackend {
    type Session = PostgresMigrationSession;

    async fn lock(&self) -> Result<Self::Session> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .context("migrations.lock")?
            .detach();

        sqlx::query("SELECT pg_advisory_lock($1)")
            .bind(MIGRATION_LOCK_KEY)
            .execute(&mut conn)
            .await
            .context("migrations.lock")?;

        tracing::debug!(key = MIGRATION_LOCK_KEY, "acquired migration lock");
        Ok(PostgresMigrationSession {
            conn,
            clock: self.clock.clone(),
        })
    }
}

/// Session of [`PostgresMigrationBackend`], holding the advisory lock.
pub struct PostgresMigrationSession {
    conn: PgConnection,
    clock: Arc<dyn Clock>,
}

#[async_trait]
impl MigrationSession for PostgresMigrationSession {
    async fn ensure_ledger(&mut self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS schema_migrations (
                version BIGINT PRIMARY KEY,
                name TEXT NOT NULL,
                applied_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&mut self.conn)
        .await
        .context("migrations.ensure_ledger")?;
        Ok(())
    }

    async fn applied(&mut self) -> Result<Vec<AppliedMigration>> {
        let rows = sqlx::query(
            "SELECT version, name, applied_at FROM schema_migrations ORDER BY version ASC",
        )
        .fetch_all(&mut self.conn)
        .await
        .context("migrations.applied")?;

        rows.iter()
            .map(|row| {
                Ok(AppliedMigration {
                    version: row.try_get("version").context("migrations.applied")?,
                    name: row.try_get("name").context("migrations.applied")?,
                    applied_at: row.try_get("applied_at").context("migrations.applied")?,
                })
            })
            .collect()
    }

    async fn apply(&mut self, migration: &Migration) -> Result<()> {
        let applied_at = self.clock.now();
        let mut tx = self.conn.begin().await.context("migrations.apply")?;

        // Unprepared, so one body may hold several statements
        (&mut *tx)
            .execute(migration.up.as_str())
            .await
            .context("migrations.apply")?;
        sqlx::query("INSERT INTO schema_migrations (version, name, applied_at) VALUES ($1, $2, $3)")
            .bind(migration.version)
            .bind(&migration.name)
            .bind(applied_at)
            .execute(&mut *tx)
            .await
            .context("migrations.apply")?;

        tx.commit().await.context("migrations.apply")?;
        Ok(())
    }

    async fn revert(&mut self, migration: &Migration) -> Result<()> {
        let mut tx = self.conn.begin().await.context("migrations.revert")?;

        (&mut *tx)
            .execute(migration.down.as_str())
            .await
            .context("migrations.revert")?;
        sqlx::query("DELETE FROM schema_migrations WHERE version = $1")
            .bind(migration.version)
            .execute(&mut *tx)
            .await
            .context("migrations.revert")?;

        tx.commit().await.context("migrations.revert")?;
        Ok(())
    }

    async fn unlock(mut self) -> Result<()> {
        let unlocked = sqlx::query("SELECT pg_advisory_unlock($1)")
            .bind(MIGRATION_LOCK_KEY)
            .execute(&mut self.conn)
            .await
            .context("migrations.unlock");
        // Closing the session frees the lock even if the unlock call failed
        let closed = self.conn.close().await.context("migrations.unlock");
        unlocked?;
        closed
    }
}
