use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use common::{Clock, SystemClock};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::backend::{AppliedMigration, MigrationBackend, MigrationSession};
use crate::{Migration, Result};

#[derive(Debug, Default)]
struct LedgerState {
    ledger_created: bool,
    applied: BTreeMap<i64, AppliedMigration>,
    executed: Vec<String>,
}

/// In-memory migration backend.
///
/// Keeps the ledger in process and logs the SQL it would have run. The
/// session owns the mutex guard, so holding a session is holding the lock.
#[derive(Clone)]
pub struct InMemoryMigrationBackend {
    state: Arc<Mutex<LedgerState>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryMigrationBackend {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(Mutex::new(LedgerState::default())),
            clock,
        }
    }

    /// SQL bodies executed so far, in order.
    pub async fn executed(&self) -> Vec<String> {
        self.state.lock().await.executed.clone()
    }

    /// Returns true once a session created the ledger.
    pub async fn ledger_created(&self) -> bool {
        self.state.lock().await.ledger_created
    }

    /// Returns true while a session holds the lock.
    pub fn is_locked(&self) -> bool {
        self.state.try_lock().is_err()
    }
}

impl Default for InMemoryMigrationBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MigrationBackend for InMemoryMigrationBackend {
    type Session = InMemoryMigrationSession;

    async fn lock(&self) -> Result<Self::Session> {
        Ok(InMemoryMigrationSession {
            state: self.state.clone().lock_owned().await,
            clock: self.clock.clone(),
        })
    }
}

/// Session of [`InMemoryMigrationBackend`].
pub struct InMemoryMigrationSession {
    state: OwnedMutexGuard<LedgerState>,
    clock: Arc<dyn Clock>,
}

#[async_trait]
impl MigrationSession for InMemoryMigrationSession {
    async fn ensure_ledger(&mut self) -> Result<()> {
        self.state.ledger_created = true;
        Ok(())
    }

    async fn applied(&mut self) -> Result<Vec<AppliedMigration>> {
        Ok(self.state.applied.values().cloned().collect())
    }

    async fn apply(&mut self, migration: &Migration) -> Result<()> {
        let applied_at = self.clock.now();
        self.state.executed.push(migration.up.clone());
        self.state.applied.insert(
            migration.version,
            AppliedMigration {
                version: migration.version,
                name: migration.name.clone(),
                applied_at,
            },
        );
        Ok(())
    }

    async fn revert(&mut self, migration: &Migration) -> Result<()> {
        self.state.executed.push(migration.down.clone());
        self.state.applied.remove(&migration.version);
        Ok(())
    }

    async fn unlock(self) -> Result<()> {
        drop(self.state);
        Ok(())
    }
}
