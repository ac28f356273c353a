//! Versioned schema migrations for the order write-path stores.
//!
//! Migrations are pairs of `<version>_<name>.up.sql` / `.down.sql` files.
//! [`SchemaMigrator`] applies and reverts them under an exclusive lock and
//! records each applied version in the `schema_migrations` ledger.

pub mod backend;
pub mod discovery;
pub mod error;
pub mod memory;
pub mod migrator;
pub mod postgres;
pub mod source;

pub use backend::{AppliedMigration, MigrationBackend, MigrationSession};
pub use discovery::{Migration, discover};
pub use error::{MigrationError, Result};
pub use memory::{InMemoryMigrationBackend, InMemoryMigrationSession};
pub use migrator::{MigrationStatus, SchemaMigrator};
pub use postgres::{MIGRATION_LOCK_KEY, PostgresMigrationBackend, PostgresMigrationSession};
pub use source::{
    DirectoryMigrations, EmbeddedMigrations, MigrationFile, MigrationSource, StaticMigrations,
};
