use thiserror::Error;

/// Errors that can occur while discovering or running migrations.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// A migration file name does not follow `<version>_<name>.<up|down>[.sql]`.
    #[error("Invalid migration file name {file:?}: {reason}")]
    InvalidFileName { file: String, reason: &'static str },

    /// A version is missing its forward or reverse body.
    #[error("Migration {version} has no {direction} file")]
    MissingDirection {
        version: i64,
        direction: &'static str,
    },

    /// Two files define the same direction of one version.
    #[error("Migration {version} has more than one {direction} file")]
    DuplicateDirection {
        version: i64,
        direction: &'static str,
    },

    /// A migration body is empty or whitespace only.
    #[error("Migration {version} has an empty {direction} body")]
    EmptyBody {
        version: i64,
        direction: &'static str,
    },

    /// The up and down files of one version carry different names.
    #[error("Migration {version} has mismatched names {up:?} and {down:?}")]
    NameMismatch {
        version: i64,
        up: String,
        down: String,
    },

    /// The ledger records a version with no discovered definition.
    #[error("Applied migration {version} has no definition")]
    UnknownAppliedVersion { version: i64 },

    /// Reading migration files failed.
    #[error("Failed to read migrations from {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// A database error occurred.
    #[error("Database error during {operation}: {source}")]
    Database {
        operation: &'static str,
        #[source]
        source: sqlx::Error,
    },
}

/// Result type for migration operations.
pub type Result<T> = std::result::Result<T, MigrationError>;

pub(crate) trait DbContext<T> {
    fn context(self, operation: &'static str) -> Result<T>;
}

impl<T> DbContext<T> for std::result::Result<T, sqlx::Error> {
    fn context(self, operation: &'static str) -> Result<T> {
        self.map_err(|source| MigrationError::Database { operation, source })
    }
}
