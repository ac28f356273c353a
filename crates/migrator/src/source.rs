//! Providers of raw migration files.

use std::path::{Path, PathBuf};

use crate::{MigrationError, Result};

/// A raw migration file: its file name and SQL body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationFile {
    pub name: String,
    pub body: String,
}

impl MigrationFile {
    pub fn new(name: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            body: body.into(),
        }
    }
}

/// Somewhere migration files come from.
pub trait MigrationSource: Send + Sync {
    fn files(&self) -> Result<Vec<MigrationFile>>;
}

macro_rules! embedded {
    ($($file:literal),* $(,)?) => {
        &[$(($file, include_str!(concat!("../../../migrations/", $file)))),*]
    };
}

const EMBEDDED: &[(&str, &str)] = embedded![
    "0001_create_orders.up.sql",
    "0001_create_orders.down.sql",
    "0002_create_outbox_messages.up.sql",
    "0002_create_outbox_messages.down.sql",
    "0003_create_idempotency_keys.up.sql",
    "0003_create_idempotency_keys.down.sql",
];

/// The migrations compiled into the binary from the workspace `migrations/` directory.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmbeddedMigrations;

impl MigrationSource for EmbeddedMigrations {
    fn files(&self) -> Result<Vec<MigrationFile>> {
        Ok(EMBEDDED
            .iter()
            .map(|(name, body)| MigrationFile::new(*name, *body))
            .collect())
    }
}

/// Reads every `*.sql` file of a directory.
#[derive(Debug, Clone)]
pub struct DirectoryMigrations {
    path: PathBuf,
}

impl DirectoryMigrations {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl MigrationSource for DirectoryMigrations {
    fn files(&self) -> Result<Vec<MigrationFile>> {
        let io_err = |source| MigrationError::Io {
            path: self.path.display().to_string(),
            source,
        };

        let mut files = Vec::new();
        for entry in std::fs::read_dir(&self.path).map_err(io_err)? {
            let path = entry.map_err(io_err)?.path();
            if !path.is_file() || path.extension().is_none_or(|ext| ext != "sql") {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let body = std::fs::read_to_string(&path).map_err(io_err)?;
            files.push(MigrationFile::new(name, body));
        }
        files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(files)
    }
}

/// A fixed in-memory set of files, mostly for tests.
#[derive(Debug, Clone, Default)]
pub struct StaticMigrations {
    files: Vec<MigrationFile>,
}

impl StaticMigrations {
    pub fn new<N, B>(files: impl IntoIterator<Item = (N, B)>) -> Self
    where
        N: Into<String>,
        B: Into<String>,
    {
        Self {
            files: files
                .into_iter()
                .map(|(name, body)| MigrationFile::new(name, body))
                .collect(),
        }
    }
}

impl MigrationSource for StaticMigrations {
    fn files(&self) -> Result<Vec<MigrationFile>> {
        Ok(self.files.clone())
    }
}
