//! Handle configuration: where the database lives, how it is created and
//! migrated, and the connection-wide PRAGMAs applied on open.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::Connection;
use serde::Deserialize;

use super::migration::MigrationSet;

/// Path string that selects a private in-memory database.
pub const MEMORY_PATH: &str = ":memory:";

/// Storage location of a database.
///
/// [`StoragePath::Memory`] is ephemeral: every handle gets its own private
/// database, so it is exempt from the one-handle-per-path rule.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
#[serde(from = "String")]
pub enum StoragePath {
    Memory,
    File(PathBuf),
}

impl StoragePath {
    pub fn file(path: impl AsRef<Path>) -> Self {
        StoragePath::File(path.as_ref().to_path_buf())
    }

    pub fn is_ephemeral(&self) -> bool {
        matches!(self, StoragePath::Memory)
    }

    /// The concrete filesystem path, if any.
    pub fn as_path(&self) -> Option<&Path> {
        match self {
            StoragePath::Memory => None,
            StoragePath::File(path) => Some(path),
        }
    }

    pub(crate) fn connect(&self) -> rusqlite::Result<Connection> {
        match self {
            StoragePath::Memory => Connection::open_in_memory(),
            StoragePath::File(path) => Connection::open(path),
        }
    }
}

impl fmt::Display for StoragePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoragePath::Memory => f.write_str(MEMORY_PATH),
            StoragePath::File(path) => write!(f, "{}", path.display()),
        }
    }
}

impl From<&str> for StoragePath {
    fn from(value: &str) -> Self {
        if value == MEMORY_PATH {
            StoragePath::Memory
        } else {
            StoragePath::File(PathBuf::from(value))
        }
    }
}

impl From<String> for StoragePath {
    fn from(value: String) -> Self {
        StoragePath::from(value.as_str())
    }
}

impl From<PathBuf> for StoragePath {
    fn from(value: PathBuf) -> Self {
        StoragePath::File(value)
    }
}

impl From<&Path> for StoragePath {
    fn from(value: &Path) -> Self {
        StoragePath::File(value.to_path_buf())
    }
}

/// SQLite handle configuration
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DatabaseConfig {
    /// Where the database lives
    pub path: StoragePath,
    /// Script run once, when the database has no schema yet
    #[serde(default)]
    pub creation_sql: String,
    /// Versioned migrations applied after creation
    #[serde(default)]
    pub migrations: MigrationSet,
    /// `PRAGMA busy_timeout`, in milliseconds
    #[serde(default)]
    pub busy_timeout_ms: Option<u64>,
    /// `PRAGMA foreign_keys = ON`
    #[serde(default)]
    pub foreign_keys: bool,
    /// `PRAGMA journal_mode = WAL`; ignored for in-memory databases
    #[serde(default)]
    pub wal: bool,
}

impl DatabaseConfig {
    /// Create a config for `path` with no schema and default PRAGMAs
    pub fn new(path: impl Into<StoragePath>) -> Self {
        Self {
            path: path.into(),
            creation_sql: String::new(),
            migrations: MigrationSet::new(),
            busy_timeout_ms: None,
            foreign_keys: false,
            wal: false,
        }
    }

    pub fn with_creation_sql(mut self, sql: impl Into<String>) -> Self {
        self.creation_sql = sql.into();
        self
    }

    pub fn with_migrations(mut self, migrations: MigrationSet) -> Self {
        self.migrations = migrations;
        self
    }

    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    pub fn with_foreign_keys(mut self, enabled: bool) -> Self {
        self.foreign_keys = enabled;
        self
    }

    pub fn with_wal(mut self, enabled: bool) -> Self {
        self.wal = enabled;
        self
    }

    /// Apply the connection-wide PRAGMAs this config asks for.
    pub(crate) fn apply_pragmas(&self, conn: &Connection) -> rusqlite::Result<()> {
        if let Some(ms) = self.busy_timeout_ms {
            conn.busy_timeout(Duration::from_millis(ms))?;
        }
        if self.foreign_keys {
            conn.pragma_update(None, "foreign_keys", true)?;
        }
        if self.wal && !self.path.is_ephemeral() {
            let mode: String =
                conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
            tracing::debug!(path = %self.path, mode, "Journal mode set");
        }
        Ok(())
    }
}
