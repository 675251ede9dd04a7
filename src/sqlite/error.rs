//! Error types for the SQLite access layer.
//!
//! The `Result` forms of [`DatabaseHandle`](super::DatabaseHandle) operations
//! return [`DatabaseError`]; the `run_*` forms log it and report `false`.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for database operations.
pub type Result<T> = std::result::Result<T, DatabaseError>;

/// Errors that can occur while opening or using a database handle.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Another live handle in the same registry owns this path.
    #[error("database at {} is already open", .0.display())]
    AlreadyOpen(PathBuf),

    /// The engine connection could not be established.
    #[error("failed to open database at {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: rusqlite::Error,
    },

    /// Malformed SQL.
    #[error("failed to compile `{sql}`: {source}")]
    Compile {
        sql: String,
        #[source]
        source: rusqlite::Error,
    },

    /// A parameter could not be bound.
    #[error("failed to bind parameter {index}: {reason}")]
    Bind { index: usize, reason: String },

    /// Stepping the statement failed.
    #[error("statement execution failed: {0}")]
    Execution(#[from] rusqlite::Error),

    /// The handle has no live connection.
    #[error("database handle is closed")]
    Closed,

    #[error("empty SQL statement")]
    EmptyStatement,

    /// The worker thread could not be started.
    #[error("failed to spawn database worker: {0}")]
    Spawn(#[from] io::Error),

    /// The worker dropped a command without replying.
    #[error("database worker stopped before replying")]
    WorkerDisconnected,
}

impl DatabaseError {
    /// `true` for failures raised while opening a handle.
    pub fn is_open_error(&self) -> bool {
        matches!(
            self,
            DatabaseError::AlreadyOpen(_) | DatabaseError::Open { .. } | DatabaseError::Spawn(_)
        )
    }
}
