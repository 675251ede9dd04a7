//! Public handle over one serialized SQLite connection.

use std::path::Path;
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

use futures::channel::oneshot;
use futures::executor::block_on;

use super::config::{DatabaseConfig, StoragePath};
use super::error::{DatabaseError, Result};
use super::migration::MigrationSet;
use super::registry::InstanceRegistry;
use super::value::{Bindings, QueryRows, Row};
use super::worker::{self, Command, SqlStatement};

/// Owns one SQLite connection, its statement cache and the worker thread
/// that runs every operation against them in FIFO order.
///
/// The handle is `Send + Sync`; share it by reference or `Arc` between
/// callers. Closing (explicitly or on drop) drains queued work, finalizes
/// cached statements, closes the connection and releases the path in the
/// registry.
pub struct DatabaseHandle {
    path: StoragePath,
    registry: Arc<InstanceRegistry>,
    sender: Mutex<Option<Sender<Command>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for DatabaseHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseHandle")
            .field("path", &self.path)
            .field("open", &self.is_open())
            .finish_non_exhaustive()
    }
}

impl DatabaseHandle {
    /// Open `path`, creating the schema with `creation_sql` if the database is
    /// empty and then applying `migrations`.
    ///
    /// Initialization is queued ahead of any operation issued on the returned
    /// handle; it does not finish before this call returns.
    ///
    /// # Errors
    ///
    /// [`DatabaseError::AlreadyOpen`] if another live handle in `registry`
    /// owns `path` (compared after canonicalization, so `a/b/../x.db` and
    /// `a/x.db` are the same file), [`DatabaseError::Open`] if the connection
    /// cannot be established, [`DatabaseError::Spawn`] if the worker cannot
    /// start.
    pub fn open(
        registry: &Arc<InstanceRegistry>,
        path: impl Into<StoragePath>,
        creation_sql: &str,
        migrations: MigrationSet,
    ) -> Result<Self> {
        let config = DatabaseConfig::new(path)
            .with_creation_sql(creation_sql)
            .with_migrations(migrations);
        Self::open_with_config(registry, config)
    }

    /// Like [`open`](Self::open), also applying the connection PRAGMAs in `config`.
    pub fn open_with_config(
        registry: &Arc<InstanceRegistry>,
        config: DatabaseConfig,
    ) -> Result<Self> {
        let DatabaseConfig {
            path,
            creation_sql,
            migrations,
            ..
        } = config.clone();

        if !registry.register_if_absent(&path) {
            tracing::warn!(path = %path, "Database already open");
            let owned = path.as_path().map(Path::to_path_buf).unwrap_or_default();
            return Err(DatabaseError::AlreadyOpen(owned));
        }

        let opened = Self::connect(&config)
            .and_then(|conn| worker::spawn(conn, path.clone()).map_err(DatabaseError::from));
        let (worker, sender) = match opened {
            Ok(started) => started,
            Err(e) => {
                registry.unregister(&path);
                tracing::error!(path = %path, error = %e, "Database open failed");
                return Err(e);
            }
        };

        // Cannot fail: the worker holds the receiver until it sees `Close`.
        let _ = sender.send(Command::Initialize {
            creation_sql,
            migrations,
        });
        tracing::info!(path = %path, "Database opened");

        Ok(Self {
            path,
            registry: Arc::clone(registry),
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
        })
    }

    fn connect(config: &DatabaseConfig) -> Result<rusqlite::Connection> {
        let open_error = |source| DatabaseError::Open {
            path: config.path.to_string(),
            source,
        };
        let conn = config.path.connect().map_err(open_error)?;
        config.apply_pragmas(&conn).map_err(open_error)?;
        Ok(conn)
    }

    pub fn path(&self) -> &StoragePath {
        &self.path
    }

    pub fn is_open(&self) -> bool {
        self.lock_sender().is_some()
    }

    /// Close the handle, waiting for every queued operation to finish first.
    ///
    /// Returns `false` if the handle was already closed (a warning is
    /// logged) or if finalizing statements or closing the connection failed.
    pub fn close(&self) -> bool {
        match self.shutdown() {
            Some(closed) => closed,
            None => {
                tracing::warn!(path = %self.path, "Close called on a closed database handle");
                false
            }
        }
    }

    /// `None` if the handle was already closed.
    fn shutdown(&self) -> Option<bool> {
        let sender = self.lock_sender().take()?;

        let (reply, rx) = oneshot::channel();
        let closed = match sender.send(Command::Close { reply }) {
            Ok(()) => block_on(rx).unwrap_or(false),
            Err(_) => false,
        };
        drop(sender);

        if let Some(worker) = self.lock_worker().take() {
            if worker.join().is_err() {
                tracing::error!(path = %self.path, "Database worker panicked");
            }
        }
        self.registry.unregister(&self.path);

        tracing::info!(path = %self.path, closed, "Database closed");
        Some(closed)
    }

    // =========================================================================
    // Statements
    // =========================================================================

    /// Run a statement that returns no rows. Returns the number of rows changed.
    ///
    /// With `cache_statement` the compiled statement is kept for the next call
    /// with identical SQL text; otherwise it is finalized after this call.
    ///
    /// # Errors
    ///
    /// A statement that produces rows (`SELECT`, `RETURNING`, most PRAGMA
    /// reads) fails with [`DatabaseError::Execution`] wrapping
    /// `rusqlite::Error::ExecuteReturnedResults`; use [`query`](Self::query)
    /// for those.
    pub fn execute(&self, sql: &str, bindings: &Bindings, cache_statement: bool) -> Result<usize> {
        let statement = prepare(sql, bindings, cache_statement)?;
        wait(self.request(|reply| Command::Execute { statement, reply })?)
    }

    pub async fn execute_async(
        &self,
        sql: &str,
        bindings: &Bindings,
        cache_statement: bool,
    ) -> Result<usize> {
        let statement = prepare(sql, bindings, cache_statement)?;
        let rx = self.request(|reply| Command::Execute { statement, reply })?;
        rx.await.map_err(|_| DatabaseError::WorkerDisconnected)?
    }

    /// [`execute`](Self::execute), reporting failure as `false` plus a log entry.
    /// Row-producing statements therefore return `false`.
    pub fn run_non_query(&self, sql: &str, bindings: &Bindings, cache_statement: bool) -> bool {
        match self.execute(sql, bindings, cache_statement) {
            Ok(_) => true,
            Err(e) => {
                self.log_failure(sql, &e);
                false
            }
        }
    }

    /// Run a query and collect its rows. Column values are text, with NULL
    /// kept as [`Value::Null`](super::Value::Null).
    pub fn query(
        &self,
        sql: &str,
        bindings: &Bindings,
        cache_statement: bool,
    ) -> Result<QueryRows> {
        let statement = prepare(sql, bindings, cache_statement)?;
        wait(self.request(|reply| Command::Query { statement, reply })?).map(QueryRows::new)
    }

    pub async fn query_async(
        &self,
        sql: &str,
        bindings: &Bindings,
        cache_statement: bool,
    ) -> Result<QueryRows> {
        let statement = prepare(sql, bindings, cache_statement)?;
        let rx = self.request(|reply| Command::Query { statement, reply })?;
        let rows = rx.await.map_err(|_| DatabaseError::WorkerDisconnected)??;
        Ok(QueryRows::new(rows))
    }

    /// Call `on_row` once per result row. On failure no row is delivered and
    /// `false` is returned.
    pub fn run_query(
        &self,
        sql: &str,
        bindings: &Bindings,
        cache_statement: bool,
        on_row: impl FnMut(Row),
    ) -> bool {
        match self.query(sql, bindings, cache_statement) {
            Ok(rows) => {
                rows.for_each(on_row);
                true
            }
            Err(e) => {
                self.log_failure(sql, &e);
                false
            }
        }
    }

    // =========================================================================
    // Versions
    // =========================================================================

    /// `PRAGMA user_version`, read after everything queued before it.
    pub fn user_version(&self) -> Result<i32> {
        wait(self.request(|reply| Command::UserVersion { reply })?)
    }

    pub async fn user_version_async(&self) -> Result<i32> {
        let rx = self.request(|reply| Command::UserVersion { reply })?;
        rx.await.map_err(|_| DatabaseError::WorkerDisconnected)?
    }

    /// Queue a `PRAGMA user_version` write without waiting for it.
    ///
    /// `Ok` means the write was queued; it runs after everything queued
    /// before it and before anything queued later. Engine failures are logged.
    pub fn set_user_version(&self, version: i32) -> Result<()> {
        self.submit(Command::SetUserVersion { version })
    }

    /// `PRAGMA schema_version`, the engine's schema change counter.
    pub fn schema_version(&self) -> Result<i32> {
        wait(self.request(|reply| Command::SchemaVersion { reply })?)
    }

    // =========================================================================
    // Queue plumbing
    // =========================================================================

    /// Enqueue `cmd`. The sender lock is held across the send so nothing can
    /// be queued behind `Close`.
    fn submit(&self, cmd: Command) -> Result<()> {
        let guard = self.lock_sender();
        let sender = guard.as_ref().ok_or(DatabaseError::Closed)?;
        sender
            .send(cmd)
            .map_err(|_| DatabaseError::WorkerDisconnected)
    }

    fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<Result<T>>) -> Command,
    ) -> Result<oneshot::Receiver<Result<T>>> {
        let (reply, rx) = oneshot::channel();
        self.submit(command(reply))?;
        Ok(rx)
    }

    fn log_failure(&self, sql: &str, err: &DatabaseError) {
        match err {
            DatabaseError::Closed | DatabaseError::EmptyStatement => {
                tracing::warn!(path = %self.path, sql, error = %err, "Statement rejected");
            }
            _ => tracing::error!(path = %self.path, sql, error = %err, "Statement failed"),
        }
    }

    fn lock_sender(&self) -> MutexGuard<'_, Option<Sender<Command>>> {
        self.sender.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_worker(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.worker.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for DatabaseHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn prepare(sql: &str, bindings: &Bindings, cache: bool) -> Result<SqlStatement> {
    if sql.trim().is_empty() {
        return Err(DatabaseError::EmptyStatement);
    }
    Ok(SqlStatement {
        sql: sql.to_string(),
        bindings: bindings.clone(),
        cache,
    })
}

fn wait<T>(rx: oneshot::Receiver<Result<T>>) -> Result<T> {
    block_on(rx).map_err(|_| DatabaseError::WorkerDisconnected)?
}
