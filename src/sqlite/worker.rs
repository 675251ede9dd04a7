//! Serial executor: one thread owns the connection and its statement cache
//! and runs queued commands one at a time, in submission order.

use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};

use futures::channel::oneshot;
use rusqlite::{Connection, Statement};

use super::cache::StatementCache;
use super::config::StoragePath;
use super::error::{DatabaseError, Result};
use super::migration::{self, MigrationSet};
use super::value::{Bindings, Row, Value};

/// SQL text plus what to do with the compiled statement afterwards.
#[derive(Debug, Clone)]
pub(crate) struct SqlStatement {
    pub sql: String,
    pub bindings: Bindings,
    pub cache: bool,
}

/// Commands sent to the worker.
pub(crate) enum Command {
    /// Creation script (fresh schema only) then migrations.
    Initialize {
        creation_sql: String,
        migrations: MigrationSet,
    },
    Execute {
        statement: SqlStatement,
        reply: oneshot::Sender<Result<usize>>,
    },
    Query {
        statement: SqlStatement,
        reply: oneshot::Sender<Result<Vec<Row>>>,
    },
    UserVersion {
        reply: oneshot::Sender<Result<i32>>,
    },
    /// No reply; ordering alone is guaranteed.
    SetUserVersion { version: i32 },
    SchemaVersion {
        reply: oneshot::Sender<Result<i32>>,
    },
    /// Finalize statements, close the connection, stop the thread.
    Close { reply: oneshot::Sender<bool> },
}

/// Spawn the worker thread for an already opened connection.
pub(crate) fn spawn(
    conn: Connection,
    path: StoragePath,
) -> std::io::Result<(JoinHandle<()>, Sender<Command>)> {
    let (tx, rx) = mpsc::channel();
    let handle = thread::Builder::new()
        .name("sqlite-worker".to_string())
        .spawn(move || run(conn, path, rx))?;
    Ok((handle, tx))
}

fn run(conn: Connection, path: StoragePath, rx: Receiver<Command>) {
    tracing::debug!(path = %path, "Database worker started");

    let (close_reply, finalized) = {
        let mut session = Session::new(&conn, &path);
        let close_reply = session.serve(&rx);
        let failures = session.cache.finalize_all();
        (close_reply, failures == 0)
    };

    let closed = match conn.close() {
        Ok(()) => true,
        Err((conn, e)) => {
            tracing::error!(path = %path, error = %e, "Connection close failed");
            drop(conn);
            false
        }
    };

    if let Some(reply) = close_reply {
        let _ = reply.send(finalized && closed);
    }
    tracing::debug!(path = %path, "Database worker stopped");
}

/// Worker-side state borrowed from the connection for the thread's lifetime.
struct Session<'conn> {
    conn: &'conn Connection,
    cache: StatementCache<'conn>,
    path: &'conn StoragePath,
}

impl<'conn> Session<'conn> {
    fn new(conn: &'conn Connection, path: &'conn StoragePath) -> Self {
        Self {
            conn,
            cache: StatementCache::new(conn),
            path,
        }
    }

    /// Handle commands until `Close` arrives or every sender is gone.
    fn serve(&mut self, rx: &Receiver<Command>) -> Option<oneshot::Sender<bool>> {
        while let Ok(cmd) = rx.recv() {
            match cmd {
                Command::Initialize {
                    creation_sql,
                    migrations,
                } => self.initialize(&creation_sql, &migrations),
                Command::Execute { statement, reply } => {
                    let _ = reply.send(self.execute(&statement));
                }
                Command::Query { statement, reply } => {
                    let _ = reply.send(self.query(&statement));
                }
                Command::UserVersion { reply } => {
                    let _ = reply.send(migration::user_version(self.conn).map_err(Into::into));
                }
                Command::SetUserVersion { version } => {
                    if let Err(e) = migration::set_user_version(self.conn, version) {
                        tracing::error!(
                            path = %self.path,
                            version,
                            error = %e,
                            "Setting user_version failed"
                        );
                    }
                }
                Command::SchemaVersion { reply } => {
                    let _ = reply.send(migration::schema_version(self.conn).map_err(Into::into));
                }
                Command::Close { reply } => return Some(reply),
            }
        }
        tracing::warn!(path = %self.path, "Command channel disconnected, shutting down");
        None
    }

    fn initialize(&mut self, creation_sql: &str, migrations: &MigrationSet) {
        match migration::schema_version(self.conn) {
            Ok(0) if !creation_sql.trim().is_empty() => {
                match self.conn.execute_batch(creation_sql) {
                    Ok(()) => tracing::info!(path = %self.path, "Database schema created"),
                    Err(e) => {
                        tracing::error!(path = %self.path, error = %e, "Creation script failed")
                    }
                }
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!(path = %self.path, error = %e, "Reading schema_version failed");
            }
        }

        match migration::run_migrations(self.conn, migrations) {
            Ok(report) if report.from != report.to || !report.is_clean() => {
                tracing::info!(
                    path = %self.path,
                    from = report.from,
                    to = report.to,
                    applied = report.applied.len(),
                    failed = report.failed.len(),
                    "Migrations run"
                );
            }
            Ok(_) => {}
            Err(e) => tracing::error!(path = %self.path, error = %e, "Migration run failed"),
        }
    }

    fn execute(&mut self, statement: &SqlStatement) -> Result<usize> {
        self.with_statement(statement, |stmt| Ok(stmt.raw_execute()?))
    }

    fn query(&mut self, statement: &SqlStatement) -> Result<Vec<Row>> {
        self.with_statement(statement, |stmt| {
            let columns: Vec<String> =
                stmt.column_names().into_iter().map(String::from).collect();
            let mut rows = stmt.raw_query();
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let mut map = Row::with_capacity(columns.len());
                for (i, name) in columns.iter().enumerate() {
                    map.insert(name.clone(), Value::from_column(row.get_ref(i)?));
                }
                out.push(map);
            }
            Ok(out)
        })
    }

    /// Compile or reuse the statement, bind, run `f`, then keep the statement
    /// (reset by rusqlite after stepping) or finalize it.
    fn with_statement<T>(
        &mut self,
        statement: &SqlStatement,
        f: impl FnOnce(&mut Statement<'conn>) -> Result<T>,
    ) -> Result<T> {
        let compile_error = |source| DatabaseError::Compile {
            sql: statement.sql.clone(),
            source,
        };

        if statement.cache {
            let stmt = self
                .cache
                .get_or_compile(&statement.sql)
                .map_err(compile_error)?;
            bind(stmt, &statement.bindings)?;
            f(stmt)
        } else {
            let mut stmt = self.conn.prepare(&statement.sql).map_err(compile_error)?;
            bind(&mut stmt, &statement.bindings)?;
            let result = f(&mut stmt);
            if let Err(e) = stmt.finalize() {
                tracing::warn!(path = %self.path, error = %e, "Statement finalize failed");
            }
            result
        }
    }
}

/// Bind every parameter of `stmt`; indices missing from `bindings` get NULL.
fn bind(stmt: &mut Statement<'_>, bindings: &Bindings) -> Result<()> {
    let count = stmt.parameter_count();
    if let Some(&index) = bindings.values.keys().find(|&&i| i == 0 || i > count) {
        return Err(DatabaseError::Bind {
            index,
            reason: format!("statement has {count} parameters"),
        });
    }

    for index in 1..=count {
        let value = bindings.get(index).unwrap_or(&Value::Null);
        stmt.raw_bind_parameter(index, value).map_err(|e| DatabaseError::Bind {
            index,
            reason: e.to_string(),
        })?;
    }
    Ok(())
}
