//! Compiled statement cache.
//!
//! Statements borrow the connection they were compiled on, so a cache can
//! never be used after its connection has been closed; the worker finalizes
//! the cache and drops it before calling `Connection::close`.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use rusqlite::{Connection, Statement};

/// Maps exact SQL text to a compiled statement on one connection.
pub struct StatementCache<'conn> {
    conn: &'conn Connection,
    statements: HashMap<String, Statement<'conn>>,
}

impl<'conn> StatementCache<'conn> {
    pub fn new(conn: &'conn Connection) -> Self {
        Self {
            conn,
            statements: HashMap::new(),
        }
    }

    /// Return the cached statement for `sql`, compiling it on first use.
    ///
    /// The key is the SQL text as given; no whitespace or case normalization.
    pub fn get_or_compile(&mut self, sql: &str) -> rusqlite::Result<&mut Statement<'conn>> {
        let conn = self.conn;
        match self.statements.entry(sql.to_string()) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let statement = conn.prepare(sql)?;
                tracing::debug!(sql, "Statement compiled and cached");
                Ok(entry.insert(statement))
            }
        }
    }

    /// Evict and finalize the statement for `sql`. Returns `false` if it was
    /// not cached.
    pub fn remove(&mut self, sql: &str) -> bool {
        match self.statements.remove(sql) {
            Some(statement) => {
                if let Err(e) = statement.finalize() {
                    tracing::warn!(error = %e, sql, "Statement finalize failed");
                }
                true
            }
            None => false,
        }
    }

    /// Finalize every cached statement, leaving the cache empty.
    ///
    /// Returns the number of statements whose finalization reported an error.
    pub fn finalize_all(&mut self) -> usize {
        let mut failures = 0;
        for (sql, statement) in self.statements.drain() {
            if let Err(e) = statement.finalize() {
                tracing::warn!(error = %e, sql, "Statement finalize failed");
                failures += 1;
            }
        }
        failures
    }

    pub fn contains(&self, sql: &str) -> bool {
        self.statements.contains_key(sql)
    }

    pub fn len(&self) -> usize {
        self.statements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }
}
