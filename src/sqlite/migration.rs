//! Versioned schema migrations tracked in `PRAGMA user_version`.
//!
//! Migrations are best-effort: a failing migration is logged and skipped, and
//! later migrations are still attempted. The persisted version becomes the
//! version of the last migration that succeeded, which can leave the schema
//! partially migrated. Callers that need all-or-nothing upgrades should put
//! the whole upgrade into one migration script.

use std::collections::BTreeMap;
use std::ops::Bound;

use rusqlite::Connection;
use serde::Deserialize;

/// Ordered `version -> SQL` pairs. Versions are unique; iteration is ascending.
#[derive(Debug, Default, Clone, PartialEq, Deserialize)]
#[serde(transparent)]
pub struct MigrationSet {
    migrations: BTreeMap<i32, String>,
}

impl MigrationSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the migration for `version`, replacing any previous one.
    pub fn with_migration(mut self, version: i32, sql: impl Into<String>) -> Self {
        self.migrations.insert(version, sql.into());
        self
    }

    pub fn get(&self, version: i32) -> Option<&str> {
        self.migrations.get(&version).map(String::as_str)
    }

    /// Highest version in the set.
    pub fn latest_version(&self) -> Option<i32> {
        self.migrations.keys().next_back().copied()
    }

    /// Migrations strictly newer than `version`, ascending.
    pub fn pending(&self, version: i32) -> impl Iterator<Item = (i32, &str)> {
        self.migrations
            .range((Bound::Excluded(version), Bound::Unbounded))
            .map(|(v, sql)| (*v, sql.as_str()))
    }

    pub fn len(&self) -> usize {
        self.migrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }
}

impl<S: Into<String>> FromIterator<(i32, S)> for MigrationSet {
    fn from_iter<I: IntoIterator<Item = (i32, S)>>(iter: I) -> Self {
        Self {
            migrations: iter.into_iter().map(|(v, sql)| (v, sql.into())).collect(),
        }
    }
}

/// Outcome of one migration run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MigrationReport {
    /// `user_version` before the run
    pub from: i32,
    /// `user_version` after the run
    pub to: i32,
    /// Versions that succeeded, in the order they ran
    pub applied: Vec<i32>,
    /// Versions that failed, with the engine's message
    pub failed: Vec<(i32, String)>,
}

impl MigrationReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

pub fn user_version(conn: &Connection) -> rusqlite::Result<i32> {
    conn.pragma_query_value(None, "user_version", |row| row.get(0))
}

pub fn set_user_version(conn: &Connection, version: i32) -> rusqlite::Result<()> {
    conn.pragma_update(None, "user_version", version)
}

/// Engine-managed counter bumped on every schema change. Zero means the
/// database has never had a schema.
pub fn schema_version(conn: &Connection) -> rusqlite::Result<i32> {
    conn.pragma_query_value(None, "schema_version", |row| row.get(0))
}

/// Apply every migration newer than the current `user_version`.
///
/// Only reading or writing the version itself is reported as an error;
/// failing migrations end up in [`MigrationReport::failed`].
pub fn run_migrations(
    conn: &Connection,
    migrations: &MigrationSet,
) -> rusqlite::Result<MigrationReport> {
    let current = user_version(conn)?;
    let mut report = MigrationReport {
        from: current,
        to: current,
        ..MigrationReport::default()
    };

    for (version, sql) in migrations.pending(current) {
        match conn.execute_batch(sql) {
            Ok(()) => {
                tracing::debug!(version, "Migration applied");
                report.to = version;
                report.applied.push(version);
            }
            Err(e) => {
                // Later migrations still run; see module docs.
                tracing::warn!(version, error = %e, "Migration failed, continuing");
                report.failed.push((version, e.to_string()));
            }
        }
    }

    if report.to != current {
        set_user_version(conn, report.to)?;
    }
    Ok(report)
}
