//! SQLite integration and utilities for the Runar ecosystem.
//!
//! # Intention
//!
//! - Provide a single, serialized access path to one SQLite database.
//! - Own the connection, its compiled statements and its migrations in one place.
//! - Keep at most one live handle per database file within a registry.
//!
//! # Architectural Boundaries
//!
//! - Only SQLite/database code belongs here.
//! - No business logic or unrelated utilities.
//! - SQL is passed through verbatim; no query building or schema diffing.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use rust_sqlite::sqlite::{
//!     Bindings, DatabaseHandle, InstanceRegistry, MigrationSet, StoragePath,
//! };
//!
//! let registry = Arc::new(InstanceRegistry::new());
//! let migrations = MigrationSet::new().with_migration(1, "ALTER TABLE t ADD COLUMN w TEXT");
//! let db = DatabaseHandle::open(
//!     &registry,
//!     StoragePath::Memory,
//!     "CREATE TABLE t(id INTEGER, v TEXT)",
//!     migrations,
//! )?;
//!
//! db.run_non_query(
//!     "INSERT INTO t(id, v) VALUES (?, ?)",
//!     &Bindings::positional(["7", "x"]),
//!     true,
//! );
//! db.run_query("SELECT * FROM t", &Bindings::new(), true, |row| println!("{row:?}"));
//! db.close();
//! # Ok::<(), rust_sqlite::sqlite::DatabaseError>(())
//! ```

pub mod sqlite;
