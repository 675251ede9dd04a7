//! Serialized SQLite access.
//!
//! # Components
//!
//! - [`DatabaseHandle`]: owns one connection and runs every operation on a
//!   private worker thread, in submission order
//! - [`StatementCache`]: compiled statements keyed by SQL text, tied to the
//!   lifetime of their connection
//! - [`MigrationSet`] / [`run_migrations`]: versioned migrations tracked in
//!   `PRAGMA user_version`
//! - [`InstanceRegistry`]: at most one live handle per database file
//! - [`DatabaseConfig`] / [`StoragePath`]: where the database lives and how it
//!   is opened

mod cache;
mod config;
mod error;
mod handle;
mod migration;
mod registry;
mod value;
mod worker;

pub use cache::StatementCache;
pub use config::{DatabaseConfig, StoragePath, MEMORY_PATH};
pub use error::{DatabaseError, Result};
pub use handle::DatabaseHandle;
pub use migration::{
    run_migrations, schema_version, set_user_version, user_version, MigrationReport, MigrationSet,
};
pub use registry::InstanceRegistry;
pub use value::{Bindings, QueryRows, Row, Value};
