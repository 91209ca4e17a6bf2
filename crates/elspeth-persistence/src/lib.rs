//! elspeth-persistence
//!
//! Postgres (Diesel) backend for `elspeth_core::audit::AuditRecorder`:
//! the durable side of the eleven-table audit schema.
//!
//! Modules:
//! - `pg`: the Diesel/r2d2 `PgAuditRecorder` and pool helpers.
//! - `migrations`: embedded Diesel migration runner.
//! - `config`: `.env`/environment-backed connection configuration.
//! - `schema`: hand-written Diesel table declarations.

pub mod config;
pub mod error;
pub mod migrations;
pub mod pg;
pub mod schema;

pub use config::init_dotenv;
pub use error::PersistenceError;
pub use pg::{build_dev_pool_from_env, build_pool, ConnectionProvider, PgAuditRecorder, PgPool, PoolProvider};
