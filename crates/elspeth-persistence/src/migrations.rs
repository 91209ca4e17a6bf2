//! Wrapper around running the crate's embedded migrations.

use diesel::pg::PgConnection;
use diesel::connection::SimpleConnection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use crate::error::PersistenceError;

// Migrations live under `migrations/` in this crate; embedded at compile time.
pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!();

pub fn run_pending_migrations(conn: &mut PgConnection) -> Result<(), PersistenceError> {
    conn.batch_execute("CREATE EXTENSION IF NOT EXISTS pgcrypto;").ok();
    conn.run_pending_migrations(MIGRATIONS)
        .map(|_| ())
        .map_err(|e| PersistenceError::Unknown(format!("migration error: {e}")))
}
