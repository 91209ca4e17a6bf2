//! elspeth-infra: picks the `AuditRecorder` backend a run uses.
//!
//! Without the `pg` feature, every run is backed by
//! `elspeth_core::audit::InMemoryAuditRecorder` — enough for the demo
//! binary and for tests. With `pg` enabled, `build_audit_recorder`
//! instead loads `DATABASE_URL` from the environment (via `.env`, same
//! convention as `elspeth-persistence::config`), builds a migrated
//! connection pool, and returns the durable `PgAuditRecorder`.

use std::sync::Arc;

use elspeth_core::audit::AuditRecorder;

#[cfg(not(feature = "pg"))]
pub fn build_audit_recorder() -> Arc<dyn AuditRecorder> {
    Arc::new(elspeth_core::audit::InMemoryAuditRecorder::new())
}

#[cfg(feature = "pg")]
pub fn build_audit_recorder() -> Result<Arc<dyn AuditRecorder>, elspeth_persistence::PersistenceError> {
    let pool = elspeth_persistence::build_dev_pool_from_env()?;
    let recorder = elspeth_persistence::PgAuditRecorder::new(elspeth_persistence::PoolProvider { pool });
    Ok(Arc::new(recorder))
}
