//! Postgres (Diesel) backend for `elspeth_core::audit::AuditRecorder`.
//!
//! Design:
//! - `audit_log` is the authoritative append-only sequence: every event
//!   is written there first, inside the same transaction that fans it
//!   out into whichever of the eleven domain tables it belongs to.
//!   `list` replays straight from `audit_log`, so the domain tables can
//!   be queried directly for reporting without ever being the source of
//!   truth for ordering.
//! - `append_atomic` runs the whole batch in one transaction: fork
//!   children and the parent's `FORKED` outcome, or every row failing
//!   together, are never observed half-written.
//! - Thread safety: Diesel connections are not `Sync`; each call checks
//!   a connection out of the r2d2 pool for the duration of the
//!   transaction, so concurrent workers serialize at the database, not
//!   in this process.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::r2d2::{self, ConnectionManager};
use log::warn;
use uuid::Uuid;

use elspeth_core::audit::{AuditEvent, AuditEventKind, AuditRecorder, BatchStatus, NodeStateStatus};
use elspeth_core::errors::CoreError;
use elspeth_core::model::{EdgeMode, Outcome};

use crate::error::PersistenceError;
use crate::migrations::run_pending_migrations;
use crate::schema::{artifacts, audit_log, batch_members, batches, checkpoints, node_states, nodes, routing_events,
                     runs, rows as row_table, token_outcomes, token_parents, tokens};

/// Type alias for the r2d2 pool of Postgres connections.
pub type PgPool = r2d2::Pool<ConnectionManager<PgConnection>>;

/// Abstract connection source, so tests can swap in a fake without
/// depending on r2d2/a live database.
pub trait ConnectionProvider: Send + Sync + 'static {
    fn connection(&self) -> Result<r2d2::PooledConnection<ConnectionManager<PgConnection>>, PersistenceError>;
}

/// `ConnectionProvider` backed by a real `PgPool`.
pub struct PoolProvider {
    pub pool: PgPool,
}

impl ConnectionProvider for PoolProvider {
    fn connection(&self) -> Result<r2d2::PooledConnection<ConnectionManager<PgConnection>>, PersistenceError> {
        self.pool.get().map_err(|e| PersistenceError::TransientIo(format!("pool error: {e}")))
    }
}

fn is_retryable(e: &PersistenceError) -> bool {
    match e {
        PersistenceError::SerializationConflict => true,
        PersistenceError::TransientIo(_) => true,
        PersistenceError::Unknown(msg) => {
            let m = msg.to_lowercase();
            m.contains("deadlock detected")
                || m.contains("could not serialize access due to concurrent update")
                || m.contains("terminating connection due to administrator command")
                || m.contains("connection closed")
                || m.contains("connection refused")
                || m.contains("timeout")
        }
        _ => false,
    }
}

/// Small retry/backoff wrapper, mirrored from the rest of the workspace's
/// persistence writers: up to 3 attempts, 15ms/30ms/45ms backoff.
fn with_retry<F, T>(mut f: F) -> Result<T, PersistenceError>
where
    F: FnMut() -> Result<T, PersistenceError>,
{
    let mut attempts = 0;
    loop {
        match f() {
            Err(e) if is_retryable(&e) && attempts < 3 => {
                let delay_ms = 15 * ((attempts + 1) as u64);
                warn!("retryable persistence error (attempt {}): {e:?} -> sleeping {delay_ms}ms", attempts + 1);
                std::thread::sleep(std::time::Duration::from_millis(delay_ms));
                attempts += 1;
            }
            r => return r,
        }
    }
}

fn edge_mode_str(mode: EdgeMode) -> &'static str {
    match mode {
        EdgeMode::Move => "move",
        EdgeMode::Copy => "copy",
        EdgeMode::Divert => "divert",
    }
}

fn node_state_status_str(status: NodeStateStatus) -> &'static str {
    match status {
        NodeStateStatus::Completed => "completed",
        NodeStateStatus::Failed => "failed",
    }
}

fn batch_status_str(status: BatchStatus) -> &'static str {
    match status {
        BatchStatus::Open => "open",
        BatchStatus::Flushed => "flushed",
        BatchStatus::Failed => "failed",
    }
}

fn kind_tag(kind: &AuditEventKind) -> &'static str {
    match kind {
        AuditEventKind::RunStarted { .. } => "run_started",
        AuditEventKind::RunCompleted => "run_completed",
        AuditEventKind::RunFailed { .. } => "run_failed",
        AuditEventKind::RowPulled { .. } => "row_pulled",
        AuditEventKind::TokenCreated { .. } => "token_created",
        AuditEventKind::NodeStateBegin { .. } => "node_state_begin",
        AuditEventKind::NodeStateComplete { .. } => "node_state_complete",
        AuditEventKind::RoutingEvent { .. } => "routing_event",
        AuditEventKind::TokenOutcome { .. } => "token_outcome",
        AuditEventKind::Artifact { .. } => "artifact",
        AuditEventKind::Batch { .. } => "batch",
        AuditEventKind::BatchMember { .. } => "batch_member",
        AuditEventKind::Checkpoint { .. } => "checkpoint",
    }
}

/// Writes one event's payload into `audit_log` and fans it out into the
/// domain table(s) it belongs to. Runs inside the caller's transaction.
fn apply_event(conn: &mut PgConnection, run_id: Uuid, seq: i64, ts: DateTime<Utc>, kind: &AuditEventKind) -> Result<(), diesel::result::Error> {
    let payload = serde_json::to_value(kind).expect("serialize AuditEventKind");
    diesel::insert_into(audit_log::table)
        .values((
            audit_log::run_id.eq(run_id),
            audit_log::seq.eq(seq),
            audit_log::kind_tag.eq(kind_tag(kind)),
            audit_log::payload.eq(&payload),
            audit_log::ts.eq(ts),
        ))
        .execute(conn)?;

    match kind {
        AuditEventKind::RunStarted { pipelining_config } => {
            diesel::insert_into(runs::table)
                .values((
                    runs::run_id.eq(run_id),
                    runs::status.eq("running"),
                    runs::started_at.eq(ts),
                    runs::pipelining_config.eq(pipelining_config),
                ))
                .execute(conn)?;
        }
        AuditEventKind::RunCompleted => {
            diesel::update(runs::table.find(run_id))
                .set((runs::status.eq("completed"), runs::completed_at.eq(ts)))
                .execute(conn)?;
        }
        AuditEventKind::RunFailed { cause } => {
            diesel::update(runs::table.find(run_id))
                .set((runs::status.eq("failed"), runs::completed_at.eq(ts), runs::failure_cause.eq(cause)))
                .execute(conn)?;
        }
        AuditEventKind::RowPulled { row_id, sequence_number, content_hash } => {
            diesel::insert_into(row_table::table)
                .values((
                    row_table::row_id.eq(row_id),
                    row_table::run_id.eq(run_id),
                    row_table::sequence_number.eq(*sequence_number as i64),
                    row_table::content_hash.eq(content_hash),
                ))
                .execute(conn)?;
        }
        AuditEventKind::TokenCreated { token_id, row_id, parent_token_ids } => {
            diesel::insert_into(tokens::table)
                .values((tokens::token_id.eq(token_id), tokens::run_id.eq(run_id), tokens::row_id.eq(row_id), tokens::created_at.eq(ts)))
                .execute(conn)?;
            for parent_token_id in parent_token_ids {
                diesel::insert_into(token_parents::table)
                    .values((
                        token_parents::token_id.eq(token_id),
                        token_parents::parent_token_id.eq(parent_token_id),
                        token_parents::run_id.eq(run_id),
                    ))
                    .execute(conn)?;
            }
        }
        AuditEventKind::NodeStateBegin { state_id, token_id, node_id, attempt } => {
            diesel::insert_into(node_states::table)
                .values((
                    node_states::state_id.eq(state_id),
                    node_states::run_id.eq(run_id),
                    node_states::token_id.eq(token_id),
                    node_states::node_id.eq(node_id),
                    node_states::status.eq("running"),
                    node_states::attempt.eq(*attempt as i32),
                    node_states::started_at.eq(ts),
                ))
                .execute(conn)?;
        }
        AuditEventKind::NodeStateComplete { state_id, status } => {
            diesel::update(node_states::table.filter(node_states::state_id.eq(state_id)).filter(node_states::run_id.eq(run_id)))
                .set((node_states::status.eq(node_state_status_str(*status)), node_states::completed_at.eq(ts)))
                .execute(conn)?;
        }
        AuditEventKind::RoutingEvent { state_id, edge_id, mode, reason } => {
            let reason_json = serde_json::to_value(reason).expect("serialize RoutingReason");
            diesel::insert_into(routing_events::table)
                .values((
                    routing_events::state_id.eq(state_id),
                    routing_events::edge_id.eq(edge_id),
                    routing_events::run_id.eq(run_id),
                    routing_events::mode.eq(edge_mode_str(*mode)),
                    routing_events::reason.eq(reason_json),
                    routing_events::recorded_at.eq(ts),
                ))
                .execute(conn)?;
        }
        AuditEventKind::TokenOutcome { outcome_id, token_id, outcome } => {
            let row = token_outcome_row(*outcome_id, run_id, *token_id, outcome, ts);
            diesel::insert_into(token_outcomes::table).values(&row).execute(conn)?;
        }
        AuditEventKind::Artifact { artifact_id, token_id, sink_name, content_hash, size_bytes } => {
            diesel::insert_into(artifacts::table)
                .values((
                    artifacts::artifact_id.eq(artifact_id),
                    artifacts::run_id.eq(run_id),
                    artifacts::token_id.eq(token_id),
                    artifacts::sink_name.eq(sink_name),
                    artifacts::content_hash.eq(content_hash),
                    artifacts::size_bytes.eq(*size_bytes as i64),
                    artifacts::created_at.eq(ts),
                ))
                .execute(conn)?;
        }
        AuditEventKind::Batch { batch_id, aggregation_node_id, status, trigger_type } => {
            diesel::insert_into(batches::table)
                .values((
                    batches::batch_id.eq(batch_id),
                    batches::run_id.eq(run_id),
                    batches::aggregation_node_id.eq(aggregation_node_id),
                    batches::status.eq(batch_status_str(*status)),
                    batches::trigger_type.eq(trigger_type),
                    batches::created_at.eq(ts),
                ))
                .on_conflict(batches::batch_id)
                .do_update()
                .set(batches::status.eq(batch_status_str(*status)))
                .execute(conn)?;
        }
        AuditEventKind::BatchMember { batch_id, token_id, ordinal } => {
            diesel::insert_into(batch_members::table)
                .values((
                    batch_members::batch_id.eq(batch_id),
                    batch_members::token_id.eq(token_id),
                    batch_members::run_id.eq(run_id),
                    batch_members::ordinal.eq(*ordinal as i32),
                ))
                .execute(conn)?;
        }
        AuditEventKind::Checkpoint { checkpoint_id, released_through_seq, state_blob } => {
            diesel::insert_into(checkpoints::table)
                .values((
                    checkpoints::checkpoint_id.eq(checkpoint_id),
                    checkpoints::run_id.eq(run_id),
                    checkpoints::released_through_seq.eq(*released_through_seq as i64),
                    checkpoints::state_blob.eq(state_blob),
                    checkpoints::created_at.eq(ts),
                ))
                .execute(conn)?;
        }
    }
    Ok(())
}

#[derive(Insertable)]
#[diesel(table_name = token_outcomes)]
struct TokenOutcomeRow {
    outcome_id: Uuid,
    run_id: Uuid,
    token_id: Uuid,
    outcome: String,
    is_terminal: bool,
    sink_name: Option<String>,
    error_hash: Option<String>,
    fork_group_id: Option<Uuid>,
    join_group_id: Option<Uuid>,
    expand_group_id: Option<Uuid>,
    batch_id: Option<Uuid>,
    recorded_at: DateTime<Utc>,
}

fn token_outcome_row(outcome_id: Uuid, run_id: Uuid, token_id: Uuid, outcome: &Outcome, ts: DateTime<Utc>) -> TokenOutcomeRow {
    let mut row = TokenOutcomeRow {
        outcome_id,
        run_id,
        token_id,
        outcome: outcome.name().to_string(),
        is_terminal: outcome.is_terminal(),
        sink_name: None,
        error_hash: None,
        fork_group_id: None,
        join_group_id: None,
        expand_group_id: None,
        batch_id: None,
        recorded_at: ts,
    };
    match outcome {
        Outcome::Completed { sink_name } | Outcome::Routed { sink_name } => row.sink_name = Some(sink_name.clone()),
        Outcome::Failed { error_hash } | Outcome::Quarantined { error_hash } => row.error_hash = Some(error_hash.clone()),
        Outcome::Forked { fork_group_id } => row.fork_group_id = Some(*fork_group_id),
        Outcome::Coalesced { join_group_id } => row.join_group_id = Some(*join_group_id),
        Outcome::Expanded { expand_group_id } => row.expand_group_id = Some(*expand_group_id),
        Outcome::ConsumedInBatch { batch_id } | Outcome::Buffered { batch_id } => row.batch_id = Some(*batch_id),
    }
    row
}

#[derive(Queryable)]
struct AuditLogRow {
    run_id: Uuid,
    seq: i64,
    #[diesel(column_name = kind_tag)]
    _kind_tag: String,
    payload: serde_json::Value,
    ts: DateTime<Utc>,
}

/// Durable Postgres implementation of `AuditRecorder`. `P` is almost
/// always `PoolProvider`; the indirection exists so unit tests can swap
/// in a fake connection source without a live database.
pub struct PgAuditRecorder<P: ConnectionProvider> {
    provider: P,
}

impl<P: ConnectionProvider> PgAuditRecorder<P> {
    pub fn new(provider: P) -> Self {
        Self { provider }
    }

    /// Registers a node's identity for a run. Not part of `AuditRecorder`
    /// (nodes are static per-graph, not per-event); called once per node
    /// at run start, typically by the orchestrator right after
    /// `RunStarted` is appended.
    pub fn register_node(&self, run_id: Uuid, node_id: &str, node_type: &str, plugin_name: &str) -> Result<(), CoreError> {
        with_retry(|| {
            let mut conn = self.provider.connection()?;
            diesel::insert_into(nodes::table)
                .values((nodes::node_id.eq(node_id), nodes::run_id.eq(run_id), nodes::node_type.eq(node_type), nodes::plugin_name.eq(plugin_name)))
                .on_conflict((nodes::node_id, nodes::run_id))
                .do_nothing()
                .execute(&mut conn)
                .map(|_| ())
                .map_err(PersistenceError::from)
        })
        .map_err(|e| CoreError::AuditWriteFailed(e.to_string()))
    }

    fn next_seq(conn: &mut PgConnection, run_id: Uuid) -> Result<i64, diesel::result::Error> {
        let max: Option<i64> = audit_log::table
            .filter(audit_log::run_id.eq(run_id))
            .select(diesel::dsl::max(audit_log::seq))
            .first(conn)?;
        Ok(max.map(|s| s + 1).unwrap_or(0))
    }
}

impl<P: ConnectionProvider> AuditRecorder for PgAuditRecorder<P> {
    fn append(&self, run_id: Uuid, kind: AuditEventKind) -> Result<AuditEvent, CoreError> {
        let events = self.append_atomic(run_id, vec![kind])?;
        Ok(events.into_iter().next().expect("append_atomic returns one event per input kind"))
    }

    fn append_atomic(&self, run_id: Uuid, kinds: Vec<AuditEventKind>) -> Result<Vec<AuditEvent>, CoreError> {
        with_retry(|| {
            let mut conn = self.provider.connection()?;
            conn.build_transaction()
                .read_write()
                .run(|tx_conn| {
                    let mut seq = Self::next_seq(tx_conn, run_id)?;
                    let mut events = Vec::with_capacity(kinds.len());
                    for kind in &kinds {
                        let ts = Utc::now();
                        apply_event(tx_conn, run_id, seq, ts, kind)?;
                        events.push(AuditEvent { seq: seq as u64, run_id, kind: kind.clone(), ts });
                        seq += 1;
                    }
                    Ok::<Vec<AuditEvent>, diesel::result::Error>(events)
                })
                .map_err(PersistenceError::from)
        })
        .map_err(|e| CoreError::AuditWriteFailed(e.to_string()))
    }

    fn list(&self, run_id: Uuid) -> Vec<AuditEvent> {
        let rows: Vec<AuditLogRow> = with_retry(|| {
            let mut conn = self.provider.connection()?;
            audit_log::table
                .filter(audit_log::run_id.eq(run_id))
                .order(audit_log::seq.asc())
                .select((audit_log::run_id, audit_log::seq, audit_log::kind_tag, audit_log::payload, audit_log::ts))
                .load(&mut conn)
                .map_err(PersistenceError::from)
        })
        .unwrap_or_default();

        rows.into_iter()
            .filter_map(|row| {
                let kind: AuditEventKind = serde_json::from_value(row.payload).ok()?;
                Some(AuditEvent { seq: row.seq as u64, run_id: row.run_id, kind, ts: row.ts })
            })
            .collect()
    }
}

/// Builds a Postgres r2d2 pool and runs pending migrations once.
pub fn build_pool(database_url: &str, min_size: u32, max_size: u32) -> Result<PgPool, PersistenceError> {
    let validated_min = if min_size == 0 { 1 } else { min_size };
    let validated_max = if max_size == 0 { 1 } else { max_size };
    let final_min = validated_min.min(validated_max);
    let manager = ConnectionManager::<PgConnection>::new(database_url);
    let pool = r2d2::Pool::builder()
        .min_idle(Some(final_min))
        .max_size(validated_max)
        .build(manager)
        .map_err(|e| PersistenceError::TransientIo(format!("pool build: {e}")))?;
    {
        let mut conn = pool.get().map_err(|e| PersistenceError::TransientIo(format!("pool get for migrations: {e}")))?;
        run_pending_migrations(&mut conn)?;
    }
    Ok(pool)
}

/// Development helper: loads `.env`, reads `DATABASE_URL`/pool sizing,
/// and builds an already-migrated pool.
pub fn build_dev_pool_from_env() -> Result<PgPool, PersistenceError> {
    crate::config::init_dotenv();
    let cfg = crate::config::DbConfig::from_env();
    build_pool(&cfg.url, cfg.min_connections, cfg.max_connections)
}
