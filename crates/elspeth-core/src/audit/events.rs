//! Audit event kinds and the `AuditEvent` envelope.
//!
//! Every row pulled, token created, node state transition, routing
//! decision, outcome, artifact, batch, and checkpoint is represented as
//! one `AuditEvent`. The append-only log these form is the audit schema
//! expressed as events rather than as rows in eleven tables; a
//! recorder backend (e.g. `elspeth-persistence`) is free to fan each
//! event out into its own table.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{EdgeMode, Outcome, RoutingReason};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AuditEventKind {
    RunStarted {
        pipelining_config: serde_json::Value,
    },
    RunCompleted,
    RunFailed {
        cause: String,
    },
    RowPulled {
        row_id: Uuid,
        sequence_number: u64,
        content_hash: String,
    },
    TokenCreated {
        token_id: Uuid,
        row_id: Uuid,
        parent_token_ids: Vec<Uuid>,
    },
    NodeStateBegin {
        state_id: Uuid,
        token_id: Uuid,
        node_id: String,
        attempt: u32,
    },
    NodeStateComplete {
        state_id: Uuid,
        status: NodeStateStatus,
    },
    RoutingEvent {
        state_id: Uuid,
        edge_id: String,
        mode: EdgeMode,
        reason: RoutingReason,
    },
    TokenOutcome {
        outcome_id: Uuid,
        token_id: Uuid,
        outcome: Outcome,
    },
    Artifact {
        artifact_id: Uuid,
        token_id: Uuid,
        sink_name: String,
        content_hash: String,
        size_bytes: u64,
    },
    Batch {
        batch_id: Uuid,
        aggregation_node_id: String,
        status: BatchStatus,
        trigger_type: String,
    },
    BatchMember {
        batch_id: Uuid,
        token_id: Uuid,
        ordinal: u32,
    },
    Checkpoint {
        checkpoint_id: Uuid,
        released_through_seq: u64,
        state_blob: serde_json::Value,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStateStatus {
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Open,
    Flushed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub seq: u64,
    pub run_id: Uuid,
    pub kind: AuditEventKind,
    pub ts: DateTime<Utc>,
}
