use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::edge::EdgeMode;

/// Why a routing decision was made; recorded alongside every routing
/// event so the audit trail can explain, not just record, a traversal.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RoutingReason {
    ConfigGate { expression_result: String },
    TransformError { error_reason: String, retryable: bool },
    SourceQuarantine { validation_error: String },
}

/// Recorded per edge traversal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingEvent {
    pub state_id: Uuid,
    pub edge_id: String,
    pub mode: EdgeMode,
    pub reason: RoutingReason,
}
