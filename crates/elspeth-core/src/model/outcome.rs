use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A token's life always ends in exactly one terminal outcome, or sits in
/// the single non-terminal state while an aggregation holds it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    Completed { sink_name: String },
    Routed { sink_name: String },
    Failed { error_hash: String },
    Quarantined { error_hash: String },
    Forked { fork_group_id: Uuid },
    Coalesced { join_group_id: Uuid },
    ConsumedInBatch { batch_id: Uuid },
    Expanded { expand_group_id: Uuid },
    Buffered { batch_id: Uuid },
}

impl Outcome {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Outcome::Buffered { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Outcome::Completed { .. } => "COMPLETED",
            Outcome::Routed { .. } => "ROUTED",
            Outcome::Failed { .. } => "FAILED",
            Outcome::Quarantined { .. } => "QUARANTINED",
            Outcome::Forked { .. } => "FORKED",
            Outcome::Coalesced { .. } => "COALESCED",
            Outcome::ConsumedInBatch { .. } => "CONSUMED_IN_BATCH",
            Outcome::Expanded { .. } => "EXPANDED",
            Outcome::Buffered { .. } => "BUFFERED",
        }
    }
}

/// Failure reasons recorded on `FAILED`/`QUARANTINED` outcomes and node
/// states; kept as a discriminated enum so the audit sweep can
/// distinguish policy failures from plugin bugs without string matching.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum FailureReason {
    TransformError { message: String },
    SourceQuarantine { message: String },
    ExpressionEvaluation { message: String },
    CoalesceTimeout,
    CoalesceBranchLoss,
    CoalesceQuorumUnmet { arrived: usize, required: usize },
    LateArrivalAfterMerge,
    PluginBug { message: String },
}
