//! Checkpoint snapshot recorded periodically as the `released_through_seq`
//! cursor advances. Resume doesn't try to restore executor-internal
//! buffers exactly (an open aggregation batch, a half-arrived coalesce
//! join) — it replays rows after `released_through_seq` from the
//! original source data and lets them re-accumulate. `inflight_row_refs`
//! and the waiting/draft snapshots below exist so an operator inspecting
//! a checkpoint can see what was mid-flight, not so resume can restore
//! it bit-for-bit.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One row that had been pulled but not yet released when the checkpoint
/// was taken.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InFlightRowRef {
    pub seq: u64,
    pub row_id: Uuid,
}

/// A seq sitting behind `released_through_seq` with at least one
/// recorded leaf outcome already, but not yet fully resolved (still
/// waiting on a sibling branch, an open aggregation, or a coalesce).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitingSeqSnapshot {
    pub seq: u64,
    pub recorded_outcomes: usize,
}

/// An aggregation's open batch at snapshot time. Member row data is not
/// captured here — resume re-derives batch membership by re-pulling and
/// re-processing the member rows from source, not by restoring the
/// buffer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DraftBatchSnapshot {
    pub aggregation_node_id: String,
    pub batch_id: Uuid,
    pub member_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointState {
    pub released_through_seq: u64,
    pub inflight_row_refs: Vec<InFlightRowRef>,
    pub waiting_tokens: Vec<WaitingSeqSnapshot>,
    pub draft_batches: Vec<DraftBatchSnapshot>,
    pub pending_fork_groups: Vec<Uuid>,
    pub pending_coalesce_groups: Vec<Uuid>,
}
