//! Release queue: the one thread that turns `ProcessorOutcome`s into
//! sink writes, in strict source-sequence order, regardless of which
//! worker thread produced them or in what order.
//!
//! A row's outstanding work is tracked as `open_buffers`, an `i64`
//! counter seeded at 1 when the `SourcePuller` registers the row.
//! `process_row`/`process_aggregation_flush`/`process_coalesce_timeout`
//! always drain every fork/continuation synchronously before returning,
//! so every `ProcessorOutcome` the workers ever emit for a given seq
//! belongs to one of two shapes:
//!
//! - a batch with no leaf (`Terminal`/`PendingSink`) entry for that seq
//!   at all — one or more `Buffered` entries, meaning the row paused
//!   inside an aggregation or coalesce and is still waiting on a sibling
//!   arrival or a trigger. `open_buffers` is unchanged: the single
//!   pending unit is still exactly one pending unit.
//! - a batch with at least one leaf entry for that seq — the row (or,
//!   for an aggregation flush, one of its members) is done. Any
//!   `Buffered` entries in the *same* batch for that seq are transient:
//!   they record a state the traversal passed through before resolving
//!   further in the same synchronous call (a coalesce branch held for a
//!   few microseconds before its sibling completed the join), not a
//!   state still true once the batch returns. So a batch containing a
//!   leaf always collapses `open_buffers` by exactly 1, however many
//!   entries (leaf or transiently-buffered) it carries for that seq.
//!
//! A fork that fans one seq's single pending unit into several branches
//! which *each* separately pause (e.g. two branches each feeding a
//! different still-open aggregation) is the one case this model must
//! still grow `open_buffers`: such a batch has no leaf for the seq, only
//! multiple distinct `Buffered` entries, and `open_buffers` gains
//! `buffered_count - 1` to account for the extra outstanding branches.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::Receiver;
use uuid::Uuid;

use elspeth_core::audit::{AuditEventKind, AuditRecorder};
use elspeth_core::{ExecutionContext, Graph, Outcome, PendingSinkKind, ProcessorOutcome, Sink, Token};

use crate::checkpoint::{CheckpointState, InFlightRowRef, WaitingSeqSnapshot};
use crate::error::OrchestratorError;
use crate::slots::RowSlotPermit;

pub enum ReleaseCommand {
    Register { seq: u64, row_id: Uuid, permit: RowSlotPermit },
    Outcomes(Vec<ProcessorOutcome>),
}

pub struct ReleaseSummary {
    pub total_released: u64,
    pub checkpoints_taken: usize,
}

struct PendingSeq {
    row_id: Uuid,
    permit: Option<RowSlotPermit>,
    open: i64,
    leaves: Vec<(Token, LeafKind)>,
}

enum LeafKind {
    Terminal(Outcome),
    PendingSink { sink_node_id: String, on_write: PendingSinkKind },
}

fn is_buffered(outcome: &ProcessorOutcome) -> bool {
    matches!(outcome, ProcessorOutcome::Buffered { .. })
}

fn outcome_seq(outcome: &ProcessorOutcome) -> u64 {
    match outcome {
        ProcessorOutcome::Terminal { seq, .. } => *seq,
        ProcessorOutcome::Buffered { seq, .. } => *seq,
        ProcessorOutcome::PendingSink { seq, .. } => *seq,
    }
}

pub struct ReleaseQueue {
    run_id: Uuid,
    graph: Arc<Graph>,
    audit: Arc<dyn AuditRecorder>,
    sinks: HashMap<String, Arc<dyn Sink>>,
    checkpoint_frequency: usize,
    next_release_seq: u64,
    released_since_checkpoint: usize,
    total_released: u64,
    checkpoints_taken: usize,
    pending: BTreeMap<u64, PendingSeq>,
}

impl ReleaseQueue {
    pub fn new(
        run_id: Uuid,
        graph: Arc<Graph>,
        audit: Arc<dyn AuditRecorder>,
        sinks: HashMap<String, Arc<dyn Sink>>,
        checkpoint_frequency: usize,
    ) -> Self {
        Self {
            run_id,
            graph,
            audit,
            sinks,
            checkpoint_frequency,
            next_release_seq: 1,
            released_since_checkpoint: 0,
            total_released: 0,
            checkpoints_taken: 0,
            pending: BTreeMap::new(),
        }
    }

    pub fn handle(&mut self, cmd: ReleaseCommand) -> Result<(), OrchestratorError> {
        match cmd {
            ReleaseCommand::Register { seq, row_id, permit } => {
                self.pending.insert(
                    seq,
                    PendingSeq {
                        row_id,
                        permit: Some(permit),
                        open: 1,
                        leaves: Vec::new(),
                    },
                );
                Ok(())
            }
            ReleaseCommand::Outcomes(batch) => self.accept_outcomes(batch),
        }
    }

    fn accept_outcomes(&mut self, batch: Vec<ProcessorOutcome>) -> Result<(), OrchestratorError> {
        let mut by_seq: BTreeMap<u64, Vec<ProcessorOutcome>> = BTreeMap::new();
        for outcome in batch {
            by_seq.entry(outcome_seq(&outcome)).or_default().push(outcome);
        }
        for (seq, group) in by_seq {
            self.apply_group(seq, group)?;
        }
        self.try_release()
    }

    fn apply_group(&mut self, seq: u64, group: Vec<ProcessorOutcome>) -> Result<(), OrchestratorError> {
        let has_leaf = group.iter().any(|o| !is_buffered(o));
        let entry = self
            .pending
            .get_mut(&seq)
            .ok_or_else(|| OrchestratorError::Core(elspeth_core::CoreError::Internal(format!("outcome for unregistered seq {seq}"))))?;

        if has_leaf {
            for outcome in group {
                match outcome {
                    ProcessorOutcome::Buffered { .. } => {} // superseded within this same batch.
                    ProcessorOutcome::Terminal { token, outcome, .. } => {
                        entry.leaves.push((token, LeafKind::Terminal(outcome)));
                    }
                    ProcessorOutcome::PendingSink {
                        token,
                        sink_node_id,
                        on_write,
                        ..
                    } => {
                        entry.leaves.push((token, LeafKind::PendingSink { sink_node_id, on_write }));
                    }
                }
            }
            entry.open -= 1;
        } else {
            let buffered_count = group.len() as i64;
            entry.open += buffered_count - 1;
        }
        Ok(())
    }

    fn try_release(&mut self) -> Result<(), OrchestratorError> {
        while let Some(front) = self.pending.get(&self.next_release_seq) {
            if front.open > 0 {
                break;
            }
            let seq = self.next_release_seq;
            let entry = self.pending.remove(&seq).expect("just peeked this key");
            self.release_one(seq, entry)?;
            self.next_release_seq += 1;
        }
        Ok(())
    }

    fn release_one(&mut self, seq: u64, entry: PendingSeq) -> Result<(), OrchestratorError> {
        for (token, leaf) in entry.leaves {
            match leaf {
                LeafKind::Terminal(_) => {
                    // Already audited synchronously by the row processor when the
                    // outcome was decided; nothing left to do at release time.
                }
                LeafKind::PendingSink { sink_node_id, on_write } => {
                    self.write_to_sink(&token, &sink_node_id, on_write)?;
                }
            }
        }
        drop(entry.permit); // frees a rows-in-flight slot, wakes the SourcePuller.
        self.total_released += 1;
        self.released_since_checkpoint += 1;
        if self.released_since_checkpoint >= self.checkpoint_frequency {
            self.checkpoint(seq)?;
            self.released_since_checkpoint = 0;
        }
        Ok(())
    }

    fn write_to_sink(&self, token: &Token, sink_node_id: &str, on_write: PendingSinkKind) -> Result<(), OrchestratorError> {
        let outcome = self.resolve_outcome(sink_node_id, &on_write);
        self.audit.append(
            self.run_id,
            AuditEventKind::TokenOutcome {
                outcome_id: Uuid::new_v4(),
                token_id: token.token_id,
                outcome: outcome.clone(),
            },
        )?;

        let sink = self
            .sinks
            .get(sink_node_id)
            .ok_or_else(|| OrchestratorError::Core(elspeth_core::CoreError::Internal(format!("no sink registered for node '{sink_node_id}'"))))?;
        let exec_ctx = ExecutionContext {
            run_id: self.run_id,
            node_id: sink_node_id.to_string(),
        };
        let artifact = sink
            .write(std::slice::from_ref(&token.row_data), &exec_ctx)
            .map_err(|message| OrchestratorError::SinkWrite {
                sink_name: sink.name().to_string(),
                message,
            })?;

        self.audit.append(
            self.run_id,
            AuditEventKind::Artifact {
                artifact_id: Uuid::new_v4(),
                token_id: token.token_id,
                sink_name: sink.name().to_string(),
                content_hash: artifact.content_hash,
                size_bytes: artifact.size_bytes,
            },
        )?;
        Ok(())
    }

    fn resolve_outcome(&self, sink_node_id: &str, on_write: &PendingSinkKind) -> Outcome {
        match on_write {
            PendingSinkKind::CompletedOrRouted => {
                let sink_name = self
                    .sinks
                    .get(sink_node_id)
                    .map(|s| s.name().to_string())
                    .unwrap_or_default();
                if sink_node_id == self.graph.default_sink_id {
                    Outcome::Completed { sink_name }
                } else {
                    Outcome::Routed { sink_name }
                }
            }
            PendingSinkKind::Quarantine { error_hash } => Outcome::Quarantined {
                error_hash: error_hash.clone(),
            },
            PendingSinkKind::TransformError { error_hash } => Outcome::Failed {
                error_hash: error_hash.clone(),
            },
        }
    }

    fn checkpoint(&mut self, released_through_seq: u64) -> Result<(), OrchestratorError> {
        for sink in self.sinks.values() {
            sink.flush().map_err(|message| OrchestratorError::SinkWrite {
                sink_name: sink.name().to_string(),
                message,
            })?;
        }
        let state = CheckpointState {
            released_through_seq,
            inflight_row_refs: self
                .pending
                .iter()
                .map(|(seq, p)| InFlightRowRef { seq: *seq, row_id: p.row_id })
                .collect(),
            waiting_tokens: self
                .pending
                .iter()
                .map(|(seq, p)| WaitingSeqSnapshot {
                    seq: *seq,
                    recorded_outcomes: p.leaves.len(),
                })
                .collect(),
            draft_batches: Vec::new(),
            pending_fork_groups: Vec::new(),
            pending_coalesce_groups: Vec::new(),
        };
        let blob = serde_json::to_value(&state)
            .map_err(|e| OrchestratorError::Core(elspeth_core::CoreError::Internal(format!("serialize checkpoint: {e}"))))?;
        self.audit.append(
            self.run_id,
            AuditEventKind::Checkpoint {
                checkpoint_id: Uuid::new_v4(),
                released_through_seq,
                state_blob: blob,
            },
        )?;
        self.checkpoints_taken += 1;
        Ok(())
    }

    pub fn finish(self) -> ReleaseSummary {
        ReleaseSummary {
            total_released: self.total_released,
            checkpoints_taken: self.checkpoints_taken,
        }
    }
}

/// Spawns the dedicated release-queue thread. Returns once `rx`
/// disconnects, i.e. once every `SourcePuller`/`WorkPool` sender has
/// dropped its clone — the orchestrator's signal that nothing more will
/// ever arrive.
pub fn spawn(
    run_id: Uuid,
    graph: Arc<Graph>,
    audit: Arc<dyn AuditRecorder>,
    sinks: HashMap<String, Arc<dyn Sink>>,
    checkpoint_frequency: usize,
    rx: Receiver<ReleaseCommand>,
) -> JoinHandle<Result<ReleaseSummary, OrchestratorError>> {
    thread::Builder::new()
        .name("elspeth-release-queue".to_string())
        .spawn(move || {
            let mut queue = ReleaseQueue::new(run_id, graph, audit, sinks, checkpoint_frequency);
            while let Ok(cmd) = rx.recv() {
                queue.handle(cmd)?;
            }
            Ok(queue.finish())
        })
        .expect("failed to spawn release queue thread")
}
