//! Source puller: the one thread that drives a `Source`, mints the
//! monotonic sequence number and root `Token` for every row, and hands
//! each one off either to the `WorkPool` (a valid row) or straight to
//! the `ReleaseQueue` (a row the source itself quarantined — there is
//! nothing for a worker to process).

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{SendError, Sender};
use uuid::Uuid;

use elspeth_core::audit::{AuditEventKind, AuditRecorder};
use elspeth_core::hashing::{hash_str, hash_value};
use elspeth_core::{pending_quarantine_write, ExecutionContext, Outcome, ProcessorOutcome, Source, SourceRow, Token};
use elspeth_domain::{RowData, SchemaContract, SchemaMode};

use crate::error::OrchestratorError;
use crate::release::ReleaseCommand;
use crate::slots::RowSlots;

/// One valid row, ready for a `WorkPool` worker to run through
/// `process_row` starting at the graph's source node.
pub struct PullItem {
    pub seq: u64,
    pub token: Token,
    pub start_node_id: String,
}

pub struct PullerSummary {
    pub rows_pulled: u64,
    /// `row_id` for every seq pulled, so the end-of-source coalesce
    /// sweep (keyed by `row_id` in `CoalesceExecutor::pending_row_ids`)
    /// can recover the seq a `process_coalesce_timeout` result belongs
    /// to.
    pub seq_by_row_id: HashMap<Uuid, u64>,
}

#[allow(clippy::too_many_arguments)]
pub fn spawn(
    source: Arc<dyn Source>,
    run_id: Uuid,
    audit: Arc<dyn AuditRecorder>,
    start_node_id: String,
    sink_node_id_by_name: Arc<HashMap<String, String>>,
    row_slots: Arc<RowSlots>,
    work_tx: Sender<PullItem>,
    release_tx: Sender<ReleaseCommand>,
) -> JoinHandle<Result<PullerSummary, OrchestratorError>> {
    thread::Builder::new()
        .name("elspeth-source-puller".to_string())
        .spawn(move || {
            puller_loop(
                source,
                run_id,
                audit,
                start_node_id,
                sink_node_id_by_name,
                row_slots,
                work_tx,
                release_tx,
            )
        })
        .expect("failed to spawn source puller thread")
}

fn puller_loop(
    source: Arc<dyn Source>,
    run_id: Uuid,
    audit: Arc<dyn AuditRecorder>,
    start_node_id: String,
    sink_node_id_by_name: Arc<HashMap<String, String>>,
    row_slots: Arc<RowSlots>,
    work_tx: Sender<PullItem>,
    release_tx: Sender<ReleaseCommand>,
) -> Result<PullerSummary, OrchestratorError> {
    source.on_start();
    let source_node_ctx = ExecutionContext {
        run_id,
        node_id: start_node_id.clone(),
    };

    let mut rows_pulled = 0u64;
    let mut seq_by_row_id = HashMap::new();

    for row in source.load(&source_node_ctx) {
        let seq = rows_pulled + 1;
        rows_pulled = seq;
        let row_id = Uuid::new_v4();
        seq_by_row_id.insert(row_id, seq);

        let permit = row_slots.acquire();

        match row {
            SourceRow::Valid { row, contract } => {
                let row = match contract {
                    Some(contract) => RowData::new(Arc::new(contract), row.fields),
                    None => row,
                };
                let content_hash = hash_value(&row.as_value());
                audit.append(
                    run_id,
                    AuditEventKind::RowPulled {
                        row_id,
                        sequence_number: seq,
                        content_hash,
                    },
                )?;

                let token = Token::new_root(row_id, row);
                audit.append(
                    run_id,
                    AuditEventKind::TokenCreated {
                        token_id: token.token_id,
                        row_id,
                        parent_token_ids: Vec::new(),
                    },
                )?;

                send_release(&release_tx, ReleaseCommand::Register { seq, row_id, permit })?;
                work_tx
                    .send(PullItem {
                        seq,
                        token,
                        start_node_id: start_node_id.clone(),
                    })
                    .map_err(|_| OrchestratorError::ChannelClosed)?;
            }
            SourceRow::Quarantined { raw_row, error, destination } => {
                let content_hash = hash_value(&raw_row);
                audit.append(
                    run_id,
                    AuditEventKind::RowPulled {
                        row_id,
                        sequence_number: seq,
                        content_hash,
                    },
                )?;

                let error_hash = hash_str(&error);
                let fields = raw_row.as_object().cloned().unwrap_or_default();
                let quarantine_contract = SchemaContract::builder(SchemaMode::Observed).build();
                let row_data = RowData::new(Arc::new(quarantine_contract), fields);
                let token = Token::new_root(row_id, row_data);
                audit.append(
                    run_id,
                    AuditEventKind::TokenCreated {
                        token_id: token.token_id,
                        row_id,
                        parent_token_ids: Vec::new(),
                    },
                )?;

                send_release(&release_tx, ReleaseCommand::Register { seq, row_id, permit })?;

                let outcome = if destination == "discard" {
                    audit.append(
                        run_id,
                        AuditEventKind::TokenOutcome {
                            outcome_id: Uuid::new_v4(),
                            token_id: token.token_id,
                            outcome: Outcome::Quarantined {
                                error_hash: error_hash.clone(),
                            },
                        },
                    )?;
                    ProcessorOutcome::Terminal {
                        seq,
                        token,
                        outcome: Outcome::Quarantined { error_hash },
                    }
                } else {
                    let sink_node_id = sink_node_id_by_name.get(&destination).ok_or_else(|| {
                        OrchestratorError::Core(elspeth_core::CoreError::Internal(format!(
                            "quarantine destination '{destination}' is not a declared sink"
                        )))
                    })?;
                    pending_quarantine_write(seq, token, sink_node_id, error_hash)
                };
                send_release(&release_tx, ReleaseCommand::Outcomes(vec![outcome]))?;
            }
        }
    }

    source.on_complete();
    source.close();
    Ok(PullerSummary { rows_pulled, seq_by_row_id })
}

fn send_release(tx: &Sender<ReleaseCommand>, cmd: ReleaseCommand) -> Result<(), OrchestratorError> {
    tx.send(cmd).map_err(|SendError(_)| OrchestratorError::ChannelClosed)
}
