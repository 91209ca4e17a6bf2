//! Row processor: the stateless per-row DAG traversal.
//!
//! Each call to `process_row` drains a work queue that starts at a single
//! node and token, and can grow (forks, aggregation flushes, coalesce
//! merges) or shrink (sinks, failures) until empty. The processor itself
//! keeps no state between calls — the mutable state gates/aggregations/
//! coalesces need lives in their executors (`flow_control`), shared across
//! threads by the orchestrator.

use std::collections::HashMap;
use std::sync::Arc;

use elspeth_domain::RowData;
use uuid::Uuid;

use crate::audit::{AuditEventKind, AuditRecorder, BatchStatus, NodeStateStatus};
use crate::concurrency::Semaphore;
use crate::constants::MAX_WORK_QUEUE_ITERATIONS;
use crate::contracts::{ExecutionContext, Transform, TransformInput, TransformResult};
use crate::errors::CoreError;
use crate::flow_control::{AggregationExecutor, AggregationFlush, CoalesceExecutor, CoalesceOutcome, GateExecutor};
use crate::graph::{AggregationOutputMode, Graph, GateAction};
use crate::hashing::hash_str;
use crate::model::{Determinism, Edge, EdgeMode, FailureReason, Node, NodeKind, Outcome, RoutingReason, Token};

/// Registry of the live plugin/executor instances a processor run needs,
/// keyed by node id (or, for coalesces, by coalesce name — the key the
/// executor itself is keyed by in `GraphSpec::coalesces`).
pub struct ProcessorContext {
    pub run_id: Uuid,
    pub graph: Arc<Graph>,
    pub transforms: HashMap<String, Arc<dyn Transform>>,
    pub gates: HashMap<String, GateExecutor>,
    pub aggregations: HashMap<String, AggregationExecutor>,
    pub coalesces: HashMap<String, CoalesceExecutor>,
    pub audit: Arc<dyn AuditRecorder>,
    /// Bounds concurrent `ExternalCall` transform invocations across every
    /// worker thread, independent of how many rows are in flight.
    pub external_calls: Arc<Semaphore>,
}

/// Result of routing one token all the way to a terminal outcome, or to
/// the single non-terminal state (held inside an open aggregation batch).
/// `seq` is the originating source row's sequence number, carried so the
/// orchestrator's release queue can place this outcome at its correct
/// position even when it surfaces from a `process_row` call started by a
/// different, later row (an aggregation flush releasing earlier members).
///
/// Reaching a sink does not write to it: sink I/O and the audit records
/// that surround it (node state, outcome, artifact) are deferred to the
/// orchestrator's release queue, which is the only component allowed to
/// perform them, and only in strict source-sequence order (spec §4.7,
/// §5 — "sink writes occur in strictly ascending source sequence
/// order"). `PendingSink` is how a traversal hands that obligation off.
pub enum ProcessorOutcome {
    Terminal { seq: u64, token: Token, outcome: Outcome },
    Buffered { seq: u64, token: Token, batch_id: Uuid },
    PendingSink {
        seq: u64,
        token: Token,
        sink_node_id: String,
        on_write: PendingSinkKind,
    },
}

/// What outcome a deferred sink write should produce once it actually
/// runs. `Quarantine`'s `error_hash` is already known at traversal time
/// (the source validation error), unlike `CompletedOrRouted`, which
/// depends on whether `sink_node_id` happens to be the graph's default
/// sink — a fact only the release queue (which holds the `Graph`) needs
/// to resolve.
#[derive(Clone)]
pub enum PendingSinkKind {
    CompletedOrRouted,
    Quarantine { error_hash: String },
    /// A transform failed and its `on_error` diverted the token straight to
    /// a sink. The terminal outcome is `Failed`, not `Completed`/`Routed` —
    /// the write still happens, but it never succeeds a processing step.
    TransformError { error_hash: String },
}

struct QueueItem {
    token: Token,
    /// Sequence number of the *original* source row, threaded through so
    /// aggregations can keep batch membership in source order even when
    /// forks/coalesces reorder arrival.
    seq: u64,
    node_id: String,
}

/// Runs one token from `start_node_id` to however many terminal/buffered
/// outcomes its traversal produces. A single call can yield more than one
/// `ProcessorOutcome` (a fork fans out into several independent terminal
/// results; a coalesce failure terminates every consumed member).
pub fn process_row(ctx: &ProcessorContext, token: Token, seq: u64, start_node_id: &str) -> Result<Vec<ProcessorOutcome>, CoreError> {
    let mut queue: Vec<QueueItem> = vec![QueueItem {
        token,
        seq,
        node_id: start_node_id.to_string(),
    }];
    let mut results = Vec::new();
    drain_queue(ctx, &mut queue, &mut results)?;
    Ok(results)
}

/// Runs an aggregation flush that fired outside of any in-progress
/// `process_row` call — the end-of-source sweep the orchestrator performs
/// once the source is exhausted and every in-flight row has been
/// processed (§4.6: "Timeout is checked ... at end-of-source"). Shares
/// the same flush-handling and traversal-drain logic a flush discovered
/// mid-`process_row` uses, so a batch's continuation is indistinguishable
/// from one triggered by an ordinary row's arrival.
pub fn process_aggregation_flush(ctx: &ProcessorContext, agg_node_id: &str, flush: AggregationFlush) -> Result<Vec<ProcessorOutcome>, CoreError> {
    let node = ctx
        .graph
        .node(agg_node_id)
        .ok_or_else(|| CoreError::Internal(format!("unknown aggregation node id '{agg_node_id}'")))?;
    let mut queue = Vec::new();
    let mut results = Vec::new();
    handle_aggregation_flush(ctx, node, flush, &mut queue, &mut results)?;
    drain_queue(ctx, &mut queue, &mut results)?;
    Ok(results)
}

/// End-of-source sweep for a pending coalesce join. Mirrors
/// `process_aggregation_flush`: no arriving token of its own, just a
/// timeout re-check against a join already held in the executor.
pub fn process_coalesce_timeout(
    ctx: &ProcessorContext,
    coalesce_name: &str,
    node_id: &str,
    row_id: Uuid,
    seq: u64,
    timeout: std::time::Duration,
) -> Result<Vec<ProcessorOutcome>, CoreError> {
    let exec = ctx
        .coalesces
        .get(coalesce_name)
        .ok_or_else(|| CoreError::Internal(format!("no coalesce executor for '{coalesce_name}'")))?;
    let decision = exec.check_timeout(row_id, timeout);
    let node = ctx
        .graph
        .node(node_id)
        .ok_or_else(|| CoreError::Internal(format!("unknown node id '{node_id}'")))?;
    let mut queue = Vec::new();
    let mut results = Vec::new();
    handle_coalesce_outcome(ctx, node, None, seq, decision, &mut queue, &mut results)?;
    drain_queue(ctx, &mut queue, &mut results)?;
    Ok(results)
}

fn drain_queue(ctx: &ProcessorContext, queue: &mut Vec<QueueItem>, results: &mut Vec<ProcessorOutcome>) -> Result<(), CoreError> {
    let mut iterations = 0usize;
    while let Some(item) = queue.pop() {
        iterations += 1;
        if iterations > MAX_WORK_QUEUE_ITERATIONS {
            return Err(CoreError::WorkQueueOverrun(MAX_WORK_QUEUE_ITERATIONS));
        }

        let node = ctx
            .graph
            .node(&item.node_id)
            .ok_or_else(|| CoreError::Internal(format!("unknown node id '{}'", item.node_id)))?;

        step_node(ctx, node, item, queue, results)?;
    }
    Ok(())
}

fn step_node(
    ctx: &ProcessorContext,
    node: &Node,
    item: QueueItem,
    queue: &mut Vec<QueueItem>,
    results: &mut Vec<ProcessorOutcome>,
) -> Result<(), CoreError> {
    let QueueItem { token, seq, node_id } = item;

    match node.kind {
        NodeKind::Source => {
            // Reached only if the orchestrator hands the processor a token
            // at the source node itself; a valid row always takes the
            // "continue" edge (quarantine is decided before a token ever
            // exists, from `SourceRow::Quarantined`).
            let target = continue_target(ctx.graph.as_ref(), &node_id)?;
            queue.push(QueueItem { token, seq, node_id: target });
            Ok(())
        }
        NodeKind::Transform => run_transform(ctx, node, token, seq, queue, results),
        NodeKind::Aggregation => run_aggregation(ctx, node, token, seq, queue, results),
        NodeKind::Gate => run_gate(ctx, node, token, seq, queue, results),
        NodeKind::Coalesce => run_coalesce(ctx, node, token, seq, queue, results),
        NodeKind::Sink => run_sink(ctx, node, token, seq, results),
    }
}

fn continue_target(graph: &Graph, node_id: &str) -> Result<String, CoreError> {
    graph
        .outgoing(node_id)
        .into_iter()
        .find(|e| e.mode != EdgeMode::Divert && e.label == "continue")
        .map(|e| e.to_node.clone())
        .ok_or_else(|| CoreError::Internal(format!("node '{node_id}' has no continue edge")))
}

fn error_divert(graph: &Graph, node_id: &str) -> Option<&Edge> {
    graph.outgoing(node_id).into_iter().find(|e| e.mode == EdgeMode::Divert)
}

fn begin_state(ctx: &ProcessorContext, token: &Token, node_id: &str) -> Result<Uuid, CoreError> {
    let state_id = Uuid::new_v4();
    ctx.audit.append(
        ctx.run_id,
        AuditEventKind::NodeStateBegin {
            state_id,
            token_id: token.token_id,
            node_id: node_id.to_string(),
            attempt: 1,
        },
    )?;
    Ok(state_id)
}

fn complete_state(ctx: &ProcessorContext, state_id: Uuid, status: NodeStateStatus) -> Result<(), CoreError> {
    ctx.audit
        .append(ctx.run_id, AuditEventKind::NodeStateComplete { state_id, status })?;
    Ok(())
}

fn record_outcome(ctx: &ProcessorContext, token: &Token, outcome: Outcome) -> Result<(), CoreError> {
    ctx.audit.append(
        ctx.run_id,
        AuditEventKind::TokenOutcome {
            outcome_id: Uuid::new_v4(),
            token_id: token.token_id,
            outcome,
        },
    )?;
    Ok(())
}

fn run_transform(
    ctx: &ProcessorContext,
    node: &Node,
    token: Token,
    seq: u64,
    queue: &mut Vec<QueueItem>,
    results: &mut Vec<ProcessorOutcome>,
) -> Result<(), CoreError> {
    let plugin = ctx
        .transforms
        .get(&node.node_id)
        .ok_or_else(|| CoreError::Internal(format!("no transform registered for node '{}'", node.node_id)))?;
    let exec_ctx = ExecutionContext {
        run_id: ctx.run_id,
        node_id: node.node_id.clone(),
    };
    let state_id = begin_state(ctx, &token, &node.node_id)?;

    let _permit = (plugin.determinism() == Determinism::ExternalCall).then(|| ctx.external_calls.acquire());
    match plugin.process(TransformInput::Single(token.row_data.clone()), &exec_ctx) {
        TransformResult::Success { row, .. } => {
            complete_state(ctx, state_id, NodeStateStatus::Completed)?;
            let target = continue_target(&ctx.graph, &node.node_id)?;
            queue.push(QueueItem {
                token: token.with_row_data(row),
                seq,
                node_id: target,
            });
            Ok(())
        }
        TransformResult::SuccessMulti { rows, .. } => {
            complete_state(ctx, state_id, NodeStateStatus::Completed)?;
            let target = continue_target(&ctx.graph, &node.node_id)?;
            let expand_group_id = Uuid::new_v4();
            for row in rows {
                let child = token.expand_child(expand_group_id, row);
                ctx.audit.append(
                    ctx.run_id,
                    AuditEventKind::TokenCreated {
                        token_id: child.token_id,
                        row_id: child.row_id,
                        parent_token_ids: vec![token.token_id],
                    },
                )?;
                queue.push(QueueItem {
                    token: child,
                    seq,
                    node_id: target.clone(),
                });
            }
            record_outcome(ctx, &token, Outcome::Expanded { expand_group_id })
        }
        TransformResult::Error { reason, retryable } => {
            complete_state(ctx, state_id, NodeStateStatus::Failed)?;
            match error_divert(&ctx.graph, &node.node_id) {
                Some(edge) => {
                    ctx.audit.append(
                        ctx.run_id,
                        AuditEventKind::RoutingEvent {
                            state_id,
                            edge_id: edge.edge_id.clone(),
                            mode: edge.mode,
                            reason: RoutingReason::TransformError {
                                error_reason: reason.clone(),
                                retryable,
                            },
                        },
                    )?;
                    let error_hash = hash_str(&reason);
                    results.push(ProcessorOutcome::PendingSink {
                        seq,
                        token,
                        sink_node_id: edge.to_node.clone(),
                        on_write: PendingSinkKind::TransformError { error_hash },
                    });
                    Ok(())
                }
                None => {
                    let error_hash = hash_str(&reason);
                    record_outcome(ctx, &token, Outcome::Failed { error_hash: error_hash.clone() })?;
                    results.push(ProcessorOutcome::Terminal {
                        seq,
                        token,
                        outcome: Outcome::Failed { error_hash },
                    });
                    Ok(())
                }
            }
        }
    }
}

fn run_gate(
    ctx: &ProcessorContext,
    node: &Node,
    token: Token,
    seq: u64,
    queue: &mut Vec<QueueItem>,
    _results: &mut Vec<ProcessorOutcome>,
) -> Result<(), CoreError> {
    let gate = ctx
        .gates
        .get(&node.node_id)
        .ok_or_else(|| CoreError::Internal(format!("no gate executor for node '{}'", node.node_id)))?;
    let state_id = begin_state(ctx, &token, &node.node_id)?;
    let decision = gate.evaluate(&token.row_data)?;
    complete_state(ctx, state_id, NodeStateStatus::Completed)?;

    match &decision.action {
        GateAction::Fork(branches) => {
            // Every child `TokenCreated` plus the parent's `Forked` outcome
            // must land as a single transaction (spec: no partial forks
            // observable), so events are collected and emitted through
            // `append_atomic` once, after every edge has resolved.
            let fork_group_id = Uuid::new_v4();
            let mut events = Vec::with_capacity(branches.len() * 2 + 1);
            let mut children: Vec<(Token, String)> = Vec::with_capacity(branches.len());
            for branch in branches {
                let label = format!("{}:{}", decision.wire_label, branch.branch_name);
                let edge = ctx
                    .graph
                    .outgoing(&node.node_id)
                    .into_iter()
                    .find(|e| e.label == label && e.mode == EdgeMode::Copy)
                    .ok_or_else(|| CoreError::Internal(format!("gate '{}' missing fork edge '{label}'", node.node_id)))?;
                events.push(AuditEventKind::RoutingEvent {
                    state_id,
                    edge_id: edge.edge_id.clone(),
                    mode: edge.mode,
                    reason: RoutingReason::ConfigGate {
                        expression_result: decision.expression_result.clone(),
                    },
                });
                let child = token.fork_child(branch.branch_name.clone(), fork_group_id, token.row_data.fork_copy());
                events.push(AuditEventKind::TokenCreated {
                    token_id: child.token_id,
                    row_id: child.row_id,
                    parent_token_ids: vec![token.token_id],
                });
                children.push((child, edge.to_node.clone()));
            }
            events.push(AuditEventKind::TokenOutcome {
                outcome_id: Uuid::new_v4(),
                token_id: token.token_id,
                outcome: Outcome::Forked { fork_group_id },
            });
            ctx.audit.append_atomic(ctx.run_id, events)?;
            for (child, target) in children {
                queue.push(QueueItem { token: child, seq, node_id: target });
            }
            Ok(())
        }
        GateAction::Continue | GateAction::RouteTo(_) => {
            let edge = ctx
                .graph
                .outgoing(&node.node_id)
                .into_iter()
                .find(|e| e.label == decision.wire_label && e.mode == EdgeMode::Move)
                .ok_or_else(|| CoreError::Internal(format!("gate '{}' missing edge for '{}'", node.node_id, decision.wire_label)))?;
            ctx.audit.append(
                ctx.run_id,
                AuditEventKind::RoutingEvent {
                    state_id,
                    edge_id: edge.edge_id.clone(),
                    mode: edge.mode,
                    reason: RoutingReason::ConfigGate {
                        expression_result: decision.expression_result.clone(),
                    },
                },
            )?;
            queue.push(QueueItem {
                token,
                seq,
                node_id: edge.to_node.clone(),
            });
            Ok(())
        }
    }
}

fn run_aggregation(
    ctx: &ProcessorContext,
    node: &Node,
    token: Token,
    seq: u64,
    queue: &mut Vec<QueueItem>,
    results: &mut Vec<ProcessorOutcome>,
) -> Result<(), CoreError> {
    let exec = ctx
        .aggregations
        .get(&node.node_id)
        .ok_or_else(|| CoreError::Internal(format!("no aggregation executor for node '{}'", node.node_id)))?;

    let row_for_condition = token.row_data.clone();
    match exec.accept(seq, token.clone(), &row_for_condition) {
        AggregationFlush::Held { batch_id } => {
            results.push(ProcessorOutcome::Buffered {
                seq,
                token: token.clone(),
                batch_id,
            });
            record_outcome(ctx, &token, Outcome::Buffered { batch_id })
        }
        flush @ AggregationFlush::Flushed { .. } => handle_aggregation_flush(ctx, node, flush, queue, results),
    }
}

/// Turns one fired `AggregationFlush` into batch/batch-member audit
/// records and either passthrough-releases or batch-transforms its
/// members, enqueuing their continuation. Shared by a flush discovered
/// mid-traversal (`run_aggregation`) and the orchestrator's end-of-source
/// sweep (`process_aggregation_flush`), since both cases are otherwise
/// identical.
fn handle_aggregation_flush(
    ctx: &ProcessorContext,
    node: &Node,
    flush: AggregationFlush,
    queue: &mut Vec<QueueItem>,
    results: &mut Vec<ProcessorOutcome>,
) -> Result<(), CoreError> {
    let AggregationFlush::Flushed { batch_id, tokens, trigger } = flush else {
        return Ok(());
    };
    ctx.audit.append(
        ctx.run_id,
        AuditEventKind::Batch {
            batch_id,
            aggregation_node_id: node.node_id.clone(),
            status: BatchStatus::Flushed,
            trigger_type: trigger.to_string(),
        },
    )?;
    for (ordinal, (_, member)) in tokens.iter().enumerate() {
        ctx.audit.append(
            ctx.run_id,
            AuditEventKind::BatchMember {
                batch_id,
                token_id: member.token_id,
                ordinal: ordinal as u32,
            },
        )?;
    }

    let exec = ctx
        .aggregations
        .get(&node.node_id)
        .ok_or_else(|| CoreError::Internal(format!("no aggregation executor for node '{}'", node.node_id)))?;

    match exec.output_mode() {
        AggregationOutputMode::Passthrough => {
            // Spec: a passthrough flush still calls the transform, which
            // must return exactly N rows for the N-row batch; each
            // original token carries the corresponding returned row
            // onward rather than its pre-flush data.
            let plugin = ctx.transforms.get(&node.node_id).ok_or_else(|| {
                CoreError::Internal(format!("no batch transform registered for aggregation node '{}'", node.node_id))
            })?;
            let exec_ctx = ExecutionContext {
                run_id: ctx.run_id,
                node_id: node.node_id.clone(),
            };
            let expected = tokens.len();
            let rows: Vec<RowData> = tokens.iter().map(|(_, t)| t.row_data.clone()).collect();
            let target = continue_target(&ctx.graph, &node.node_id)?;

            let produced: Vec<RowData> = match plugin.process(TransformInput::Batch(rows), &exec_ctx) {
                TransformResult::Success { row, .. } => vec![row],
                TransformResult::SuccessMulti { rows, .. } => rows,
                TransformResult::Error { reason, .. } => {
                    let error_hash = hash_str(&reason);
                    for (member_seq, member) in &tokens {
                        record_outcome(ctx, member, Outcome::Failed { error_hash: error_hash.clone() })?;
                        results.push(ProcessorOutcome::Terminal {
                            seq: *member_seq,
                            token: member.clone(),
                            outcome: Outcome::Failed { error_hash: error_hash.clone() },
                        });
                    }
                    return Ok(());
                }
            };

            if produced.len() != expected {
                let error_hash = hash_str(&format!(
                    "passthrough aggregation '{}' returned {} rows for a {expected}-row batch",
                    node.node_id,
                    produced.len()
                ));
                for (member_seq, member) in &tokens {
                    record_outcome(ctx, member, Outcome::Failed { error_hash: error_hash.clone() })?;
                    results.push(ProcessorOutcome::Terminal {
                        seq: *member_seq,
                        token: member.clone(),
                        outcome: Outcome::Failed { error_hash: error_hash.clone() },
                    });
                }
                return Ok(());
            }

            for ((member_seq, member), row) in tokens.into_iter().zip(produced) {
                queue.push(QueueItem {
                    token: member.with_row_data(row),
                    seq: member_seq,
                    node_id: target.clone(),
                });
            }
            Ok(())
        }
        AggregationOutputMode::Transform => {
            let plugin = ctx.transforms.get(&node.node_id).ok_or_else(|| {
                CoreError::Internal(format!("no batch transform registered for aggregation node '{}'", node.node_id))
            })?;
            let exec_ctx = ExecutionContext {
                run_id: ctx.run_id,
                node_id: node.node_id.clone(),
            };
            let continuation_seq = AggregationFlush::max_seq(&tokens);
            let rows: Vec<RowData> = tokens.iter().map(|(_, t)| t.row_data.clone()).collect();
            let member_ids: Vec<Uuid> = tokens.iter().map(|(_, t)| t.token_id).collect();
            let target = continue_target(&ctx.graph, &node.node_id)?;

            let produced: Vec<RowData> = match plugin.process(TransformInput::Batch(rows), &exec_ctx) {
                TransformResult::Success { row, .. } => vec![row],
                TransformResult::SuccessMulti { rows, .. } => rows,
                TransformResult::Error { reason, .. } => {
                    let error_hash = hash_str(&reason);
                    for (member_seq, member) in &tokens {
                        record_outcome(ctx, member, Outcome::Failed { error_hash: error_hash.clone() })?;
                        results.push(ProcessorOutcome::Terminal {
                            seq: *member_seq,
                            token: member.clone(),
                            outcome: Outcome::Failed { error_hash: error_hash.clone() },
                        });
                    }
                    return Ok(());
                }
            };

            if let Some(expected) = exec.expected_output_count() {
                if produced.len() != expected {
                    let error_hash = hash_str(&format!(
                        "aggregation '{}' expected {expected} output rows, got {}",
                        node.node_id,
                        produced.len()
                    ));
                    for (member_seq, member) in &tokens {
                        record_outcome(ctx, member, Outcome::Failed { error_hash: error_hash.clone() })?;
                        results.push(ProcessorOutcome::Terminal {
                            seq: *member_seq,
                            token: member.clone(),
                            outcome: Outcome::Failed { error_hash: error_hash.clone() },
                        });
                    }
                    return Ok(());
                }
            }

            for (member_seq, member) in &tokens {
                record_outcome(ctx, member, Outcome::ConsumedInBatch { batch_id })?;
                results.push(ProcessorOutcome::Terminal {
                    seq: *member_seq,
                    token: member.clone(),
                    outcome: Outcome::ConsumedInBatch { batch_id },
                });
            }

            for row in produced {
                let new_token = Token {
                    row_id: batch_id,
                    token_id: Uuid::new_v4(),
                    row_data: row,
                    branch_name: None,
                    fork_group_id: None,
                    join_group_id: None,
                    expand_group_id: Some(batch_id),
                };
                ctx.audit.append(
                    ctx.run_id,
                    AuditEventKind::TokenCreated {
                        token_id: new_token.token_id,
                        row_id: batch_id,
                        parent_token_ids: member_ids.clone(),
                    },
                )?;
                queue.push(QueueItem {
                    token: new_token,
                    seq: continuation_seq,
                    node_id: target.clone(),
                });
            }
            Ok(())
        }
    }
}

fn run_coalesce(
    ctx: &ProcessorContext,
    node: &Node,
    token: Token,
    seq: u64,
    queue: &mut Vec<QueueItem>,
    results: &mut Vec<ProcessorOutcome>,
) -> Result<(), CoreError> {
    let exec = ctx
        .coalesces
        .get(&node.plugin_name)
        .ok_or_else(|| CoreError::Internal(format!("no coalesce executor for '{}'", node.plugin_name)))?;
    let branch = token.branch_name.clone().unwrap_or_else(|| "main".to_string());
    let row_id = token.row_id;

    let decision = exec.accept(row_id, branch, token.clone());
    handle_coalesce_outcome(ctx, node, Some(token), seq, decision, queue, results)
}

/// Translates one `CoalesceOutcome` into audit records and either a
/// traversal continuation or terminal results. Shared by a live arrival
/// (`run_coalesce`) and the orchestrator's end-of-source timeout sweep
/// (`process_coalesce_timeout`), which has no arriving token of its own
/// (`arriving` is `None`: a timeout re-check that is still `Held` touches
/// nothing new).
fn handle_coalesce_outcome(
    ctx: &ProcessorContext,
    node: &Node,
    arriving: Option<Token>,
    seq: u64,
    decision: CoalesceOutcome,
    queue: &mut Vec<QueueItem>,
    results: &mut Vec<ProcessorOutcome>,
) -> Result<(), CoreError> {
    match decision {
        CoalesceOutcome::Held => {
            let Some(token) = arriving else { return Ok(()) };
            results.push(ProcessorOutcome::Buffered {
                seq,
                token: token.clone(),
                batch_id: Uuid::nil(),
            });
            record_outcome(ctx, &token, Outcome::Buffered { batch_id: Uuid::nil() })
        }
        CoalesceOutcome::Merged { join_group_id, token: merged, consumed, collisions } => {
            for member in &consumed {
                record_outcome(ctx, member, Outcome::Coalesced { join_group_id })?;
            }
            ctx.audit.append(
                ctx.run_id,
                AuditEventKind::TokenCreated {
                    token_id: merged.token_id,
                    row_id: merged.row_id,
                    parent_token_ids: consumed.iter().map(|t| t.token_id).collect(),
                },
            )?;
            if !collisions.is_empty() {
                log::warn!("coalesce '{}' merge for row {} had field collisions: {collisions:?}", node.plugin_name, merged.row_id);
            }
            let target = continue_target(&ctx.graph, &node.node_id)?;
            queue.push(QueueItem {
                token: merged,
                seq,
                node_id: target,
            });
            Ok(())
        }
        CoalesceOutcome::Failed { consumed, reason } => {
            let error_hash = hash_str(&format!("{reason:?}"));
            for member in consumed {
                record_outcome(ctx, &member, Outcome::Failed { error_hash: error_hash.clone() })?;
                results.push(ProcessorOutcome::Terminal {
                    seq,
                    token: member,
                    outcome: Outcome::Failed { error_hash: error_hash.clone() },
                });
            }
            Ok(())
        }
        CoalesceOutcome::LateArrival { token: late } => {
            let error_hash = hash_str(&format!("{:?}", FailureReason::LateArrivalAfterMerge));
            record_outcome(ctx, &late, Outcome::Failed { error_hash: error_hash.clone() })?;
            results.push(ProcessorOutcome::Terminal {
                seq,
                token: late,
                outcome: Outcome::Failed { error_hash },
            });
            Ok(())
        }
    }
}

/// Reaching a sink node never writes to it here — see `ProcessorOutcome`'s
/// doc comment. The traversal's job ends at handing the token to the
/// orchestrator's release queue with the sink it's destined for.
fn run_sink(_ctx: &ProcessorContext, node: &Node, token: Token, seq: u64, results: &mut Vec<ProcessorOutcome>) -> Result<(), CoreError> {
    run_sink_by_id(_ctx, &node.node_id, token, seq, results)
}

fn run_sink_by_id(_ctx: &ProcessorContext, sink_node_id: &str, token: Token, seq: u64, results: &mut Vec<ProcessorOutcome>) -> Result<(), CoreError> {
    results.push(ProcessorOutcome::PendingSink {
        seq,
        token,
        sink_node_id: sink_node_id.to_string(),
        on_write: PendingSinkKind::CompletedOrRouted,
    });
    Ok(())
}

/// Quarantine is resolved by the orchestrator's `SourcePuller` before any
/// token enters the graph (§3, §7), but a quarantine destination is still
/// a sink write and so still owes the release queue's ordering guarantee.
/// This lets the puller hand a quarantined row's token to the same
/// deferred-write machinery every other sink-bound token uses.
pub fn pending_quarantine_write(seq: u64, token: Token, sink_node_id: &str, error_hash: String) -> ProcessorOutcome {
    ProcessorOutcome::PendingSink {
        seq,
        token,
        sink_node_id: sink_node_id.to_string(),
        on_write: PendingSinkKind::Quarantine { error_hash },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::InMemoryAuditRecorder;
    use crate::graph::{
        AggregationOutputMode, AggregationSettings, AggregationSpec, AggregationTrigger, ForkBranch, GateAction, GateSpec, GraphSpec,
        SinkSpec, SourceSpec, StepSpec, TransformSpec,
    };
    use crate::model::Determinism;
    use elspeth_domain::{SchemaContract, SchemaMode};
    use indexmap::IndexMap;
    use std::collections::HashMap as Map;

    struct UpperTransform;
    impl Transform for UpperTransform {
        fn name(&self) -> &str {
            "upper"
        }
        fn input_schema(&self) -> &SchemaContract {
            unimplemented!()
        }
        fn output_schema(&self) -> &SchemaContract {
            unimplemented!()
        }
        fn determinism(&self) -> Determinism {
            Determinism::Deterministic
        }
        fn plugin_version(&self) -> &str {
            "1.0.0"
        }
        fn process(&self, input: TransformInput, _ctx: &ExecutionContext) -> TransformResult {
            match input {
                TransformInput::Single(mut row) => {
                    if let Some(serde_json::Value::String(s)) = row.fields.get("text").cloned() {
                        row.fields.insert("text".into(), serde_json::Value::String(s.to_uppercase()));
                    }
                    TransformResult::Success {
                        row,
                        success_reason: "uppercased".into(),
                        contract: None,
                    }
                }
                TransformInput::Batch(_) => unreachable!(),
            }
        }
    }

    fn build_simple_graph() -> Graph {
        let observed = SchemaContract::builder(SchemaMode::Observed).build();
        let mut sinks = Map::new();
        sinks.insert(
            "out".to_string(),
            SinkSpec {
                name: "out".into(),
                config: serde_json::json!({}),
                input_schema: observed.clone(),
            },
        );
        let mut chains = IndexMap::new();
        chains.insert(
            "main".to_string(),
            vec![StepSpec::Transform(TransformSpec {
                name: "upper".into(),
                config: serde_json::json!({}),
                input_schema: observed.clone(),
                output_schema: observed.clone(),
                on_error: None,
            })],
        );
        let spec = GraphSpec {
            source: SourceSpec {
                name: "vec_source".into(),
                config: serde_json::json!({}),
                output_schema: observed,
                on_validation_failure: "out".into(),
            },
            chains,
            sinks,
            coalesces: Map::new(),
            default_sink: "out".into(),
        };
        crate::graph::build(&spec).unwrap().0
    }

    #[test]
    fn transform_then_sink_yields_pending_sink_outcome() {
        let graph = build_simple_graph();
        let transform_id = graph
            .node_ids()
            .into_iter()
            .find(|id| id.starts_with("xf_upper_"))
            .unwrap();

        let mut transforms: HashMap<String, Arc<dyn Transform>> = HashMap::new();
        transforms.insert(transform_id.clone(), Arc::new(UpperTransform));

        let default_sink_id = graph.default_sink_id.clone();
        let ctx = ProcessorContext {
            run_id: Uuid::new_v4(),
            graph: Arc::new(graph),
            transforms,
            gates: HashMap::new(),
            aggregations: HashMap::new(),
            coalesces: HashMap::new(),
            audit: Arc::new(InMemoryAuditRecorder::new()),
            external_calls: Arc::new(Semaphore::new(4)),
        };

        let contract = Arc::new(SchemaContract::builder(SchemaMode::Observed).build());
        let mut fields = serde_json::Map::new();
        fields.insert("text".into(), serde_json::json!("hello"));
        let token = Token::new_root(Uuid::new_v4(), RowData::new(contract, fields));

        let results = process_row(&ctx, token, 1, &transform_id).unwrap();
        assert_eq!(results.len(), 1);
        match &results[0] {
            ProcessorOutcome::PendingSink {
                seq,
                sink_node_id,
                on_write: PendingSinkKind::CompletedOrRouted,
                token,
            } => {
                assert_eq!(*seq, 1);
                assert_eq!(sink_node_id, &default_sink_id);
                assert_eq!(
                    token.row_data.fields.get("text"),
                    Some(&serde_json::json!("HELLO"))
                );
            }
            _ => panic!("expected pending sink outcome"),
        }
    }

    struct BatchSumTransform;
    impl Transform for BatchSumTransform {
        fn name(&self) -> &str {
            "batch_sum"
        }
        fn input_schema(&self) -> &SchemaContract {
            unimplemented!()
        }
        fn output_schema(&self) -> &SchemaContract {
            unimplemented!()
        }
        fn determinism(&self) -> Determinism {
            Determinism::Deterministic
        }
        fn plugin_version(&self) -> &str {
            "1.0.0"
        }
        fn process(&self, input: TransformInput, _ctx: &ExecutionContext) -> TransformResult {
            match input {
                TransformInput::Batch(rows) => {
                    let sum: i64 = rows
                        .iter()
                        .filter_map(|r| r.fields.get("amount").and_then(|v| v.as_i64()))
                        .sum();
                    let mut fields = serde_json::Map::new();
                    fields.insert("sum".into(), serde_json::json!(sum));
                    TransformResult::SuccessMulti {
                        rows: vec![RowData::new(rows[0].contract.clone(), fields)],
                        success_reason: "summed".into(),
                        contract: None,
                    }
                }
                TransformInput::Single(_) => unreachable!(),
            }
        }
    }

    struct BatchEchoTransform;
    impl Transform for BatchEchoTransform {
        fn name(&self) -> &str {
            "batch_echo"
        }
        fn input_schema(&self) -> &SchemaContract {
            unimplemented!()
        }
        fn output_schema(&self) -> &SchemaContract {
            unimplemented!()
        }
        fn determinism(&self) -> Determinism {
            Determinism::Deterministic
        }
        fn plugin_version(&self) -> &str {
            "1.0.0"
        }
        fn process(&self, input: TransformInput, _ctx: &ExecutionContext) -> TransformResult {
            match input {
                TransformInput::Batch(rows) => TransformResult::SuccessMulti {
                    rows,
                    success_reason: "echoed".into(),
                    contract: None,
                },
                TransformInput::Single(_) => unreachable!(),
            }
        }
    }

    /// A single aggregation with a count-2 trigger, wired as the only step
    /// in the chain. `output_mode`/`expected_output_count` are the knobs
    /// each aggregation test below exercises.
    fn build_aggregation_graph(output_mode: AggregationOutputMode, expected_output_count: Option<usize>) -> Graph {
        let observed = SchemaContract::builder(SchemaMode::Observed).build();
        let mut sinks = Map::new();
        sinks.insert(
            "out".to_string(),
            SinkSpec {
                name: "out".into(),
                config: serde_json::json!({}),
                input_schema: observed.clone(),
            },
        );
        let mut chains = IndexMap::new();
        chains.insert(
            "main".to_string(),
            vec![StepSpec::Aggregation(AggregationSpec {
                name: "totals".into(),
                config: serde_json::json!({}),
                input_schema: observed.clone(),
                output_schema: observed.clone(),
                settings: AggregationSettings {
                    output_mode,
                    triggers: vec![AggregationTrigger::Count(2)],
                    expected_output_count,
                },
            })],
        );
        let spec = GraphSpec {
            source: SourceSpec {
                name: "vec_source".into(),
                config: serde_json::json!({}),
                output_schema: observed,
                on_validation_failure: "out".into(),
            },
            chains,
            sinks,
            coalesces: Map::new(),
            default_sink: "out".into(),
        };
        crate::graph::build(&spec).unwrap().0
    }

    fn amount_token(amount: i64) -> Token {
        let contract = Arc::new(SchemaContract::builder(SchemaMode::Observed).build());
        let mut fields = serde_json::Map::new();
        fields.insert("amount".into(), serde_json::json!(amount));
        Token::new_root(Uuid::new_v4(), RowData::new(contract, fields))
    }

    fn ctx_with_aggregation(
        graph: Graph,
        agg_node_id: &str,
        exec: AggregationExecutor,
        transform: Option<Arc<dyn Transform>>,
    ) -> ProcessorContext {
        assert!(matches!(graph.node(agg_node_id).unwrap().kind, NodeKind::Aggregation));
        let mut transforms: HashMap<String, Arc<dyn Transform>> = HashMap::new();
        if let Some(t) = transform {
            transforms.insert(agg_node_id.to_string(), t);
        }
        let mut aggregations = HashMap::new();
        aggregations.insert(agg_node_id.to_string(), exec);
        ProcessorContext {
            run_id: Uuid::new_v4(),
            graph: Arc::new(graph),
            transforms,
            gates: HashMap::new(),
            aggregations,
            coalesces: HashMap::new(),
            audit: Arc::new(InMemoryAuditRecorder::new()),
            external_calls: Arc::new(Semaphore::new(4)),
        }
    }

    #[test]
    fn transform_mode_flush_invokes_registered_batch_transform() {
        let graph = build_aggregation_graph(AggregationOutputMode::Transform, None);
        let agg_id = graph.node_ids().into_iter().find(|id| id.starts_with("agg_")).unwrap();
        let spec = AggregationSpec {
            name: "totals".into(),
            config: serde_json::json!({}),
            input_schema: SchemaContract::builder(SchemaMode::Observed).build(),
            output_schema: SchemaContract::builder(SchemaMode::Observed).build(),
            settings: AggregationSettings {
                output_mode: AggregationOutputMode::Transform,
                triggers: vec![AggregationTrigger::Count(2)],
                expected_output_count: None,
            },
        };
        let exec = AggregationExecutor::new(agg_id.clone(), &spec).unwrap();

        let row1 = amount_token(100);
        let row2 = amount_token(250);
        let empty_row = RowData::new(Arc::new(SchemaContract::builder(SchemaMode::Observed).build()), serde_json::Map::new());
        assert!(matches!(exec.accept(1, row1, &empty_row), AggregationFlush::Held { .. }));
        let flush = exec.accept(2, row2, &empty_row);

        let ctx = ctx_with_aggregation(graph, &agg_id, exec, Some(Arc::new(BatchSumTransform)));
        let results = process_aggregation_flush(&ctx, &agg_id, flush).unwrap();

        // Two members consumed into the batch, one new token carrying the
        // transform's output on to the sink.
        let consumed = results
            .iter()
            .filter(|r| matches!(r, ProcessorOutcome::Terminal { outcome: Outcome::ConsumedInBatch { .. }, .. }))
            .count();
        assert_eq!(consumed, 2);
        let pending = results
            .iter()
            .find(|r| matches!(r, ProcessorOutcome::PendingSink { .. }))
            .expect("expected the batch transform's output to reach the sink");
        match pending {
            ProcessorOutcome::PendingSink { token, .. } => {
                assert_eq!(token.row_data.fields.get("sum"), Some(&serde_json::json!(350)));
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn transform_mode_flush_fails_atomically_on_expected_output_count_mismatch() {
        let graph = build_aggregation_graph(AggregationOutputMode::Transform, Some(2));
        let agg_id = graph.node_ids().into_iter().find(|id| id.starts_with("agg_")).unwrap();
        let spec = AggregationSpec {
            name: "totals".into(),
            config: serde_json::json!({}),
            input_schema: SchemaContract::builder(SchemaMode::Observed).build(),
            output_schema: SchemaContract::builder(SchemaMode::Observed).build(),
            settings: AggregationSettings {
                output_mode: AggregationOutputMode::Transform,
                triggers: vec![AggregationTrigger::Count(2)],
                expected_output_count: Some(2),
            },
        };
        let exec = AggregationExecutor::new(agg_id.clone(), &spec).unwrap();

        let empty_row = RowData::new(Arc::new(SchemaContract::builder(SchemaMode::Observed).build()), serde_json::Map::new());
        assert!(matches!(exec.accept(1, amount_token(100), &empty_row), AggregationFlush::Held { .. }));
        let flush = exec.accept(2, amount_token(250), &empty_row);

        // BatchSumTransform always returns exactly one row, so asking for
        // two outputs can never be satisfied — every member must fail.
        let ctx = ctx_with_aggregation(graph, &agg_id, exec, Some(Arc::new(BatchSumTransform)));
        let results = process_aggregation_flush(&ctx, &agg_id, flush).unwrap();

        assert_eq!(results.len(), 2);
        assert!(results
            .iter()
            .all(|r| matches!(r, ProcessorOutcome::Terminal { outcome: Outcome::Failed { .. }, .. })));
    }

    #[test]
    fn passthrough_mode_flush_requires_and_invokes_a_batch_transform() {
        let graph = build_aggregation_graph(AggregationOutputMode::Passthrough, None);
        let agg_id = graph.node_ids().into_iter().find(|id| id.starts_with("agg_")).unwrap();
        let spec = AggregationSpec {
            name: "totals".into(),
            config: serde_json::json!({}),
            input_schema: SchemaContract::builder(SchemaMode::Observed).build(),
            output_schema: SchemaContract::builder(SchemaMode::Observed).build(),
            settings: AggregationSettings {
                output_mode: AggregationOutputMode::Passthrough,
                triggers: vec![AggregationTrigger::Count(2)],
                expected_output_count: None,
            },
        };
        let exec = AggregationExecutor::new(agg_id.clone(), &spec).unwrap();
        let empty_row = RowData::new(Arc::new(SchemaContract::builder(SchemaMode::Observed).build()), serde_json::Map::new());
        assert!(matches!(exec.accept(1, amount_token(100), &empty_row), AggregationFlush::Held { .. }));
        let flush = exec.accept(2, amount_token(250), &empty_row);

        // Without a registered transform, passthrough flush errors instead
        // of silently passing the pre-flush rows through.
        let ctx_missing = ctx_with_aggregation(graph, &agg_id, exec, None);
        let err = process_aggregation_flush(&ctx_missing, &agg_id, flush);
        assert!(err.is_err());
    }

    #[test]
    fn passthrough_mode_flush_carries_transform_output_onto_each_token() {
        let graph = build_aggregation_graph(AggregationOutputMode::Passthrough, None);
        let agg_id = graph.node_ids().into_iter().find(|id| id.starts_with("agg_")).unwrap();
        let spec = AggregationSpec {
            name: "totals".into(),
            config: serde_json::json!({}),
            input_schema: SchemaContract::builder(SchemaMode::Observed).build(),
            output_schema: SchemaContract::builder(SchemaMode::Observed).build(),
            settings: AggregationSettings {
                output_mode: AggregationOutputMode::Passthrough,
                triggers: vec![AggregationTrigger::Count(2)],
                expected_output_count: None,
            },
        };
        let exec = AggregationExecutor::new(agg_id.clone(), &spec).unwrap();
        let empty_row = RowData::new(Arc::new(SchemaContract::builder(SchemaMode::Observed).build()), serde_json::Map::new());
        assert!(matches!(exec.accept(1, amount_token(100), &empty_row), AggregationFlush::Held { .. }));
        let flush = exec.accept(2, amount_token(250), &empty_row);

        let ctx = ctx_with_aggregation(graph, &agg_id, exec, Some(Arc::new(BatchEchoTransform)));
        let results = process_aggregation_flush(&ctx, &agg_id, flush).unwrap();

        let pending: Vec<_> = results
            .iter()
            .filter_map(|r| match r {
                ProcessorOutcome::PendingSink { token, .. } => Some(token.row_data.fields.get("amount").cloned()),
                _ => None,
            })
            .collect();
        assert_eq!(pending.len(), 2);
        assert!(pending.contains(&Some(serde_json::json!(100))));
        assert!(pending.contains(&Some(serde_json::json!(250))));
    }

    fn build_fork_graph() -> Graph {
        let observed = SchemaContract::builder(SchemaMode::Observed).build();
        let mut sinks = Map::new();
        sinks.insert(
            "sink_a".to_string(),
            SinkSpec {
                name: "sink_a".into(),
                config: serde_json::json!({}),
                input_schema: observed.clone(),
            },
        );
        sinks.insert(
            "sink_b".to_string(),
            SinkSpec {
                name: "sink_b".into(),
                config: serde_json::json!({}),
                input_schema: observed.clone(),
            },
        );
        let mut chains = IndexMap::new();
        chains.insert(
            "main".to_string(),
            vec![StepSpec::Gate(GateSpec {
                name: "splitter".into(),
                config: serde_json::json!({}),
                expression: "true".into(),
                routes: HashMap::new(),
                default: GateAction::Fork(vec![
                    ForkBranch {
                        branch_name: "a".into(),
                        chain: "sink_a".into(),
                    },
                    ForkBranch {
                        branch_name: "b".into(),
                        chain: "sink_b".into(),
                    },
                ]),
            })],
        );
        let spec = GraphSpec {
            source: SourceSpec {
                name: "vec_source".into(),
                config: serde_json::json!({}),
                output_schema: observed,
                on_validation_failure: "sink_a".into(),
            },
            chains,
            sinks,
            coalesces: Map::new(),
            default_sink: "sink_a".into(),
        };
        crate::graph::build(&spec).unwrap().0
    }

    #[test]
    fn fork_writes_child_and_parent_audit_events_through_a_single_transaction() {
        let graph = build_fork_graph();
        let gate_id = graph.node_ids().into_iter().find(|id| id.starts_with("gate_")).unwrap();
        let gate_spec = GateSpec {
            name: "splitter".into(),
            config: serde_json::json!({}),
            expression: "true".into(),
            routes: HashMap::new(),
            default: GateAction::Fork(vec![
                ForkBranch {
                    branch_name: "a".into(),
                    chain: "sink_a".into(),
                },
                ForkBranch {
                    branch_name: "b".into(),
                    chain: "sink_b".into(),
                },
            ]),
        };
        let gate_exec = GateExecutor::new(gate_id.clone(), gate_spec).unwrap();
        let mut gates = HashMap::new();
        gates.insert(gate_id.clone(), gate_exec);

        let run_id = Uuid::new_v4();
        let audit = Arc::new(InMemoryAuditRecorder::new());
        let ctx = ProcessorContext {
            run_id,
            graph: Arc::new(graph),
            transforms: HashMap::new(),
            gates,
            aggregations: HashMap::new(),
            coalesces: HashMap::new(),
            audit: audit.clone(),
            external_calls: Arc::new(Semaphore::new(4)),
        };

        let token = amount_token(1);
        let results = process_row(&ctx, token, 1, &gate_id).unwrap();
        assert_eq!(results.len(), 2, "one pending sink per fork branch");

        let events = audit.list(run_id);
        let token_created = events
            .iter()
            .filter(|e| matches!(e.kind, AuditEventKind::TokenCreated { .. }))
            .count();
        let forked = events
            .iter()
            .filter(|e| matches!(e.kind, AuditEventKind::TokenOutcome { outcome: Outcome::Forked { .. }, .. }))
            .count();
        assert_eq!(token_created, 2);
        assert_eq!(forked, 1);
    }
}
