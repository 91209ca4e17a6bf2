//! Ties the three pipeline stages (`SourcePuller`, `WorkPool`,
//! `ReleaseQueue`) to a built graph and runs them to completion.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use elspeth_core::audit::{AuditEventKind, AuditRecorder};
use elspeth_core::{
    build_executors, process_aggregation_flush, process_coalesce_timeout, Graph, GraphSpec, ProcessorContext, Semaphore, Sink,
    Source, Transform,
};

use crate::config::{validate_pipelining_config, PipeliningConfig};
use crate::error::OrchestratorError;
use crate::pool;
use crate::puller;
use crate::release::{self, ReleaseCommand};

/// Live plugin instances, keyed by the name they were declared under in
/// the graph spec (`SourceSpec::name`, `TransformSpec::name`,
/// sink map key) — resolved to node ids once the graph is built.
pub struct PluginRegistry {
    pub source: Arc<dyn Source>,
    pub transforms: HashMap<String, Arc<dyn Transform>>,
    pub sinks: HashMap<String, Arc<dyn Sink>>,
}

pub struct RunSummary {
    pub run_id: Uuid,
    pub rows_pulled: u64,
    pub rows_released: u64,
    pub checkpoints_taken: usize,
    pub graph_warnings: Vec<String>,
    pub pipelining_warnings: Vec<String>,
}

pub struct Orchestrator {
    run_id: Uuid,
    graph: Arc<Graph>,
    spec: GraphSpec,
    audit: Arc<dyn AuditRecorder>,
    plugins: PluginRegistry,
    pipelining: PipeliningConfig,
    external_call_capacity: usize,
    graph_warnings: Vec<String>,
    pipelining_warnings: Vec<String>,
}

impl Orchestrator {
    pub fn new(
        spec: GraphSpec,
        plugins: PluginRegistry,
        audit: Arc<dyn AuditRecorder>,
        pipelining: PipeliningConfig,
        external_call_capacity: usize,
    ) -> Result<Self, OrchestratorError> {
        let pipelining_warnings = validate_pipelining_config(&pipelining)?;
        for warning in &pipelining_warnings {
            log::warn!("pipelining config: {warning}");
        }

        let (graph, graph_warnings) = elspeth_core::graph::build(&spec)?;
        for warning in &graph_warnings {
            log::warn!("graph build: {warning}");
        }
        elspeth_core::graph::validate_structural(&graph)?;

        Ok(Self {
            run_id: Uuid::new_v4(),
            graph: Arc::new(graph),
            spec,
            audit,
            plugins,
            pipelining,
            external_call_capacity,
            graph_warnings,
            pipelining_warnings,
        })
    }

    pub fn run(self) -> Result<RunSummary, OrchestratorError> {
        let Self {
            run_id,
            graph,
            spec,
            audit,
            plugins,
            pipelining,
            external_call_capacity,
            graph_warnings,
            pipelining_warnings,
        } = self;

        let pipelining_value = serde_json::json!({
            "max_rows_in_flight": pipelining.max_rows_in_flight,
            "max_completed_waiting": pipelining.max_completed_waiting,
            "pool_size": pipelining.pool_size,
            "checkpoint_frequency": pipelining.checkpoint_frequency,
        });
        audit.append(run_id, AuditEventKind::RunStarted { pipelining_config: pipelining_value })?;

        match run_pipeline(run_id, &graph, &spec, Arc::clone(&audit), &plugins, &pipelining, external_call_capacity) {
            Ok((rows_pulled, rows_released, checkpoints_taken)) => {
                audit.append(run_id, AuditEventKind::RunCompleted)?;
                Ok(RunSummary {
                    run_id,
                    rows_pulled,
                    rows_released,
                    checkpoints_taken,
                    graph_warnings,
                    pipelining_warnings,
                })
            }
            Err(err) => {
                let _ = audit.append(run_id, AuditEventKind::RunFailed { cause: err.to_string() });
                Err(err)
            }
        }
    }

}

#[allow(clippy::too_many_arguments)]
fn run_pipeline(
    run_id: Uuid,
    graph: &Arc<Graph>,
    spec: &GraphSpec,
    audit: Arc<dyn AuditRecorder>,
    plugins: &PluginRegistry,
    pipelining: &PipeliningConfig,
    external_call_capacity: usize,
) -> Result<(u64, u64, usize), OrchestratorError> {
    let executors = build_executors(spec, graph)?;

        // Both plain transform nodes and aggregation nodes resolve their
    // plugin through `plugins.transforms`: an aggregation's batch
    // transform (required in both `transform` and `passthrough` mode)
    // is declared under the same name a `TransformSpec` would use, just
    // attached to the aggregation's node id here.
    let transforms_by_node: HashMap<String, Arc<dyn Transform>> = graph
            .nodes
            .values()
            .filter(|n| matches!(n.kind, elspeth_core::NodeKind::Transform | elspeth_core::NodeKind::Aggregation))
            .filter_map(|n| plugins.transforms.get(&n.plugin_name).map(|t| (n.node_id.clone(), Arc::clone(t))))
            .collect();

        let sinks_by_node: HashMap<String, Arc<dyn Sink>> = graph
            .sink_ids
            .iter()
            .filter_map(|id| {
                let node = graph.node(id)?;
                plugins.sinks.get(&node.plugin_name).map(|s| (id.clone(), Arc::clone(s)))
            })
            .collect();

        let sink_node_id_by_name: Arc<HashMap<String, String>> = Arc::new(
            graph
                .sink_ids
                .iter()
                .filter_map(|id| graph.node(id).map(|n| (n.plugin_name.clone(), id.clone())))
                .collect(),
        );

        let processor_ctx = Arc::new(ProcessorContext {
            run_id,
            graph: Arc::clone(graph),
            transforms: transforms_by_node,
            gates: executors.gates,
            aggregations: executors.aggregations,
            coalesces: executors.coalesces,
            audit: Arc::clone(&audit),
            external_calls: Arc::new(Semaphore::new(external_call_capacity.max(1))),
        });

        let (work_tx, work_rx) = crossbeam_channel::bounded(pipelining.max_rows_in_flight.max(1));
        let (release_tx, release_rx) = crossbeam_channel::bounded(pipelining.max_completed_waiting.max(1));
        let row_slots = crate::slots::RowSlots::new(pipelining.max_rows_in_flight);

        let release_handle = release::spawn(
            run_id,
            Arc::clone(graph),
            Arc::clone(&audit),
            sinks_by_node,
            pipelining.checkpoint_frequency,
            release_rx,
        );

        let pool_handles = pool::spawn(pipelining.pool_size, Arc::clone(&processor_ctx), work_rx, release_tx.clone());

        let puller_handle = puller::spawn(
            Arc::clone(&plugins.source),
            run_id,
            Arc::clone(&audit),
            graph.source_id.clone(),
            sink_node_id_by_name,
            row_slots,
            work_tx,
            release_tx.clone(),
        );

        let puller_summary = puller_handle
            .join()
            .map_err(|_| OrchestratorError::WorkerPanicked {
                thread: "elspeth-source-puller".to_string(),
            })??;

        for handle in pool_handles {
            handle
                .join()
                .map_err(|_| OrchestratorError::WorkerPanicked {
                    thread: "elspeth-worker".to_string(),
                })??;
        }

        // End-of-source sweeps: every row the source will ever produce has
        // been pulled and every worker has drained, so any aggregation
        // still holding a partial batch or coalesce still short a branch
        // gets resolved now instead of waiting for an arrival that will
        // never come.
        for (node_id, exec) in &processor_ctx.aggregations {
            if let Some(flush) = exec.flush_end_of_source() {
                let outcomes = process_aggregation_flush(&processor_ctx, node_id, flush)?;
                release_tx
                    .send(ReleaseCommand::Outcomes(outcomes))
                    .map_err(|_| OrchestratorError::ChannelClosed)?;
            }
        }
        for exec in processor_ctx.coalesces.values() {
            for row_id in exec.pending_row_ids() {
                let Some(&seq) = puller_summary.seq_by_row_id.get(&row_id) else {
                    continue;
                };
                let node_id = graph
                    .coalesce_ids
                    .get(exec.name())
                    .cloned()
                    .ok_or_else(|| OrchestratorError::Core(elspeth_core::CoreError::Internal(format!("no node id for coalesce '{}'", exec.name()))))?;
                let outcomes = process_coalesce_timeout(&processor_ctx, exec.name(), &node_id, row_id, seq, Duration::ZERO)?;
                release_tx
                    .send(ReleaseCommand::Outcomes(outcomes))
                    .map_err(|_| OrchestratorError::ChannelClosed)?;
            }
        }
        drop(release_tx);

        let release_summary = release_handle
            .join()
            .map_err(|_| OrchestratorError::WorkerPanicked {
                thread: "elspeth-release-queue".to_string(),
            })??;

        Ok((puller_summary.rows_pulled, release_summary.total_released, release_summary.checkpoints_taken))
}
