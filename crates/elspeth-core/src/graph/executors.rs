//! Builds the flow-control executors (gates/aggregations/coalesces) that
//! accompany a `Graph`, keyed by the same node ids `builder::build`
//! assigned them. Kept separate from `build` itself so `Graph` stays a
//! plain data value with no executor state, shareable read-only across
//! worker threads while the executors (which hold real `Mutex` state)
//! are handed out individually.

use std::collections::HashMap;

use crate::errors::ConfigurationError;
use crate::flow_control::{AggregationExecutor, CoalesceExecutor, GateExecutor};

use super::builder::Graph;
use super::spec::{GraphSpec, StepSpec};

pub struct Executors {
    pub gates: HashMap<String, GateExecutor>,
    pub aggregations: HashMap<String, AggregationExecutor>,
    pub coalesces: HashMap<String, CoalesceExecutor>,
}

/// Walks `spec.chains` in the same declared order `builder::build` used
/// to allocate node ids, zipping each non-`CoalesceJoin` step against the
/// node id `graph.chains` recorded for that chain. Must be called with
/// the `Graph` `build` produced from this exact `spec` — a mismatched
/// pair silently builds an empty or partial executor set.
pub fn build_executors(spec: &GraphSpec, graph: &Graph) -> Result<Executors, ConfigurationError> {
    let mut issues = Vec::new();
    let mut gates = HashMap::new();
    let mut aggregations = HashMap::new();

    for (chain_name, steps) in &spec.chains {
        let Some(ids) = graph.chains.get(chain_name) else { continue };
        let mut cursor = 0usize;
        for step in steps {
            match step {
                StepSpec::Transform(_) => cursor += 1,
                StepSpec::Aggregation(a) => {
                    let id = ids[cursor].clone();
                    cursor += 1;
                    match AggregationExecutor::new(id.clone(), a) {
                        Ok(exec) => {
                            aggregations.insert(id, exec);
                        }
                        Err(e) => issues.extend(e.issues),
                    }
                }
                StepSpec::Gate(g) => {
                    let id = ids[cursor].clone();
                    cursor += 1;
                    match GateExecutor::new(id.clone(), g.clone()) {
                        Ok(exec) => {
                            gates.insert(id, exec);
                        }
                        Err(e) => issues.extend(e.issues),
                    }
                }
                StepSpec::CoalesceJoin(_) => {}
            }
        }
    }

    let mut coalesces = HashMap::new();
    for (name, c) in &spec.coalesces {
        if let Some(id) = graph.coalesce_ids.get(name) {
            coalesces.insert(name.clone(), CoalesceExecutor::new(id.clone(), name.clone(), c.clone()));
        }
    }

    if !issues.is_empty() {
        return Err(ConfigurationError { issues });
    }
    Ok(Executors {
        gates,
        aggregations,
        coalesces,
    })
}
