use std::collections::HashMap;

use crate::errors::{ConfigIssue, ConfigurationError};
use crate::model::{node_id, Edge, EdgeMode, Node, NodeKind, SchemaRef};

use super::spec::{GateAction, GraphSpec, StepSpec};

/// A fully wired, validated execution graph. Read-only after
/// construction; accessors return copies of internal maps.
#[derive(Debug, Clone)]
pub struct Graph {
    pub nodes: HashMap<String, Node>,
    pub edges: Vec<Edge>,
    pub source_id: String,
    pub sink_ids: Vec<String>,
    pub default_sink_id: String,
    /// chain name ("main" or a fork branch name) -> ordered node ids.
    pub chains: HashMap<String, Vec<String>>,
    pub coalesce_ids: HashMap<String, String>,
}

impl Graph {
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    /// Copy of the node-id map, per the "accessors return copies" rule.
    pub fn node_ids(&self) -> Vec<String> {
        self.nodes.keys().cloned().collect()
    }

    pub fn outgoing(&self, node_id: &str) -> Vec<&Edge> {
        self.edges.iter().filter(|e| e.from_node == node_id).collect()
    }
}

struct SeqAllocator {
    seen: HashMap<(String, String), u32>,
}

impl SeqAllocator {
    fn new() -> Self {
        Self { seen: HashMap::new() }
    }

    fn alloc(&mut self, kind: NodeKind, name: &str, config: &serde_json::Value) -> String {
        let h = crate::hashing::hash12(config);
        let key = (kind.prefix().to_string(), h);
        let count = self.seen.entry(key).or_insert(0);
        let seq = if *count == 0 { None } else { Some(*count) };
        *count += 1;
        node_id(kind, name, config, seq)
    }
}

/// Runs construction phases 1-3: create nodes, wire edges, and
/// validate schema compatibility. Phase 4 (structural validation) is run
/// separately by the orchestrator just before execution, via
/// `super::validate::validate_structural`.
pub fn build(spec: &GraphSpec) -> Result<(Graph, Vec<String>), ConfigurationError> {
    let mut issues = Vec::new();
    let mut warnings = Vec::new();
    let mut alloc = SeqAllocator::new();
    let mut nodes: HashMap<String, Node> = HashMap::new();
    let mut edges: Vec<Edge> = Vec::new();

    // --- Phase 1: create nodes (source -> sinks -> transforms -> aggregations -> gates -> coalesces).
    let source_id = alloc.alloc(NodeKind::Source, &spec.source.name, &spec.source.config);
    nodes.insert(
        source_id.clone(),
        Node {
            node_id: source_id.clone(),
            kind: NodeKind::Source,
            plugin_name: spec.source.name.clone(),
            config: spec.source.config.clone(),
            input_schema: None,
            output_schema: Some(SchemaRef::new(spec.source.output_schema.clone())),
        },
    );

    let mut sink_ids: HashMap<String, String> = HashMap::new();
    for (name, sink) in &spec.sinks {
        let id = alloc.alloc(NodeKind::Sink, name, &sink.config);
        nodes.insert(
            id.clone(),
            Node {
                node_id: id.clone(),
                kind: NodeKind::Sink,
                plugin_name: sink.name.clone(),
                config: sink.config.clone(),
                input_schema: Some(SchemaRef::new(sink.input_schema.clone())),
                output_schema: None,
            },
        );
        sink_ids.insert(name.clone(), id);
    }
    let Some(default_sink_id) = sink_ids.get(&spec.default_sink).cloned() else {
        issues.push(ConfigIssue::new("default_sink", format!("unknown sink '{}'", spec.default_sink)));
        return Err(ConfigurationError { issues });
    };

    // Transforms, aggregations and gates: created per chain, in declared order.
    let mut chain_node_ids: HashMap<String, Vec<String>> = HashMap::new();
    for (chain_name, steps) in &spec.chains {
        let mut ids = Vec::new();
        for (seq, step) in steps.iter().enumerate() {
            match step {
                StepSpec::Transform(t) => {
                    let id = alloc.alloc(NodeKind::Transform, &t.name, &t.config);
                    nodes.insert(
                        id.clone(),
                        Node {
                            node_id: id.clone(),
                            kind: NodeKind::Transform,
                            plugin_name: t.name.clone(),
                            config: t.config.clone(),
                            input_schema: Some(SchemaRef::new(t.input_schema.clone())),
                            output_schema: Some(SchemaRef::new(t.output_schema.clone())),
                        },
                    );
                    ids.push(id);
                    if let Some(err_sink) = &t.on_error {
                        if !sink_ids.contains_key(err_sink) {
                            issues.push(ConfigIssue::new(
                                format!("{chain_name}[{seq}].on_error"),
                                format!("unknown sink '{err_sink}'"),
                            ));
                        }
                    }
                }
                StepSpec::Aggregation(a) => {
                    let id = alloc.alloc(NodeKind::Aggregation, &a.name, &a.config);
                    nodes.insert(
                        id.clone(),
                        Node {
                            node_id: id.clone(),
                            kind: NodeKind::Aggregation,
                            plugin_name: a.name.clone(),
                            config: a.config.clone(),
                            input_schema: Some(SchemaRef::new(a.input_schema.clone())),
                            output_schema: Some(SchemaRef::new(a.output_schema.clone())),
                        },
                    );
                    ids.push(id);
                }
                StepSpec::Gate(g) => {
                    let id = alloc.alloc(NodeKind::Gate, &g.name, &g.config);
                    nodes.insert(
                        id.clone(),
                        Node {
                            node_id: id.clone(),
                            kind: NodeKind::Gate,
                            plugin_name: g.name.clone(),
                            config: g.config.clone(),
                            input_schema: None,
                            output_schema: None,
                        },
                    );
                    ids.push(id.clone());
                    for (result, action) in &g.routes {
                        validate_gate_action(action, &spec.sinks, &spec.chains, &mut issues, &format!("{chain_name}.{}[{result}]", g.name));
                    }
                    validate_gate_action(&g.default, &spec.sinks, &spec.chains, &mut issues, &format!("{chain_name}.{}[default]", g.name));
                }
                StepSpec::CoalesceJoin(_) => {}
            }
        }
        chain_node_ids.insert(chain_name.clone(), ids);
    }

    let mut coalesce_ids: HashMap<String, String> = HashMap::new();
    for (name, c) in &spec.coalesces {
        let id = alloc.alloc(NodeKind::Coalesce, name, &c.config);
        nodes.insert(
            id.clone(),
            Node {
                node_id: id.clone(),
                kind: NodeKind::Coalesce,
                plugin_name: name.clone(),
                config: c.config.clone(),
                input_schema: None,
                output_schema: None,
            },
        );
        coalesce_ids.insert(name.clone(), id);
        if !spec.chains.contains_key(&c.continues_on) {
            issues.push(ConfigIssue::new(format!("coalesce.{name}.continues_on"), format!("unknown chain '{}'", c.continues_on)));
        }
    }

    if !issues.is_empty() {
        return Err(ConfigurationError { issues });
    }

    // --- Phase 2: wire edges.
    // Source -> first node of "main" chain (or default sink if main is empty).
    let main_first = chain_node_ids.get("main").and_then(|v| v.first().cloned());
    let main_target = main_first.clone().unwrap_or_else(|| default_sink_id.clone());
    edges.push(Edge::new(source_id.clone(), main_target, EdgeMode::Move, "continue"));
    edges.push(Edge::new(
        source_id.clone(),
        sink_ids
            .get(&spec.source.on_validation_failure)
            .cloned()
            .unwrap_or_else(|| default_sink_id.clone()),
        EdgeMode::Divert,
        Edge::quarantine_label(),
    ));

    for (chain_name, steps) in &spec.chains {
        let ids = &chain_node_ids[chain_name];
        let mut transform_seq = 0usize;
        let mut cursor = 0usize; // index into `ids`
        for (i, step) in steps.iter().enumerate() {
            let this_id = match step {
                StepSpec::CoalesceJoin(_) => None,
                _ => {
                    let id = ids[cursor].clone();
                    cursor += 1;
                    Some(id)
                }
            };
            let next_default = if i + 1 < steps.len() {
                match &steps[i + 1] {
                    StepSpec::CoalesceJoin(coalesce_name) => coalesce_ids[coalesce_name].clone(),
                    _ => ids[cursor].clone(),
                }
            } else {
                default_sink_id.clone()
            };

            match step {
                StepSpec::Transform(t) => {
                    let this_id = this_id.unwrap();
                    edges.push(Edge::new(this_id.clone(), next_default.clone(), EdgeMode::Move, "continue"));
                    if let Some(err_sink) = &t.on_error {
                        let target = sink_ids[err_sink].clone();
                        edges.push(Edge::new(this_id, target, EdgeMode::Divert, Edge::error_label(transform_seq)));
                    }
                    transform_seq += 1;
                }
                StepSpec::Aggregation(_) => {
                    let this_id = this_id.unwrap();
                    edges.push(Edge::new(this_id, next_default, EdgeMode::Move, "continue"));
                }
                StepSpec::Gate(g) => {
                    let this_id = this_id.unwrap();
                    for (result, action) in &g.routes {
                        wire_gate_action(&this_id, result, action, &next_default, &sink_ids, &chain_node_ids, &coalesce_ids, &mut edges);
                    }
                    wire_gate_action(&this_id, "__default__", &g.default, &next_default, &sink_ids, &chain_node_ids, &coalesce_ids, &mut edges);
                }
                StepSpec::CoalesceJoin(coalesce_name) => {
                    // incoming edge from the previous node in this chain (if any) into the coalesce.
                    if i > 0 {
                        if let Some(prev_id) = ids.get(cursor.saturating_sub(1)) {
                            edges.push(Edge::new(prev_id.clone(), coalesce_ids[coalesce_name].clone(), EdgeMode::Move, "join"));
                        }
                    }
                }
            }
        }
    }

    for (name, c) in &spec.coalesces {
        let target = chain_node_ids
            .get(&c.continues_on)
            .and_then(|v| v.first().cloned())
            .unwrap_or_else(|| default_sink_id.clone());
        edges.push(Edge::new(coalesce_ids[name].clone(), target, EdgeMode::Move, "continue"));

        if matches!(c.policy, super::spec::CoalescePolicy::RequireAll) {
            for branch in &c.expected_branches {
                if let Some(branch_steps) = spec.chains.get(branch) {
                    let divert_between_fork_and_require_all = branch_steps.iter().any(|s| {
                        matches!(s, StepSpec::Transform(t) if t.on_error.is_some())
                    });
                    if divert_between_fork_and_require_all {
                        warnings.push(format!(
                            "DIVERT_COALESCE_REQUIRE_ALL: branch '{branch}' feeding require_all coalesce '{name}' has an on_error DIVERT"
                        ));
                    }
                }
            }
        }
    }

    if !issues.is_empty() {
        return Err(ConfigurationError { issues });
    }

    // --- Phase 3: schema validation.
    validate_schema(&nodes, &edges, &mut issues);
    if !issues.is_empty() {
        return Err(ConfigurationError { issues });
    }

    let sink_id_list: Vec<String> = sink_ids.values().cloned().collect();
    Ok((
        Graph {
            nodes,
            edges,
            source_id,
            sink_ids: sink_id_list,
            default_sink_id,
            chains: chain_node_ids,
            coalesce_ids,
        },
        warnings,
    ))
}

fn validate_gate_action(
    action: &GateAction,
    sinks: &HashMap<String, super::spec::SinkSpec>,
    chains: &indexmap::IndexMap<String, Vec<StepSpec>>,
    issues: &mut Vec<ConfigIssue>,
    location: &str,
) {
    match action {
        GateAction::Continue => {}
        GateAction::RouteTo(sink) => {
            if !sinks.contains_key(sink) {
                issues.push(ConfigIssue::new(location, format!("unknown sink '{sink}'")));
            }
        }
        GateAction::Fork(branches) => {
            for b in branches {
                if !chains.contains_key(&b.chain) && !sinks.contains_key(&b.chain) {
                    issues.push(ConfigIssue::new(
                        location,
                        format!("fork branch '{}' maps to neither a chain nor a sink", b.branch_name),
                    ));
                }
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn wire_gate_action(
    from: &str,
    label: &str,
    action: &GateAction,
    next_default: &str,
    sink_ids: &HashMap<String, String>,
    chain_node_ids: &HashMap<String, Vec<String>>,
    coalesce_ids: &HashMap<String, String>,
    edges: &mut Vec<Edge>,
) {
    match action {
        GateAction::Continue => {
            edges.push(Edge::new(from, next_default.to_string(), EdgeMode::Move, label));
        }
        GateAction::RouteTo(sink) => {
            edges.push(Edge::new(from, sink_ids[sink].clone(), EdgeMode::Move, label));
        }
        GateAction::Fork(branches) => {
            for b in branches {
                let target = chain_node_ids
                    .get(&b.chain)
                    .and_then(|v| v.first().cloned())
                    .or_else(|| sink_ids.get(&b.chain).cloned())
                    .or_else(|| coalesce_ids.get(&b.chain).cloned())
                    .expect("validated by validate_gate_action");
                edges.push(Edge::new(from, target, EdgeMode::Copy, format!("{label}:{}", b.branch_name)));
            }
        }
    }
}

fn effective_schema<'a>(nodes: &'a HashMap<String, Node>, node_id: &str) -> Option<&'a SchemaRef> {
    nodes.get(node_id).and_then(|n| n.output_schema.as_ref().or(n.input_schema.as_ref()))
}

fn validate_schema(nodes: &HashMap<String, Node>, edges: &[Edge], issues: &mut Vec<ConfigIssue>) {
    for edge in edges {
        if matches!(edge.mode, EdgeMode::Divert) {
            continue;
        }
        let Some(producer) = effective_schema(nodes, &edge.from_node) else { continue };
        let Some(consumer_node) = nodes.get(&edge.to_node) else { continue };
        let Some(consumer) = consumer_node.input_schema.as_ref() else { continue };
        if producer.is_observed() || consumer.is_observed() {
            continue;
        }
        if let Err(missing) = producer.contract.satisfies(&consumer.contract) {
            issues.push(ConfigIssue::new(
                edge.edge_id.clone(),
                format!("producer does not satisfy consumer schema, missing fields: {missing:?}"),
            ));
        }
    }
}
