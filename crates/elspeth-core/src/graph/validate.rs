use std::collections::{HashSet, VecDeque};

use crate::errors::{ConfigIssue, ConfigurationError};
use crate::model::NodeKind;

use super::builder::Graph;

/// Phase 4: structural validation, run by the orchestrator just
/// before execution (after phase 1-3 have already run at build time).
pub fn validate_structural(graph: &Graph) -> Result<(), ConfigurationError> {
    let mut issues = Vec::new();

    let sources: Vec<_> = graph
        .nodes
        .values()
        .filter(|n| n.kind == NodeKind::Source)
        .collect();
    if sources.len() != 1 {
        issues.push(ConfigIssue::new("graph", format!("expected exactly one source, found {}", sources.len())));
    }

    let sinks: Vec<_> = graph.nodes.values().filter(|n| n.kind == NodeKind::Sink).collect();
    if sinks.is_empty() {
        issues.push(ConfigIssue::new("graph", "graph has no sinks"));
    }

    for node_id in graph.nodes.keys() {
        let mut labels = HashSet::new();
        for edge in graph.outgoing(node_id) {
            if !labels.insert(&edge.label) {
                issues.push(ConfigIssue::new(
                    node_id.clone(),
                    format!("duplicate outgoing edge label '{}'", edge.label),
                ));
            }
        }
    }

    let reachable = reachable_from(graph, &graph.source_id);
    for node_id in graph.nodes.keys() {
        if !reachable.contains(node_id) {
            issues.push(ConfigIssue::new(node_id.clone(), "unreachable from source"));
        }
    }

    if let Some(cycle_node) = find_cycle(graph) {
        issues.push(ConfigIssue::new(cycle_node, "graph contains a cycle"));
    }

    if issues.is_empty() {
        Ok(())
    } else {
        Err(ConfigurationError { issues })
    }
}

fn reachable_from(graph: &Graph, start: &str) -> HashSet<String> {
    let mut seen = HashSet::new();
    let mut queue = VecDeque::new();
    queue.push_back(start.to_string());
    seen.insert(start.to_string());
    while let Some(n) = queue.pop_front() {
        for edge in graph.outgoing(&n) {
            if seen.insert(edge.to_node.clone()) {
                queue.push_back(edge.to_node.clone());
            }
        }
    }
    seen
}

/// DFS-based cycle detection; returns the id of a node on a cycle, if any.
fn find_cycle(graph: &Graph) -> Option<String> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }
    let mut marks: std::collections::HashMap<String, Mark> = std::collections::HashMap::new();

    fn visit(
        graph: &Graph,
        node: &str,
        marks: &mut std::collections::HashMap<String, Mark>,
    ) -> Option<String> {
        match marks.get(node) {
            Some(Mark::Done) => return None,
            Some(Mark::Visiting) => return Some(node.to_string()),
            None => {}
        }
        marks.insert(node.to_string(), Mark::Visiting);
        for edge in graph.outgoing(node) {
            if let Some(c) = visit(graph, &edge.to_node, marks) {
                return Some(c);
            }
        }
        marks.insert(node.to_string(), Mark::Done);
        None
    }

    for node_id in graph.nodes.keys() {
        if let Some(c) = visit(graph, node_id, &mut marks) {
            return Some(c);
        }
    }
    None
}
