use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::hashing::hash12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Source,
    Transform,
    Gate,
    Aggregation,
    Coalesce,
    Sink,
}

impl NodeKind {
    /// Node ID prefix table.
    pub fn prefix(&self) -> &'static str {
        match self {
            NodeKind::Source => "src",
            NodeKind::Transform => "xf",
            NodeKind::Gate => "gate",
            NodeKind::Aggregation => "agg",
            NodeKind::Coalesce => "coal",
            NodeKind::Sink => "sink",
        }
    }
}

/// Deterministic node identifier: `prefix_name_hash12[_seq]`.
pub fn node_id(kind: NodeKind, name: &str, config: &Value, seq: Option<u32>) -> String {
    let h = hash12(config);
    match seq {
        Some(n) => format!("{}_{}_{}_{}", kind.prefix(), name, h, n),
        None => format!("{}_{}_{}", kind.prefix(), name, h),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub node_id: String,
    pub kind: NodeKind,
    pub plugin_name: String,
    pub config: Value,
    pub input_schema: Option<SchemaRef>,
    pub output_schema: Option<SchemaRef>,
}

/// A contract attached to a node, tagged with its schema mode so graph
/// validation can skip `observed` edges without downcasting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaRef {
    pub contract: elspeth_domain::SchemaContract,
}

impl SchemaRef {
    pub fn new(contract: elspeth_domain::SchemaContract) -> Self {
        Self { contract }
    }

    pub fn is_observed(&self) -> bool {
        self.contract.mode == elspeth_domain::SchemaMode::Observed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_is_pure_function_of_config() {
        let cfg = serde_json::json!({"path": "/tmp/x.csv"});
        let a = node_id(NodeKind::Source, "csv", &cfg, None);
        let b = node_id(NodeKind::Source, "csv", &cfg, None);
        assert_eq!(a, b);
        assert!(a.starts_with("src_csv_"));
    }

    #[test]
    fn node_id_changes_with_config() {
        let a = node_id(NodeKind::Transform, "upper", &serde_json::json!({"k": 1}), None);
        let b = node_id(NodeKind::Transform, "upper", &serde_json::json!({"k": 2}), None);
        assert_ne!(a, b);
    }
}
