use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeMode {
    Move,
    Copy,
    Divert,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub edge_id: String,
    pub from_node: String,
    pub to_node: String,
    pub mode: EdgeMode,
    pub label: String,
}

impl Edge {
    pub fn new(from_node: impl Into<String>, to_node: impl Into<String>, mode: EdgeMode, label: impl Into<String>) -> Self {
        let from_node = from_node.into();
        let to_node = to_node.into();
        let label = label.into();
        let edge_id = format!("{from_node}->{to_node}:{label}");
        Self {
            edge_id,
            from_node,
            to_node,
            mode,
            label,
        }
    }

    pub fn quarantine_label() -> &'static str {
        "__quarantine__"
    }

    pub fn error_label(transform_seq: usize) -> String {
        format!("__error_{transform_seq}__")
    }
}
