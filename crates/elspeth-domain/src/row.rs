use std::sync::Arc;

use serde_json::{Map, Value};

use crate::contract::SchemaContract;

/// Row payload plus the (shared, immutable) contract it was produced
/// under.
#[derive(Debug, Clone)]
pub struct RowData {
    pub contract: Arc<SchemaContract>,
    pub fields: Map<String, Value>,
}

impl RowData {
    pub fn new(contract: Arc<SchemaContract>, fields: Map<String, Value>) -> Self {
        Self { contract, fields }
    }

    /// Deep-copies the row payload for a fork child; the contract
    /// reference is shared, never copied.
    pub fn fork_copy(&self) -> Self {
        Self {
            contract: Arc::clone(&self.contract),
            fields: self.fields.clone(),
        }
    }

    pub fn as_value(&self) -> Value {
        Value::Object(self.fields.clone())
    }
}

/// Result of a `union` merge across coalesce branches: the merged
/// payload plus the names of fields that collided (last writer wins).
pub struct UnionMergeResult {
    pub fields: Map<String, Value>,
    pub collisions: Vec<String>,
}

/// Merges branch row payloads for `MergeStrategy::Union`. Branches are
/// applied in order; a later branch's value for an already-set field
/// wins and the field name is recorded as a collision.
pub fn merge_rows_union(branches: &[(String, Map<String, Value>)]) -> UnionMergeResult {
    let mut merged = Map::new();
    let mut collisions = Vec::new();
    for (_, fields) in branches {
        for (key, value) in fields {
            if merged.contains_key(key) {
                collisions.push(key.clone());
            }
            merged.insert(key.clone(), value.clone());
        }
    }
    collisions.sort();
    collisions.dedup();
    UnionMergeResult {
        fields: merged,
        collisions,
    }
}

/// `nested` merge: `{branch_name: branch_row}`.
pub fn merge_rows_nested(branches: &[(String, Map<String, Value>)]) -> Map<String, Value> {
    let mut out = Map::new();
    for (name, fields) in branches {
        out.insert(name.clone(), Value::Object(fields.clone()));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn union_merge_tracks_collisions_last_writer_wins() {
        let mut a = Map::new();
        a.insert("id".to_string(), Value::from(1));
        a.insert("sentiment".to_string(), Value::from("positive"));
        let mut b = Map::new();
        b.insert("id".to_string(), Value::from(1));
        b.insert("entities".to_string(), Value::from(vec!["X"]));

        let result = merge_rows_union(&[
            ("sentiment_path".to_string(), a),
            ("entity_path".to_string(), b),
        ]);
        assert_eq!(result.collisions, vec!["id".to_string()]);
        assert_eq!(result.fields.get("id"), Some(&Value::from(1)));
        assert_eq!(result.fields.get("sentiment"), Some(&Value::from("positive")));
        assert_eq!(result.fields.get("entities"), Some(&Value::from(vec!["X"])));
    }
}
