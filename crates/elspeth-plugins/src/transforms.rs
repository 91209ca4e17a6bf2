//! Closure-backed `Transform`: wraps a plain function so
//! tests and the demo pipeline can define transforms inline instead of
//! writing a new type per step. Works for both single-row transforms
//! and the batch-aware transforms an aggregation's `transform` output
//! mode calls (`TransformInput::Batch`).

use elspeth_core::{Determinism, ExecutionContext, Transform, TransformInput, TransformResult};
use elspeth_domain::{RowData, SchemaContract};

type RowFn = dyn Fn(&RowData) -> Result<serde_json::Map<String, serde_json::Value>, String> + Send + Sync;
type BatchFn = dyn Fn(&[RowData]) -> Result<Vec<serde_json::Map<String, serde_json::Value>>, String> + Send + Sync;

enum Body {
    Row(Box<RowFn>),
    Batch(Box<BatchFn>),
}

/// A `Transform` whose behavior is a Rust closure rather than a
/// dedicated struct. `Transform::new` builds a row-at-a-time transform;
/// `Transform::new_batch` builds one that only accepts
/// `TransformInput::Batch` (for aggregation `transform` output mode).
pub struct ClosureTransform {
    name: String,
    input_schema: SchemaContract,
    output_schema: SchemaContract,
    body: Body,
}

impl ClosureTransform {
    pub fn new<F>(name: impl Into<String>, input_schema: SchemaContract, output_schema: SchemaContract, f: F) -> Self
    where
        F: Fn(&RowData) -> Result<serde_json::Map<String, serde_json::Value>, String> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            input_schema,
            output_schema,
            body: Body::Row(Box::new(f)),
        }
    }

    pub fn new_batch<F>(name: impl Into<String>, input_schema: SchemaContract, output_schema: SchemaContract, f: F) -> Self
    where
        F: Fn(&[RowData]) -> Result<Vec<serde_json::Map<String, serde_json::Value>>, String> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            input_schema,
            output_schema,
            body: Body::Batch(Box::new(f)),
        }
    }
}

impl Transform for ClosureTransform {
    fn name(&self) -> &str {
        &self.name
    }

    fn input_schema(&self) -> &SchemaContract {
        &self.input_schema
    }

    fn output_schema(&self) -> &SchemaContract {
        &self.output_schema
    }

    fn determinism(&self) -> Determinism {
        Determinism::Deterministic
    }

    fn plugin_version(&self) -> &str {
        "1.0.0"
    }

    fn is_batch_aware(&self) -> bool {
        matches!(self.body, Body::Batch(_))
    }

    fn process(&self, input: TransformInput, _ctx: &ExecutionContext) -> TransformResult {
        let contract = std::sync::Arc::new(self.output_schema.clone());
        match (&self.body, input) {
            (Body::Row(f), TransformInput::Single(row)) => match f(&row) {
                Ok(fields) => TransformResult::Success {
                    row: RowData::new(contract, fields),
                    success_reason: "ok".to_string(),
                    contract: None,
                },
                Err(reason) => TransformResult::Error { reason, retryable: false },
            },
            (Body::Batch(f), TransformInput::Batch(rows)) => match f(&rows) {
                Ok(rows_out) if rows_out.is_empty() => {
                    TransformResult::Error { reason: "batch transform produced zero rows".to_string(), retryable: false }
                }
                Ok(rows_out) => TransformResult::SuccessMulti {
                    rows: rows_out.into_iter().map(|fields| RowData::new(contract.clone(), fields)).collect(),
                    success_reason: "ok".to_string(),
                    contract: None,
                },
                Err(reason) => TransformResult::Error { reason, retryable: false },
            },
            _ => TransformResult::Error { reason: "transform invoked with the wrong input shape".to_string(), retryable: false },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use elspeth_domain::SchemaMode;
    use uuid::Uuid;

    #[test]
    fn row_transform_doubles_a_field() {
        let schema = SchemaContract::builder(SchemaMode::Observed).build();
        let transform = ClosureTransform::new("double", schema.clone(), schema.clone(), |row| {
            let n = row.fields.get("n").and_then(|v| v.as_i64()).unwrap_or(0);
            let mut out = row.fields.clone();
            out.insert("n".into(), serde_json::json!(n * 2));
            Ok(out)
        });
        let ctx = ExecutionContext { run_id: Uuid::new_v4(), node_id: "transform_double_1".into() };
        let mut fields = serde_json::Map::new();
        fields.insert("n".into(), serde_json::json!(3));
        let row = RowData::new(std::sync::Arc::new(schema), fields);

        match transform.process(TransformInput::Single(row), &ctx) {
            TransformResult::Success { row, .. } => assert_eq!(row.fields.get("n"), Some(&serde_json::json!(6))),
            _ => panic!("expected success"),
        }
    }

    #[test]
    fn batch_transform_rejects_empty_output() {
        let schema = SchemaContract::builder(SchemaMode::Observed).build();
        let transform = ClosureTransform::new_batch("sum", schema.clone(), schema, |_rows| Ok(vec![]));
        let ctx = ExecutionContext { run_id: Uuid::new_v4(), node_id: "agg_sum_1".into() };
        match transform.process(TransformInput::Batch(vec![]), &ctx) {
            TransformResult::Error { .. } => {}
            _ => panic!("expected error on empty success_multi"),
        }
    }
}
