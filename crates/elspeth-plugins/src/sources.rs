//! In-memory `Source`: yields a fixed vector of rows, in
//! order, once. Used by tests and the demo binary; a production
//! deployment would instead read a file, queue, or database cursor.

use std::sync::Mutex;

use elspeth_core::{Determinism, Source, SourceRow};
use elspeth_domain::{RowData, SchemaContract};

pub struct VecSource {
    name: String,
    output_schema: SchemaContract,
    rows: Mutex<Vec<serde_json::Map<String, serde_json::Value>>>,
}

impl VecSource {
    pub fn new(name: impl Into<String>, output_schema: SchemaContract, rows: Vec<serde_json::Map<String, serde_json::Value>>) -> Self {
        Self {
            name: name.into(),
            output_schema,
            rows: Mutex::new(rows),
        }
    }
}

impl Source for VecSource {
    fn name(&self) -> &str {
        &self.name
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

    fn on_validation_failure(&self) -> &str {
        "quarantine"
    }

    fn load(&self, _ctx: &elspeth_core::ExecutionContext) -> Box<dyn Iterator<Item = SourceRow> + '_> {
        let rows = std::mem::take(&mut *self.rows.lock().expect("VecSource rows lock poisoned"));
        let contract = std::sync::Arc::new(self.output_schema.clone());
        Box::new(rows.into_iter().map(move |fields| SourceRow::Valid {
            row: RowData::new(contract.clone(), fields),
            contract: None,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use elspeth_domain::SchemaMode;
    use uuid::Uuid;

    #[test]
    fn yields_rows_in_order_exactly_once() {
        let schema = SchemaContract::builder(SchemaMode::Observed).build();
        let mut row = serde_json::Map::new();
        row.insert("n".into(), serde_json::json!(1));
        let source = VecSource::new("vec_source", schema, vec![row.clone()]);
        let ctx = elspeth_core::ExecutionContext {
            run_id: Uuid::new_v4(),
            node_id: "source_vec_1".into(),
        };

        let first: Vec<_> = source.load(&ctx).collect();
        assert_eq!(first.len(), 1);

        let second: Vec<_> = source.load(&ctx).collect();
        assert!(second.is_empty(), "source should not replay rows once drained");
    }
}
