//! elspeth-cli: a small standalone binary that runs one pipeline
//! through the orchestrator and prints its run summary. For a richer
//! demo (an aggregation and a fork/coalesce), see the workspace's
//! `elspeth-demo` binary at the repository root.

use std::collections::HashMap;
use std::sync::Arc;

use indexmap::IndexMap;

use elspeth_core::graph::{GraphSpec, SinkSpec, SourceSpec, StepSpec, TransformSpec};
use elspeth_domain::{SchemaContract, SchemaMode};
use elspeth_orchestrator::{Orchestrator, PipeliningConfig, PluginRegistry};
use elspeth_plugins::{ClosureTransform, VecSink, VecSource};

fn main() {
    env_logger::init();

    let schema = SchemaContract::builder(SchemaMode::Observed).build();

    let mut row = serde_json::Map::new();
    row.insert("text".into(), serde_json::json!("hello from elspeth-cli"));
    let source: Arc<dyn elspeth_core::Source> = Arc::new(VecSource::new("rows", schema.clone(), vec![row]));

    let upper: Arc<dyn elspeth_core::Transform> = Arc::new(ClosureTransform::new("uppercase", schema.clone(), schema.clone(), |row| {
        let mut out = row.fields.clone();
        if let Some(text) = row.fields.get("text").and_then(|v| v.as_str()) {
            out.insert("text".into(), serde_json::json!(text.to_uppercase()));
        }
        Ok(out)
    }));

    let sink = Arc::new(VecSink::new("out", schema.clone()));
    let sink_dyn: Arc<dyn elspeth_core::Sink> = sink.clone();

    let mut sinks = HashMap::new();
    sinks.insert(
        "out".to_string(),
        SinkSpec {
            name: "out".to_string(),
            config: serde_json::json!({}),
            input_schema: schema.clone(),
        },
    );

    let mut chains = IndexMap::new();
    chains.insert(
        "main".to_string(),
        vec![StepSpec::Transform(TransformSpec {
            name: "uppercase".to_string(),
            config: serde_json::json!({}),
            input_schema: schema.clone(),
            output_schema: schema.clone(),
            on_error: None,
        })],
    );

    let spec = GraphSpec {
        source: SourceSpec {
            name: "rows".to_string(),
            config: serde_json::json!({}),
            output_schema: schema.clone(),
            on_validation_failure: "out".to_string(),
        },
        chains,
        sinks,
        coalesces: HashMap::new(),
        default_sink: "out".to_string(),
    };

    let plugins = PluginRegistry {
        source,
        transforms: HashMap::from([("uppercase".to_string(), upper)]),
        sinks: HashMap::from([("out".to_string(), sink_dyn)]),
    };

    let audit = elspeth_infra::build_audit_recorder();

    let orchestrator = match Orchestrator::new(spec, plugins, audit, PipeliningConfig::single_threaded(), 4) {
        Ok(o) => o,
        Err(e) => {
            eprintln!("pipeline configuration invalid: {e}");
            std::process::exit(1);
        }
    };

    match orchestrator.run() {
        Ok(summary) => {
            println!("run {} complete: {} rows pulled, {} released, {} checkpoints", summary.run_id, summary.rows_pulled, summary.rows_released, summary.checkpoints_taken);
            for row in sink.rows() {
                println!("{row}");
            }
        }
        Err(e) => {
            eprintln!("run failed: {e}");
            std::process::exit(1);
        }
    }
}
