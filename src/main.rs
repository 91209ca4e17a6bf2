//! elspeth-demo: a small end-to-end run of the pipeline engine.
//!
//! Pulls a handful of purchase rows through a source, gates them on
//! `amount` into a "high value" and a "standard" sink, and prints the
//! run summary plus each sink's contents. Enable the `pg_demo` feature
//! to back the run with the durable Postgres audit recorder instead of
//! the in-memory one (requires `DATABASE_URL` in the environment).

use std::collections::HashMap;
use std::sync::Arc;

use indexmap::IndexMap;

use elspeth_core::graph::{GateAction, GateSpec, GraphSpec, SinkSpec, SourceSpec, StepSpec};
use elspeth_domain::{SchemaContract, SchemaMode};
use elspeth_orchestrator::{Orchestrator, PipeliningConfig, PluginRegistry};
use elspeth_plugins::{VecSink, VecSource};

fn purchase_row(customer: &str, amount: i64) -> serde_json::Map<String, serde_json::Value> {
    let mut row = serde_json::Map::new();
    row.insert("customer".into(), serde_json::json!(customer));
    row.insert("amount".into(), serde_json::json!(amount));
    row
}

fn main() {
    env_logger::init();

    let schema = SchemaContract::builder(SchemaMode::Observed).build();

    let rows = vec![
        purchase_row("acme", 250),
        purchase_row("globex", 4200),
        purchase_row("initech", 980),
        purchase_row("umbrella", 15000),
    ];
    let source: Arc<dyn elspeth_core::Source> = Arc::new(VecSource::new("purchases", schema.clone(), rows));

    let high_value = Arc::new(VecSink::new("high_value", schema.clone()));
    let standard = Arc::new(VecSink::new("standard", schema.clone()));
    let high_value_dyn: Arc<dyn elspeth_core::Sink> = high_value.clone();
    let standard_dyn: Arc<dyn elspeth_core::Sink> = standard.clone();

    let mut sinks = HashMap::new();
    sinks.insert(
        "high_value".to_string(),
        SinkSpec {
            name: "high_value".to_string(),
            config: serde_json::json!({}),
            input_schema: schema.clone(),
        },
    );
    sinks.insert(
        "standard".to_string(),
        SinkSpec {
            name: "standard".to_string(),
            config: serde_json::json!({}),
            input_schema: schema.clone(),
        },
    );

    let mut routes = HashMap::new();
    routes.insert("true".to_string(), GateAction::RouteTo("high_value".to_string()));
    let gate = GateSpec {
        name: "amount_gate".to_string(),
        config: serde_json::json!({}),
        expression: "row['amount'] > 1000".to_string(),
        routes,
        default: GateAction::RouteTo("standard".to_string()),
    };

    let mut chains = IndexMap::new();
    chains.insert("main".to_string(), vec![StepSpec::Gate(gate)]);

    let spec = GraphSpec {
        source: SourceSpec {
            name: "purchases".to_string(),
            config: serde_json::json!({}),
            output_schema: schema.clone(),
            on_validation_failure: "standard".to_string(),
        },
        chains,
        sinks,
        coalesces: HashMap::new(),
        default_sink: "standard".to_string(),
    };

    let plugins = PluginRegistry {
        source,
        transforms: HashMap::new(),
        sinks: HashMap::from([
            ("high_value".to_string(), high_value_dyn),
            ("standard".to_string(), standard_dyn),
        ]),
    };

    #[cfg(not(feature = "pg_demo"))]
    let audit = elspeth_infra::build_audit_recorder();
    #[cfg(feature = "pg_demo")]
    let audit = elspeth_infra::build_audit_recorder().unwrap_or_else(|e| {
        eprintln!("failed to wire Postgres audit recorder: {e}");
        std::process::exit(1);
    });

    let orchestrator = match Orchestrator::new(spec, plugins, audit, PipeliningConfig::single_threaded(), 4) {
        Ok(o) => o,
        Err(e) => {
            eprintln!("pipeline configuration invalid: {e}");
            std::process::exit(1);
        }
    };

    match orchestrator.run() {
        Ok(summary) => {
            println!(
                "run {} complete: {} rows pulled, {} released, {} checkpoints",
                summary.run_id, summary.rows_pulled, summary.rows_released, summary.checkpoints_taken
            );
            for warning in &summary.graph_warnings {
                println!("graph warning: {warning}");
            }
            println!("high_value sink ({} rows):", high_value.rows().len());
            for row in high_value.rows() {
                println!("  {row}");
            }
            println!("standard sink ({} rows):", standard.rows().len());
            for row in standard.rows() {
                println!("  {row}");
            }
        }
        Err(e) => {
            eprintln!("run failed: {e}");
            std::process::exit(1);
        }
    }
}
