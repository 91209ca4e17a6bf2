//! Declarative input to `GraphBuilder`. These descriptors are what a
//! plugin exposes once its constructor has run — the builder
//! itself never touches a live plugin instance, only the schemas/config
//! it already produced, so `elspeth-core` stays independent of the
//! plugin trait objects defined in `elspeth-plugins`.

use std::collections::HashMap;

use elspeth_domain::{MergeStrategy, SchemaContract};
use indexmap::IndexMap;
use serde_json::Value;

#[derive(Debug, Clone)]
pub struct SourceSpec {
    pub name: String,
    pub config: Value,
    pub output_schema: SchemaContract,
    pub on_validation_failure: String,
}

#[derive(Debug, Clone)]
pub struct TransformSpec {
    pub name: String,
    pub config: Value,
    pub input_schema: SchemaContract,
    pub output_schema: SchemaContract,
    pub on_error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SinkSpec {
    pub name: String,
    pub config: Value,
    pub input_schema: SchemaContract,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregationOutputMode {
    Transform,
    Passthrough,
}

#[derive(Debug, Clone)]
pub enum AggregationTrigger {
    Count(usize),
    Elapsed(std::time::Duration),
    Condition(String),
    EndOfSource,
    Manual,
}

#[derive(Debug, Clone)]
pub struct AggregationSettings {
    pub output_mode: AggregationOutputMode,
    pub triggers: Vec<AggregationTrigger>,
    pub expected_output_count: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct AggregationSpec {
    pub name: String,
    pub config: Value,
    pub input_schema: SchemaContract,
    pub output_schema: SchemaContract,
    pub settings: AggregationSettings,
}

#[derive(Debug, Clone)]
pub enum GateAction {
    Continue,
    RouteTo(String),
    Fork(Vec<ForkBranch>),
}

#[derive(Debug, Clone)]
pub struct ForkBranch {
    pub branch_name: String,
    /// Key into `GraphSpec::chains` for this branch's sub-chain.
    pub chain: String,
}

#[derive(Debug, Clone)]
pub struct GateSpec {
    pub name: String,
    pub config: Value,
    pub expression: String,
    /// Result string -> action. Must be exhaustive at config time; an
    /// unmatched result at runtime is impossible once `default` is set.
    pub routes: HashMap<String, GateAction>,
    pub default: GateAction,
}

#[derive(Debug, Clone, Copy)]
pub enum CoalescePolicy {
    RequireAll,
    Quorum(usize),
    BestEffort,
    First,
}

#[derive(Debug, Clone)]
pub struct CoalesceSpec {
    pub name: String,
    pub config: Value,
    pub expected_branches: Vec<String>,
    pub policy: CoalescePolicy,
    pub merge_strategy: MergeStrategy,
    /// Chain the merged token continues on after the join.
    pub continues_on: String,
}

#[derive(Debug, Clone)]
pub enum StepSpec {
    Transform(TransformSpec),
    Aggregation(AggregationSpec),
    Gate(GateSpec),
    /// Terminates this chain by feeding the named coalesce.
    CoalesceJoin(String),
}

/// A whole pipeline description: one source, a named set of step chains
/// (`"main"` plus one per fork branch), the sinks and coalesces they can
/// reference.
#[derive(Debug, Clone)]
pub struct GraphSpec {
    pub source: SourceSpec,
    pub chains: IndexMap<String, Vec<StepSpec>>,
    pub sinks: HashMap<String, SinkSpec>,
    pub coalesces: HashMap<String, CoalesceSpec>,
    pub default_sink: String,
}
