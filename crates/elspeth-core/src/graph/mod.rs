//! DAG construction and validation.

pub mod builder;
pub mod executors;
pub mod spec;
pub mod validate;

pub use builder::{build, Graph};
pub use executors::{build_executors, Executors};
pub use spec::{
    AggregationOutputMode, AggregationSettings, AggregationSpec, AggregationTrigger, CoalescePolicy,
    CoalesceSpec, ForkBranch, GateAction, GateSpec, GraphSpec, SinkSpec, SourceSpec, StepSpec, TransformSpec,
};
pub use validate::validate_structural;
