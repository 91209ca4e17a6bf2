//! elspeth-core: the execution graph, row processor and flow-control
//! executors.
//!
//! Components:
//! - `model`: node/edge/token/outcome/routing value types.
//! - `graph`: `GraphSpec` -> `Graph` construction and structural
//!   validation.
//! - `audit`: the `AuditRecorder` trait and its event vocabulary.
//!   `elspeth-persistence` supplies the durable Postgres backend; the
//!   in-memory recorder here backs tests and `max_rows_in_flight = 1`
//!   demo runs.
//! - `contracts`: the plugin-facing `Source`/`Transform`/`Sink` traits
//!   consumed by `elspeth-plugins` and driven by `elspeth-orchestrator`
//!   consumed by `elspeth-plugins` implementations.
//! - `processor`: the stateless per-row DAG traversal.
//! - `flow_control`: gate, aggregation and coalesce executors, the
//!   small amounts of mutable state the traversal needs.
//! - `hashing`: canonical JSON and SHA-256 helpers shared by node IDs,
//!   artifact hashes and row content hashes.
//! - `errors`: the error taxonomy.

pub mod audit;
pub mod concurrency;
pub mod constants;
pub mod contracts;
pub mod errors;
pub mod flow_control;
pub mod graph;
pub mod hashing;
pub mod model;
pub mod processor;

pub use concurrency::{Semaphore, SemaphorePermit};
pub use contracts::{
    ArtifactDescriptor, ArtifactType, ExecutionContext, Sink, Source, SourceRow, Transform, TransformInput,
    TransformResult,
};
pub use errors::{classify_error, ConfigIssue, ConfigurationError, CoreError, ErrorClass, RunFailure};
pub use flow_control::{AggregationExecutor, AggregationFlush, CoalesceExecutor, CoalesceOutcome, GateDecision, GateExecutor};
pub use graph::{build_executors, Executors, Graph, GraphSpec};
pub use model::{Determinism, Edge, EdgeMode, Node, NodeKind, Outcome, RoutingEvent, RoutingReason, Token, WorkItem};
pub use processor::{
    pending_quarantine_write, process_aggregation_flush, process_coalesce_timeout, process_row, PendingSinkKind,
    ProcessorContext, ProcessorOutcome,
};
