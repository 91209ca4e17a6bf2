//! elspeth-plugins: reference `Source`/`Transform`/`Sink` implementations
//! used by the demo binary and by `elspeth-orchestrator`'s own
//! tests. Real deployments plug in their own; these exist so the
//! execution core has something concrete to drive end to end without a
//! database or file system.

pub mod sinks;
pub mod sources;
pub mod transforms;

pub use sinks::{FileSink, VecSink};
pub use sources::VecSource;
pub use transforms::ClosureTransform;
