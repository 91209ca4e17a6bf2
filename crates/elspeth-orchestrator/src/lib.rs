//! elspeth-orchestrator: the pipelined execution driver.
//!
//! Wires the stateless `elspeth-core` row processor into three
//! cooperating threads — a `SourcePuller`, a `WorkPool` and a
//! `ReleaseQueue` — that overlap row processing across workers while
//! guaranteeing sink writes land in the same order rows were pulled from
//! the source, matching what a single-threaded run would have produced.

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod pool;
pub mod puller;
pub mod release;
pub mod run;
pub mod slots;

pub use checkpoint::CheckpointState;
pub use config::{validate_pipelining_config, PipeliningConfig};
pub use error::OrchestratorError;
pub use run::{Orchestrator, PluginRegistry, RunSummary};
pub use slots::{RowSlotPermit, RowSlots};
