//! Orchestrator error taxonomy. Wraps the core's own errors (structural
//! validation, row-processing failure) and adds the I/O-shaped errors
//! that only make sense once there's a live source/sink to fail.

use thiserror::Error;

use elspeth_core::{ConfigurationError, CoreError};

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error("sink '{sink_name}' write failed: {message}")]
    SinkWrite { sink_name: String, message: String },
    #[error("source '{source_name}' failed: {message}")]
    SourceIo { source_name: String, message: String },
    #[error("{thread} panicked mid-run")]
    WorkerPanicked { thread: String },
    #[error("a pipeline thread's channel disconnected unexpectedly")]
    ChannelClosed,
}
