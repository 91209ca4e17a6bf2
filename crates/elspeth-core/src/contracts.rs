//! Plugin-facing contracts. These traits are the core's *consumer*
//! interface: `elspeth-plugins` provides concrete implementations (and a
//! typed/neutral bridge in the style of the graph's node descriptors),
//! the orchestrator in `elspeth-orchestrator` drives them.

use elspeth_domain::{RowData, SchemaContract};
use uuid::Uuid;

use crate::model::Determinism;

#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub run_id: Uuid,
    pub node_id: String,
}

pub enum SourceRow {
    Valid {
        row: RowData,
        contract: Option<SchemaContract>,
    },
    Quarantined {
        raw_row: serde_json::Value,
        error: String,
        destination: String,
    },
}

pub trait Source: Send + Sync {
    fn name(&self) -> &str;
    fn output_schema(&self) -> &SchemaContract;
    fn determinism(&self) -> Determinism;
    fn plugin_version(&self) -> &str;
    fn on_validation_failure(&self) -> &str;
    fn on_start(&self) {}
    fn on_complete(&self) {}
    fn close(&self) {}
    fn load(&self, ctx: &ExecutionContext) -> Box<dyn Iterator<Item = SourceRow> + '_>;
}

pub enum TransformInput {
    Single(RowData),
    Batch(Vec<RowData>),
}

pub enum TransformResult {
    Success {
        row: RowData,
        success_reason: String,
        contract: Option<SchemaContract>,
    },
    SuccessMulti {
        rows: Vec<RowData>,
        success_reason: String,
        contract: Option<SchemaContract>,
    },
    Error {
        reason: String,
        retryable: bool,
    },
}

pub trait Transform: Send + Sync {
    fn name(&self) -> &str;
    fn input_schema(&self) -> &SchemaContract;
    fn output_schema(&self) -> &SchemaContract;
    fn determinism(&self) -> Determinism;
    fn plugin_version(&self) -> &str;
    fn is_batch_aware(&self) -> bool {
        false
    }
    fn creates_tokens(&self) -> bool {
        false
    }
    fn on_error(&self) -> Option<&str> {
        None
    }
    fn on_start(&self) {}
    fn on_complete(&self) {}
    fn close(&self) {}
    fn process(&self, input: TransformInput, ctx: &ExecutionContext) -> TransformResult;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactType {
    File,
    Database,
    Webhook,
}

#[derive(Debug, Clone)]
pub struct ArtifactDescriptor {
    pub artifact_type: ArtifactType,
    pub path_or_uri: String,
    pub content_hash: String,
    pub size_bytes: u64,
    pub metadata: Option<serde_json::Value>,
}

pub trait Sink: Send + Sync {
    fn name(&self) -> &str;
    fn input_schema(&self) -> &SchemaContract;
    fn idempotent(&self) -> bool {
        false
    }
    fn supports_resume(&self) -> bool {
        false
    }
    fn on_start(&self) {}
    fn write(&self, rows: &[RowData], ctx: &ExecutionContext) -> Result<ArtifactDescriptor, String>;
    /// Durable barrier: MUST return only once writes survive a crash.
    fn flush(&self) -> Result<(), String> {
        Ok(())
    }
    fn close(&self) {}
}
