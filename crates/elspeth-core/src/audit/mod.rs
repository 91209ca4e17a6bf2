//! Token model & audit recorder.

pub mod events;
pub mod recorder;

pub use events::{AuditEvent, AuditEventKind, BatchStatus, NodeStateStatus};
pub use recorder::{AuditRecorder, InMemoryAuditRecorder};
