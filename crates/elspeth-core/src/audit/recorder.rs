//! `AuditRecorder`: the append-only audit writer.
//!
//! Thread safety is the implementor's responsibility — either serialize
//! writes behind a single writer (as `elspeth-persistence`'s dedicated
//! writer thread does) or use per-connection transactional isolation.
//! `append_atomic` exists specifically for fork atomicity: writing N
//! child token records and the parent's `FORKED` outcome must be a
//! single transaction with no partial forks observable.

use uuid::Uuid;

use super::events::{AuditEvent, AuditEventKind};
use crate::errors::CoreError;

pub trait AuditRecorder: Send + Sync {
    fn append(&self, run_id: Uuid, kind: AuditEventKind) -> Result<AuditEvent, CoreError>;

    /// Appends every kind in order as a single transaction.
    fn append_atomic(&self, run_id: Uuid, kinds: Vec<AuditEventKind>) -> Result<Vec<AuditEvent>, CoreError>;

    fn list(&self, run_id: Uuid) -> Vec<AuditEvent>;
}

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::Utc;

/// Volatile in-memory recorder. Used by tests and by single-process
/// demo runs; not durable across restarts.
#[derive(Default)]
pub struct InMemoryAuditRecorder {
    inner: Mutex<HashMap<Uuid, Vec<AuditEvent>>>,
}

impl InMemoryAuditRecorder {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AuditRecorder for InMemoryAuditRecorder {
    fn append(&self, run_id: Uuid, kind: AuditEventKind) -> Result<AuditEvent, CoreError> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| CoreError::AuditWriteFailed("recorder lock poisoned".to_string()))?;
        let log = guard.entry(run_id).or_default();
        let event = AuditEvent {
            seq: log.len() as u64,
            run_id,
            kind,
            ts: Utc::now(),
        };
        log.push(event.clone());
        Ok(event)
    }

    fn append_atomic(&self, run_id: Uuid, kinds: Vec<AuditEventKind>) -> Result<Vec<AuditEvent>, CoreError> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| CoreError::AuditWriteFailed("recorder lock poisoned".to_string()))?;
        let log = guard.entry(run_id).or_default();
        let mut out = Vec::with_capacity(kinds.len());
        for kind in kinds {
            let event = AuditEvent {
                seq: log.len() as u64,
                run_id,
                kind,
                ts: Utc::now(),
            };
            log.push(event.clone());
            out.push(event);
        }
        Ok(out)
    }

    fn list(&self, run_id: Uuid) -> Vec<AuditEvent> {
        self.inner.lock().map(|g| g.get(&run_id).cloned().unwrap_or_default()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_atomic_preserves_order_within_one_transaction() {
        let recorder = InMemoryAuditRecorder::new();
        let run_id = Uuid::new_v4();
        let events = recorder
            .append_atomic(
                run_id,
                vec![
                    AuditEventKind::RunStarted {
                        pipelining_config: serde_json::json!({}),
                    },
                    AuditEventKind::RunCompleted,
                ],
            )
            .unwrap();
        assert_eq!(events[0].seq, 0);
        assert_eq!(events[1].seq, 1);
        assert_eq!(recorder.list(run_id).len(), 2);
    }
}
