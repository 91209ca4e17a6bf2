//! Execution core errors and their taxonomy.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A single `(location, message)` pair inside a `ConfigurationError`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigIssue {
    pub location: String,
    pub message: String,
}

impl ConfigIssue {
    pub fn new(location: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            message: message.into(),
        }
    }
}

/// Errors raised before any row flows: graph construction, expression
/// parsing, schema mismatch. The run never starts.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("configuration invalid: {}", issues.iter().map(|i| format!("{}: {}", i.location, i.message)).collect::<Vec<_>>().join("; "))]
pub struct ConfigurationError {
    pub issues: Vec<ConfigIssue>,
}

impl ConfigurationError {
    pub fn single(location: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            issues: vec![ConfigIssue::new(location, message)],
        }
    }
}

/// Runtime pipeline failure: the run started and failed. Carries the run
/// id and a human cause; never routed, the whole run halts.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("run {run_id} failed: {cause}")]
pub struct RunFailure {
    pub run_id: uuid::Uuid,
    pub cause: String,
}

/// Errors raised by the execution core while a row is in flight. Distinct
/// from `TransformResult::error`, which is a plugin-declared, routable
/// outcome rather than a core failure.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoreError {
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigurationError),
    #[error("expression syntax error: {0}")]
    ExpressionSyntax(String),
    #[error("expression uses a forbidden construct: {0}")]
    ExpressionSecurity(String),
    #[error("expression evaluation failed: {0}")]
    ExpressionEvaluation(String),
    #[error("plugin bug: {0}")]
    PluginBug(String),
    #[error("coalesce policy failure for {coalesce_name}/{row_id}: {reason}")]
    CoalesceFailure {
        coalesce_name: String,
        row_id: uuid::Uuid,
        reason: String,
    },
    #[error("late arrival for {coalesce_name}/{row_id} after merge")]
    LateArrival {
        coalesce_name: String,
        row_id: uuid::Uuid,
    },
    #[error("audit store write failed: {0}")]
    AuditWriteFailed(String),
    #[error("work queue exceeded {0} iterations")]
    WorkQueueOverrun(usize),
    #[error("internal: {0}")]
    Internal(String),
}

/// Coarse classification used by retry/backoff wrappers around fallible
/// operations (persistence writes, external calls).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Caused by bad input/config; retrying will not help.
    Validation,
    /// A bug in our code or a plugin; the run must stop.
    Permanent,
    /// Transport/connection hiccup; safe to retry with backoff.
    Transient,
    /// Anything else observed at runtime that isn't config/permanent.
    Runtime,
}

pub fn classify_error(err: &CoreError) -> ErrorClass {
    match err {
        CoreError::Configuration(_) | CoreError::ExpressionSyntax(_) | CoreError::ExpressionSecurity(_) => {
            ErrorClass::Validation
        }
        CoreError::PluginBug(_) | CoreError::WorkQueueOverrun(_) | CoreError::Internal(_) => ErrorClass::Permanent,
        CoreError::AuditWriteFailed(_) => ErrorClass::Transient,
        CoreError::ExpressionEvaluation(_)
        | CoreError::CoalesceFailure { .. }
        | CoreError::LateArrival { .. } => ErrorClass::Runtime,
    }
}
