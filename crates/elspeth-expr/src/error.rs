use thiserror::Error;

/// Parser error kinds. `Syntax` and `Security` fail at config
/// time, before any row flows; `Evaluation` is a runtime failure caused
/// by the row data itself.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExprError {
    #[error("syntax error: {0}")]
    Syntax(String),
    #[error("forbidden construct: {0}")]
    Security(String),
    #[error("evaluation error: {0}")]
    Evaluation(String),
}
