use thiserror::Error;

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("{0}")]
    ValidationError(String),
    #[error("missing required fields: {0:?}")]
    MissingFields(Vec<String>),
    #[error("incompatible field '{field}': producer type {producer:?}, consumer type {consumer:?}")]
    IncompatibleField {
        field: String,
        producer: FieldType,
        consumer: FieldType,
    },
    #[error("{0}")]
    ExternalError(String),
}

use crate::field::FieldType;
