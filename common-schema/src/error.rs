//! Error taxonomy for schema compilation (spec.md §7 `SchemaViolation`
//! covers evaluation; compilation failures are a distinct, earlier-stage
//! concern not named in spec.md and so are modeled minimally here).

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("invalid regex pattern {0:?}: {1}")]
    InvalidPattern(String, String),
    #[error("unknown JSON-Schema type {0:?}")]
    UnknownType(String),
    #[error("$ref target not found: {0}")]
    DanglingRef(String),
    #[error("value is not a valid schema node: {0}")]
    NotASchema(Value),
}

pub type Result<T> = std::result::Result<T, SchemaError>;
