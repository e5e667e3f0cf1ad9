//! Error types for the aggregation engine.
//!
//! Mirrors the five error kinds of the engine's error-handling design:
//! `ParseError`, `UnsupportedOperator`, `ExpressionFailure`,
//! `InvariantViolation`, and `ResourceError`. `ExpressionFailure` is the only
//! kind recovered locally (the expression evaluator catches it and surfaces
//! `Value::Null`); the others propagate to the caller of the public entry
//! point.

use thiserror::Error;

/// Engine error type.
#[derive(Error, Debug, Clone)]
pub enum AggError {
    /// Malformed pipeline or expression. Surfaces at plan time; no partial
    /// plan is retained.
    #[error("parse error: {message}")]
    ParseError { message: String },

    /// Pipeline uses an operator not implemented by either the hot path or
    /// the compatibility shim.
    #[error("unsupported operator: {operator}")]
    UnsupportedOperator { operator: String },

    /// Runtime error within an expression. Used only for direct
    /// unit-testing of expression evaluation and by the shim; the hot path
    /// never propagates this kind, it is caught and converted to
    /// `Value::Null` at the evaluator boundary.
    #[error("expression failure at {context}: {message}")]
    ExpressionFailure { context: String, message: String },

    /// Internal consistency breach (buffer overflow, unknown row id,
    /// virtual-row leak). The run aborts; the collection remains usable for
    /// subsequent runs because all broken state lived only in the context.
    #[error("invariant violation in stage {stage}: {message}")]
    InvariantViolation { stage: String, message: String },

    /// Allocation failure or a configured bound was exceeded (e.g. the
    /// `$unwind` buffer cap). The run aborts.
    #[error("resource error in stage {stage}: {message}")]
    ResourceError { stage: String, message: String },
}

impl From<serde_json::Error> for AggError {
    fn from(e: serde_json::Error) -> Self {
        AggError::ParseError {
            message: e.to_string(),
        }
    }
}

/// Result type for engine operations.
pub type AggResult<T> = Result<T, AggError>;
