//! Evaluation errors.

use thiserror::Error;

/// Result type for expression evaluation.
pub type Result<T> = std::result::Result<T, EvalError>;

/// Errors surfaced by the evaluator.
///
/// Evaluation aborts on the first error; partial results are never kept.
#[derive(Error, Debug, Clone)]
pub enum EvalError {
    /// An expression form is unknown and no host function covers it.
    #[error("unknown expression type `{0}`")]
    UnknownForm(String),

    /// A form is missing a required field or a field has the wrong shape.
    #[error("malformed `{form}` expression: {reason}")]
    Malformed { form: String, reason: String },

    /// A value had a different type than the context requires.
    #[error("expected {expected}, got {got}")]
    TypeMismatch { expected: &'static str, got: String },

    /// A host function reported a domain error.
    #[error("{0}")]
    Function(String),
}
