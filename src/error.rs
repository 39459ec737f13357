//! Error taxonomy for the execution engine.
//!
//! Every failure surfaced by the engine is fatal to the operation that raised
//! it and is reported synchronously on the calling thread. Nothing is caught
//! and retried internally; retry policy belongs to the training driver.

use thiserror::Error;

/// Errors raised by layer construction, network startup, and the
/// weight-update lifecycle.
#[derive(Debug, Error)]
pub enum EngineError {
    /// An input/output volume or per-sample area disagrees with a layer's
    /// declared shape.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// A requested filter/stride/dimension combination does not evenly relate
    /// the input and output geometry. Raised at construction or startup time,
    /// never silently rounded.
    #[error("unsatisfiable constraint: {0}")]
    ConstraintUnsatisfiable(String),

    /// An operation was attempted before the owning object finished startup,
    /// or while an outstanding borrow forbids it.
    #[error("invalid operation: {0}")]
    InvalidOperationAtUse(String),

    /// A computation reached a numerically degenerate state that the epsilon
    /// floors could not prevent.
    #[error("numeric degeneracy: {0}")]
    NumericDegenerate(String),
}
