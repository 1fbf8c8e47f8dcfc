//! Structured error types for the Vireya workspace.

use thiserror::Error;

/// Unified error type for all Vireya operations.
#[derive(Debug, Error)]
pub enum VireyaError {
    /// Invalid input (bad arguments, out-of-range values)
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A sampler's interval search could not bracket a valid slice
    /// (non-unimodal target or insufficient numeric precision)
    #[error("slice bracket failure: {0}")]
    SliceBracket(String),

    /// Catch-all for other errors
    #[error("{0}")]
    Other(String),
}

/// Convenience alias used throughout the Vireya workspace.
pub type Result<T> = std::result::Result<T, VireyaError>;
