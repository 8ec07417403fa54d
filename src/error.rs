//! Error taxonomy shared by every public operation.
//!
//! All errors are raised synchronously at the call that violates a contract;
//! nothing is retried internally. Validation happens before any array is
//! mutated, so a returned error never leaves a map half-updated.

use thiserror::Error;

use crate::value::Dtype;

#[derive(Debug, Error)]
pub enum Error {
    /// Missing or contradictory constructor arguments.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Element type disagrees with the storage type.
    #[error("type mismatch: expected {expected:?}, got {actual:?}")]
    TypeMismatch { expected: Dtype, actual: Dtype },

    /// Malformed, out-of-range, or duplicate-where-unique identifiers.
    #[error("dimension error: {0}")]
    Dimension(String),

    /// Invalid nside relationship.
    #[error("resolution error: {0}")]
    Resolution(String),

    /// Operation not defined for this map kind.
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// None of the requested coverage cells exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Bad magic, unsupported version, or corrupt header.
    #[error("malformed file: {0}")]
    Format(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
