//! # Error Types
//!
//! Purpose: Define the single error enum shared by the storage engine, the
//! durability layer, and the cluster tiers.
//!
//! ## Design Principles
//! 1. **Explicit Results**: Every fallible operation returns `EmberResult`;
//!    no panics or exception-style flow in library code.
//! 2. **Absent Is Not An Error**: Missing keys are modeled as `Option`/status
//!    values at call sites, never as an error variant.
//! 3. **Fail-Fast Durability**: Log failures carry their own variant so the
//!    engine can refuse further writes without guessing from `Io`.

use thiserror::Error;

/// Result alias used across the workspace.
pub type EmberResult<T> = Result<T, EmberError>;

/// Errors surfaced by Ember components.
#[derive(Debug, Error)]
pub enum EmberError {
    /// Input validation failure (empty key, NaN score, bad TTL, ...).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation addressed a key holding the other entry kind.
    #[error("operation against a key holding the wrong kind of value")]
    WrongType,

    /// Underlying IO failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The write-ahead log refused the write; the mutation did not happen.
    #[error("durability failure: {0}")]
    Durability(String),

    /// A snapshot or log file failed structural validation.
    #[error("corrupt file: {0}")]
    Corrupt(String),

    /// Startup recovery could not be completed.
    #[error("recovery failed: {0}")]
    Recovery(String),

    /// Routing found no live target for a command.
    #[error("no healthy nodes")]
    NoHealthyNodes,

    /// Wire framing violation.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Malformed or unreachable cluster configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

impl EmberError {
    /// Builds an `InvalidArgument` from anything printable.
    pub fn invalid(msg: impl Into<String>) -> Self {
        EmberError::InvalidArgument(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_convert() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        let err: EmberError = io.into();
        assert!(matches!(err, EmberError::Io(_)));
    }

    #[test]
    fn display_is_stable() {
        assert_eq!(EmberError::NoHealthyNodes.to_string(), "no healthy nodes");
        assert_eq!(
            EmberError::invalid("empty key").to_string(),
            "invalid argument: empty key"
        );
    }
}
