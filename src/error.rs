//! Error types for dxr-fib.

use thiserror::Error;

/// Error type for dxr-fib operations.
#[derive(Error, Debug)]
pub enum Error {
    /// The range table cannot hold a new chunk
    #[error("range table exhausted: requested {requested} words, {available} available")]
    ResourceExhausted { requested: usize, available: usize },

    /// The route source produced a prefix set no well-formed LPM table can hold
    #[error("route source invariant violated: {0}")]
    InvariantViolation(String),

    /// Configuration rejected by validation
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Malformed prefix or route line
    #[error("invalid prefix: {0}")]
    InvalidPrefix(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parsing error
    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl Error {
    /// Whether the failed operation can be retried after compaction or a later batch.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::ResourceExhausted { .. })
    }
}

/// Result type alias for dxr-fib operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Raised by short-format encoding when a breakpoint does not fit.
///
/// Not an error: the builder reacts by encoding the slot in long format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatOverflow;
