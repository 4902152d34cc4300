//! Error types for AtlasLog
//!
//! Provides a unified error type for all operations, plus the coarse
//! [`ErrorKind`] classification used to decide how an error propagates.

use thiserror::Error;

/// Result type alias using AtlasError
pub type Result<T> = std::result::Result<T, AtlasError>;

/// Unified error type for AtlasLog operations
#[derive(Debug, Error)]
pub enum AtlasError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Physical log write/flush failed. The log can no longer be trusted.
    #[error("Fatal log failure: {0}")]
    Fatal(String),

    #[error("Log corruption detected: {0}")]
    Corruption(String),

    // -------------------------------------------------------------------------
    // Resource Errors
    // -------------------------------------------------------------------------
    #[error("Record of {requested} bytes does not fit in a log buffer of {capacity} bytes")]
    BufferTooSmall { requested: usize, capacity: usize },

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    // -------------------------------------------------------------------------
    // Wait Errors
    // -------------------------------------------------------------------------
    #[error("Operation interrupted: {0}")]
    Interrupted(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    // -------------------------------------------------------------------------
    // Protocol Errors
    // -------------------------------------------------------------------------
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    // -------------------------------------------------------------------------
    // Archive Errors
    // -------------------------------------------------------------------------
    #[error("Archive error: {0}")]
    Archive(String),

    // -------------------------------------------------------------------------
    // Crypto Errors
    // -------------------------------------------------------------------------
    #[error("Crypto error: {0}")]
    Crypto(String),

    // -------------------------------------------------------------------------
    // Serialization Errors
    // -------------------------------------------------------------------------
    #[error("Serialization error: {0}")]
    Serialization(String),

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),
}

/// How an error is allowed to propagate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Never returned under the default policy: the process aborts
    Fatal,
    /// The triggering operation is abandoned, engine state is unaffected
    ResourceExhaustion,
    /// Shutdown or a timeout cut a wait short
    Interruption,
    /// Call made in the wrong state or with bad arguments
    Protocol,
    Other,
}

impl AtlasError {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            AtlasError::Fatal(_) => ErrorKind::Fatal,
            AtlasError::BufferTooSmall { .. } | AtlasError::ResourceExhausted(_) => {
                ErrorKind::ResourceExhaustion
            }
            AtlasError::Interrupted(_) | AtlasError::Timeout(_) => ErrorKind::Interruption,
            AtlasError::InvalidState(_) | AtlasError::InvalidArgument(_) => ErrorKind::Protocol,
            _ => ErrorKind::Other,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::Fatal
    }
}

impl From<bincode::Error> for AtlasError {
    fn from(err: bincode::Error) -> Self {
        AtlasError::Serialization(err.to_string())
    }
}
