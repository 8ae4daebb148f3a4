//! Error types for the collector.

use crate::domain::PatternError;

/// Errors produced by the collector layer.
#[derive(Debug, thiserror::Error)]
pub enum CollectorError {
    #[error("collector already started")]
    AlreadyStarted,

    #[error("collector not started")]
    NotStarted,

    #[error("collector already stopped")]
    AlreadyStopped,

    #[error("invalid collector configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid log glob {glob:?}: {reason}")]
    InvalidGlob { glob: String, reason: String },

    #[error("pattern error: {0}")]
    Pattern(#[from] PatternError),

    #[error("collector task failed: {0}")]
    Task(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for collector operations.
pub type CollectorResult<T> = std::result::Result<T, CollectorError>;
