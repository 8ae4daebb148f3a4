//! Error types for the knowledge base.

use mender_store::StoreError;

/// Errors produced while opening the knowledge base.
///
/// Write-through failures after open are not errors: they are logged and
/// counted, and the in-memory table stays authoritative.
#[derive(Debug, thiserror::Error)]
pub enum KnowledgeError {
    #[error("pattern store unavailable: {0}")]
    Store(#[from] StoreError),

    #[error("invalid knowledge configuration: {0}")]
    InvalidConfig(String),
}

/// Result type for knowledge operations.
pub type KnowledgeResult<T> = std::result::Result<T, KnowledgeError>;
