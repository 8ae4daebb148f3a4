//! Error types for mender-store

use thiserror::Error;

/// Errors that can occur in the file store
#[derive(Error, Debug)]
pub enum StoreError {
    /// Record does not exist in the collection
    #[error("record not found: {collection}/{id}")]
    NotFound { collection: String, id: String },

    /// Collection or record id is not a safe single path segment
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// Underlying filesystem failure
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Record could not be encoded
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Record on disk could not be decoded
    #[error("deserialization failed for {collection}/{id}: {reason}")]
    Deserialization {
        collection: String,
        id: String,
        reason: String,
    },

    /// Backup archive is malformed or contains unexpected entries
    #[error("archive error: {0}")]
    Archive(String),
}

impl StoreError {
    /// Whether this error means "the record is simply absent".
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

/// Result type for store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_display() {
        let err = StoreError::NotFound {
            collection: "patterns".to_string(),
            id: "abc".to_string(),
        };
        assert_eq!(err.to_string(), "record not found: patterns/abc");
        assert!(err.is_not_found());
    }

    #[test]
    fn test_io_is_not_not_found() {
        let err = StoreError::Io(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "denied",
        ));
        assert!(!err.is_not_found());
        assert!(err.to_string().contains("denied"));
    }
}
