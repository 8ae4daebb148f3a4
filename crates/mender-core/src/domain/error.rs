//! Error taxonomy for Mender.

use uuid::Uuid;

use super::fix::FixStatus;

/// Errors produced when registering or removing detector patterns.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PatternError {
    #[error("pattern must not be empty")]
    EmptyPattern,

    #[error("duplicate pattern: {0}")]
    DuplicatePattern(String),

    #[error("invalid pattern {pattern:?}: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("pattern is {len} chars, exceeds maximum of {max}")]
    PatternTooLong { len: usize, max: usize },

    #[error("invalid severity: {0:?} (expected critical, high, medium or low)")]
    InvalidSeverity(String),

    #[error("pattern not found: {0}")]
    PatternNotFound(String),
}

/// Errors produced by illegal fix status transitions.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("fix {fix_id}: illegal transition {from} -> {to}")]
    Invalid {
        fix_id: Uuid,
        from: FixStatus,
        to: FixStatus,
    },

    #[error("fix {fix_id}: cannot roll back without captured rollback data")]
    MissingRollbackData { fix_id: Uuid },
}

/// Mender top-level errors.
#[derive(Debug, thiserror::Error)]
pub enum MenderError {
    #[error("config error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("pattern error: {0}")]
    Pattern(#[from] PatternError),

    #[error("transition error: {0}")]
    Transition(#[from] TransitionError),

    #[error("collector error: {0}")]
    Collector(#[from] crate::collector::CollectorError),

    #[error("deployment error: {0}")]
    Deploy(#[from] crate::deployment::DeployError),

    #[error("knowledge error: {0}")]
    Knowledge(#[from] crate::knowledge::KnowledgeError),

    #[error("pipeline error: {0}")]
    Pipeline(#[from] crate::pipeline::PipelineError),

    #[error("storage error: {0}")]
    Store(#[from] mender_store::StoreError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for Mender operations.
pub type Result<T> = std::result::Result<T, MenderError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_error_display() {
        let err = PatternError::PatternTooLong { len: 600, max: 512 };
        assert!(err.to_string().contains("exceeds maximum of 512"));

        let err = PatternError::InvalidPattern {
            pattern: "(".to_string(),
            reason: "unclosed group".to_string(),
        };
        assert!(err.to_string().contains("unclosed group"));
    }

    #[test]
    fn test_transition_error_display() {
        let id = Uuid::new_v4();
        let err = TransitionError::Invalid {
            fix_id: id,
            from: FixStatus::Verified,
            to: FixStatus::Applied,
        };
        assert!(err.to_string().contains("verified -> applied"));
    }

    #[test]
    fn test_mender_error_from_pattern() {
        let err: MenderError = PatternError::EmptyPattern.into();
        assert!(matches!(err, MenderError::Pattern(PatternError::EmptyPattern)));
    }
}
