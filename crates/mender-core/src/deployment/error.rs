//! Error types for the deployment subsystem.

use uuid::Uuid;

use crate::domain::TransitionError;

/// Why a fix did not reach Verified.
#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    #[error("deployer halted after a failed rollback validation")]
    Halted,

    #[error("sandbox tests failed: {0}")]
    Sandbox(String),

    #[error("fix not approved: {0}")]
    NotApproved(String),

    #[error("path escapes the working tree: {0}")]
    PathEscape(String),

    #[error("change conflicts with {file}:{line}: {reason}")]
    Conflict {
        file: String,
        line: u32,
        reason: String,
    },

    #[error("apply failed for {file}: {reason}")]
    Apply { file: String, reason: String },

    #[error("verification failed: {0}")]
    Verify(String),

    #[error("rollback failed for fix {fix_id}: {reason}")]
    Rollback { fix_id: Uuid, reason: String },

    #[error("rollback validation failed for fix {fix_id}: {reason}")]
    RollbackValidate { fix_id: Uuid, reason: String },

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl DeployError {
    /// Whether the error leaves the working tree in a state an operator
    /// must inspect.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DeployError::Rollback { .. } | DeployError::RollbackValidate { .. }
        )
    }
}

/// Result type for deployment operations.
pub type DeployResult<T> = std::result::Result<T, DeployError>;
