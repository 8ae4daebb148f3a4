//! Candidate fixes and their lifecycle.
//!
//! Status transitions form a DAG:
//!
//! ```text
//! Pending -> InProgress -> Applied -> Verified
//!                |            |
//!                v            v
//!              Failed     RolledBack / Failed (rollback disabled)
//! ```
//!
//! `applied_at` is set exactly while the status is Applied, Verified or
//! RolledBack; `verified_at` exactly while it is Verified.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::TransitionError;
use super::event::ErrorEvent;
use super::fingerprint::{error_signature, fingerprint, DEFAULT_TOP_FRAMES};

/// Clamp a score into `[0, 1]`; NaN and infinities map to 0.
pub fn unit_interval(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// Lifecycle status of a [`Fix`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixStatus {
    Pending,
    InProgress,
    Applied,
    Failed,
    Verified,
    RolledBack,
}

impl FixStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FixStatus::Pending => "pending",
            FixStatus::InProgress => "in_progress",
            FixStatus::Applied => "applied",
            FixStatus::Failed => "failed",
            FixStatus::Verified => "verified",
            FixStatus::RolledBack => "rolled_back",
        }
    }

    /// Whether the fix has touched the working tree.
    pub fn is_applied(&self) -> bool {
        matches!(
            self,
            FixStatus::Applied | FixStatus::Verified | FixStatus::RolledBack
        )
    }

    /// Whether no further transition is possible.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FixStatus::Failed | FixStatus::Verified | FixStatus::RolledBack
        )
    }

    /// Whether the fix holds its fingerprint's deployment slot.
    pub fn is_active(&self) -> bool {
        matches!(self, FixStatus::InProgress | FixStatus::Applied)
    }

    fn can_transition_to(&self, to: FixStatus) -> bool {
        use FixStatus::*;
        matches!(
            (self, to),
            (Pending, InProgress)
                | (InProgress, Applied)
                | (InProgress, Failed)
                | (Applied, Verified)
                | (Applied, RolledBack)
                | (Applied, Failed)
        )
    }
}

impl fmt::Display for FixStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of a located source edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    /// Insert `new_text` before `start_line`.
    Add,
    /// Replace lines `start_line..=end_line` with `new_text`.
    Modify,
    /// Remove lines `start_line..=end_line`.
    Delete,
}

/// A located edit to one source file. Line numbers are 1-based.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeChange {
    /// Path relative to the working tree root.
    pub file_path: String,
    pub start_line: u32,
    pub end_line: u32,
    /// Expected current text of the range; empty skips the check.
    pub old_text: String,
    pub new_text: String,
    pub kind: ChangeKind,
    pub description: String,
}

impl CodeChange {
    pub fn add(file: impl Into<String>, before_line: u32, text: impl Into<String>) -> Self {
        Self {
            file_path: file.into(),
            start_line: before_line,
            end_line: before_line,
            old_text: String::new(),
            new_text: text.into(),
            kind: ChangeKind::Add,
            description: String::new(),
        }
    }

    pub fn modify(
        file: impl Into<String>,
        start_line: u32,
        end_line: u32,
        old_text: impl Into<String>,
        new_text: impl Into<String>,
    ) -> Self {
        Self {
            file_path: file.into(),
            start_line,
            end_line,
            old_text: old_text.into(),
            new_text: new_text.into(),
            kind: ChangeKind::Modify,
            description: String::new(),
        }
    }

    pub fn delete(
        file: impl Into<String>,
        start_line: u32,
        end_line: u32,
        old_text: impl Into<String>,
    ) -> Self {
        Self {
            file_path: file.into(),
            start_line,
            end_line,
            old_text: old_text.into(),
            new_text: String::new(),
            kind: ChangeKind::Delete,
            description: String::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// Outcome of one external command run (sandbox test, verify, rollback validation).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestResult {
    /// Protocol phase: `sandbox`, `verify` or `rollback_validate`.
    pub phase: String,
    pub command: String,
    pub passed: bool,
    pub exit_code: Option<i32>,
    /// Combined stdout and stderr.
    pub output: String,
    pub duration_ms: u64,
    pub timed_out: bool,
    pub ran_at: DateTime<Utc>,
}

/// Pre-images captured before a fix touches the working tree.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RollbackData {
    /// Relative path -> exact bytes before apply.
    pub files: BTreeMap<String, Vec<u8>>,
    /// Files that did not exist before apply; removed on rollback.
    #[serde(default)]
    pub created_files: Vec<String>,
    pub checkpoint: String,
    pub validate_cmd: Option<String>,
}

/// One recorded status transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChange {
    pub from: FixStatus,
    pub to: FixStatus,
    pub at: DateTime<Utc>,
}

/// A candidate patch for one [`ErrorEvent`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fix {
    pub id: Uuid,
    pub event_id: Uuid,
    /// Fingerprint of the originating event; deployments serialise on it.
    pub fingerprint: String,
    /// Normalised class signature used by the knowledge base.
    pub error_signature: String,
    pub strategy: String,
    pub status: FixStatus,
    pub created_at: DateTime<Utc>,
    pub applied_at: Option<DateTime<Utc>>,
    pub verified_at: Option<DateTime<Utc>>,
    pub confidence: f64,
    pub description: String,
    pub changes: Vec<CodeChange>,
    #[serde(default)]
    pub test_results: Vec<TestResult>,
    pub rollback: Option<RollbackData>,
    pub failure_reason: Option<String>,
    #[serde(default)]
    pub history: Vec<StatusChange>,
}

impl Fix {
    /// Create a pending fix for `event`.
    pub fn new(
        event: &ErrorEvent,
        strategy: impl Into<String>,
        changes: Vec<CodeChange>,
        confidence: f64,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_id: event.id,
            fingerprint: event
                .fingerprint
                .clone()
                .unwrap_or_else(|| fingerprint(event, DEFAULT_TOP_FRAMES)),
            error_signature: event
                .signature
                .clone()
                .unwrap_or_else(|| error_signature(event, DEFAULT_TOP_FRAMES)),
            strategy: strategy.into(),
            status: FixStatus::Pending,
            created_at: Utc::now(),
            applied_at: None,
            verified_at: None,
            confidence: unit_interval(confidence),
            description: description.into(),
            changes,
            test_results: Vec::new(),
            rollback: None,
            failure_reason: None,
            history: Vec::new(),
        }
    }

    /// Whether the fix ended in a verified state.
    pub fn is_successful(&self) -> bool {
        self.status == FixStatus::Verified
    }

    /// Files touched by this fix, deduplicated, in first-seen order.
    pub fn touched_files(&self) -> Vec<String> {
        let mut files: Vec<String> = Vec::new();
        for change in &self.changes {
            if !files.contains(&change.file_path) {
                files.push(change.file_path.clone());
            }
        }
        files
    }

    fn transition(&mut self, to: FixStatus, at: DateTime<Utc>) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(to) {
            return Err(TransitionError::Invalid {
                fix_id: self.id,
                from: self.status,
                to,
            });
        }
        self.history.push(StatusChange {
            from: self.status,
            to,
            at,
        });
        self.status = to;
        Ok(())
    }

    /// Pending -> InProgress.
    pub fn begin(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.transition(FixStatus::InProgress, now)
    }

    /// InProgress -> Applied.
    pub fn mark_applied(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.transition(FixStatus::Applied, now)?;
        self.applied_at = Some(now);
        Ok(())
    }

    /// Applied -> Verified.
    pub fn mark_verified(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.transition(FixStatus::Verified, now)?;
        self.verified_at = Some(now);
        Ok(())
    }

    /// Applied -> RolledBack. Requires captured [`RollbackData`].
    pub fn mark_rolled_back(
        &mut self,
        now: DateTime<Utc>,
        reason: impl Into<String>,
    ) -> Result<(), TransitionError> {
        if self.rollback.is_none() {
            return Err(TransitionError::MissingRollbackData { fix_id: self.id });
        }
        self.transition(FixStatus::RolledBack, now)?;
        self.failure_reason = Some(reason.into());
        Ok(())
    }

    /// InProgress|Applied -> Failed.
    ///
    /// Failing an applied fix clears `applied_at`: a Failed fix never
    /// reports itself as applied, even if rollback was disabled and its
    /// changes remain in the working tree.
    pub fn mark_failed(
        &mut self,
        now: DateTime<Utc>,
        reason: impl Into<String>,
    ) -> Result<(), TransitionError> {
        self.transition(FixStatus::Failed, now)?;
        self.applied_at = None;
        self.failure_reason = Some(reason.into());
        Ok(())
    }

    /// Status sequence, starting from Pending.
    pub fn status_path(&self) -> Vec<FixStatus> {
        let mut path = vec![FixStatus::Pending];
        path.extend(self.history.iter().map(|c| c.to));
        path
    }
}
