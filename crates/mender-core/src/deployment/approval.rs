//! Human approval gate.

use async_trait::async_trait;

use crate::domain::Fix;

/// Decides whether a sandbox-tested fix may touch the working tree.
#[async_trait]
pub trait Approver: Send + Sync {
    async fn approve(&self, fix: &Fix) -> bool;
}

/// Approves everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoApprove;

#[async_trait]
impl Approver for AutoApprove {
    async fn approve(&self, _fix: &Fix) -> bool {
        true
    }
}

/// Rejects everything; the default when approval is required but no
/// reviewer is wired in.
#[derive(Debug, Clone, Copy, Default)]
pub struct RejectAll;

#[async_trait]
impl Approver for RejectAll {
    async fn approve(&self, _fix: &Fix) -> bool {
        false
    }
}
