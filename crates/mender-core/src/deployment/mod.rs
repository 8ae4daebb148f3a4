//! Two-phase deployment of candidate fixes.
//!
//! Each fix is first applied to a private sandbox holding copies of the
//! files it touches and tested there. Only then, after optional approval
//! and pre-image capture, is it written to the working tree and verified.
//! A failed verification rolls the tree back byte-for-byte; a rollback that
//! cannot be validated halts the deployer until an operator intervenes.

pub mod approval;
pub mod command;
pub mod error;
pub mod sandbox;
pub mod stage;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{info, warn, Instrument};

pub use approval::{Approver, AutoApprove, RejectAll};
pub use command::{run_command, summarize, PHASE_ROLLBACK_VALIDATE, PHASE_SANDBOX, PHASE_VERIFY};
pub use error::{DeployError, DeployResult};
pub use sandbox::{apply_changes, resolve_in_tree, FileEdit, Sandbox};
pub use stage::DeploymentStage;

use crate::config::DeploymentConfig;
use crate::domain::{ErrorEvent, Fix, FixStatus, RollbackData, TransitionError};
use crate::generator::FixCandidate;
use crate::metrics::PipelineMetrics;
use crate::obs;
use sandbox::{capture_pre_images, diverged_files, plan_edits, restore_pre_images, write_edits};

/// A fix together with the event it was generated for, after deployment.
#[derive(Debug, Clone, Serialize)]
pub struct Remediation {
    pub event: ErrorEvent,
    pub fix: Fix,
}

/// Outcome of [`Deployer::deploy`].
#[derive(Debug)]
pub struct DeployReport {
    pub event: ErrorEvent,
    pub fix: Fix,
    /// Why the fix did not reach Verified.
    pub error: Option<DeployError>,
}

impl DeployReport {
    pub fn into_remediation(self) -> Remediation {
        Remediation {
            event: self.event,
            fix: self.fix,
        }
    }
}

/// Runs the sandbox → apply → verify protocol under a concurrency cap.
pub struct Deployer {
    config: DeploymentConfig,
    root: PathBuf,
    slots: Semaphore,
    approver: Arc<dyn Approver>,
    halted: AtomicBool,
    metrics: Arc<PipelineMetrics>,
}

impl Deployer {
    pub fn new(
        config: &DeploymentConfig,
        approver: Arc<dyn Approver>,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            config: config.clone(),
            root: absolute_root(&config.worktree_root),
            slots: Semaphore::new(config.max_concurrent_deployments.max(1)),
            approver,
            halted: AtomicBool::new(false),
            metrics,
        }
    }

    /// Working tree every change is resolved against.
    pub fn worktree_root(&self) -> &Path {
        &self.root
    }

    /// Whether a failed rollback validation stopped the deployer.
    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    /// Deploy one candidate. The returned fix is terminal unless the
    /// deployer was halted before it started.
    pub async fn deploy(&self, candidate: FixCandidate) -> DeployReport {
        let FixCandidate { event, mut fix } = candidate;
        let halted = |event, fix| DeployReport {
            event,
            fix,
            error: Some(DeployError::Halted),
        };
        if self.is_halted() {
            warn!(fix_id = %fix.id, "deployer halted, fix not attempted");
            return halted(event, fix);
        }
        let Ok(_permit) = self.slots.acquire().await else {
            return halted(event, fix);
        };
        if self.is_halted() {
            warn!(fix_id = %fix.id, "deployer halted while waiting, fix not attempted");
            return halted(event, fix);
        }

        let span = obs::fix_span(&fix);
        let error = self.run(&mut fix).instrument(span).await.err();
        DeployReport { event, fix, error }
    }

    async fn run(&self, fix: &mut Fix) -> DeployResult<()> {
        step(fix, |f| f.begin(Utc::now()))?;
        match self.attempt(fix).await {
            Ok(()) => {
                self.metrics.fixes_verified.inc();
                info!(changes = fix.changes.len(), "fix verified");
                Ok(())
            }
            Err(e) => Err(self.recover(fix, e).await),
        }
    }

    async fn attempt(&self, fix: &mut Fix) -> DeployResult<()> {
        let edits = plan_edits(&self.root, fix)?;
        if edits.is_empty() {
            return Err(DeployError::Sandbox("fix has no changes".to_string()));
        }

        {
            let sandbox = Sandbox::create(&self.root, &edits)?;
            sandbox.apply(&edits)?;
            if let Some(cmd) = &self.config.test_command {
                let result =
                    run_command(PHASE_SANDBOX, cmd, sandbox.path(), self.config.sandbox_timeout)
                        .await;
                let passed = result.passed;
                let summary = summarize(&result);
                fix.test_results.push(result);
                if !passed {
                    return Err(DeployError::Sandbox(summary));
                }
            }
        }

        if self.config.require_human_approval {
            let decision =
                tokio::time::timeout(self.config.approval_timeout, self.approver.approve(fix)).await;
            match decision {
                Ok(true) => {}
                Ok(false) => return Err(DeployError::NotApproved("rejected".to_string())),
                Err(_) => return Err(DeployError::NotApproved("approval timed out".to_string())),
            }
        }

        if self.config.rollback_enabled {
            fix.rollback = Some(capture_pre_images(
                &self.root,
                &edits,
                self.config.rollback_validate_command.clone(),
            )?);
        }

        // Applied before the first write, so a partial write is rolled back.
        step(fix, |f| f.mark_applied(Utc::now()))?;
        write_edits(&self.root, &edits)?;
        self.metrics.fixes_deployed.inc();

        if let Some(cmd) = self.config.effective_verify_command() {
            let result = run_command(PHASE_VERIFY, cmd, &self.root, self.config.sandbox_timeout).await;
            let passed = result.passed;
            let summary = summarize(&result);
            fix.test_results.push(result);
            if !passed {
                return Err(DeployError::Verify(summary));
            }
        }

        step(fix, |f| f.mark_verified(Utc::now()))?;
        Ok(())
    }

    /// Bring a failed fix to a terminal state; returns the error to report.
    async fn recover(&self, fix: &mut Fix, cause: DeployError) -> DeployError {
        let reason = cause.to_string();
        warn!(status = %fix.status, error = %reason, "deployment failed");

        let rollback = match (fix.status, fix.rollback.clone()) {
            (FixStatus::Applied, Some(data)) => data,
            _ => {
                if let Err(e) = step(fix, |f| f.mark_failed(Utc::now(), reason)) {
                    return e;
                }
                self.metrics.fixes_failed.inc();
                return cause;
            }
        };

        match self.roll_back(fix, &rollback).await {
            Ok(()) => {
                if let Err(e) = step(fix, |f| f.mark_rolled_back(Utc::now(), reason)) {
                    return e;
                }
                self.metrics.fixes_rolled_back.inc();
                info!("working tree restored");
                cause
            }
            Err(fatal) => {
                self.halt(&fatal);
                let outcome = match &fatal {
                    DeployError::RollbackValidate { .. } => {
                        step(fix, |f| f.mark_rolled_back(Utc::now(), format!("{reason}; {fatal}")))
                    }
                    _ => step(fix, |f| f.mark_failed(Utc::now(), format!("{reason}; {fatal}"))),
                };
                if let Err(e) = outcome {
                    warn!(error = %e, "cannot record rollback outcome");
                }
                match fix.status {
                    FixStatus::RolledBack => self.metrics.fixes_rolled_back.inc(),
                    _ => self.metrics.fixes_failed.inc(),
                }
                fatal
            }
        }
    }

    async fn roll_back(&self, fix: &mut Fix, data: &RollbackData) -> DeployResult<()> {
        restore_pre_images(&self.root, data).map_err(|e| DeployError::Rollback {
            fix_id: fix.id,
            reason: e.to_string(),
        })?;

        let diverged = diverged_files(&self.root, data);
        if !diverged.is_empty() {
            return Err(DeployError::RollbackValidate {
                fix_id: fix.id,
                reason: format!("restored files differ from pre-images: {}", diverged.join(", ")),
            });
        }

        if let Some(cmd) = &data.validate_cmd {
            let result =
                run_command(PHASE_ROLLBACK_VALIDATE, cmd, &self.root, self.config.sandbox_timeout)
                    .await;
            let passed = result.passed;
            let summary = summarize(&result);
            fix.test_results.push(result);
            if !passed {
                return Err(DeployError::RollbackValidate {
                    fix_id: fix.id,
                    reason: summary,
                });
            }
        }
        Ok(())
    }

    fn halt(&self, cause: &DeployError) {
        self.halted.store(true, Ordering::Release);
        obs::emit_fatal("deployment", cause);
    }
}

/// Apply one status transition and log it.
fn step(
    fix: &mut Fix,
    transition: impl FnOnce(&mut Fix) -> Result<(), TransitionError>,
) -> DeployResult<()> {
    let from = fix.status;
    transition(fix)?;
    obs::emit_fix_transition(fix, from, fix.status);
    Ok(())
}

fn absolute_root(root: &Path) -> PathBuf {
    if let Ok(canonical) = std::fs::canonicalize(root) {
        return canonical;
    }
    if root.is_absolute() {
        return root.to_path_buf();
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(root))
        .unwrap_or_else(|_| root.to_path_buf())
}
