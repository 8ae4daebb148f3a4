//! Deployment stage: per-fingerprint serialisation in front of the deployer.
//!
//! At most one fix per fingerprint is between InProgress and a terminal
//! state. A candidate arriving while its fingerprint is active is deferred
//! and deployed by the worker that owns the fingerprint once the active fix
//! finishes. Once a fix for a fingerprint verifies, the remaining deferred
//! candidates for it are superseded and dropped.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{DeployError, Deployer, Remediation};
use crate::domain::FixStatus;
use crate::generator::FixCandidate;
use crate::metrics::PipelineMetrics;
use crate::queue::{QueueReceiver, QueueSender};
use crate::stage::{spawn_workers, StageHandle};

/// Deployment workers per pipeline; the deployer's semaphore caps how many
/// of them run the protocol at once.
pub const DEPLOYMENT_WORKERS: usize = 3;

pub struct DeploymentStage {
    deployer: Arc<Deployer>,
    learn: QueueSender<Remediation>,
    fixes: QueueSender<Remediation>,
    max_deferred: usize,
    /// Active fingerprints and the candidates waiting behind them.
    active: Mutex<HashMap<String, VecDeque<FixCandidate>>>,
    metrics: Arc<PipelineMetrics>,
}

impl DeploymentStage {
    pub fn new(
        deployer: Arc<Deployer>,
        learn: QueueSender<Remediation>,
        fixes: QueueSender<Remediation>,
        max_deferred: usize,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            deployer,
            learn,
            fixes,
            max_deferred,
            active: Mutex::new(HashMap::new()),
            metrics,
        }
    }

    pub fn deployer(&self) -> &Arc<Deployer> {
        &self.deployer
    }

    /// Number of candidates waiting behind an active fingerprint.
    pub fn deferred(&self) -> usize {
        self.active.lock().values().map(VecDeque::len).sum()
    }

    /// Deploy `candidate`, or defer it behind the active fix for its
    /// fingerprint.
    pub async fn handle(&self, candidate: FixCandidate) {
        let fingerprint = candidate.fix.fingerprint.clone();
        {
            let mut active = self.active.lock();
            if let Some(waiting) = active.get_mut(&fingerprint) {
                if waiting.len() >= self.max_deferred {
                    self.metrics.deferred_dropped.inc();
                    warn!(fingerprint = %fingerprint, fix_id = %candidate.fix.id, "deferral queue full, fix dropped");
                } else {
                    debug!(fingerprint = %fingerprint, fix_id = %candidate.fix.id, "fingerprint busy, fix deferred");
                    waiting.push_back(candidate);
                }
                return;
            }
            active.insert(fingerprint.clone(), VecDeque::new());
        }

        let mut next = Some(candidate);
        while let Some(candidate) = next {
            let report = self.deployer.deploy(candidate).await;
            let verified = report.fix.status == FixStatus::Verified;
            if let Some(DeployError::Halted) = report.error {
                debug!(fix_id = %report.fix.id, "fix returned unattempted");
            }
            self.publish(report.into_remediation());

            let mut active = self.active.lock();
            next = match active.get_mut(&fingerprint) {
                Some(waiting) if verified && !waiting.is_empty() => {
                    let superseded = waiting.len();
                    self.metrics.deferred_dropped.add(superseded as u64);
                    info!(fingerprint = %fingerprint, superseded, "class fixed, deferred fixes dropped");
                    None
                }
                Some(waiting) => waiting.pop_front(),
                None => None,
            };
            if next.is_none() {
                active.remove(&fingerprint);
            }
        }
    }

    fn publish(&self, mut remediation: Remediation) {
        if remediation.fix.status == FixStatus::Verified {
            remediation.event.mark_fixed(remediation.fix.id);
        }
        if remediation.fix.status.is_terminal() {
            self.learn.publish(remediation.clone());
        }
        self.fixes.publish(remediation);
    }

    /// Run the deployment pool on `input`.
    pub fn spawn(
        self: Arc<Self>,
        input: QueueReceiver<FixCandidate>,
        cancel: CancellationToken,
        drain_limit: usize,
    ) -> StageHandle {
        spawn_workers(
            "deployment",
            DEPLOYMENT_WORKERS,
            input,
            cancel,
            drain_limit,
            move |candidate| {
                let stage = Arc::clone(&self);
                async move { stage.handle(candidate).await }
            },
        )
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::DeploymentConfig;
    use crate::deployment::AutoApprove;
    use crate::domain::{CodeChange, ErrorEvent, Fix, Severity};
    use crate::queue::bounded;

    fn candidate(line: u32) -> FixCandidate {
        let event = ErrorEvent::new("boom", Severity::High, "app.log").with_location("a.txt", 1);
        let mut fix = Fix::new(&event, "code_refactoring", vec![CodeChange::add("a.txt", line, "// note")], 0.9, "");
        fix.fingerprint = "fp-1".to_string();
        FixCandidate { event, fix }
    }

    fn stage(
        root: &std::path::Path,
        verify: &str,
        max_deferred: usize,
    ) -> (Arc<DeploymentStage>, QueueReceiver<Remediation>, QueueReceiver<Remediation>, Arc<PipelineMetrics>) {
        let metrics = Arc::new(PipelineMetrics::new());
        let config = DeploymentConfig {
            worktree_root: root.to_path_buf(),
            verify_command: Some(verify.to_string()),
            ..DeploymentConfig::default()
        };
        let deployer = Arc::new(Deployer::new(&config, Arc::new(AutoApprove), Arc::clone(&metrics)));
        let (learn_tx, learn_rx) = bounded("learn", 16);
        let (fix_tx, fix_rx) = bounded("fixes", 16);
        let stage = Arc::new(DeploymentStage::new(deployer, learn_tx, fix_tx, max_deferred, Arc::clone(&metrics)));
        (stage, learn_rx, fix_rx, metrics)
    }

    #[tokio::test]
    async fn test_verified_fix_marks_event_and_feeds_knowledge() {
        let tree = tempfile::tempdir().unwrap();
        std::fs::write(tree.path().join("a.txt"), "x\n").unwrap();
        let (stage, mut learn, mut fixes, _) = stage(tree.path(), "true", 8);

        stage.handle(candidate(1)).await;
        let r = learn.try_recv().unwrap();
        assert_eq!(r.fix.status, FixStatus::Verified);
        assert!(r.event.fixed);
        assert_eq!(r.event.fix_id, Some(r.fix.id));
        assert_eq!(fixes.try_recv().unwrap().fix.id, r.fix.id);
    }

    #[tokio::test]
    async fn test_busy_fingerprint_defers_and_bounds() {
        let tree = tempfile::tempdir().unwrap();
        std::fs::write(tree.path().join("a.txt"), "x\n").unwrap();
        let (stage, _learn, _fixes, metrics) = stage(tree.path(), "false", 1);

        // Occupy the fingerprint as if a deployment were running.
        stage.active.lock().insert("fp-1".to_string(), VecDeque::new());
        stage.handle(candidate(1)).await;
        stage.handle(candidate(1)).await;
        assert_eq!(stage.deferred(), 1);
        assert_eq!(metrics.deferred_dropped.get(), 1);
    }

    #[tokio::test]
    async fn test_deferred_fix_runs_after_failure() {
        let tree = tempfile::tempdir().unwrap();
        std::fs::write(tree.path().join("a.txt"), "x\n").unwrap();
        let (stage, mut learn, _fixes, _) = stage(tree.path(), "false", 8);

        // The first handle yields while its verify command runs; the
        // second finds the fingerprint busy and is deployed afterwards by
        // the first.
        tokio::join!(stage.handle(candidate(1)), stage.handle(candidate(1)));
        assert_eq!(learn.try_recv().unwrap().fix.status, FixStatus::RolledBack);
        assert_eq!(learn.try_recv().unwrap().fix.status, FixStatus::RolledBack);
        assert_eq!(stage.deferred(), 0);
        assert!(stage.active.lock().is_empty());
    }
}
