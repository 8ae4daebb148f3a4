//! Fix synthesis.
//!
//! For each analysed event the generator walks the strategy registry, most
//! promising first, and turns the first proposal into a pending [`Fix`].
//! A strategy the knowledge base has learned to trust for this class of
//! error is tried before the priority order.

pub mod builtin;
pub mod strategy;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use builtin::{
    CodeRefactoring, ConditionInversion, ExceptionHandling, Language, NullCheck, ResourceCleanup,
    TypeConversion,
};
pub use strategy::{FixStrategy, Proposal, StrategyRegistry};

use crate::config::{DeploymentConfig, GeneratorConfig};
use crate::domain::{ErrorEvent, Fix};
use crate::knowledge::KnowledgeBase;
use crate::metrics::PipelineMetrics;
use crate::queue::{QueueReceiver, QueueSender};
use crate::stage::{spawn_workers, StageHandle};

/// Upper bound on the wait before an exhausted event is retried.
pub const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(60);

/// A generated fix and the event it addresses.
#[derive(Debug, Clone, Serialize)]
pub struct FixCandidate {
    pub event: ErrorEvent,
    pub fix: Fix,
}

/// Where generated fixes go: deployment in direct mode, suggestions
/// otherwise.
#[derive(Clone)]
pub struct FixRouter {
    auto_deploy: bool,
    min_deploy_confidence: f64,
    deploy: QueueSender<FixCandidate>,
    suggest: QueueSender<FixCandidate>,
}

impl FixRouter {
    pub fn new(
        config: &DeploymentConfig,
        deploy: QueueSender<FixCandidate>,
        suggest: QueueSender<FixCandidate>,
    ) -> Self {
        Self {
            auto_deploy: config.auto_deploy,
            min_deploy_confidence: config.min_deploy_confidence,
            deploy,
            suggest,
        }
    }

    /// Whether `fix` goes straight to deployment.
    pub fn is_direct(&self, fix: &Fix) -> bool {
        self.auto_deploy && fix.confidence >= self.min_deploy_confidence
    }

    /// Publish `candidate`; returns whether it went to deployment.
    pub fn route(&self, candidate: FixCandidate, metrics: &PipelineMetrics) -> bool {
        if self.is_direct(&candidate.fix) {
            self.deploy.publish(candidate);
            true
        } else {
            metrics.fixes_suggested.inc();
            self.suggest.publish(candidate);
            false
        }
    }
}

/// Strategy driver with knowledge bias and retry accounting.
pub struct Generator {
    registry: StrategyRegistry,
    knowledge: Option<Arc<KnowledgeBase>>,
    timeout: Duration,
    max_fix_attempts: u32,
    bias_threshold: f64,
    retry_backoff: Duration,
    workers: usize,
    metrics: Arc<PipelineMetrics>,
}

impl Generator {
    pub fn new(
        config: &GeneratorConfig,
        registry: StrategyRegistry,
        knowledge: Option<Arc<KnowledgeBase>>,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            registry,
            knowledge,
            timeout: config.timeout,
            max_fix_attempts: config.max_fix_attempts,
            bias_threshold: config.bias_confidence_threshold,
            retry_backoff: config.retry_backoff,
            workers: config.workers,
            metrics,
        }
    }

    pub fn registry(&self) -> &StrategyRegistry {
        &self.registry
    }

    /// Strategies to try for `event`, in order.
    pub fn selection_order(&self, event: &ErrorEvent) -> Vec<Arc<dyn FixStrategy>> {
        let mut order = self.registry.ordered();
        let learned = self
            .knowledge
            .as_ref()
            .and_then(|kb| kb.lookup(event))
            .filter(|p| p.confidence >= self.bias_threshold);
        if let Some(pattern) = learned {
            if let Some(pos) = order.iter().position(|s| s.tag() == pattern.strategy) {
                let preferred = order.remove(pos);
                debug!(strategy = %pattern.strategy, confidence = pattern.confidence, "knowledge bias");
                order.insert(0, preferred);
            }
        }
        order
    }

    /// Try strategies until one proposes changes.
    pub async fn generate(&self, event: &ErrorEvent) -> Option<FixCandidate> {
        for strategy in self.selection_order(event) {
            let deadline = Instant::now() + self.timeout;
            let proposal =
                match tokio::time::timeout_at(deadline, strategy.propose(event, deadline)).await {
                    Ok(proposal) => proposal,
                    Err(_) => {
                        self.metrics.strategy_timeouts.inc();
                        warn!(strategy = strategy.tag(), event_id = %event.id, "strategy timed out");
                        continue;
                    }
                };
            let Some(proposal) = proposal.filter(|p| !p.changes.is_empty()) else {
                continue;
            };
            let fix = Fix::new(
                event,
                strategy.tag(),
                proposal.changes,
                proposal.confidence,
                proposal.description,
            );
            self.metrics.fixes_generated.inc();
            info!(
                event_id = %event.id,
                fix_id = %fix.id,
                strategy = %fix.strategy,
                confidence = fix.confidence,
                "fix generated"
            );
            return Some(FixCandidate {
                event: event.clone(),
                fix,
            });
        }
        None
    }

    /// Count a failed round; returns whether the event may be retried.
    fn exhausted(&self, event: &mut ErrorEvent) -> bool {
        self.metrics.fixes_exhausted.inc();
        event.record_retry(Utc::now());
        let retry = event.retry_count < self.max_fix_attempts;
        debug!(event_id = %event.id, retry_count = event.retry_count, retry, "no strategy produced a fix");
        retry
    }

    /// Wait before retrying an event that has failed `retry_count` rounds.
    pub fn retry_delay(&self, retry_count: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry_count.saturating_sub(1));
        self.retry_backoff.saturating_mul(factor).min(MAX_RETRY_BACKOFF)
    }

    /// Run the generator pool. Exhausted events go back through `requeue`
    /// after [`Generator::retry_delay`] until they reach `max_fix_attempts`.
    /// Retries still waiting at cancellation are dropped.
    pub fn spawn(
        self: Arc<Self>,
        input: QueueReceiver<ErrorEvent>,
        requeue: QueueSender<ErrorEvent>,
        router: FixRouter,
        cancel: CancellationToken,
        drain_limit: usize,
    ) -> StageHandle {
        let workers = self.workers;
        let retries = cancel.clone();
        spawn_workers("generator", workers, input, cancel, drain_limit, move |mut event: ErrorEvent| {
            let generator = Arc::clone(&self);
            let requeue = requeue.clone();
            let router = router.clone();
            let retries = retries.clone();
            async move {
                match generator.generate(&event).await {
                    Some(candidate) => {
                        router.route(candidate, &generator.metrics);
                    }
                    None => {
                        if generator.exhausted(&mut event) {
                            generator.metrics.events_requeued.inc();
                            let delay = generator.retry_delay(event.retry_count);
                            tokio::spawn(async move {
                                tokio::select! {
                                    _ = retries.cancelled() => {
                                        debug!(event_id = %event.id, "pending retry dropped at shutdown");
                                    }
                                    _ = tokio::time::sleep(delay) => {
                                        requeue.publish(event);
                                    }
                                }
                            });
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KnowledgeConfig;
    use crate::domain::{CodeChange, CodeSnippet, FixStatus, Severity};
    use crate::queue::bounded;
    use async_trait::async_trait;

    fn located(message: &str, file: &str, text: &str) -> ErrorEvent {
        let mut ev = ErrorEvent::new(message, Severity::High, "app.log").with_location(file, 5);
        ev.snippet = Some(CodeSnippet {
            file: file.to_string(),
            start_line: 5,
            target_line: 5,
            lines: vec![text.to_string()],
        });
        ev
    }

    fn generator(registry: StrategyRegistry, knowledge: Option<Arc<KnowledgeBase>>) -> Generator {
        Generator::new(
            &GeneratorConfig {
                timeout: Duration::from_millis(200),
                ..GeneratorConfig::default()
            },
            registry,
            knowledge,
            Arc::new(PipelineMetrics::new()),
        )
    }

    struct Slow;

    #[async_trait]
    impl FixStrategy for Slow {
        fn tag(&self) -> &str {
            "slow"
        }
        fn priority(&self) -> u32 {
            1000
        }
        async fn propose(&self, _event: &ErrorEvent, _deadline: Instant) -> Option<Proposal> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            None
        }
    }

    #[tokio::test]
    async fn test_highest_priority_match_wins() {
        let g = generator(StrategyRegistry::with_builtins(), None);
        let ev = located("too many open files", "main.go", "\tf, err := os.Open(p)");
        let c = g.generate(&ev).await.unwrap();
        assert_eq!(c.fix.strategy, "resource_cleanup");
        assert_eq!(c.fix.status, FixStatus::Pending);
        assert_eq!(c.event.id, ev.id);
    }

    #[tokio::test]
    async fn test_fallback_to_annotation() {
        let g = generator(StrategyRegistry::with_builtins(), None);
        let ev = located("disk quota exceeded", "main.go", "\twrite()");
        assert_eq!(g.generate(&ev).await.unwrap().fix.strategy, "code_refactoring");
    }

    #[tokio::test]
    async fn test_unlocated_event_yields_nothing() {
        let g = generator(StrategyRegistry::with_builtins(), None);
        let ev = ErrorEvent::new("nil pointer dereference", Severity::High, "app.log");
        assert!(g.generate(&ev).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_strategy_is_skipped() {
        let mut registry = StrategyRegistry::with_builtins();
        registry.register(Arc::new(Slow));
        let g = generator(registry, None);
        let ev = located("disk quota exceeded", "main.go", "\twrite()");
        let c = g.generate(&ev).await.unwrap();
        assert_eq!(c.fix.strategy, "code_refactoring");
        assert_eq!(g.metrics.strategy_timeouts.get(), 1);
    }

    #[tokio::test]
    async fn test_knowledge_bias_reorders() {
        let kb = Arc::new(
            KnowledgeBase::in_memory(&KnowledgeConfig::default(), Arc::new(PipelineMetrics::new())).unwrap(),
        );
        let ev = located("too many open files", "main.go", "\tf, err := os.Open(p)");
        let mut learned = Fix::new(&ev, "code_refactoring", vec![CodeChange::add("main.go", 5, "x")], 0.9, "");
        let now = Utc::now();
        learned.begin(now).unwrap();
        learned.mark_applied(now).unwrap();
        learned.mark_verified(now).unwrap();
        kb.observe(&learned).unwrap();

        let g = generator(StrategyRegistry::with_builtins(), Some(kb));
        assert_eq!(g.selection_order(&ev)[0].tag(), "code_refactoring");
        assert_eq!(g.generate(&ev).await.unwrap().fix.strategy, "code_refactoring");
    }

    #[tokio::test]
    async fn test_router_honours_mode_and_confidence() {
        let (deploy_tx, mut deploy_rx) = bounded("deploy", 4);
        let (suggest_tx, mut suggest_rx) = bounded("suggest", 4);
        let metrics = PipelineMetrics::new();
        let router = FixRouter::new(
            &DeploymentConfig {
                auto_deploy: true,
                ..DeploymentConfig::default()
            },
            deploy_tx,
            suggest_tx,
        );
        let ev = located("boom", "a.go", "x()");
        let strong = Fix::new(&ev, "null_check", vec![CodeChange::add("a.go", 1, "x")], 0.6, "");
        let weak = Fix::new(&ev, "code_refactoring", vec![CodeChange::add("a.go", 1, "x")], 0.1, "");

        assert!(router.route(FixCandidate { event: ev.clone(), fix: strong }, &metrics));
        assert!(!router.route(FixCandidate { event: ev, fix: weak }, &metrics));
        assert_eq!(deploy_rx.try_recv().unwrap().fix.strategy, "null_check");
        assert_eq!(suggest_rx.try_recv().unwrap().fix.strategy, "code_refactoring");
        assert_eq!(metrics.fixes_suggested.get(), 1);
    }

    #[test]
    fn test_retry_delay_doubles_and_caps() {
        let g = generator(StrategyRegistry::new(), None);
        assert_eq!(g.retry_delay(1), Duration::from_secs(1));
        assert_eq!(g.retry_delay(2), Duration::from_secs(2));
        assert_eq!(g.retry_delay(3), Duration::from_secs(4));
        assert_eq!(g.retry_delay(40), MAX_RETRY_BACKOFF);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_events_requeue_until_limit() {
        let (in_tx, in_rx) = bounded::<ErrorEvent>("generator.in", 16);
        let (deploy_tx, _deploy_rx) = bounded("deploy", 4);
        let (suggest_tx, _suggest_rx) = bounded("suggest", 4);
        let router = FixRouter::new(&DeploymentConfig::default(), deploy_tx, suggest_tx);
        let g = Arc::new(generator(StrategyRegistry::with_builtins(), None));
        let metrics = Arc::clone(&g.metrics);
        let cancel = CancellationToken::new();
        let mut stage = Arc::clone(&g).spawn(in_rx, in_tx.clone(), router, cancel.clone(), 0);

        let started = tokio::time::Instant::now();
        in_tx.publish(ErrorEvent::new("unlocated", Severity::High, "app.log"));
        for _ in 0..200 {
            if metrics.fixes_exhausted.get() >= 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        // Retries wait 1s, then 2s.
        assert!(started.elapsed() >= Duration::from_secs(3));
        cancel.cancel();
        stage.join().await;
        assert_eq!(metrics.fixes_exhausted.get(), 3);
        assert_eq!(metrics.events_requeued.get(), 2);
    }
}
