//! Pipeline supervisor.
//!
//! Wires the stages together over bounded queues:
//!
//! ```text
//! collector.out -> analyzer -> generator.in -> { deployment.in | suggestions }
//! deployment -> knowledge.in, remediations
//! ```
//!
//! Stages start leaves first (knowledge, deployment, generator, analyzer,
//! collector) and are awaited in the reverse order on stop.

use std::sync::Arc;
use std::time::Duration;

use mender_store::{FileStore, StoreError};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::analyzer::Analyzer;
use crate::collector::{Collector, CollectorError, ErrorDetector};
use crate::config::{ConfigError, MenderConfig};
use crate::deployment::{Approver, AutoApprove, Deployer, DeploymentStage, RejectAll, Remediation};
use crate::domain::{ErrorEvent, PatternError};
use crate::generator::{FixCandidate, FixRouter, FixStrategy, Generator, StrategyRegistry};
use crate::knowledge::{KnowledgeBase, KnowledgeError};
use crate::metrics::{MetricsSnapshot, PipelineMetrics};
use crate::queue::{self, QueueReceiver, QueueSender};
use crate::stage::StageHandle;

/// Errors produced while building or driving the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("pipeline already started")]
    AlreadyStarted,

    #[error("pipeline not started")]
    NotStarted,

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("pattern error: {0}")]
    Pattern(#[from] PatternError),

    #[error("collector error: {0}")]
    Collector(#[from] CollectorError),

    #[error("knowledge error: {0}")]
    Knowledge(#[from] KnowledgeError),

    #[error("storage error: {0}")]
    Store(#[from] StoreError),
}

/// Result type for pipeline operations.
pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

/// Stages that did not finish within the shutdown grace period.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub abandoned: Vec<String>,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.abandoned.is_empty()
    }
}

struct Running {
    cancel: CancellationToken,
    /// Analyzer, generator, deployment, knowledge: the stop order.
    stages: Vec<StageHandle>,
}

/// The assembled remediation pipeline.
pub struct Pipeline {
    config: MenderConfig,
    metrics: Arc<PipelineMetrics>,
    store: Arc<FileStore>,
    knowledge: Arc<KnowledgeBase>,
    collector: Collector,
    analyzer: Arc<Analyzer>,
    registry: StrategyRegistry,
    approver: Arc<dyn Approver>,
    deployer: Option<Arc<Deployer>>,
    suggestions: (QueueSender<FixCandidate>, Option<QueueReceiver<FixCandidate>>),
    remediations: (QueueSender<Remediation>, Option<QueueReceiver<Remediation>>),
    running: Option<Running>,
    stopped: bool,
}

impl Pipeline {
    /// Validate `config`, open the pattern store and build every stage.
    pub fn new(config: MenderConfig) -> PipelineResult<Self> {
        config.validate()?;
        let metrics = Arc::new(PipelineMetrics::new());

        let store = Arc::new(FileStore::open(&config.knowledge.storage_path)?);
        let knowledge = Arc::new(KnowledgeBase::open(
            &config.knowledge,
            Arc::clone(&store),
            Arc::clone(&metrics),
        )?);

        let detector = ErrorDetector::with_defaults_and(&config.analyzer.error_patterns)?;
        let collector = Collector::new(&config.collector, detector, Arc::clone(&metrics))?;
        let analyzer = Arc::new(Analyzer::new(&config.analyzer, Arc::clone(&metrics))?);

        let mut registry = StrategyRegistry::with_builtins();
        registry.configure(&config.generator.fix_strategies)?;

        let approver: Arc<dyn Approver> = if config.deployment.require_human_approval {
            Arc::new(RejectAll)
        } else {
            Arc::new(AutoApprove)
        };

        let capacity = config.pipeline.queue_capacity;
        let (suggest_tx, suggest_rx) = queue::bounded("suggestions", capacity);
        let (fix_tx, fix_rx) = queue::bounded("remediations", capacity);
        metrics.register_queue(suggest_tx.drop_counter());
        metrics.register_queue(fix_tx.drop_counter());

        Ok(Self {
            config,
            metrics,
            store,
            knowledge,
            collector,
            analyzer,
            registry,
            approver,
            deployer: None,
            suggestions: (suggest_tx, Some(suggest_rx)),
            remediations: (fix_tx, Some(fix_rx)),
            running: None,
            stopped: false,
        })
    }

    /// Register an extra strategy, replacing a built-in with the same tag.
    pub fn with_strategy(mut self, strategy: Arc<dyn FixStrategy>) -> Self {
        self.registry.register(strategy);
        self
    }

    /// Replace the approval gate used when deploying.
    pub fn with_approver(mut self, approver: Arc<dyn Approver>) -> Self {
        self.approver = approver;
        self
    }

    pub fn config(&self) -> &MenderConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<FileStore> {
        &self.store
    }

    pub fn knowledge(&self) -> &Arc<KnowledgeBase> {
        &self.knowledge
    }

    pub fn collector(&self) -> &Collector {
        &self.collector
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Whether the deployer stopped after a failed rollback validation.
    pub fn is_halted(&self) -> bool {
        self.deployer.as_ref().is_some_and(|d| d.is_halted())
    }

    /// Fixes published for human review. Handed out once.
    pub fn take_suggestions(&mut self) -> Option<QueueReceiver<FixCandidate>> {
        self.suggestions.1.take()
    }

    /// Every deployment outcome. Handed out once.
    pub fn take_remediations(&mut self) -> Option<QueueReceiver<Remediation>> {
        self.remediations.1.take()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn metrics_handle(&self) -> Arc<PipelineMetrics> {
        Arc::clone(&self.metrics)
    }

    fn queue<T>(&self, name: &str) -> (QueueSender<T>, QueueReceiver<T>) {
        let (tx, rx) = queue::bounded(name, self.config.pipeline.queue_capacity);
        self.metrics.register_queue(tx.drop_counter());
        (tx, rx)
    }

    /// Start every stage. Must be called from within a Tokio runtime.
    pub fn start(&mut self, cancel: CancellationToken) -> PipelineResult<()> {
        if self.running.is_some() || self.stopped {
            return Err(PipelineError::AlreadyStarted);
        }
        let Some(events) = self.collector.output() else {
            return Err(PipelineError::AlreadyStarted);
        };
        let cancel = cancel.child_token();
        let drain = self.config.pipeline.drain_limit;

        let (analyzed_tx, analyzed_rx) = self.queue::<ErrorEvent>("generator.in");
        let (deploy_tx, deploy_rx) = self.queue::<FixCandidate>("deployment.in");
        let (learn_tx, learn_rx) = self.queue::<Remediation>("knowledge.in");

        // Knowledge.
        let knowledge = Arc::clone(&self.knowledge).spawn(learn_rx, cancel.clone(), drain);

        // Deployment.
        let deployer = Arc::new(Deployer::new(
            &self.config.deployment,
            Arc::clone(&self.approver),
            Arc::clone(&self.metrics),
        ));
        self.deployer = Some(Arc::clone(&deployer));
        let deployment = Arc::new(DeploymentStage::new(
            deployer,
            learn_tx,
            self.remediations.0.clone(),
            self.config.deployment.max_deferred_per_fingerprint,
            Arc::clone(&self.metrics),
        ))
        .spawn(deploy_rx, cancel.clone(), drain);

        // Generator.
        let generator = Arc::new(Generator::new(
            &self.config.generator,
            self.registry.clone(),
            Some(Arc::clone(&self.knowledge)),
            Arc::clone(&self.metrics),
        ));
        let router = FixRouter::new(&self.config.deployment, deploy_tx, self.suggestions.0.clone());
        let generator = generator.spawn(analyzed_rx, analyzed_tx.clone(), router, cancel.clone(), drain);

        // Analyzer.
        let analyzer = Arc::clone(&self.analyzer).spawn(events, analyzed_tx, cancel.clone(), drain);

        let stages = vec![analyzer, generator, deployment, knowledge];

        // Collector.
        if let Err(e) = self.collector.start(cancel.clone()) {
            cancel.cancel();
            for stage in &stages {
                stage.abort();
            }
            self.stopped = true;
            return Err(e.into());
        }

        info!(
            auto_deploy = self.config.deployment.auto_deploy,
            strategies = self.registry.len(),
            "pipeline started"
        );
        self.running = Some(Running { cancel, stages });
        Ok(())
    }

    /// Cancel every stage and wait up to `grace` for them to finish in
    /// order collector, analyzer, generator, deployment, knowledge.
    /// Stages still running at the deadline are aborted and reported.
    pub async fn stop(&mut self, grace: Duration) -> PipelineResult<ShutdownReport> {
        let Running { cancel, mut stages } = self.running.take().ok_or(PipelineError::NotStarted)?;
        self.stopped = true;
        let deadline = Instant::now() + grace;
        cancel.cancel();

        let mut report = ShutdownReport::default();
        match tokio::time::timeout_at(deadline, self.collector.stop()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "collector stop failed"),
            Err(_) => report.abandoned.push("collector".to_string()),
        }
        for stage in &mut stages {
            if tokio::time::timeout_at(deadline, stage.join()).await.is_err() {
                stage.abort();
                report.abandoned.push(stage.name().to_string());
            }
        }

        if report.is_clean() {
            info!("pipeline stopped");
        } else {
            warn!(abandoned = ?report.abandoned, "pipeline stopped with abandoned stages");
        }
        self.metrics.flush();
        Ok(report)
    }
}
