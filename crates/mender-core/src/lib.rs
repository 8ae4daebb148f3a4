//! Mender Core Library
//!
//! Automated error remediation: tail application logs, detect and enrich
//! failures, synthesise candidate patches, validate them in a sandbox before
//! touching the working tree, and learn which repair strategies work.
//!
//! ## Stages
//!
//! - [`collector`]: log discovery, tailing and error detection
//! - [`analyzer`]: stack parsing, source context, fingerprinting
//! - [`generator`]: rule-based fix strategies with knowledge bias
//! - [`deployment`]: sandbox, approval, apply, verify and rollback
//! - [`knowledge`]: persisted error/fix pattern statistics
//! - [`pipeline`]: wiring, start ordering and graceful shutdown

pub mod analyzer;
pub mod collector;
pub mod config;
pub mod deployment;
pub mod domain;
pub mod generator;
pub mod knowledge;
pub mod metrics;
pub mod obs;
pub mod pipeline;
pub mod queue;
pub mod stage;
pub mod telemetry;

pub use analyzer::Analyzer;
pub use collector::{Collector, CollectorError, ErrorDetector, LogParser};
pub use config::{ConfigError, MenderConfig};
pub use deployment::{
    Approver, AutoApprove, DeployError, DeployReport, Deployer, DeploymentStage, RejectAll,
    Remediation,
};
pub use domain::{
    CodeChange, ErrorEvent, ErrorFixPattern, Fix, FixStatus, MenderError, PatternError, Result,
    Severity, TransitionError,
};
pub use generator::{FixCandidate, FixRouter, FixStrategy, Generator, Proposal, StrategyRegistry};
pub use knowledge::{CleanupReport, KnowledgeBase, KnowledgeError};
pub use metrics::{MetricsSnapshot, PipelineMetrics};
pub use pipeline::{Pipeline, PipelineError, ShutdownReport};
pub use queue::{QueueReceiver, QueueSender};
pub use telemetry::init_tracing;

/// Mender version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
