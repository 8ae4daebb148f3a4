//! Event enrichment: severity, stack frames, source context, fingerprint.
//!
//! [`Analyzer::analyze`] is a pure per-event transformation (apart from
//! reading source files); [`Analyzer::spawn`] runs it on a worker pool
//! between two bounded queues.

pub mod context;
pub mod stack;

use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub use context::{capture_snippet, resolve_source};
pub use stack::parse_stack_trace;

use crate::collector::ErrorDetector;
use crate::config::AnalyzerConfig;
use crate::domain::{error_signature, fingerprint, ErrorEvent, PatternError, Severity, SourceLocation};
use crate::metrics::PipelineMetrics;
use crate::queue::{QueueReceiver, QueueSender};
use crate::stage::{spawn_workers, StageHandle};

/// Severity classifier and context enricher.
pub struct Analyzer {
    classifier: Option<ErrorDetector>,
    max_stack_depth: usize,
    context_lines: usize,
    source_root: PathBuf,
    top_frames: usize,
    workers: usize,
    metrics: Arc<PipelineMetrics>,
}

impl Analyzer {
    /// Build from configuration. Without `error_patterns` the severity
    /// assigned by the collector is kept.
    pub fn new(config: &AnalyzerConfig, metrics: Arc<PipelineMetrics>) -> Result<Self, PatternError> {
        let classifier = if config.error_patterns.is_empty() {
            None
        } else {
            Some(ErrorDetector::from_config(&config.error_patterns)?)
        };
        Ok(Self {
            classifier,
            max_stack_depth: config.max_stack_depth,
            context_lines: config.context_lines,
            source_root: config.source_root.clone(),
            top_frames: config.top_frames,
            workers: config.workers,
            metrics,
        })
    }

    /// Enrich one event.
    pub fn analyze(&self, mut event: ErrorEvent) -> ErrorEvent {
        self.classify(&mut event);

        if event.frames.is_empty() {
            if let Some(trace) = &event.stack_trace {
                event.frames = parse_stack_trace(trace);
            }
        }
        event.frames.truncate(self.max_stack_depth);
        if let Some(top) = event.frames.first() {
            event.context.insert("stack.top".to_string(), top.key());
            event
                .context
                .insert("stack.depth".to_string(), event.frames.len().to_string());
        }

        if event.location.is_none() {
            event.location = event
                .frames
                .iter()
                .find(|f| !f.file.is_empty())
                .and_then(|f| f.line.map(|line| SourceLocation::new(f.file.clone(), line)));
        }

        if let Some(loc) = event.location.clone() {
            let path = resolve_source(&self.source_root, &loc.file);
            match capture_snippet(&path, &loc.file, loc.line, self.context_lines) {
                Ok(Some(snippet)) => event.snippet = Some(snippet),
                Ok(None) => debug!(location = %loc, "line outside source file, no snippet"),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "cannot read source for snippet");
                    self.metrics.snippet_failures.inc();
                }
            }
        }

        event.fingerprint = Some(fingerprint(&event, self.top_frames));
        event.signature = Some(error_signature(&event, self.top_frames));
        self.metrics.events_analyzed.inc();
        event
    }

    fn classify(&self, event: &mut ErrorEvent) {
        let Some(classifier) = &self.classifier else {
            return;
        };
        let text = match event.context.get("level") {
            Some(level) => format!("{level} {}", event.message),
            None => event.message.clone(),
        };
        match classifier.classify(&text) {
            Some((pattern, severity)) => {
                event.severity = severity;
                event
                    .context
                    .insert("analyzer.pattern".to_string(), pattern.to_string());
            }
            None => event.severity = Severity::Low,
        }
    }

    /// Run the analyzer pool from `input` to `output`.
    pub fn spawn(
        self: Arc<Self>,
        input: QueueReceiver<ErrorEvent>,
        output: QueueSender<ErrorEvent>,
        cancel: CancellationToken,
        drain_limit: usize,
    ) -> StageHandle {
        let workers = self.workers;
        spawn_workers("analyzer", workers, input, cancel, drain_limit, move |event| {
            let analyzer = Arc::clone(&self);
            let output = output.clone();
            async move {
                let event = analyzer.analyze(event);
                output.publish(event);
            }
        })
    }
}
