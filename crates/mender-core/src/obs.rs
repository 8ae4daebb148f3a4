//! Structured observability hooks for the remediation lifecycle.
//!
//! This module provides:
//! - Fix-scoped tracing spans via [`fix_span`]
//! - Emission functions for stage lifecycle, detections and fix transitions

use tracing::{error, info};

use crate::domain::{ErrorEvent, Fix, FixStatus};

/// Span scoping every log line of one deployment to its fix.
///
/// ```ignore
/// deployer.run(&mut fix).instrument(obs::fix_span(&fix)).await;
/// ```
pub fn fix_span(fix: &Fix) -> tracing::Span {
    tracing::info_span!(
        "mender.fix",
        fix_id = %fix.id,
        fingerprint = %fix.fingerprint,
        strategy = %fix.strategy,
    )
}

pub fn emit_stage_started(stage: &str, workers: usize) {
    info!(event = "stage.started", stage = %stage, workers = workers);
}

pub fn emit_stage_stopped(stage: &str, processed: u64) {
    info!(event = "stage.stopped", stage = %stage, processed = processed);
}

/// Emit event: the collector matched a log entry.
pub fn emit_event_detected(event: &ErrorEvent) {
    info!(
        event = "error.detected",
        event_id = %event.id,
        severity = %event.severity,
        source = %event.source,
        pattern = event.matched_pattern.as_deref().unwrap_or(""),
    );
}

/// Emit event: a fix moved between lifecycle states.
pub fn emit_fix_transition(fix: &Fix, from: FixStatus, to: FixStatus) {
    info!(
        event = "fix.transition",
        fix_id = %fix.id,
        from = %from,
        to = %to,
        reason = fix.failure_reason.as_deref().unwrap_or(""),
    );
}

/// Emit event: a condition that requires operator intervention.
pub fn emit_fatal(component: &str, reason: &dyn std::fmt::Display) {
    error!(event = "operator.fatal", component = %component, reason = %reason);
}
