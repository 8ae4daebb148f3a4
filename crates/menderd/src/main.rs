//! Mender daemon.
//!
//! Loads configuration, runs the remediation pipeline until SIGINT or
//! SIGTERM, then shuts down within `pipeline.shutdown_grace`. Exits non-zero
//! if the deployer halted after a failed rollback validation.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use mender_core::config::MenderConfig;
use mender_core::pipeline::Pipeline;
use mender_core::queue::QueueReceiver;
use mender_core::telemetry::init_tracing_with;
use mender_core::{FixCandidate, Remediation};

/// Interval between metric flushes and halt checks.
const TICK: Duration = Duration::from_secs(60);

#[derive(Parser)]
#[command(name = "menderd")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Mender remediation daemon", long_about = None)]
struct Args {
    /// Configuration file (YAML)
    #[arg(short, long, env = "MENDER_CONFIG", default_value = "mender.yaml")]
    config: PathBuf,

    /// Emit JSON-formatted log lines
    #[arg(long)]
    json: bool,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();
    let config = MenderConfig::load(&args.config)
        .with_context(|| format!("invalid configuration {}", args.config.display()))?;

    let level = if args.verbose { "debug" } else { config.logging.level.as_str() };
    init_tracing_with(args.json || config.logging.json, level);

    let grace = config.pipeline.shutdown_grace;
    let mut pipeline = Pipeline::new(config).context("failed to build pipeline")?;
    let suggestions = pipeline.take_suggestions();
    let remediations = pipeline.take_remediations();

    let cancel = CancellationToken::new();
    pipeline.start(cancel.clone()).context("failed to start pipeline")?;
    info!(config = %args.config.display(), version = mender_core::VERSION, "menderd started");

    let reporters = [
        suggestions.map(|rx| tokio::spawn(report_suggestions(rx))),
        remediations.map(|rx| tokio::spawn(report_remediations(rx))),
    ];

    let mut ticker = tokio::time::interval(TICK);
    ticker.tick().await;
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = ticker.tick() => {
                pipeline.metrics_handle().flush();
                if pipeline.is_halted() {
                    error!("deployer halted after a failed rollback validation, shutting down");
                    break;
                }
            }
        }
    }

    info!(grace_secs = grace.as_secs(), "shutting down");
    let report = pipeline.stop(grace).await.context("failed to stop pipeline")?;
    if !report.is_clean() {
        warn!(abandoned = ?report.abandoned, "stages abandoned at shutdown");
    }
    cancel.cancel();
    for reporter in reporters.into_iter().flatten() {
        reporter.abort();
    }

    if pipeline.is_halted() {
        error!("exiting: deployment halted, working tree needs operator attention");
        return Ok(ExitCode::from(2));
    }
    Ok(ExitCode::SUCCESS)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT"),
        _ = terminate => info!("received SIGTERM"),
    }
}

/// Suggestions have no consumer in the daemon; log them for review.
async fn report_suggestions(mut rx: QueueReceiver<FixCandidate>) {
    while let Some(candidate) = rx.recv().await {
        info!(
            event_id = %candidate.event.id,
            fix_id = %candidate.fix.id,
            strategy = %candidate.fix.strategy,
            confidence = candidate.fix.confidence,
            description = %candidate.fix.description,
            "fix suggested"
        );
    }
}

async fn report_remediations(mut rx: QueueReceiver<Remediation>) {
    while let Some(r) = rx.recv().await {
        info!(
            event_id = %r.event.id,
            fix_id = %r.fix.id,
            status = %r.fix.status,
            reason = r.fix.failure_reason.as_deref().unwrap_or(""),
            "remediation finished"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_defaults() {
        let args = Args::parse_from(["menderd"]);
        assert_eq!(args.config, PathBuf::from("mender.yaml"));
        assert!(!args.json);
        assert!(!args.verbose);
    }

    #[test]
    fn test_args_flags() {
        let args = Args::parse_from(["menderd", "--config", "/etc/mender.yaml", "--json", "-v"]);
        assert_eq!(args.config, PathBuf::from("/etc/mender.yaml"));
        assert!(args.json);
        assert!(args.verbose);
    }
}
