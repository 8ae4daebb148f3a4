//! Mender operator CLI
//!
//! The `mender` command inspects configuration, scans logs offline and
//! maintains the knowledge store.
//!
//! ## Commands
//!
//! - `check-config`: load and validate a configuration file
//! - `scan`: run detection and analysis over a whole log file
//! - `patterns list` / `patterns cleanup`: inspect or compact learned patterns
//! - `backup` / `restore`: archive a store collection

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::info;

use mender_core::analyzer::Analyzer;
use mender_core::collector::{ErrorDetector, LogParser};
use mender_core::config::{KnowledgeConfig, MenderConfig};
use mender_core::domain::ErrorEvent;
use mender_core::knowledge::{KnowledgeBase, PATTERNS_COLLECTION};
use mender_core::metrics::PipelineMetrics;
use mender_core::telemetry::init_tracing_with;
use mender_store::FileStore;

#[derive(Parser)]
#[command(name = "mender")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Mender automated error remediation: operator tooling", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load and validate a configuration file
    CheckConfig {
        /// Configuration file (YAML)
        config: PathBuf,

        /// Print the effective configuration with defaults filled in
        #[arg(long)]
        print: bool,
    },

    /// Detect and analyse every error in a log file, from its first byte
    Scan {
        /// Configuration file (YAML); defaults apply when omitted
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Log file to scan
        log: PathBuf,
    },

    /// Inspect or compact learned patterns
    Patterns {
        #[command(subcommand)]
        action: PatternsAction,
    },

    /// Archive a store collection to `<store>/backups`
    Backup {
        /// Store root directory
        #[arg(short, long)]
        store: PathBuf,

        /// Collection to archive
        #[arg(short, long, default_value = PATTERNS_COLLECTION)]
        collection: String,
    },

    /// Replace a store collection with the contents of an archive
    Restore {
        /// Store root directory
        #[arg(short, long)]
        store: PathBuf,

        /// Archive written by `backup`
        archive: PathBuf,

        /// Collection to restore
        #[arg(short, long, default_value = PATTERNS_COLLECTION)]
        collection: String,
    },
}

#[derive(Subcommand)]
enum PatternsAction {
    /// List patterns, best score first
    List {
        /// Store root directory
        #[arg(short, long)]
        store: PathBuf,
    },

    /// Expire and prune patterns per the knowledge settings of a config
    Cleanup {
        /// Configuration file (YAML)
        #[arg(short, long)]
        config: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing_with(cli.json, if cli.verbose { "debug" } else { "warn" });

    match cli.command {
        Commands::CheckConfig { config, print } => cmd_check_config(&config, print),
        Commands::Scan { config, log } => cmd_scan(config.as_deref(), &log),
        Commands::Patterns { action } => match action {
            PatternsAction::List { store } => cmd_patterns_list(&store, cli.json),
            PatternsAction::Cleanup { config } => cmd_patterns_cleanup(&config),
        },
        Commands::Backup { store, collection } => cmd_backup(&store, &collection),
        Commands::Restore {
            store,
            archive,
            collection,
        } => cmd_restore(&store, &archive, &collection),
    }
}

fn load_config(path: &Path) -> Result<MenderConfig> {
    MenderConfig::load(path).with_context(|| format!("invalid configuration {}", path.display()))
}

fn open_store(root: &Path) -> Result<Arc<FileStore>> {
    let store = FileStore::open(root)
        .with_context(|| format!("failed to open store at {}", root.display()))?;
    Ok(Arc::new(store))
}

fn cmd_check_config(path: &Path, print: bool) -> Result<()> {
    let config = load_config(path)?;
    if print {
        print!("{}", config.to_yaml()?);
    } else {
        println!("{}: ok", path.display());
    }
    Ok(())
}

/// Parse, detect and analyse every line of `log`.
fn scan_file(config: &MenderConfig, log: &Path) -> Result<Vec<ErrorEvent>> {
    let raw = std::fs::read(log).with_context(|| format!("failed to read {}", log.display()))?;
    let text = String::from_utf8_lossy(&raw);
    let parser = LogParser::new();
    let detector = ErrorDetector::with_defaults_and(&config.analyzer.error_patterns)?;
    let analyzer = Analyzer::new(&config.analyzer, Arc::new(PipelineMetrics::new()))?;
    let source = log.display().to_string();

    Ok(text
        .lines()
        .filter_map(|line| parser.parse(line))
        .filter_map(|entry| detector.detect(&entry, &source))
        .map(|event| analyzer.analyze(event))
        .collect())
}

fn cmd_scan(config: Option<&Path>, log: &Path) -> Result<()> {
    let config = match config {
        Some(path) => load_config(path)?,
        None => MenderConfig::default(),
    };
    let events = scan_file(&config, log)?;
    for event in &events {
        println!("{}", serde_json::to_string(event)?);
    }
    info!(events = events.len(), log = %log.display(), "scan complete");
    Ok(())
}

fn cmd_patterns_list(store: &Path, json: bool) -> Result<()> {
    let store = open_store(store)?;
    let kb = KnowledgeBase::open(
        &KnowledgeConfig::default(),
        store,
        Arc::new(PipelineMetrics::new()),
    )?;
    let patterns = kb.patterns();
    if json {
        println!("{}", serde_json::to_string_pretty(&patterns)?);
        return Ok(());
    }
    if patterns.is_empty() {
        println!("No patterns learned yet");
        return Ok(());
    }
    for p in patterns {
        println!(
            "{:<20} uses={:<5} success={:.2} confidence={:.2} last={} {}",
            p.strategy,
            p.usage_count,
            p.success_rate,
            p.confidence,
            p.last_used.to_rfc3339(),
            p.error_signature
        );
    }
    Ok(())
}

fn cmd_patterns_cleanup(config: &Path) -> Result<()> {
    let config = load_config(config)?;
    let store = open_store(&config.knowledge.storage_path)?;
    let kb = KnowledgeBase::open(&config.knowledge, store, Arc::new(PipelineMetrics::new()))?;
    let report = kb.cleanup(Utc::now());
    println!(
        "expired={} pruned={} remaining={}",
        report.expired, report.pruned, report.remaining
    );
    Ok(())
}

fn cmd_backup(store: &Path, collection: &str) -> Result<()> {
    let archive = open_store(store)?
        .backup(collection)
        .with_context(|| format!("backup of {collection} failed"))?;
    println!("{}", archive.display());
    Ok(())
}

fn cmd_restore(store: &Path, archive: &Path, collection: &str) -> Result<()> {
    let restored = open_store(store)?
        .restore(archive, collection)
        .with_context(|| format!("restore of {collection} from {} failed", archive.display()))?;
    println!("Restored {restored} records into {collection}");
    Ok(())
}
