//! Learned error→strategy associations.
//!
//! The pattern table lives in memory behind a single-writer lock and is
//! written through to the `patterns` collection of a [`FileStore`]. The
//! generator only reads it (`lookup`); writes arrive from deployment
//! outcomes through the knowledge stage (`observe`).

pub mod error;
pub mod similarity;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use mender_store::FileStore;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use error::{KnowledgeError, KnowledgeResult};
pub use similarity::{jaccard, signature_similarity, signature_tokens};

use crate::config::KnowledgeConfig;
use crate::deployment::Remediation;
use crate::domain::{error_signature, ErrorEvent, ErrorFixPattern, Fix, DEFAULT_TOP_FRAMES};
use crate::metrics::PipelineMetrics;
use crate::obs;
use crate::queue::QueueReceiver;
use crate::stage::StageHandle;

/// Store collection holding one record per pattern.
pub const PATTERNS_COLLECTION: &str = "patterns";

/// Failed-pattern threshold below which stale patterns expire.
const EXPIRY_SUCCESS_RATE: f64 = 0.5;

/// Outcome of one [`KnowledgeBase::cleanup`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    /// Stale, mostly failing patterns removed.
    pub expired: usize,
    /// Lowest-scoring patterns removed to respect `max_entries`.
    pub pruned: usize,
    pub remaining: usize,
}

/// In-memory pattern table with file-store write-through.
pub struct KnowledgeBase {
    patterns: RwLock<BTreeMap<Uuid, ErrorFixPattern>>,
    store: Option<Arc<FileStore>>,
    learning_enabled: bool,
    max_entries: usize,
    retention_period: Duration,
    cleanup_interval: Duration,
    min_similarity: f64,
    metrics: Arc<PipelineMetrics>,
}

impl KnowledgeBase {
    /// Open the knowledge base, loading every stored pattern.
    ///
    /// Records that fail to decode are logged and skipped.
    pub fn open(
        config: &KnowledgeConfig,
        store: Arc<FileStore>,
        metrics: Arc<PipelineMetrics>,
    ) -> KnowledgeResult<Self> {
        let mut kb = Self::in_memory(config, metrics)?;
        let mut table: BTreeMap<Uuid, ErrorFixPattern> = BTreeMap::new();
        let mut duplicates: Vec<Uuid> = Vec::new();
        for id in store.list(PATTERNS_COLLECTION)? {
            match store.load::<ErrorFixPattern>(PATTERNS_COLLECTION, &id) {
                Ok(pattern) => {
                    // Keep the busiest record if a pair was stored twice.
                    let existing = table.values().find(|p| p.same_pair(&pattern)).map(|p| (p.id, p.usage_count));
                    match existing {
                        Some((_, usage)) if usage >= pattern.usage_count => {
                            duplicates.push(pattern.id);
                            continue;
                        }
                        Some((old, _)) => {
                            table.remove(&old);
                            duplicates.push(old);
                        }
                        None => {}
                    }
                    table.insert(pattern.id, pattern);
                }
                Err(e) => warn!(id = %id, error = %e, "skipping unreadable pattern record"),
            }
        }
        info!(patterns = table.len(), root = %store.root().display(), "knowledge base loaded");
        kb.patterns = RwLock::new(table);
        kb.store = Some(store);
        for id in &duplicates {
            debug!(pattern_id = %id, "removing duplicate pattern record");
            kb.unpersist(id);
        }
        Ok(kb)
    }

    /// Knowledge base without persistence.
    pub fn in_memory(config: &KnowledgeConfig, metrics: Arc<PipelineMetrics>) -> KnowledgeResult<Self> {
        if !(0.0..=1.0).contains(&config.min_similarity) {
            return Err(KnowledgeError::InvalidConfig(format!(
                "min_similarity must be within [0, 1], got {}",
                config.min_similarity
            )));
        }
        Ok(Self {
            patterns: RwLock::new(BTreeMap::new()),
            store: None,
            learning_enabled: config.learning_enabled,
            max_entries: config.max_entries,
            retention_period: config.retention_period,
            cleanup_interval: config.cleanup_interval,
            min_similarity: config.min_similarity,
            metrics,
        })
    }

    pub fn len(&self) -> usize {
        self.patterns.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.read().is_empty()
    }

    /// Every pattern, best score first.
    pub fn patterns(&self) -> Vec<ErrorFixPattern> {
        let mut all: Vec<ErrorFixPattern> = self.patterns.read().values().cloned().collect();
        all.sort_by(|a, b| {
            b.score()
                .total_cmp(&a.score())
                .then_with(|| a.error_signature.cmp(&b.error_signature))
        });
        all
    }

    /// Best pattern for `event`'s class, if any is similar enough.
    pub fn lookup(&self, event: &ErrorEvent) -> Option<ErrorFixPattern> {
        match &event.signature {
            Some(signature) => self.lookup_signature(signature),
            None => self.lookup_signature(&error_signature(event, DEFAULT_TOP_FRAMES)),
        }
    }

    /// Best pattern for a signature: highest similarity, then confidence,
    /// then usage count.
    pub fn lookup_signature(&self, signature: &str) -> Option<ErrorFixPattern> {
        let wanted = signature_tokens(signature);
        let table = self.patterns.read();
        table
            .values()
            .map(|p| (jaccard(&wanted, &signature_tokens(&p.error_signature)), p))
            .filter(|(score, _)| *score > 0.0 && *score >= self.min_similarity)
            .max_by(|(sa, a), (sb, b)| {
                sa.total_cmp(sb)
                    .then_with(|| a.confidence.total_cmp(&b.confidence))
                    .then_with(|| a.usage_count.cmp(&b.usage_count))
            })
            .map(|(_, p)| p.clone())
    }

    /// Fold a terminal fix into its (class, strategy) pattern.
    ///
    /// Returns the updated pattern, or `None` when learning is disabled or
    /// the fix has not reached a terminal state.
    pub fn observe(&self, fix: &Fix) -> Option<ErrorFixPattern> {
        if !self.learning_enabled || !fix.status.is_terminal() {
            return None;
        }
        let successful = fix.is_successful();
        let now = Utc::now();

        let mut table = self.patterns.write();
        let existing = table
            .values_mut()
            .find(|p| p.error_signature == fix.error_signature && p.strategy == fix.strategy);
        let updated = match existing {
            Some(pattern) => {
                pattern.record_outcome(successful, fix.confidence, now);
                pattern.clone()
            }
            None => {
                let pattern = ErrorFixPattern::first_observation(
                    fix.error_signature.clone(),
                    fix.strategy.clone(),
                    successful,
                    fix.confidence,
                    now,
                );
                table.insert(pattern.id, pattern.clone());
                pattern
            }
        };
        self.persist(&updated);
        drop(table);

        self.metrics.patterns_observed.inc();
        debug!(
            strategy = %updated.strategy,
            usage = updated.usage_count,
            success_rate = updated.success_rate,
            "pattern updated"
        );
        Some(updated)
    }

    /// Expire stale failing patterns, then prune by score down to
    /// `max_entries`.
    pub fn cleanup(&self, now: DateTime<Utc>) -> CleanupReport {
        let mut table = self.patterns.write();

        let expired: Vec<Uuid> = table
            .values()
            .filter(|p| p.success_rate < EXPIRY_SUCCESS_RATE && self.is_stale(p, now))
            .map(|p| p.id)
            .collect();
        for id in &expired {
            table.remove(id);
            self.unpersist(id);
        }

        let mut pruned = 0;
        if table.len() > self.max_entries {
            let mut ranked: Vec<(f64, DateTime<Utc>, Uuid)> =
                table.values().map(|p| (p.score(), p.last_used, p.id)).collect();
            ranked.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
            let excess = table.len() - self.max_entries;
            for (_, _, id) in ranked.into_iter().take(excess) {
                table.remove(&id);
                self.unpersist(&id);
                pruned += 1;
            }
        }

        let report = CleanupReport {
            expired: expired.len(),
            pruned,
            remaining: table.len(),
        };
        drop(table);

        self.metrics
            .patterns_pruned
            .add((report.expired + report.pruned) as u64);
        if report.expired + report.pruned > 0 {
            info!(
                expired = report.expired,
                pruned = report.pruned,
                remaining = report.remaining,
                "knowledge cleanup"
            );
        }
        report
    }

    fn is_stale(&self, pattern: &ErrorFixPattern, now: DateTime<Utc>) -> bool {
        (now - pattern.last_used)
            .to_std()
            .map(|age| age > self.retention_period)
            .unwrap_or(false)
    }

    fn persist(&self, pattern: &ErrorFixPattern) {
        let Some(store) = &self.store else { return };
        if let Err(e) = store.save(PATTERNS_COLLECTION, &pattern.id.to_string(), pattern) {
            warn!(pattern_id = %pattern.id, error = %e, "pattern write-through failed");
            self.metrics.persist_errors.inc();
        }
    }

    fn unpersist(&self, id: &Uuid) {
        let Some(store) = &self.store else { return };
        match store.delete(PATTERNS_COLLECTION, &id.to_string()) {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => {
                warn!(pattern_id = %id, error = %e, "pattern delete failed");
                self.metrics.persist_errors.inc();
            }
        }
    }

    /// Run the knowledge stage: observe remediations and clean up every
    /// `cleanup_interval`.
    pub fn spawn(
        self: Arc<Self>,
        mut input: QueueReceiver<Remediation>,
        cancel: CancellationToken,
        drain_limit: usize,
    ) -> StageHandle {
        obs::emit_stage_started("knowledge", 1);
        let period = self.cleanup_interval.max(Duration::from_millis(10));
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            let mut processed = 0u64;
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        self.cleanup(Utc::now());
                    }
                    item = input.recv() => match item {
                        Some(remediation) => {
                            self.observe(&remediation.fix);
                            processed += 1;
                        }
                        None => return processed,
                    },
                }
            }
            for _ in 0..drain_limit {
                match input.try_recv() {
                    Ok(remediation) => {
                        self.observe(&remediation.fix);
                        processed += 1;
                    }
                    Err(_) => break,
                }
            }
            processed
        });
        StageHandle::new("knowledge", vec![handle])
    }
}
