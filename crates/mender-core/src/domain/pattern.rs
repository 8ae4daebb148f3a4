//! Learned (failure class, strategy) associations.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::fix::unit_interval;

/// Weight kept from the previous confidence on each observation.
pub const CONFIDENCE_DECAY: f64 = 0.8;

/// A learned association between an error signature and a strategy.
///
/// Two patterns are the same pattern when their `(error_signature,
/// strategy)` pair is equal; `id` is only the storage key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorFixPattern {
    pub id: Uuid,
    pub error_signature: String,
    pub strategy: String,
    pub confidence: f64,
    pub success_rate: f64,
    pub usage_count: u64,
    pub last_used: DateTime<Utc>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl ErrorFixPattern {
    /// Pattern created by the first terminal fix of a new pair.
    pub fn first_observation(
        error_signature: impl Into<String>,
        strategy: impl Into<String>,
        successful: bool,
        fix_confidence: f64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            error_signature: error_signature.into(),
            strategy: strategy.into(),
            confidence: unit_interval(fix_confidence),
            success_rate: if successful { 1.0 } else { 0.0 },
            usage_count: 1,
            last_used: now,
            metadata: BTreeMap::new(),
        }
    }

    /// Fold one more terminal outcome into the running statistics.
    pub fn record_outcome(&mut self, successful: bool, fix_confidence: f64, now: DateTime<Utc>) {
        self.usage_count = self.usage_count.saturating_add(1);
        let n = self.usage_count as f64;
        let hit = if successful { 1.0 } else { 0.0 };
        self.success_rate = unit_interval((unit_interval(self.success_rate) * (n - 1.0) + hit) / n);
        self.confidence = unit_interval(
            CONFIDENCE_DECAY * unit_interval(self.confidence)
                + (1.0 - CONFIDENCE_DECAY) * unit_interval(fix_confidence),
        );
        self.last_used = now;
    }

    /// Pruning score: confidence x success_rate x usage_count.
    pub fn score(&self) -> f64 {
        self.confidence * self.success_rate * self.usage_count as f64
    }

    /// Whether `self` and `other` describe the same (class, strategy) pair.
    pub fn same_pair(&self, other: &ErrorFixPattern) -> bool {
        self.error_signature == other.error_signature && self.strategy == other.strategy
    }
}

impl PartialEq for ErrorFixPattern {
    fn eq(&self, other: &Self) -> bool {
        self.same_pair(other)
    }
}
