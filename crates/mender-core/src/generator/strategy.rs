//! Strategy port and registry.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::config::{ConfigError, ConfigResult, StrategyConfig};
use crate::domain::{CodeChange, ErrorEvent};

/// Changes a strategy proposes for one event.
#[derive(Debug, Clone, PartialEq)]
pub struct Proposal {
    pub changes: Vec<CodeChange>,
    pub confidence: f64,
    pub description: String,
}

/// A repair strategy.
///
/// Strategies only propose changes; they never write to the working tree.
#[async_trait]
pub trait FixStrategy: Send + Sync {
    /// Registry key, e.g. `null_check`.
    fn tag(&self) -> &str;

    /// Default ordering weight; higher runs first.
    fn priority(&self) -> u32;

    /// Propose a fix for `event`, or decline with `None`. Work past
    /// `deadline` is wasted: the caller has already moved on.
    async fn propose(&self, event: &ErrorEvent, deadline: Instant) -> Option<Proposal>;
}

#[derive(Clone)]
struct Entry {
    strategy: Arc<dyn FixStrategy>,
    priority: u32,
}

/// Strategies keyed by tag with effective priorities.
#[derive(Clone, Default)]
pub struct StrategyRegistry {
    entries: BTreeMap<String, Entry>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every built-in strategy.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for strategy in super::builtin::all() {
            registry.register(strategy);
        }
        registry
    }

    /// Add or replace the strategy registered under its tag.
    pub fn register(&mut self, strategy: Arc<dyn FixStrategy>) {
        let priority = strategy.priority();
        self.entries
            .insert(strategy.tag().to_string(), Entry { strategy, priority });
    }

    /// Restrict to the configured strategies and apply priority overrides.
    /// An empty list leaves every registered strategy enabled.
    pub fn configure(&mut self, configured: &[StrategyConfig]) -> ConfigResult<()> {
        if configured.is_empty() {
            return Ok(());
        }
        for c in configured {
            if !self.entries.contains_key(&c.kind) {
                return Err(ConfigError::Invalid(format!(
                    "unknown fix strategy {:?}",
                    c.kind
                )));
            }
        }
        self.entries
            .retain(|tag, _| configured.iter().any(|c| &c.kind == tag));
        for c in configured {
            if let (Some(p), Some(entry)) = (c.priority, self.entries.get_mut(&c.kind)) {
                entry.priority = p;
            }
        }
        Ok(())
    }

    pub fn get(&self, tag: &str) -> Option<Arc<dyn FixStrategy>> {
        self.entries.get(tag).map(|e| Arc::clone(&e.strategy))
    }

    pub fn priority_of(&self, tag: &str) -> Option<u32> {
        self.entries.get(tag).map(|e| e.priority)
    }

    /// Strategies by descending priority; ties by tag.
    pub fn ordered(&self) -> Vec<Arc<dyn FixStrategy>> {
        let mut entries: Vec<(&String, &Entry)> = self.entries.iter().collect();
        entries.sort_by(|a, b| b.1.priority.cmp(&a.1.priority).then_with(|| a.0.cmp(b.0)));
        entries
            .into_iter()
            .map(|(_, e)| Arc::clone(&e.strategy))
            .collect()
    }

    pub fn tags(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(&'static str, u32);

    #[async_trait]
    impl FixStrategy for Fixed {
        fn tag(&self) -> &str {
            self.0
        }
        fn priority(&self) -> u32 {
            self.1
        }
        async fn propose(&self, _event: &ErrorEvent, _deadline: Instant) -> Option<Proposal> {
            None
        }
    }

    fn tags(list: Vec<Arc<dyn FixStrategy>>) -> Vec<String> {
        list.iter().map(|s| s.tag().to_string()).collect()
    }

    #[test]
    fn test_builtin_order() {
        let r = StrategyRegistry::with_builtins();
        assert_eq!(
            tags(r.ordered()),
            vec![
                "null_check",
                "resource_cleanup",
                "exception_handling",
                "condition_inversion",
                "type_conversion",
                "code_refactoring"
            ]
        );
    }

    #[test]
    fn test_configure_filters_and_overrides() {
        let mut r = StrategyRegistry::with_builtins();
        r.configure(&[
            StrategyConfig {
                kind: "code_refactoring".to_string(),
                priority: Some(100),
            },
            StrategyConfig {
                kind: "null_check".to_string(),
                priority: None,
            },
        ])
        .unwrap();
        assert_eq!(tags(r.ordered()), vec!["code_refactoring", "null_check"]);
        assert_eq!(r.priority_of("null_check"), Some(90));
    }

    #[test]
    fn test_configure_unknown_tag() {
        let mut r = StrategyRegistry::with_builtins();
        let err = r
            .configure(&[StrategyConfig {
                kind: "magic".to_string(),
                priority: None,
            }])
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
        assert_eq!(r.len(), 6);
    }

    #[test]
    fn test_register_replaces_by_tag() {
        let mut r = StrategyRegistry::new();
        r.register(Arc::new(Fixed("a", 1)));
        r.register(Arc::new(Fixed("b", 5)));
        r.register(Arc::new(Fixed("a", 10)));
        assert_eq!(r.len(), 2);
        assert_eq!(tags(r.ordered()), vec!["a", "b"]);
    }
}
