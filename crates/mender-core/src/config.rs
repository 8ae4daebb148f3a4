//! Pipeline configuration.
//!
//! `MenderConfig` is loaded from YAML and handed to stage constructors.
//! Every section is defaulted, so an empty document is a valid (if not very
//! useful) configuration. Durations are written as `250ms`, `30s`, `5m`,
//! `2h`, `7d` or a bare number of seconds.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::Severity;

/// Strategy tags shipped with the generator.
pub const BUILTIN_STRATEGIES: [&str; 6] = [
    "null_check",
    "exception_handling",
    "resource_cleanup",
    "type_conversion",
    "condition_inversion",
    "code_refactoring",
];

/// Errors produced while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("invalid config: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MenderConfig {
    pub collector: CollectorConfig,
    pub analyzer: AnalyzerConfig,
    pub generator: GeneratorConfig,
    pub deployment: DeploymentConfig,
    pub knowledge: KnowledgeConfig,
    pub pipeline: PipelineConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CollectorConfig {
    /// Glob patterns of log files to tail.
    pub log_paths: Vec<String>,
    #[serde(with = "duration_serde")]
    pub polling_interval: Duration,
    /// Capacity of the collector output queue.
    pub buffer_size: usize,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            log_paths: vec!["logs/*.log".to_string()],
            polling_interval: Duration::from_secs(1),
            buffer_size: 1000,
        }
    }
}

/// One `{pattern, severity}` detector entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PatternConfig {
    pub pattern: String,
    pub severity: String,
}

impl PatternConfig {
    pub fn new(pattern: impl Into<String>, severity: Severity) -> Self {
        Self {
            pattern: pattern.into(),
            severity: severity.as_str().to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AnalyzerConfig {
    /// Ordered classification patterns; first match wins.
    pub error_patterns: Vec<PatternConfig>,
    pub max_stack_depth: usize,
    pub context_lines: usize,
    pub workers: usize,
    /// Root that relative source paths are resolved against.
    pub source_root: PathBuf,
    /// Frames folded into the fingerprint.
    pub top_frames: usize,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            error_patterns: Vec::new(),
            max_stack_depth: 50,
            context_lines: 5,
            workers: 3,
            source_root: PathBuf::from("."),
            top_frames: crate::domain::DEFAULT_TOP_FRAMES,
        }
    }
}

/// One `{type, priority}` strategy entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StrategyConfig {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub priority: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GeneratorConfig {
    /// Enabled strategies; empty enables every built-in.
    pub fix_strategies: Vec<StrategyConfig>,
    pub max_fix_attempts: u32,
    /// Per-attempt synthesis deadline.
    #[serde(with = "duration_serde")]
    pub timeout: Duration,
    pub workers: usize,
    /// Minimum pattern confidence for knowledge to reorder strategies.
    pub bias_confidence_threshold: f64,
    /// Delay before the first retry of an exhausted event; doubles per retry.
    #[serde(with = "duration_serde")]
    pub retry_backoff: Duration,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            fix_strategies: Vec::new(),
            max_fix_attempts: 3,
            timeout: Duration::from_secs(30),
            workers: 3,
            bias_confidence_threshold: 0.7,
            retry_backoff: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DeploymentConfig {
    /// Hand fixes to deployment (`direct` mode) instead of publishing suggestions.
    pub auto_deploy: bool,
    pub require_human_approval: bool,
    #[serde(with = "duration_serde")]
    pub sandbox_timeout: Duration,
    pub rollback_enabled: bool,
    pub max_concurrent_deployments: usize,
    pub worktree_root: PathBuf,
    pub test_command: Option<String>,
    /// Falls back to `test_command`.
    pub verify_command: Option<String>,
    /// Run in the working tree after a rollback; failure halts deployment.
    pub rollback_validate_command: Option<String>,
    #[serde(with = "duration_serde")]
    pub approval_timeout: Duration,
    /// Fixes below this confidence are suggested even in auto-deploy mode.
    pub min_deploy_confidence: f64,
    pub max_deferred_per_fingerprint: usize,
}

impl DeploymentConfig {
    pub fn effective_verify_command(&self) -> Option<&str> {
        self.verify_command
            .as_deref()
            .or(self.test_command.as_deref())
    }
}

impl Default for DeploymentConfig {
    fn default() -> Self {
        Self {
            auto_deploy: false,
            require_human_approval: false,
            sandbox_timeout: Duration::from_secs(300),
            rollback_enabled: true,
            max_concurrent_deployments: 1,
            worktree_root: PathBuf::from("."),
            test_command: None,
            verify_command: None,
            rollback_validate_command: None,
            approval_timeout: Duration::from_secs(300),
            min_deploy_confidence: 0.5,
            max_deferred_per_fingerprint: 8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct KnowledgeConfig {
    pub storage_path: PathBuf,
    pub learning_enabled: bool,
    pub max_entries: usize,
    #[serde(with = "duration_serde")]
    pub cleanup_interval: Duration,
    #[serde(with = "duration_serde")]
    pub retention_period: Duration,
    /// Minimum Jaccard similarity for `lookup` to return a pattern.
    pub min_similarity: f64,
}

impl Default for KnowledgeConfig {
    fn default() -> Self {
        Self {
            storage_path: PathBuf::from("./data"),
            learning_enabled: true,
            max_entries: 10_000,
            cleanup_interval: Duration::from_secs(3600),
            retention_period: Duration::from_secs(30 * 86_400),
            min_similarity: 0.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    /// Capacity of every inter-stage queue except the collector output.
    pub queue_capacity: usize,
    #[serde(with = "duration_serde")]
    pub shutdown_grace: Duration,
    /// Items a worker may still drain from its input after cancellation.
    pub drain_limit: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 100,
            shutdown_grace: Duration::from_secs(30),
            drain_limit: 64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Loading and validation
// ---------------------------------------------------------------------------

impl MenderConfig {
    pub fn from_yaml_str(yaml: &str) -> ConfigResult<Self> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(yaml).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&raw)
    }

    /// Load and validate in one step.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let config = Self::from_file(path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_yaml(&self) -> ConfigResult<String> {
        serde_yaml::to_string(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Reject configurations no stage could run with.
    pub fn validate(&self) -> ConfigResult<()> {
        let c = &self.collector;
        if c.log_paths.is_empty() {
            return invalid("collector.log_paths must not be empty");
        }
        if let Some(bad) = c.log_paths.iter().find(|p| p.trim().is_empty()) {
            return invalid(format!("collector.log_paths contains an empty glob: {bad:?}"));
        }
        if c.polling_interval.is_zero() {
            return invalid("collector.polling_interval must be positive");
        }
        if c.buffer_size == 0 {
            return invalid("collector.buffer_size must be positive");
        }

        let a = &self.analyzer;
        for entry in &a.error_patterns {
            if entry.pattern.is_empty() {
                return invalid("analyzer.error_patterns contains an empty pattern");
            }
            if let Err(e) = entry.severity.parse::<Severity>() {
                return invalid(format!("analyzer.error_patterns: {e}"));
            }
        }
        if a.workers == 0 {
            return invalid("analyzer.workers must be positive");
        }
        if a.max_stack_depth == 0 {
            return invalid("analyzer.max_stack_depth must be positive");
        }

        let g = &self.generator;
        for entry in &g.fix_strategies {
            if !BUILTIN_STRATEGIES.contains(&entry.kind.as_str()) {
                return invalid(format!("generator.fix_strategies: unknown type {:?}", entry.kind));
            }
        }
        if g.workers == 0 {
            return invalid("generator.workers must be positive");
        }
        if g.timeout.is_zero() {
            return invalid("generator.timeout must be positive");
        }
        check_unit("generator.bias_confidence_threshold", g.bias_confidence_threshold)?;

        let d = &self.deployment;
        if d.sandbox_timeout.is_zero() {
            return invalid("deployment.sandbox_timeout must be positive");
        }
        if d.max_concurrent_deployments == 0 {
            return invalid("deployment.max_concurrent_deployments must be positive");
        }
        if d.approval_timeout.is_zero() {
            return invalid("deployment.approval_timeout must be positive");
        }
        if d.max_deferred_per_fingerprint == 0 {
            return invalid("deployment.max_deferred_per_fingerprint must be positive");
        }
        check_unit("deployment.min_deploy_confidence", d.min_deploy_confidence)?;

        let k = &self.knowledge;
        if k.max_entries == 0 {
            return invalid("knowledge.max_entries must be positive");
        }
        if k.cleanup_interval.is_zero() {
            return invalid("knowledge.cleanup_interval must be positive");
        }
        check_unit("knowledge.min_similarity", k.min_similarity)?;

        if self.pipeline.queue_capacity == 0 {
            return invalid("pipeline.queue_capacity must be positive");
        }
        Ok(())
    }
}

fn invalid(msg: impl Into<String>) -> ConfigResult<()> {
    Err(ConfigError::Invalid(msg.into()))
}

fn check_unit(name: &str, value: f64) -> ConfigResult<()> {
    if !(0.0..=1.0).contains(&value) {
        return invalid(format!("{name} must be within [0, 1], got {value}"));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Durations
// ---------------------------------------------------------------------------

/// Parse `250ms`, `30s`, `5m`, `2h`, `7d` or a bare number of seconds.
pub fn parse_duration(raw: &str) -> Result<Duration, String> {
    let s = raw.trim();
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(s.len());
    let (digits, unit) = s.split_at(split);
    if digits.is_empty() {
        return Err(format!("invalid duration {raw:?}"));
    }
    let n: u64 = digits
        .parse()
        .map_err(|_| format!("invalid duration {raw:?}"))?;
    let secs = |mult: u64| {
        n.checked_mul(mult)
            .map(Duration::from_secs)
            .ok_or_else(|| format!("duration {raw:?} overflows"))
    };
    match unit.trim() {
        "ms" => Ok(Duration::from_millis(n)),
        "" | "s" => secs(1),
        "m" => secs(60),
        "h" => secs(3600),
        "d" => secs(86_400),
        other => Err(format!("unknown duration unit {other:?} in {raw:?}")),
    }
}

/// Render a duration in the largest unit that represents it exactly.
pub fn format_duration(d: Duration) -> String {
    if d.subsec_nanos() != 0 {
        return format!("{}ms", d.as_millis());
    }
    let secs = d.as_secs();
    if secs == 0 {
        return "0s".to_string();
    }
    for (unit, size) in [("d", 86_400), ("h", 3600), ("m", 60)] {
        if secs % size == 0 {
            return format!("{}{unit}", secs / size);
        }
    }
    format!("{secs}s")
}

pub(crate) mod duration_serde {
    use std::time::Duration;

    use serde::{de, Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Secs(u64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        match Raw::deserialize(d)? {
            Raw::Secs(n) => Ok(Duration::from_secs(n)),
            Raw::Text(s) => super::parse_duration(&s).map_err(de::Error::custom),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        MenderConfig::default().validate().unwrap();
    }

    #[test]
    fn test_empty_document_is_default() {
        assert_eq!(MenderConfig::from_yaml_str("").unwrap(), MenderConfig::default());
    }

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_duration("7d").unwrap(), Duration::from_secs(604_800));
        assert_eq!(parse_duration("12").unwrap(), Duration::from_secs(12));
        assert!(parse_duration("-1s").is_err());
        assert!(parse_duration("3w").is_err());
        assert!(parse_duration("").is_err());
    }

    #[test]
    fn test_format_duration_round_trips_notation() {
        for s in ["250ms", "30s", "5m", "2h", "7d", "0s", "90s"] {
            assert_eq!(format_duration(parse_duration(s).unwrap()), s);
        }
    }

    #[test]
    fn test_yaml_sections() {
        let yaml = r#"
collector:
  log_paths: ["/var/log/app/*.log"]
  polling_interval: 250ms
  buffer_size: 2
analyzer:
  error_patterns:
    - { pattern: "ERROR", severity: high }
    - { pattern: "panic", severity: Critical }
  context_lines: 3
generator:
  fix_strategies:
    - { type: resource_cleanup, priority: 100 }
  timeout: 10
  retry_backoff: 500ms
deployment:
  auto_deploy: true
  sandbox_timeout: 2m
  test_command: "true"
knowledge:
  retention_period: 7d
"#;
        let cfg = MenderConfig::from_yaml_str(yaml).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.collector.polling_interval, Duration::from_millis(250));
        assert_eq!(cfg.collector.buffer_size, 2);
        assert_eq!(cfg.analyzer.error_patterns.len(), 2);
        assert_eq!(cfg.analyzer.max_stack_depth, 50);
        assert_eq!(cfg.generator.fix_strategies[0].priority, Some(100));
        assert_eq!(cfg.generator.timeout, Duration::from_secs(10));
        assert_eq!(cfg.generator.retry_backoff, Duration::from_millis(500));
        assert_eq!(cfg.deployment.effective_verify_command(), Some("true"));
        assert_eq!(cfg.knowledge.retention_period, Duration::from_secs(604_800));
    }

    #[test]
    fn test_validate_rejects_zero_polling_and_buffer() {
        let mut cfg = MenderConfig::default();
        cfg.collector.polling_interval = Duration::ZERO;
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));

        let mut cfg = MenderConfig::default();
        cfg.collector.buffer_size = 0;
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_negative_values_fail_to_parse() {
        let yaml = "collector:\n  buffer_size: -1\n";
        assert!(matches!(
            MenderConfig::from_yaml_str(yaml),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_validate_rejects_unknown_strategy_and_severity() {
        let mut cfg = MenderConfig::default();
        cfg.generator.fix_strategies.push(StrategyConfig {
            kind: "magic".to_string(),
            priority: None,
        });
        assert!(cfg.validate().is_err());

        let mut cfg = MenderConfig::default();
        cfg.analyzer.error_patterns.push(PatternConfig {
            pattern: "ERROR".to_string(),
            severity: "urgent".to_string(),
        });
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_threshold_out_of_range() {
        let mut cfg = MenderConfig::default();
        cfg.knowledge.min_similarity = 1.5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_yaml_round_trip() {
        let cfg = MenderConfig::default();
        let yaml = cfg.to_yaml().unwrap();
        assert_eq!(MenderConfig::from_yaml_str(&yaml).unwrap(), cfg);
    }
}
