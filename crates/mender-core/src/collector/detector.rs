//! Ordered regex detection of error entries.

use regex::Regex;

use super::parser::LogEntry;
use crate::config::PatternConfig;
use crate::domain::{ErrorEvent, PatternError, Severity};

/// Longest pattern source accepted by [`ErrorDetector::add_pattern`].
pub const MAX_PATTERN_LEN: usize = 512;

#[derive(Debug, Clone)]
struct CompiledPattern {
    source: String,
    regex: Regex,
    severity: Severity,
}

/// Ordered set of `(regex, severity)` pairs. The first match wins.
#[derive(Debug, Clone, Default)]
pub struct ErrorDetector {
    patterns: Vec<CompiledPattern>,
}

impl ErrorDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Detector with a general-purpose pattern set.
    pub fn with_defaults() -> Self {
        let mut d = Self::new();
        let defaults = [
            (r"(?i)\b(fatal|panic(ked)?)\b", Severity::Critical),
            (r"(?i)\b(error|exception|traceback)\b", Severity::High),
            (r"(?i)\b(fail(ed|ure)?|timed? ?out)\b", Severity::Medium),
        ];
        for (pattern, severity) in defaults {
            if let Err(e) = d.add(pattern, severity) {
                tracing::error!(pattern, error = %e, "default pattern rejected");
            }
        }
        d
    }

    /// Build from configured `{pattern, severity}` entries, in order.
    pub fn from_config(entries: &[PatternConfig]) -> Result<Self, PatternError> {
        let mut d = Self::new();
        for entry in entries {
            d.add_pattern(&entry.pattern, &entry.severity)?;
        }
        Ok(d)
    }

    /// Default set extended with configured entries; entries already in
    /// the default set are skipped.
    pub fn with_defaults_and(entries: &[PatternConfig]) -> Result<Self, PatternError> {
        let mut d = Self::with_defaults();
        for entry in entries {
            match d.add_pattern(&entry.pattern, &entry.severity) {
                Ok(()) | Err(PatternError::DuplicatePattern(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(d)
    }

    /// Validate and append a pattern. On error the detector is unchanged.
    pub fn add_pattern(&mut self, pattern: &str, severity: &str) -> Result<(), PatternError> {
        check_shape(pattern)?;
        let severity: Severity = severity.parse()?;
        self.add(pattern, severity)
    }

    /// Typed variant of [`add_pattern`](Self::add_pattern).
    pub fn add(&mut self, pattern: &str, severity: Severity) -> Result<(), PatternError> {
        check_shape(pattern)?;
        if self.patterns.iter().any(|p| p.source == pattern) {
            return Err(PatternError::DuplicatePattern(pattern.to_string()));
        }
        let regex = Regex::new(pattern).map_err(|e| PatternError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;
        self.patterns.push(CompiledPattern {
            source: pattern.to_string(),
            regex,
            severity,
        });
        Ok(())
    }

    pub fn remove_pattern(&mut self, pattern: &str) -> Result<(), PatternError> {
        let idx = self
            .patterns
            .iter()
            .position(|p| p.source == pattern)
            .ok_or_else(|| PatternError::PatternNotFound(pattern.to_string()))?;
        self.patterns.remove(idx);
        Ok(())
    }

    pub fn patterns(&self) -> Vec<(String, Severity)> {
        self.patterns
            .iter()
            .map(|p| (p.source.clone(), p.severity))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// First matching pattern and its severity.
    pub fn classify(&self, text: &str) -> Option<(&str, Severity)> {
        self.patterns
            .iter()
            .find(|p| p.regex.is_match(text))
            .map(|p| (p.source.as_str(), p.severity))
    }

    /// Turn a matching entry into an [`ErrorEvent`] read from `source`.
    pub fn detect(&self, entry: &LogEntry, source: &str) -> Option<ErrorEvent> {
        let (pattern, severity) = self.classify(&entry.detection_text())?;
        let mut event = ErrorEvent::new(entry.message.clone(), severity, source);
        event.matched_pattern = Some(pattern.to_string());
        if let Some(ts) = entry.timestamp {
            event.timestamp = ts;
        }
        if let Some((file, line)) = entry.location() {
            event = event.with_location(file, line);
        }
        event.stack_trace = entry.stack_trace.clone();
        event.context = entry.fields.clone();
        Some(event)
    }
}

fn check_shape(pattern: &str) -> Result<(), PatternError> {
    if pattern.is_empty() {
        return Err(PatternError::EmptyPattern);
    }
    let len = pattern.chars().count();
    if len > MAX_PATTERN_LEN {
        return Err(PatternError::PatternTooLong {
            len,
            max: MAX_PATTERN_LEN,
        });
    }
    Ok(())
}
