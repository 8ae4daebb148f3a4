//! Observed error events and their supporting value types.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::PatternError;

/// Severity of an observed failure, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = PatternError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            _ => Err(PatternError::InvalidSeverity(s.to_string())),
        }
    }
}

/// One frame of a normalised stack trace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StackFrame {
    pub function: String,
    pub file: String,
    pub line: Option<u32>,
    pub package: Option<String>,
}

impl StackFrame {
    pub fn new(function: impl Into<String>, file: impl Into<String>, line: Option<u32>) -> Self {
        Self {
            function: function.into(),
            file: file.into(),
            line,
            package: None,
        }
    }

    /// `function@file`, the tuple used for fingerprints and similarity.
    pub fn key(&self) -> String {
        format!("{}@{}", self.function, self.file)
    }
}

/// A `(file, line)` pair pointing at the failing source line.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceLocation {
    pub file: String,
    pub line: u32,
}

impl SourceLocation {
    pub fn new(file: impl Into<String>, line: u32) -> Self {
        Self {
            file: file.into(),
            line,
        }
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

/// Source lines captured around a failing line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeSnippet {
    pub file: String,
    /// 1-based line number of `lines[0]`.
    pub start_line: u32,
    /// 1-based line number of the failing line.
    pub target_line: u32,
    pub lines: Vec<String>,
}

impl CodeSnippet {
    /// Text of the failing line, if it falls inside the snippet.
    pub fn target_text(&self) -> Option<&str> {
        let idx = self.target_line.checked_sub(self.start_line)? as usize;
        self.lines.get(idx).map(String::as_str)
    }

    /// Numbered listing with the failing line marked by `>`.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (i, text) in self.lines.iter().enumerate() {
            let lineno = self.start_line + i as u32;
            let marker = if lineno == self.target_line { '>' } else { ' ' };
            out.push_str(&format!("{marker} {lineno:>5} | {text}\n"));
        }
        out
    }
}

/// An observed error extracted from a log stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub id: Uuid,
    /// Stable class hash, set by the analyzer.
    pub fingerprint: Option<String>,
    /// Knowledge-base class key, set by the analyzer with the same frame
    /// window as `fingerprint`.
    #[serde(default)]
    pub signature: Option<String>,
    pub message: String,
    /// Detector pattern that matched this entry.
    pub matched_pattern: Option<String>,
    pub severity: Severity,
    /// Log path the entry was read from.
    pub source: String,
    pub timestamp: DateTime<Utc>,
    pub stack_trace: Option<String>,
    #[serde(default)]
    pub frames: Vec<StackFrame>,
    pub location: Option<SourceLocation>,
    pub snippet: Option<CodeSnippet>,
    #[serde(default)]
    pub context: BTreeMap<String, String>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    pub retry_count: u32,
    pub last_retry: Option<DateTime<Utc>>,
    pub fixed: bool,
    pub fix_id: Option<Uuid>,
}

impl ErrorEvent {
    pub fn new(message: impl Into<String>, severity: Severity, source: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            fingerprint: None,
            signature: None,
            message: message.into(),
            matched_pattern: None,
            severity,
            source: source.into(),
            timestamp: Utc::now(),
            stack_trace: None,
            frames: Vec::new(),
            location: None,
            snippet: None,
            context: BTreeMap::new(),
            environment: capture_environment(),
            retry_count: 0,
            last_retry: None,
            fixed: false,
            fix_id: None,
        }
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_location(mut self, file: impl Into<String>, line: u32) -> Self {
        self.location = Some(SourceLocation::new(file, line));
        self
    }

    pub fn with_stack_trace(mut self, trace: impl Into<String>) -> Self {
        self.stack_trace = Some(trace.into());
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Count one more failed remediation round.
    pub fn record_retry(&mut self, now: DateTime<Utc>) {
        self.retry_count = self.retry_count.saturating_add(1);
        self.last_retry = Some(now);
    }

    /// Mark the event as fixed by `fix_id`. Returns `false` if it already was.
    pub fn mark_fixed(&mut self, fix_id: Uuid) -> bool {
        if self.fixed {
            return false;
        }
        self.fixed = true;
        self.fix_id = Some(fix_id);
        true
    }
}

/// Snapshot of the runtime the event was observed in.
pub fn capture_environment() -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    env.insert("os".to_string(), std::env::consts::OS.to_string());
    env.insert("arch".to_string(), std::env::consts::ARCH.to_string());
    env.insert("pid".to_string(), std::process::id().to_string());
    if let Ok(host) = std::env::var("HOSTNAME") {
        env.insert("host".to_string(), host);
    }
    env
}
