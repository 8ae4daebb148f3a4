//! Log line parsing.
//!
//! Three line formats are accepted:
//! - plain text, optionally prefixed by a timestamp
//! - `key=value | key=value` pipe-delimited records
//! - one JSON object per line

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

static TS_PREFIX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^\[?(\d{4}-\d{2}-\d{2}[ T]\d{2}:\d{2}:\d{2}(?:[.,]\d+)?(?:Z|[+-]\d{2}:?\d{2})?)\]?\s*(.*)$",
    )
    .unwrap_or_else(|e| unreachable!("timestamp regex: {e}"))
});

static KV_KEY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_.\-]*$").unwrap_or_else(|e| unreachable!("key regex: {e}"))
});

const MESSAGE_KEYS: [&str; 3] = ["message", "msg", "error"];
const TIMESTAMP_KEYS: [&str; 3] = ["timestamp", "time", "ts"];
const LEVEL_KEYS: [&str; 2] = ["level", "severity"];
const STACK_KEYS: [&str; 3] = ["stack", "stack_trace", "traceback"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    KeyValue,
    Json,
}

/// A parsed log line.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub format: LogFormat,
    pub timestamp: Option<DateTime<Utc>>,
    pub level: Option<String>,
    pub message: String,
    pub stack_trace: Option<String>,
    /// Every field other than the message and stack trace.
    pub fields: BTreeMap<String, String>,
}

impl LogEntry {
    /// Text the detector matches against: `<level> <message>`.
    pub fn detection_text(&self) -> String {
        match &self.level {
            Some(level) => format!("{level} {}", self.message),
            None => self.message.clone(),
        }
    }

    /// `(file, line)` from the `file` and `line` fields, if both parse.
    pub fn location(&self) -> Option<(String, u32)> {
        let file = self.fields.get("file")?;
        let line = self.fields.get("line")?.trim().parse().ok()?;
        Some((file.clone(), line))
    }
}

/// Stateless line parser.
#[derive(Debug, Clone, Default)]
pub struct LogParser;

impl LogParser {
    pub fn new() -> Self {
        Self
    }

    /// Parse one line. Blank lines yield `None`.
    pub fn parse(&self, line: &str) -> Option<LogEntry> {
        let line = line.trim_end();
        if line.trim().is_empty() {
            return None;
        }
        let trimmed = line.trim_start();
        if trimmed.starts_with('{') {
            if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(trimmed) {
                return Some(parse_json(map));
            }
        }
        if let Some(fields) = split_key_values(trimmed) {
            return Some(from_fields(LogFormat::KeyValue, fields, trimmed));
        }
        Some(parse_text(line))
    }
}

fn parse_text(line: &str) -> LogEntry {
    let (timestamp, message) = match TS_PREFIX.captures(line) {
        Some(caps) => {
            let ts = caps.get(1).and_then(|m| parse_timestamp(m.as_str()));
            let rest = caps.get(2).map(|m| m.as_str()).unwrap_or("");
            (ts, rest.to_string())
        }
        None => (None, line.trim().to_string()),
    };
    LogEntry {
        format: LogFormat::Text,
        timestamp,
        level: None,
        message,
        stack_trace: None,
        fields: BTreeMap::new(),
    }
}

fn split_key_values(line: &str) -> Option<Vec<(String, String)>> {
    let mut out = Vec::new();
    for part in line.split('|') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let (k, v) = part.split_once('=')?;
        let k = k.trim();
        if !KV_KEY.is_match(k) {
            return None;
        }
        let v = v.trim().trim_matches('"');
        out.push((k.to_string(), v.to_string()));
    }
    if out.is_empty() {
        None
    } else {
        Some(out)
    }
}

fn parse_json(map: serde_json::Map<String, Value>) -> LogEntry {
    let fields = map
        .into_iter()
        .map(|(k, v)| {
            let s = match v {
                Value::String(s) => s,
                other => other.to_string(),
            };
            (k, s)
        })
        .collect();
    from_fields(LogFormat::Json, fields, "")
}

fn from_fields(format: LogFormat, fields: Vec<(String, String)>, raw: &str) -> LogEntry {
    let mut fields: BTreeMap<String, String> = fields.into_iter().collect();
    let message = take_first(&mut fields, &MESSAGE_KEYS).unwrap_or_else(|| raw.to_string());
    let stack_trace = take_first(&mut fields, &STACK_KEYS);
    let timestamp = first(&fields, &TIMESTAMP_KEYS).and_then(|s| parse_timestamp(&s));
    let level = first(&fields, &LEVEL_KEYS);
    LogEntry {
        format,
        timestamp,
        level,
        message,
        stack_trace,
        fields,
    }
}

fn take_first(fields: &mut BTreeMap<String, String>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| fields.remove(*k))
}

fn first(fields: &BTreeMap<String, String>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| fields.get(*k).cloned())
}

/// Parse RFC 3339 or `YYYY-MM-DD HH:MM:SS[.frac]` (taken as UTC).
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let s = raw.trim().replacen(' ', "T", 1).replace(',', ".");
    if let Ok(dt) = DateTime::parse_from_rfc3339(&s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_str(&s, "%Y-%m-%dT%H:%M:%S%.f%z") {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(&s, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};

    #[test]
    fn test_text_with_timestamp() {
        let e = LogParser::new()
            .parse("2024-03-21 10:00:00 ERROR boom")
            .unwrap();
        assert_eq!(e.format, LogFormat::Text);
        assert_eq!(e.message, "ERROR boom");
        let ts = e.timestamp.unwrap();
        assert_eq!((ts.year(), ts.month(), ts.day(), ts.hour()), (2024, 3, 21, 10));
    }

    #[test]
    fn test_text_without_timestamp() {
        let e = LogParser::new().parse("panic: runtime error").unwrap();
        assert!(e.timestamp.is_none());
        assert_eq!(e.detection_text(), "panic: runtime error");
    }

    #[test]
    fn test_bracketed_rfc3339_prefix() {
        let e = LogParser::new()
            .parse("[2024-03-21T10:00:00.123+02:00] worker died")
            .unwrap();
        assert_eq!(e.timestamp.unwrap().hour(), 8);
        assert_eq!(e.message, "worker died");
    }

    #[test]
    fn test_key_value_pipe() {
        let e = LogParser::new()
            .parse("ts=2024-03-21T10:00:00Z | level=ERROR | msg=\"db down\" | file=db.go | line=42")
            .unwrap();
        assert_eq!(e.format, LogFormat::KeyValue);
        assert_eq!(e.message, "db down");
        assert_eq!(e.level.as_deref(), Some("ERROR"));
        assert_eq!(e.detection_text(), "ERROR db down");
        assert_eq!(e.location(), Some(("db.go".to_string(), 42)));
        assert!(e.timestamp.is_some());
        assert!(!e.fields.contains_key("msg"));
    }

    #[test]
    fn test_json_object() {
        let line = r#"{"level":"error","message":"nil map","file":"main.go","line":12,"stack":"main.main()\n\tmain.go:12"}"#;
        let e = LogParser::new().parse(line).unwrap();
        assert_eq!(e.format, LogFormat::Json);
        assert_eq!(e.message, "nil map");
        assert_eq!(e.location(), Some(("main.go".to_string(), 12)));
        assert!(e.stack_trace.unwrap().contains("main.go:12"));
        assert_eq!(e.fields.get("level").map(String::as_str), Some("error"));
    }

    #[test]
    fn test_broken_json_falls_back_to_text() {
        let e = LogParser::new().parse("{not json ERROR").unwrap();
        assert_eq!(e.format, LogFormat::Text);
    }

    #[test]
    fn test_blank_line() {
        assert!(LogParser::new().parse("   ").is_none());
    }
}
