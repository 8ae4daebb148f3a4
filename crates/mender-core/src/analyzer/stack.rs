//! Stack trace normalisation.
//!
//! Recognises Python tracebacks, JVM and Node.js `at` frames, Go panic
//! traces and Rust backtraces. Frames are returned innermost first; Python
//! prints outermost first, so its frames are reversed.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::domain::StackFrame;

fn re(pattern: &str) -> Regex {
    Regex::new(pattern).unwrap_or_else(|e| unreachable!("stack regex {pattern}: {e}"))
}

static PYTHON: Lazy<Regex> = Lazy::new(|| re(r#"^\s*File "([^"]+)", line (\d+)(?:, in (.+))?$"#));
static JAVA: Lazy<Regex> =
    Lazy::new(|| re(r"^\s*at ([\w$.<>]+)\(([^:()]+)(?::(\d+))?\)\s*$"));
static JS: Lazy<Regex> =
    Lazy::new(|| re(r"^\s*at (?:(.+?) \()?([^()\s]+?):(\d+):(\d+)\)?\s*$"));
static GO_LOC: Lazy<Regex> = Lazy::new(|| re(r"^\s+(\S+\.go):(\d+)(?:\s+\+0x[0-9a-fA-F]+)?\s*$"));
static RUST_FN: Lazy<Regex> = Lazy::new(|| re(r"^\s*\d+:\s+(\S.*?)(?:::h[0-9a-f]{16})?\s*$"));
static RUST_AT: Lazy<Regex> = Lazy::new(|| re(r"^\s+at (\S+?):(\d+)(?::\d+)?\s*$"));
static GO_CREATED: Lazy<Regex> = Lazy::new(|| re(r"^created by (\S+?)(?: in goroutine \d+)?$"));

/// Parse `trace` into frames, innermost first.
pub fn parse_stack_trace(trace: &str) -> Vec<StackFrame> {
    let mut frames = Vec::new();
    let mut python = Vec::new();
    let mut pending_rust: Option<String> = None;
    let mut previous = "";

    for line in trace.lines() {
        if let Some(c) = PYTHON.captures(line) {
            let function = c.get(3).map_or("<module>", |m| m.as_str().trim());
            python.push(StackFrame::new(function, &c[1], c[2].parse().ok()));
        } else if let (Some(func), Some(c)) = (pending_rust.as_ref(), RUST_AT.captures(line)) {
            frames.push(rust_frame(func, &c[1], c[2].parse().ok()));
            pending_rust = None;
        } else if let Some(c) = JAVA.captures(line) {
            frames.push(java_frame(&c[1], &c[2], c.get(3).and_then(|m| m.as_str().parse().ok())));
        } else if let Some(c) = JS.captures(line) {
            let function = c.get(1).map_or("<anonymous>", |m| m.as_str());
            frames.push(StackFrame::new(function, &c[2], c[3].parse().ok()));
        } else if let Some(c) = GO_LOC.captures(line) {
            if let Some(function) = go_function(previous) {
                frames.push(go_frame(&function, &c[1], c[2].parse().ok()));
            }
        } else if let Some(c) = RUST_FN.captures(line) {
            if let Some(func) = pending_rust.take() {
                frames.push(rust_frame(&func, "", None));
            }
            pending_rust = Some(c[1].to_string());
        }
        if !line.trim().is_empty() {
            previous = line;
        }
    }
    if let Some(func) = pending_rust {
        frames.push(rust_frame(&func, "", None));
    }
    python.reverse();
    python.extend(frames);
    python
}

fn java_frame(qualified: &str, file: &str, line: Option<u32>) -> StackFrame {
    // com.example.Service.handle -> package com.example, function Service.handle
    let parts: Vec<&str> = qualified.split('.').collect();
    if parts.len() <= 2 {
        return StackFrame::new(qualified, file, line);
    }
    let split = parts.len() - 2;
    let mut frame = StackFrame::new(parts[split..].join("."), file, line);
    frame.package = Some(parts[..split].join("."));
    frame
}

fn go_function(line: &str) -> Option<String> {
    let line = line.trim();
    if line.is_empty() || line.starts_with("goroutine ") {
        return None;
    }
    if let Some(c) = GO_CREATED.captures(line) {
        return Some(c[1].to_string());
    }
    if !line.ends_with(')') {
        return None;
    }
    line.rfind('(').map(|idx| line[..idx].to_string())
}

fn go_frame(function: &str, file: &str, line: Option<u32>) -> StackFrame {
    let mut frame = StackFrame::new(function, file, line);
    // github.com/acme/svc/pkg.(*T).Method -> package github.com/acme/svc/pkg
    let last_slash = function.rfind('/').map_or(0, |i| i + 1);
    if let Some(dot) = function[last_slash..].find('.') {
        frame.package = Some(function[..last_slash + dot].to_string());
    }
    frame
}

fn rust_frame(function: &str, file: &str, line: Option<u32>) -> StackFrame {
    let mut frame = StackFrame::new(function, file, line);
    if let Some(idx) = function.find("::") {
        frame.package = Some(function[..idx].trim_start_matches('<').to_string());
    }
    frame
}
