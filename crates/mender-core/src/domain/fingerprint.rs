//! Stable failure-class identity.
//!
//! The fingerprint is SHA-256 over the normalised message, the top-K
//! `(function, file)` frame pairs and `file:line`, truncated to 128 bits.
//! Two events with the same fingerprint are recurrences of one class.

use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};

use super::event::ErrorEvent;

/// Frames folded into fingerprints and signatures when not configured.
pub const DEFAULT_TOP_FRAMES: usize = 5;

static UUID_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}\b")
        .unwrap_or_else(|e| unreachable!("uuid regex: {e}"))
});
static HEX_ADDR_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b0x[0-9a-f]+\b").unwrap_or_else(|e| unreachable!("hex regex: {e}"))
});
static NUMBER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\d+").unwrap_or_else(|e| unreachable!("number regex: {e}")));
static SPACE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s+").unwrap_or_else(|e| unreachable!("space regex: {e}")));

/// Lowercase and strip volatile tokens (UUIDs, addresses, numbers).
pub fn normalize_message(message: &str) -> String {
    let lowered = message.to_lowercase();
    let s = UUID_RE.replace_all(&lowered, "<uuid>");
    let s = HEX_ADDR_RE.replace_all(&s, "<addr>");
    let s = NUMBER_RE.replace_all(&s, "<n>");
    SPACE_RE.replace_all(s.trim(), " ").into_owned()
}

/// Class fingerprint: 32 hex chars (128 bits of SHA-256).
pub fn fingerprint(event: &ErrorEvent, top_frames: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_message(&event.message).as_bytes());
    hasher.update([0u8]);
    for frame in event.frames.iter().take(top_frames) {
        hasher.update(frame.function.as_bytes());
        hasher.update([0x1f]);
        hasher.update(frame.file.as_bytes());
        hasher.update([0x1e]);
    }
    hasher.update([0u8]);
    if let Some(loc) = &event.location {
        hasher.update(format!("{}:{}", loc.file, loc.line).as_bytes());
    }
    let digest = hasher.finalize();
    hex::encode(&digest[..16])
}

/// `<normalised message>|<fn@file;fn@file...>` signature used by the knowledge base.
pub fn error_signature(event: &ErrorEvent, top_frames: usize) -> String {
    let frames: Vec<String> = event
        .frames
        .iter()
        .take(top_frames)
        .map(|f| f.key())
        .collect();
    format!("{}|{}", normalize_message(&event.message), frames.join(";"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::event::{Severity, StackFrame};

    #[test]
    fn test_normalize_strips_volatile_tokens() {
        let a = normalize_message("Request 1234 failed at 0xDEADBEEF   for 550e8400-e29b-41d4-a716-446655440000");
        assert_eq!(a, "request <n> failed at <addr> for <uuid>");
    }

    #[test]
    fn test_fingerprint_stable_across_numbers() {
        let a = ErrorEvent::new("timeout after 30s on conn 7", Severity::High, "a.log");
        let b = ErrorEvent::new("timeout after 45s on conn 9", Severity::Low, "b.log");
        assert_eq!(fingerprint(&a, 5), fingerprint(&b, 5));
        assert_eq!(fingerprint(&a, 5).len(), 32);
    }

    #[test]
    fn test_fingerprint_differs_by_location() {
        let a = ErrorEvent::new("boom", Severity::High, "a.log").with_location("main.go", 10);
        let b = ErrorEvent::new("boom", Severity::High, "a.log").with_location("main.go", 11);
        assert_ne!(fingerprint(&a, 5), fingerprint(&b, 5));
    }

    #[test]
    fn test_fingerprint_only_uses_top_frames() {
        let mut a = ErrorEvent::new("boom", Severity::High, "a.log");
        let mut b = a.clone();
        a.frames = vec![
            StackFrame::new("f", "a.go", Some(1)),
            StackFrame::new("g", "b.go", Some(2)),
        ];
        b.frames = vec![
            StackFrame::new("f", "a.go", Some(99)),
            StackFrame::new("other", "c.go", Some(2)),
        ];
        assert_eq!(fingerprint(&a, 1), fingerprint(&b, 1));
        assert_ne!(fingerprint(&a, 2), fingerprint(&b, 2));
    }

    #[test]
    fn test_error_signature_layout() {
        let mut ev = ErrorEvent::new("Nil pointer at 0x1f", Severity::High, "a.log");
        ev.frames = vec![StackFrame::new("main.handler", "main.go", Some(3))];
        assert_eq!(
            error_signature(&ev, 5),
            "nil pointer at <addr>|main.handler@main.go"
        );
    }
}
