//! Signature similarity.
//!
//! A signature `<message>|<fn@file;fn@file>` is reduced to a token set of
//! message words and `frame:fn@file` tuples; two signatures are compared by
//! Jaccard index over those sets.

use std::collections::BTreeSet;

/// Token set of an error signature.
pub fn signature_tokens(signature: &str) -> BTreeSet<String> {
    let (message, frames) = signature.rsplit_once('|').unwrap_or((signature, ""));
    let words = message
        .split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric() && c != '<' && c != '>'))
        .filter(|w| !w.is_empty())
        .map(str::to_string);
    let frames = frames
        .split(';')
        .filter(|f| !f.is_empty())
        .map(|f| format!("frame:{f}"));
    words.chain(frames).collect()
}

/// |a ∩ b| / |a ∪ b|; two empty sets score 0.
pub fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f64 / union as f64
}

/// Jaccard similarity of two signatures.
pub fn signature_similarity(a: &str, b: &str) -> f64 {
    jaccard(&signature_tokens(a), &signature_tokens(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokens_split_message_and_frames() {
        let t = signature_tokens("nil pointer dereference, at <addr>|main.handle@main.go;main.main@main.go");
        assert!(t.contains("nil"));
        assert!(t.contains("dereference"));
        assert!(t.contains("<addr>"));
        assert!(t.contains("frame:main.handle@main.go"));
        assert!(t.contains("frame:main.main@main.go"));
        assert_eq!(t.len(), 7);
    }

    #[test]
    fn test_identical_signatures_score_one() {
        let s = "timeout after <n>s|fetch@client.py";
        assert!((signature_similarity(s, s) - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_partial_overlap() {
        // {a, b, frame:f@x} vs {a, c, frame:f@x}: 2 shared of 4
        let score = signature_similarity("a b|f@x", "a c|f@x");
        assert!((score - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_empty_and_disjoint() {
        assert_eq!(signature_similarity("|", "|"), 0.0);
        assert_eq!(signature_similarity("alpha|", "beta|"), 0.0);
    }
}
