//! Source snippet capture around a failing line.

use std::io;
use std::path::{Path, PathBuf};

use crate::domain::CodeSnippet;

/// Resolve `file` against `root` unless it is already absolute.
pub fn resolve_source(root: &Path, file: &str) -> PathBuf {
    let path = Path::new(file);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}

/// Read `path` and cut `context` lines either side of 1-based `line`.
///
/// Returns `Ok(None)` when `line` is outside the file.
pub fn capture_snippet(
    path: &Path,
    display_name: &str,
    line: u32,
    context: usize,
) -> io::Result<Option<CodeSnippet>> {
    let bytes = std::fs::read(path)?;
    let text = String::from_utf8_lossy(&bytes);
    let lines: Vec<&str> = text.lines().collect();
    let target = line as usize;
    if target == 0 || target > lines.len() {
        return Ok(None);
    }
    let start = target.saturating_sub(context).max(1);
    let end = (target + context).min(lines.len());
    Ok(Some(CodeSnippet {
        file: display_name.to_string(),
        start_line: start as u32,
        target_line: line,
        lines: lines[start - 1..end].iter().map(|s| s.to_string()).collect(),
    }))
}
