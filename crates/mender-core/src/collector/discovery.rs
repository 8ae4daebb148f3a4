//! Log file discovery from glob patterns.
//!
//! Each glob is split into a literal base directory and a pattern for the
//! remainder. Discovery lists the base directory (recursively only when the
//! pattern contains `**`) and matches paths relative to it.

use std::fs;
use std::path::{Component, Path, PathBuf};

use globset::{GlobBuilder, GlobMatcher};
use tracing::debug;

use super::error::{CollectorError, CollectorResult};

const GLOB_META: [char; 4] = ['*', '?', '[', '{'];

#[derive(Debug, Clone)]
struct LogGlob {
    raw: String,
    base: PathBuf,
    matcher: GlobMatcher,
    recursive: bool,
}

/// Compiled set of log path globs.
#[derive(Debug, Clone)]
pub struct LogGlobs {
    globs: Vec<LogGlob>,
}

impl LogGlobs {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> CollectorResult<Self> {
        let mut globs = Vec::with_capacity(patterns.len());
        for raw in patterns {
            globs.push(compile(raw.as_ref())?);
        }
        Ok(Self { globs })
    }

    /// Directories worth an OS watch, with whether the watch must recurse.
    pub fn watch_roots(&self) -> Vec<(PathBuf, bool)> {
        let mut roots: Vec<(PathBuf, bool)> = Vec::new();
        for g in &self.globs {
            match roots.iter_mut().find(|(p, _)| *p == g.base) {
                Some(existing) => existing.1 |= g.recursive,
                None => roots.push((g.base.clone(), g.recursive)),
            }
        }
        roots
    }

    /// Whether `path` is selected by any glob.
    pub fn matches(&self, path: &Path) -> bool {
        self.globs.iter().any(|g| g.is_match(path))
    }

    /// All regular files currently selected, sorted and deduplicated.
    pub fn scan(&self) -> Vec<PathBuf> {
        let mut found = Vec::new();
        for g in &self.globs {
            walk(&g.base, g.recursive, &mut |path| {
                if g.is_match(path) {
                    found.push(path.to_path_buf());
                }
            });
        }
        found.sort();
        found.dedup();
        found
    }
}

impl LogGlob {
    fn is_match(&self, path: &Path) -> bool {
        let rel = match strip_base(path, &self.base) {
            Some(rel) => rel,
            None => return false,
        };
        if !self.recursive && rel.components().count() != 1 {
            return false;
        }
        self.matcher.is_match(rel)
    }
}

fn strip_base<'a>(path: &'a Path, base: &Path) -> Option<&'a Path> {
    if let Ok(rel) = path.strip_prefix(base) {
        return Some(rel);
    }
    // notify reports absolute paths; relative globs are anchored at cwd.
    if base.is_relative() {
        let cwd = std::env::current_dir().ok()?;
        let abs = cwd.join(base);
        let abs = normalize(&abs);
        return path.strip_prefix(&abs).ok();
    }
    None
}

fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for c in path.components() {
        match c {
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn compile(raw: &str) -> CollectorResult<LogGlob> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(CollectorError::InvalidGlob {
            glob: raw.to_string(),
            reason: "empty pattern".to_string(),
        });
    }
    let path = Path::new(trimmed);
    let mut base = PathBuf::new();
    let mut rest = PathBuf::new();
    let mut in_pattern = false;
    for c in path.components() {
        let s = c.as_os_str().to_string_lossy();
        if !in_pattern && !s.contains(GLOB_META) {
            base.push(c.as_os_str());
        } else {
            in_pattern = true;
            rest.push(c.as_os_str());
        }
    }
    if !in_pattern {
        // A literal file path: watch its parent, match its name.
        rest = base.file_name().map(PathBuf::from).unwrap_or_default();
        base = base.parent().map(Path::to_path_buf).unwrap_or_default();
    }
    if base.as_os_str().is_empty() {
        base = PathBuf::from(".");
    }
    let rest_str = rest.to_string_lossy().replace('\\', "/");
    let matcher = GlobBuilder::new(&rest_str)
        .literal_separator(true)
        .build()
        .map_err(|e| CollectorError::InvalidGlob {
            glob: raw.to_string(),
            reason: e.to_string(),
        })?
        .compile_matcher();
    Ok(LogGlob {
        raw: raw.to_string(),
        base,
        matcher,
        recursive: rest_str.contains("**") || rest.components().count() > 1,
    })
}

fn walk(dir: &Path, recursive: bool, visit: &mut dyn FnMut(&Path)) {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            debug!(dir = %dir.display(), error = %e, "log directory not readable");
            return;
        }
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let Ok(ft) = entry.file_type() else { continue };
        if ft.is_file() {
            visit(&path);
        } else if ft.is_dir() && recursive {
            walk(&path, recursive, visit);
        }
    }
}

impl std::fmt::Display for LogGlobs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let raws: Vec<&str> = self.globs.iter().map(|g| g.raw.as_str()).collect();
        write!(f, "{}", raws.join(", "))
    }
}
