//! Applying code changes to a directory tree, and undoing them.
//!
//! The same edit engine writes into the throwaway sandbox and into the
//! real working tree. Every path is resolved relative to the working tree
//! root and must stay inside it.

use std::collections::BTreeMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Component, Path, PathBuf};

use chrono::Utc;
use tempfile::{NamedTempFile, TempDir};
use tracing::debug;

use super::error::{DeployError, DeployResult};
use crate::domain::{ChangeKind, CodeChange, Fix, RollbackData};

/// All changes a fix makes to one file.
#[derive(Debug, Clone)]
pub struct FileEdit {
    /// Path relative to the tree root.
    pub rel: PathBuf,
    pub changes: Vec<CodeChange>,
}

impl FileEdit {
    pub fn display(&self) -> String {
        self.rel.to_string_lossy().replace('\\', "/")
    }
}

/// Lexically normalise `path`, resolving `.` and `..`.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Resolve `file` against `root`, rejecting anything outside it.
pub fn resolve_in_tree(root: &Path, file: &str) -> DeployResult<PathBuf> {
    let root = normalize(root);
    let joined = normalize(&root.join(file));
    match joined.strip_prefix(&root) {
        Ok(rel) if !rel.as_os_str().is_empty() => Ok(rel.to_path_buf()),
        _ => Err(DeployError::PathEscape(file.to_string())),
    }
}

/// Check that `rel` still lands inside `root` once symlinks are followed.
///
/// The nearest existing ancestor of the target is canonicalised, so a
/// file the fix creates is judged by the directory it will be created in.
pub fn ensure_within(root: &Path, rel: &Path) -> DeployResult<()> {
    let canonical_root = fs::canonicalize(root)?;
    let mut candidate = root.join(rel);
    let resolved = loop {
        match fs::canonicalize(&candidate) {
            Ok(path) => break path,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                if !candidate.pop() {
                    return Ok(());
                }
            }
            Err(e) => return Err(e.into()),
        }
    };
    if resolved.starts_with(&canonical_root) {
        Ok(())
    } else {
        Err(DeployError::PathEscape(rel.to_string_lossy().into_owned()))
    }
}

/// Group a fix's changes by target file, in first-seen order.
pub fn plan_edits(root: &Path, fix: &Fix) -> DeployResult<Vec<FileEdit>> {
    let mut edits: Vec<FileEdit> = Vec::new();
    for change in &fix.changes {
        let rel = resolve_in_tree(root, &change.file_path)?;
        ensure_within(root, &rel)?;
        match edits.iter_mut().find(|e| e.rel == rel) {
            Some(edit) => edit.changes.push(change.clone()),
            None => edits.push(FileEdit {
                rel,
                changes: vec![change.clone()],
            }),
        }
    }
    Ok(edits)
}

/// Apply `changes` to `content`, bottom-up so earlier line numbers stay valid.
pub fn apply_changes(file: &str, content: &str, changes: &[CodeChange]) -> DeployResult<String> {
    let newline = if content.contains("\r\n") { "\r\n" } else { "\n" };
    let trailing = content.is_empty() || content.ends_with('\n');
    let mut lines: Vec<String> = content.lines().map(str::to_string).collect();

    let mut ordered: Vec<(usize, &CodeChange)> = changes.iter().enumerate().collect();
    // Descending start line; equal starts in reverse input order so
    // same-line inserts end up in input order.
    ordered.sort_by(|a, b| b.1.start_line.cmp(&a.1.start_line).then(b.0.cmp(&a.0)));

    for (_, change) in ordered {
        let conflict = |reason: String| DeployError::Conflict {
            file: file.to_string(),
            line: change.start_line,
            reason,
        };
        let n = lines.len() as u32;
        let start = change.start_line;
        match change.kind {
            ChangeKind::Add => {
                if start == 0 || start > n + 1 {
                    return Err(conflict(format!("insert position outside 1..={}", n + 1)));
                }
                let at = (start - 1) as usize;
                let new: Vec<String> = change.new_text.lines().map(str::to_string).collect();
                lines.splice(at..at, new);
            }
            ChangeKind::Modify | ChangeKind::Delete => {
                let end = change.end_line;
                if start == 0 || end < start || end > n {
                    return Err(conflict(format!("range {start}..={end} outside 1..={n}")));
                }
                let range = (start - 1) as usize..end as usize;
                if !change.old_text.is_empty() {
                    let current = lines[range.clone()].join("\n");
                    let expected = change.old_text.replace("\r\n", "\n");
                    if current != expected.trim_end_matches('\n') {
                        return Err(conflict("current text differs from expected".to_string()));
                    }
                }
                let new: Vec<String> = if change.kind == ChangeKind::Modify {
                    change.new_text.lines().map(str::to_string).collect()
                } else {
                    Vec::new()
                };
                lines.splice(range, new);
            }
        }
    }

    let mut out = lines.join(newline);
    if trailing && !lines.is_empty() {
        out.push_str(newline);
    }
    Ok(out)
}

/// New contents for each edited file, computed before anything is written.
fn render_edits(root: &Path, edits: &[FileEdit]) -> DeployResult<Vec<(PathBuf, String)>> {
    let mut rendered = Vec::with_capacity(edits.len());
    for edit in edits {
        let path = root.join(&edit.rel);
        let content = match fs::read(&path) {
            Ok(bytes) => String::from_utf8(bytes).map_err(|_| DeployError::Apply {
                file: edit.display(),
                reason: "file is not valid UTF-8".to_string(),
            })?,
            Err(e) if e.kind() == ErrorKind::NotFound => String::new(),
            Err(e) => {
                return Err(DeployError::Apply {
                    file: edit.display(),
                    reason: e.to_string(),
                })
            }
        };
        let updated = apply_changes(&edit.display(), &content, &edit.changes)?;
        rendered.push((path, updated));
    }
    Ok(rendered)
}

/// Apply every edit under `root`. Conflicts are detected for all files
/// before the first write.
pub fn write_edits(root: &Path, edits: &[FileEdit]) -> DeployResult<()> {
    for edit in edits {
        ensure_within(root, &edit.rel)?;
    }
    for (path, content) in render_edits(root, edits)? {
        write_atomic(&path, content.as_bytes()).map_err(|e| DeployError::Apply {
            file: path.display().to_string(),
            reason: e.to_string(),
        })?;
    }
    Ok(())
}

/// Replace `path` with `bytes` via a temp file in the same directory.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Capture the current bytes of every file `edits` will touch.
pub fn capture_pre_images(
    root: &Path,
    edits: &[FileEdit],
    validate_cmd: Option<String>,
) -> DeployResult<RollbackData> {
    let mut files = BTreeMap::new();
    let mut created_files = Vec::new();
    for edit in edits {
        match fs::read(root.join(&edit.rel)) {
            Ok(bytes) => {
                files.insert(edit.display(), bytes);
            }
            Err(e) if e.kind() == ErrorKind::NotFound => created_files.push(edit.display()),
            Err(e) => return Err(e.into()),
        }
    }
    Ok(RollbackData {
        files,
        created_files,
        checkpoint: Utc::now().to_rfc3339(),
        validate_cmd,
    })
}

/// Put every captured pre-image back and remove files the fix created.
pub fn restore_pre_images(root: &Path, data: &RollbackData) -> std::io::Result<()> {
    for (rel, bytes) in &data.files {
        write_atomic(&root.join(rel), bytes)?;
    }
    for rel in &data.created_files {
        match fs::remove_file(root.join(rel)) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Files whose current bytes differ from their pre-image.
pub fn diverged_files(root: &Path, data: &RollbackData) -> Vec<String> {
    let mut diverged: Vec<String> = data
        .files
        .iter()
        .filter(|(rel, bytes)| fs::read(root.join(rel.as_str())).ok().as_deref() != Some(bytes.as_slice()))
        .map(|(rel, _)| rel.clone())
        .collect();
    diverged.extend(
        data.created_files
            .iter()
            .filter(|rel| root.join(rel.as_str()).exists())
            .cloned(),
    );
    diverged
}

/// Private throwaway copy of the files a fix touches.
pub struct Sandbox {
    dir: TempDir,
}

impl Sandbox {
    /// Copy each edited file (that exists) from `worktree` into a new
    /// temp directory.
    pub fn create(worktree: &Path, edits: &[FileEdit]) -> DeployResult<Self> {
        let dir = tempfile::Builder::new().prefix("mender-sandbox-").tempdir()?;
        for edit in edits {
            let src = worktree.join(&edit.rel);
            let dst = dir.path().join(&edit.rel);
            if let Some(parent) = dst.parent() {
                fs::create_dir_all(parent)?;
            }
            match fs::copy(&src, &dst) {
                Ok(_) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        debug!(sandbox = %dir.path().display(), files = edits.len(), "sandbox created");
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn apply(&self, edits: &[FileEdit]) -> DeployResult<()> {
        write_edits(self.path(), edits)
    }
}
