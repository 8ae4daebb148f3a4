//! Per-file tailing state machine.
//!
//! ```text
//! Discovered --open--> Open --read--> Reading
//!      |                 |               |
//!      +---- io error ---+--> Lost <-----+
//!                              |
//!                              +--reopen (next poll)--> Open
//! ```
//!
//! Offsets live in memory only. A file whose size drops below the stored
//! offset was truncated and is re-read from byte 0.

use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use serde::Serialize;

/// Bytes read per `read` call.
pub const CHUNK_SIZE: usize = 8 * 1024;

/// A line longer than this is emitted in pieces.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Where a newly opened tail starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartAt {
    Beginning,
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TailState {
    Discovered,
    Open,
    Reading,
    Lost,
}

/// Device and inode of an open file; survives renames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileIdentity {
    dev: u64,
    ino: u64,
}

impl FileIdentity {
    #[cfg(unix)]
    pub fn of(meta: &fs::Metadata) -> Option<Self> {
        use std::os::unix::fs::MetadataExt;
        Some(Self {
            dev: meta.dev(),
            ino: meta.ino(),
        })
    }

    #[cfg(not(unix))]
    pub fn of(_meta: &fs::Metadata) -> Option<Self> {
        None
    }

    pub fn of_path(path: &Path) -> Option<Self> {
        fs::metadata(path).ok().and_then(|m| Self::of(&m))
    }
}

/// What currently lives at a tail's path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathStatus {
    /// The open handle still refers to the file at the path.
    Same,
    /// A different file now lives at the path (rotation).
    Replaced,
    /// Nothing lives at the path any more.
    Missing,
}

/// Tailing state for one log file.
#[derive(Debug)]
pub struct FileTail {
    path: PathBuf,
    state: TailState,
    file: Option<File>,
    identity: Option<FileIdentity>,
    offset: u64,
    pending: Vec<u8>,
}

impl FileTail {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            state: TailState::Discovered,
            file: None,
            identity: None,
            offset: 0,
            pending: Vec::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> TailState {
        self.state
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn identity(&self) -> Option<FileIdentity> {
        self.identity
    }

    /// Move the tail to a new path after its file was renamed.
    pub fn rekey(&mut self, path: PathBuf) {
        self.path = path;
    }

    /// Open the file and position at `start`.
    pub fn open(&mut self, start: StartAt) -> io::Result<()> {
        let mut file = File::open(&self.path)?;
        let meta = file.metadata()?;
        let offset = match start {
            StartAt::Beginning => 0,
            StartAt::End => meta.len(),
        };
        file.seek(SeekFrom::Start(offset))?;
        self.identity = FileIdentity::of(&meta);
        self.offset = offset;
        self.pending.clear();
        self.file = Some(file);
        self.state = TailState::Open;
        Ok(())
    }

    /// Reopen a lost file. The stored offset is kept if the same file is
    /// still at the path; otherwise reading restarts at byte 0.
    pub fn reopen(&mut self) -> io::Result<()> {
        let previous = self.identity;
        let offset = self.offset;
        self.open(StartAt::Beginning)?;
        let same = previous.is_some() && previous == self.identity;
        if same {
            if let Some(file) = self.file.as_mut() {
                file.seek(SeekFrom::Start(offset))?;
            }
            self.offset = offset;
        }
        Ok(())
    }

    /// Read from the stored offset to EOF, appending complete lines to `out`.
    ///
    /// Returns the number of bytes consumed.
    pub fn read_available(&mut self, out: &mut Vec<String>) -> io::Result<u64> {
        let file = match self.file.as_mut() {
            Some(f) => f,
            None => return Ok(0),
        };
        self.state = TailState::Reading;

        let len = file.metadata()?.len();
        if len < self.offset {
            tracing::info!(path = %self.path.display(), old_offset = self.offset, new_size = len, "log truncated, rewinding");
            file.seek(SeekFrom::Start(0))?;
            self.offset = 0;
            self.pending.clear();
        }

        let mut consumed = 0u64;
        let mut chunk = [0u8; CHUNK_SIZE];
        loop {
            let n = file.read(&mut chunk)?;
            if n == 0 {
                break;
            }
            consumed += n as u64;
            self.offset += n as u64;
            self.pending.extend_from_slice(&chunk[..n]);
            drain_lines(&mut self.pending, out);
        }
        self.state = TailState::Open;
        Ok(consumed)
    }

    /// Compare the open handle with whatever is now at the path.
    pub fn path_status(&self) -> PathStatus {
        match fs::metadata(&self.path) {
            Err(_) => PathStatus::Missing,
            Ok(meta) => match (self.identity, FileIdentity::of(&meta)) {
                (Some(a), Some(b)) if a != b => PathStatus::Replaced,
                _ => PathStatus::Same,
            },
        }
    }

    pub fn mark_lost(&mut self) {
        self.file = None;
        self.state = TailState::Lost;
    }

    /// Close the handle, returning an unterminated final line if any.
    pub fn close(&mut self) -> Option<String> {
        self.file = None;
        if self.pending.is_empty() {
            return None;
        }
        let line = decode_line(&self.pending);
        self.pending.clear();
        Some(line)
    }
}

fn drain_lines(pending: &mut Vec<u8>, out: &mut Vec<String>) {
    let mut start = 0;
    while let Some(pos) = pending[start..].iter().position(|b| *b == b'\n') {
        out.push(decode_line(&pending[start..start + pos]));
        start += pos + 1;
    }
    pending.drain(..start);
    if pending.len() > MAX_LINE_BYTES {
        out.push(decode_line(pending));
        pending.clear();
    }
}

fn decode_line(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn append(path: &Path, text: &str) {
        let mut f = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        f.write_all(text.as_bytes()).unwrap();
    }

    #[test]
    fn test_open_at_end_skips_history() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        append(&path, "old line\n");

        let mut tail = FileTail::new(&path);
        tail.open(StartAt::End).unwrap();
        append(&path, "new line\n");

        let mut lines = Vec::new();
        tail.read_available(&mut lines).unwrap();
        assert_eq!(lines, vec!["new line"]);
        assert_eq!(tail.offset(), 18);
    }

    #[test]
    fn test_partial_lines_are_buffered() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        fs::write(&path, "").unwrap();
        let mut tail = FileTail::new(&path);
        tail.open(StartAt::Beginning).unwrap();

        append(&path, "hel");
        let mut lines = Vec::new();
        tail.read_available(&mut lines).unwrap();
        assert!(lines.is_empty());

        append(&path, "lo\r\nworld\n");
        tail.read_available(&mut lines).unwrap();
        assert_eq!(lines, vec!["hello", "world"]);
    }

    #[test]
    fn test_truncation_rewinds_to_zero() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        append(&path, "first line that is long\n");
        let mut tail = FileTail::new(&path);
        tail.open(StartAt::End).unwrap();

        fs::write(&path, "short\n").unwrap();
        let mut lines = Vec::new();
        tail.read_available(&mut lines).unwrap();
        assert_eq!(lines, vec!["short"]);
        assert_eq!(tail.offset(), 6);
    }

    #[cfg(unix)]
    #[test]
    fn test_rotation_detected_as_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        append(&path, "a\n");
        let mut tail = FileTail::new(&path);
        tail.open(StartAt::End).unwrap();
        assert_eq!(tail.path_status(), PathStatus::Same);

        fs::rename(&path, dir.path().join("app.log.1")).unwrap();
        assert_eq!(tail.path_status(), PathStatus::Missing);

        // The renamed handle still reads what the writer appends.
        append(&dir.path().join("app.log.1"), "late\n");
        let mut lines = Vec::new();
        tail.read_available(&mut lines).unwrap();
        assert_eq!(lines, vec!["late"]);

        append(&path, "b\n");
        assert_eq!(tail.path_status(), PathStatus::Replaced);
    }

    #[test]
    fn test_reopen_keeps_offset_for_same_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        append(&path, "one\n");
        let mut tail = FileTail::new(&path);
        tail.open(StartAt::End).unwrap();
        tail.mark_lost();
        assert_eq!(tail.state(), TailState::Lost);

        append(&path, "two\n");
        tail.reopen().unwrap();
        let mut lines = Vec::new();
        tail.read_available(&mut lines).unwrap();
        assert_eq!(lines, vec!["two"]);
    }

    #[test]
    fn test_close_returns_unterminated_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        fs::write(&path, "").unwrap();
        let mut tail = FileTail::new(&path);
        tail.open(StartAt::Beginning).unwrap();
        append(&path, "no newline");
        let mut lines = Vec::new();
        tail.read_available(&mut lines).unwrap();
        assert!(lines.is_empty());
        assert_eq!(tail.close(), Some("no newline".to_string()));
    }
}
