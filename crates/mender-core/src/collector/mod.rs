//! Log collection: discover, tail, parse and detect.
//!
//! The [`Collector`] owns a single blocking tailer thread. The thread wakes
//! on OS notifications from `notify` and at least once per
//! `polling_interval`, reads every tracked file from its stored offset to
//! EOF, and publishes detected [`ErrorEvent`]s on a bounded queue. Because
//! one thread services every file, events from a single file are emitted
//! in file order.
//!
//! Files present at `start` are opened at EOF so history is not replayed.
//! Files that appear later were created after the collector began and are
//! read from byte 0.

pub mod detector;
pub mod discovery;
pub mod error;
pub mod parser;
pub mod tail;

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use detector::{ErrorDetector, MAX_PATTERN_LEN};
pub use discovery::LogGlobs;
pub use error::{CollectorError, CollectorResult};
pub use parser::{LogEntry, LogFormat, LogParser};
pub use tail::{FileIdentity, FileTail, PathStatus, StartAt, TailState};

use crate::config::CollectorConfig;
use crate::domain::{ErrorEvent, PatternError};
use crate::metrics::PipelineMetrics;
use crate::obs;
use crate::queue::{self, DropCounter, QueueReceiver, QueueSender};

/// Longest the tailer sleeps between cancellation checks.
const MAX_WAIT: Duration = Duration::from_millis(200);

type FileTable = BTreeMap<PathBuf, FileTail>;

/// Diagnostic view of one tracked file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrackedFile {
    pub path: PathBuf,
    pub state: TailState,
    pub offset: u64,
}

enum Lifecycle {
    Idle,
    Running {
        cancel: CancellationToken,
        handle: JoinHandle<()>,
    },
    Stopped,
}

/// Tails log files and emits detected error events.
pub struct Collector {
    polling_interval: Duration,
    globs: LogGlobs,
    detector: Arc<RwLock<ErrorDetector>>,
    files: Arc<Mutex<FileTable>>,
    metrics: Arc<PipelineMetrics>,
    sender: Mutex<Option<QueueSender<ErrorEvent>>>,
    receiver: Mutex<Option<QueueReceiver<ErrorEvent>>>,
    drops: DropCounter,
    lifecycle: Mutex<Lifecycle>,
}

impl Collector {
    /// Validate `config` and build an idle collector.
    pub fn new(
        config: &CollectorConfig,
        detector: ErrorDetector,
        metrics: Arc<PipelineMetrics>,
    ) -> CollectorResult<Self> {
        if config.polling_interval.is_zero() {
            return Err(CollectorError::InvalidConfig(
                "polling_interval must be positive".to_string(),
            ));
        }
        if config.buffer_size == 0 {
            return Err(CollectorError::InvalidConfig(
                "buffer_size must be positive".to_string(),
            ));
        }
        if config.log_paths.is_empty() {
            return Err(CollectorError::InvalidConfig(
                "log_paths must not be empty".to_string(),
            ));
        }
        let globs = LogGlobs::new(&config.log_paths)?;
        let (tx, rx) = queue::bounded("collector.out", config.buffer_size);
        let drops = tx.drop_counter();
        metrics.register_queue(drops.clone());
        Ok(Self {
            polling_interval: config.polling_interval,
            globs,
            detector: Arc::new(RwLock::new(detector)),
            files: Arc::new(Mutex::new(BTreeMap::new())),
            metrics,
            sender: Mutex::new(Some(tx)),
            receiver: Mutex::new(Some(rx)),
            drops,
            lifecycle: Mutex::new(Lifecycle::Idle),
        })
    }

    /// Receive-only output queue. Handed out once.
    pub fn output(&self) -> Option<QueueReceiver<ErrorEvent>> {
        self.receiver.lock().take()
    }

    /// Events dropped because the output queue was full.
    pub fn dropped(&self) -> u64 {
        self.drops.get()
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.lifecycle.lock(), Lifecycle::Running { .. })
    }

    pub fn add_pattern(&self, pattern: &str, severity: &str) -> Result<(), PatternError> {
        self.detector.write().add_pattern(pattern, severity)
    }

    pub fn remove_pattern(&self, pattern: &str) -> Result<(), PatternError> {
        self.detector.write().remove_pattern(pattern)
    }

    pub fn patterns(&self) -> Vec<(String, crate::domain::Severity)> {
        self.detector.read().patterns()
    }

    pub fn tracked_files(&self) -> Vec<TrackedFile> {
        self.files
            .lock()
            .values()
            .map(|t| TrackedFile {
                path: t.path().to_path_buf(),
                state: t.state(),
                offset: t.offset(),
            })
            .collect()
    }

    /// Discover files, install watches and spawn the tailer.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self, cancel: CancellationToken) -> CollectorResult<()> {
        let mut lifecycle = self.lifecycle.lock();
        match *lifecycle {
            Lifecycle::Idle => {}
            Lifecycle::Running { .. } => return Err(CollectorError::AlreadyStarted),
            Lifecycle::Stopped => return Err(CollectorError::AlreadyStopped),
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| CollectorError::Task(e.to_string()))?;
        let out = self
            .sender
            .lock()
            .take()
            .ok_or(CollectorError::AlreadyStopped)?;

        let cancel = cancel.child_token();
        let tailer = Tailer {
            polling_interval: self.polling_interval,
            globs: self.globs.clone(),
            parser: LogParser::new(),
            detector: Arc::clone(&self.detector),
            files: Arc::clone(&self.files),
            metrics: Arc::clone(&self.metrics),
            out,
            cancel: cancel.clone(),
        };
        tailer.discover_initial();

        let (raw_tx, raw_rx) = std_mpsc::channel();
        let keepalive = raw_tx.clone();
        let watcher = install_watcher(&self.globs, raw_tx, &self.metrics);

        let handle = runtime.spawn_blocking(move || tailer.run(raw_rx, keepalive, watcher));
        *lifecycle = Lifecycle::Running { cancel, handle };
        info!(globs = %self.globs, "collector started");
        obs::emit_stage_started("collector", 1);
        Ok(())
    }

    /// Cancel the tailer, wait for its final drain and close the output queue.
    pub async fn stop(&self) -> CollectorResult<()> {
        let (cancel, handle) = {
            let mut lifecycle = self.lifecycle.lock();
            match std::mem::replace(&mut *lifecycle, Lifecycle::Stopped) {
                Lifecycle::Running { cancel, handle } => (cancel, handle),
                Lifecycle::Idle => {
                    *lifecycle = Lifecycle::Idle;
                    return Err(CollectorError::NotStarted);
                }
                Lifecycle::Stopped => return Err(CollectorError::AlreadyStopped),
            }
        };
        cancel.cancel();
        handle
            .await
            .map_err(|e| CollectorError::Task(e.to_string()))?;
        obs::emit_stage_stopped("collector", self.metrics.events_detected.get());
        Ok(())
    }
}

fn install_watcher(
    globs: &LogGlobs,
    raw_tx: std_mpsc::Sender<notify::Result<notify::Event>>,
    metrics: &PipelineMetrics,
) -> Option<RecommendedWatcher> {
    let mut watcher = match notify::recommended_watcher(raw_tx) {
        Ok(w) => w,
        Err(e) => {
            warn!(error = %e, "file watcher unavailable, polling only");
            metrics.watcher_errors.inc();
            return None;
        }
    };
    for (root, recursive) in globs.watch_roots() {
        let mode = if recursive {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };
        if let Err(e) = watcher.watch(&root, mode) {
            debug!(dir = %root.display(), error = %e, "cannot watch log directory, polling only");
        }
    }
    Some(watcher)
}

// ---------------------------------------------------------------------------
// Tailer thread
// ---------------------------------------------------------------------------

struct Tailer {
    polling_interval: Duration,
    globs: LogGlobs,
    parser: LogParser,
    detector: Arc<RwLock<ErrorDetector>>,
    files: Arc<Mutex<FileTable>>,
    metrics: Arc<PipelineMetrics>,
    out: QueueSender<ErrorEvent>,
    cancel: CancellationToken,
}

impl Tailer {
    fn discover_initial(&self) {
        let mut files = self.files.lock();
        for path in self.globs.scan() {
            let mut tail = FileTail::new(&path);
            if let Err(e) = tail.open(StartAt::End) {
                self.lose(&mut tail, &e);
            } else {
                debug!(path = %path.display(), offset = tail.offset(), "tailing from end");
            }
            files.insert(path, tail);
        }
    }

    fn run(
        self,
        raw_rx: std_mpsc::Receiver<notify::Result<notify::Event>>,
        _keepalive: std_mpsc::Sender<notify::Result<notify::Event>>,
        _watcher: Option<RecommendedWatcher>,
    ) {
        let wait = self.polling_interval.min(MAX_WAIT);
        let mut last_poll = Instant::now();
        while !self.cancel.is_cancelled() {
            let mut touched = BTreeSet::new();
            match raw_rx.recv_timeout(wait) {
                Ok(first) => {
                    self.collect_paths(first, &mut touched);
                    while let Ok(more) = raw_rx.try_recv() {
                        self.collect_paths(more, &mut touched);
                    }
                }
                Err(std_mpsc::RecvTimeoutError::Timeout) => {}
                Err(std_mpsc::RecvTimeoutError::Disconnected) => break,
            }
            if !touched.is_empty() {
                let mut files = self.files.lock();
                for path in &touched {
                    self.service(&mut files, path);
                }
            }
            if last_poll.elapsed() >= self.polling_interval {
                self.poll();
                last_poll = Instant::now();
            }
        }
        // Drain whatever was written before cancellation.
        let mut files = self.files.lock();
        let paths: Vec<PathBuf> = files.keys().cloned().collect();
        for path in paths {
            self.service(&mut files, &path);
        }
        debug!("collector tailer exiting");
    }

    fn collect_paths(
        &self,
        event: notify::Result<notify::Event>,
        touched: &mut BTreeSet<PathBuf>,
    ) {
        match event {
            Ok(event) => touched.extend(event.paths),
            Err(e) => {
                warn!(error = %e, "file watcher error");
                self.metrics.watcher_errors.inc();
            }
        }
    }

    /// Service every tracked file, then adopt newly matching paths.
    fn poll(&self) {
        let mut files = self.files.lock();
        let tracked: Vec<PathBuf> = files.keys().cloned().collect();
        for path in &tracked {
            self.service(&mut files, path);
        }
        for path in self.globs.scan() {
            if !files.contains_key(&path) {
                self.adopt(&mut files, path);
            }
        }
    }

    fn service(&self, files: &mut FileTable, path: &Path) {
        let outcome = {
            let Some(tail) = files.get_mut(path) else {
                if path.is_file() && self.globs.matches(path) {
                    self.adopt(files, path.to_path_buf());
                }
                return;
            };
            if tail.state() == TailState::Lost {
                if let Err(e) = tail.reopen() {
                    if e.kind() == std::io::ErrorKind::NotFound {
                        debug!(path = %path.display(), "lost file is gone, untracking");
                        files.remove(path);
                    }
                    return;
                }
                info!(path = %path.display(), offset = tail.offset(), "recovered lost log file");
            }
            let mut lines = Vec::new();
            let read = tail.read_available(&mut lines);
            let source = tail.path().display().to_string();
            self.emit_lines(&source, lines);
            if let Err(e) = read {
                self.lose(tail, &e);
                return;
            }
            (tail.path_status(), tail.identity())
        };

        let (status, identity) = outcome;
        if status == PathStatus::Same {
            return;
        }
        let Some(mut tail) = files.remove(path) else {
            return;
        };
        match identity.and_then(|id| self.find_renamed(files, id)) {
            Some(new_path) => {
                info!(from = %path.display(), to = %new_path.display(), "log file renamed, following");
                tail.rekey(new_path.clone());
                files.insert(new_path, tail);
            }
            None => {
                if let Some(last) = tail.close() {
                    self.emit_lines(&path.display().to_string(), vec![last]);
                }
                info!(path = %path.display(), ?status, "log file rotated away, closed");
            }
        }
        if status == PathStatus::Replaced {
            self.adopt(files, path.to_path_buf());
        }
    }

    /// Start tracking `path`, read from byte 0.
    fn adopt(&self, files: &mut FileTable, path: PathBuf) {
        let identity = FileIdentity::of_path(&path);
        if let Some(id) = identity {
            let renamed_from = files
                .iter()
                .find(|(p, t)| t.identity() == Some(id) && p.as_path() != path.as_path())
                .map(|(p, _)| p.clone());
            if let Some(old) = renamed_from {
                if let Some(mut tail) = files.remove(&old) {
                    info!(from = %old.display(), to = %path.display(), "log file renamed, following");
                    tail.rekey(path.clone());
                    files.insert(path, tail);
                }
                return;
            }
        }

        let mut tail = FileTail::new(&path);
        match tail.open(StartAt::Beginning) {
            Ok(()) => {
                info!(path = %path.display(), "discovered log file");
                let mut lines = Vec::new();
                let read = tail.read_available(&mut lines);
                self.emit_lines(&path.display().to_string(), lines);
                if let Err(e) = read {
                    self.lose(&mut tail, &e);
                }
            }
            Err(e) => self.lose(&mut tail, &e),
        }
        files.insert(path, tail);
    }

    /// A matching, untracked path whose file has identity `id`.
    fn find_renamed(&self, files: &FileTable, id: FileIdentity) -> Option<PathBuf> {
        self.globs.scan().into_iter().find(|p| {
            !files.contains_key(p) && FileIdentity::of_path(p) == Some(id)
        })
    }

    fn lose(&self, tail: &mut FileTail, err: &std::io::Error) {
        warn!(path = %tail.path().display(), error = %err, "log file lost");
        tail.mark_lost();
        self.metrics.files_lost.inc();
        self.metrics.io_errors.inc();
    }

    fn emit_lines(&self, source: &str, lines: Vec<String>) {
        for line in lines {
            self.metrics.lines_read.inc();
            let Some(entry) = self.parser.parse(&line) else {
                continue;
            };
            let detected = self.detector.read().detect(&entry, source);
            if let Some(event) = detected {
                self.metrics.events_detected.inc();
                obs::emit_event_detected(&event);
                self.out.publish(event);
            }
        }
    }
}
