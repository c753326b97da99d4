use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use crossbeam_channel::{RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::classifier::{LineClassifier, LogClock, ParseContext};
use crate::event::LogEvent;
use crate::queue::{Drained, EventQueue};

pub const LOG_FILE_PREFIX: &str = "output_log_";
pub const LOG_FILE_EXTENSION: &str = "txt";
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub struct LogFileContext {
    pub name: String,
    pub path: PathBuf,
    pub length: u64,
    pub cursor: u64,
    pub parse: ParseContext,
    shrink_reported: bool,
}

impl LogFileContext {
    pub fn new(path: &Path) -> Self {
        let name = path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or_default()
            .to_string();
        Self {
            name,
            path: path.to_path_buf(),
            length: 0,
            cursor: 0,
            parse: ParseContext::default(),
            shrink_reported: false,
        }
    }

    /// Reads every complete line appended since the cursor.
    ///
    /// A trailing line without its newline is left for the next call so a partially
    /// flushed write is never classified. Lines at or before `cutoff` update the parse
    /// context but produce no events.
    pub fn read_appended(
        &mut self,
        file_len: u64,
        classifier: &LineClassifier,
        cutoff: Option<DateTime<Utc>>,
        events: &mut Vec<LogEvent>,
    ) -> io::Result<()> {
        if file_len < self.cursor {
            if !self.shrink_reported {
                warn!(
                    file = %self.name,
                    cursor = self.cursor,
                    len = file_len,
                    "log file shrank below read cursor; waiting for it to grow"
                );
                self.shrink_reported = true;
            }
            return Ok(());
        }
        self.shrink_reported = false;
        if file_len == self.cursor {
            self.length = file_len;
            return Ok(());
        }

        let mut file = open_shared(&self.path)?;
        file.seek(SeekFrom::Start(self.cursor))?;
        let mut reader = BufReader::new(file);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            let bytes = reader.read_until(b'\n', &mut buf)?;
            if bytes == 0 || buf.last() != Some(&b'\n') {
                break;
            }
            self.cursor += bytes as u64;

            let line = String::from_utf8_lossy(&buf);
            if line.trim().is_empty() {
                continue;
            }
            let parsed = classifier.split(&line, &mut self.parse);
            let timestamp = parsed.timestamp;
            let Some(kind) = classifier.classify(&parsed, &mut self.parse).into_event() else {
                continue;
            };
            if cutoff.is_some_and(|cutoff| timestamp <= cutoff) {
                continue;
            }
            events.push(LogEvent::new(self.name.clone(), timestamp, kind));
        }
        self.length = file_len.max(self.cursor);
        Ok(())
    }
}

/// Thread-confined scanning state: one context per live log file in the directory.
pub struct LogScanner {
    dir: PathBuf,
    classifier: LineClassifier,
    contexts: HashMap<PathBuf, LogFileContext>,
    cutoff: Option<DateTime<Utc>>,
}

impl LogScanner {
    pub fn new(dir: impl Into<PathBuf>, classifier: LineClassifier) -> Self {
        Self {
            dir: dir.into(),
            classifier,
            contexts: HashMap::new(),
            cutoff: None,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn set_cutoff(&mut self, cutoff: Option<DateTime<Utc>>) {
        self.cutoff = cutoff;
    }

    /// Forgets every file so the next update re-derives everything from byte zero.
    pub fn reset(&mut self) {
        self.contexts.clear();
    }

    pub fn context(&self, name: &str) -> Option<&LogFileContext> {
        self.contexts.values().find(|ctx| ctx.name == name)
    }

    pub fn file_count(&self) -> usize {
        self.contexts.len()
    }

    /// One poll pass over the directory, oldest file first.
    pub fn update(&mut self) -> Vec<LogEvent> {
        let mut events = Vec::new();
        if !self.dir.exists() {
            self.contexts.clear();
            return events;
        }

        let files = discover_log_files(&self.dir);
        let seen: HashSet<PathBuf> = files.iter().map(|file| file.path.clone()).collect();

        for file in files {
            let cutoff = self.cutoff;
            let ctx = self.contexts.entry(file.path.clone()).or_insert_with(|| {
                let mut ctx = LogFileContext::new(&file.path);
                if let Some(cutoff) = cutoff
                    && modified_at_or_before(file.modified, cutoff)
                {
                    // Nothing in a file untouched since the cutoff can be newer than it.
                    ctx.cursor = file.len;
                    ctx.length = file.len;
                }
                ctx
            });
            if let Err(err) = ctx.read_appended(file.len, &self.classifier, cutoff, &mut events) {
                debug!(error = %err, file = %ctx.name, "log read failed; retrying next tick");
            }
        }

        self.contexts.retain(|path, _| seen.contains(path));
        events
    }
}

#[derive(Debug, Clone)]
pub struct LogFileInfo {
    pub path: PathBuf,
    pub len: u64,
    pub created: SystemTime,
    pub modified: SystemTime,
}

pub fn is_log_file_name(name: &str) -> bool {
    name.starts_with(LOG_FILE_PREFIX)
        && Path::new(name)
            .extension()
            .and_then(|ext| ext.to_str())
            == Some(LOG_FILE_EXTENSION)
}

/// Log files in `dir`, ordered by creation time so cross-file order is preserved.
pub fn discover_log_files(dir: &Path) -> Vec<LogFileInfo> {
    let mut files: Vec<LogFileInfo> = WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(std::result::Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| entry.file_name().to_str().is_some_and(is_log_file_name))
        .filter_map(|entry| {
            let metadata = entry.metadata().ok()?;
            let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            Some(LogFileInfo {
                path: entry.path().to_path_buf(),
                len: metadata.len(),
                created: metadata.created().unwrap_or(modified),
                modified,
            })
        })
        .collect();
    files.sort_by(|a, b| {
        a.created
            .cmp(&b.created)
            .then_with(|| a.modified.cmp(&b.modified))
            .then_with(|| a.path.cmp(&b.path))
    });
    files
}

/// Classifies a whole file in one pass.
pub fn read_log_file(path: &Path, classifier: &LineClassifier) -> Result<Vec<LogEvent>> {
    let len = std::fs::metadata(path)
        .with_context(|| format!("failed to stat log file {}", path.display()))?
        .len();
    let mut ctx = LogFileContext::new(path);
    let mut events = Vec::new();
    ctx.read_appended(len, classifier, None, &mut events)
        .with_context(|| format!("failed to read log file {}", path.display()))?;
    Ok(events)
}

fn modified_at_or_before(modified: SystemTime, cutoff: DateTime<Utc>) -> bool {
    DateTime::<Utc>::from(modified) <= cutoff
}

#[cfg(windows)]
fn open_shared(path: &Path) -> io::Result<File> {
    use std::os::windows::fs::OpenOptionsExt;
    const FILE_SHARE_ALL: u32 = 0x1 | 0x2 | 0x4;
    OpenOptions::new()
        .read(true)
        .share_mode(FILE_SHARE_ALL)
        .open(path)
}

#[cfg(not(windows))]
fn open_shared(path: &Path) -> io::Result<File> {
    OpenOptions::new().read(true).open(path)
}

/// Follows one append-only line file (JSONL written by a bridge process).
///
/// Unlike client logs these files may be rotated, so a shrink restarts from the top.
#[derive(Debug)]
pub struct LineFollower {
    path: PathBuf,
    cursor: u64,
}

impl LineFollower {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cursor: 0,
        }
    }

    /// Starts at the current end so only lines written from now on are returned.
    pub fn from_end(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let cursor = std::fs::metadata(&path).map(|meta| meta.len()).unwrap_or(0);
        Self { path, cursor }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Complete, non-blank lines appended since the last poll. I/O errors yield nothing.
    pub fn poll(&mut self) -> Vec<String> {
        match self.read_new_lines() {
            Ok(lines) => lines,
            Err(err) => {
                debug!(error = %err, path = %self.path.display(), "line follower read failed");
                Vec::new()
            }
        }
    }

    fn read_new_lines(&mut self) -> io::Result<Vec<String>> {
        let len = std::fs::metadata(&self.path)?.len();
        if len < self.cursor {
            debug!(path = %self.path.display(), "followed file shrank; restarting from the top");
            self.cursor = 0;
        }
        if len == self.cursor {
            return Ok(Vec::new());
        }

        let mut file = open_shared(&self.path)?;
        file.seek(SeekFrom::Start(self.cursor))?;
        let mut reader = BufReader::new(file);
        let mut lines = Vec::new();
        let mut buf = Vec::new();
        loop {
            buf.clear();
            let bytes = reader.read_until(b'\n', &mut buf)?;
            if bytes == 0 || buf.last() != Some(&b'\n') {
                break;
            }
            self.cursor += bytes as u64;
            let line = String::from_utf8_lossy(&buf).trim().to_string();
            if !line.is_empty() {
                lines.push(line);
            }
        }
        Ok(lines)
    }
}

enum Control {
    Wake,
    Stop,
}

/// Owns the background thread that polls the log directory and feeds the queue.
pub struct LogTailer {
    dir: PathBuf,
    clock: LogClock,
    poll_interval: Duration,
    queue: Arc<EventQueue>,
    cutoff: Arc<Mutex<Option<DateTime<Utc>>>>,
    control: Option<Sender<Control>>,
    handle: Option<JoinHandle<()>>,
}

impl LogTailer {
    pub fn new(dir: impl Into<PathBuf>, poll_interval: Duration, clock: LogClock) -> Self {
        Self {
            dir: dir.into(),
            clock,
            poll_interval,
            queue: Arc::new(EventQueue::default()),
            cutoff: Arc::new(Mutex::new(None)),
            control: None,
            handle: None,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn queue(&self) -> Arc<EventQueue> {
        Arc::clone(&self.queue)
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    pub fn start(&mut self) -> Result<()> {
        if self.handle.is_some() {
            return Ok(());
        }
        let (tx, rx) = crossbeam_channel::unbounded();
        let scanner = LogScanner::new(self.dir.clone(), LineClassifier::new(self.clock));
        let queue = Arc::clone(&self.queue);
        let cutoff = Arc::clone(&self.cutoff);
        let poll_interval = self.poll_interval;

        let handle = thread::Builder::new()
            .name("log-tailer".to_string())
            .spawn(move || {
                let mut scanner = scanner;
                let mut generation = queue.generation();
                loop {
                    let current = queue.generation();
                    if current != generation {
                        scanner.reset();
                        generation = current;
                    }
                    scanner.set_cutoff(*cutoff.lock());
                    let events = scanner.update();
                    if !queue.publish(generation, events) {
                        debug!("discarding scan output produced before a reset");
                    }
                    match rx.recv_timeout(poll_interval) {
                        Ok(Control::Wake) | Err(RecvTimeoutError::Timeout) => {}
                        Ok(Control::Stop) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                debug!("log tailer thread exiting");
            })
            .context("failed to spawn log tailer thread")?;

        self.control = Some(tx);
        self.handle = Some(handle);
        Ok(())
    }

    pub fn stop(&mut self) {
        if let Some(control) = self.control.take() {
            let _ = control.send(Control::Stop);
        }
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            warn!("log tailer thread panicked");
        }
    }

    /// Drops all queued events and file contexts; the next pass replays from scratch.
    pub fn reset(&self) {
        self.queue.reset();
        self.wake();
    }

    /// Lines stamped at or before `cutoff` are consumed without producing events.
    pub fn set_cutoff_date(&self, cutoff: Option<DateTime<Utc>>) {
        *self.cutoff.lock() = cutoff;
    }

    pub fn drain(&self, max_count: usize) -> Drained {
        self.queue.drain(max_count)
    }

    fn wake(&self) {
        if let Some(control) = self.control.as_ref() {
            let _ = control.send(Control::Wake);
        }
    }
}

impl Drop for LogTailer {
    fn drop(&mut self) {
        self.stop();
    }
}
