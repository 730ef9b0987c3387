//! Crash-tolerant event log.
//!
//! The sink keeps three views of the same event stream in step:
//!
//! - an in-memory ring of the most recent events (bounded, oldest evicted),
//! - `logs/unified.log`, an append-only text mirror that is never truncated here,
//! - `.persistent_output.json`, a snapshot of the ring rewritten on every
//!   append so the ring survives a restart of the supervisor.
//!
//! Every event is also pushed into the [`CommandOutputQueue`] and published to
//! live subscribers.
//!
//! Disk failures are logged and swallowed: recording activity must never fail
//! the operation that produced it.

use crate::config::SupervisorConfig;
use crate::event::{EventLevel, OutputEvent};
use crate::queue::CommandOutputQueue;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Block size used when scanning the durable log backwards.
const TAIL_CHUNK: u64 = 8 * 1024;

/// Byte offset into the durable log, handed out by
/// [`OutputSink::drain_since`] for incremental polling.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogCursor(pub u64);

impl LogCursor {
    pub fn start() -> Self {
        Self(0)
    }

    pub fn offset(&self) -> u64 {
        self.0
    }
}

struct SinkState {
    ring: VecDeque<OutputEvent>,
    log: Option<File>,
}

/// Append-only event log with an in-memory ring and on-disk mirrors.
pub struct OutputSink {
    state: Mutex<SinkState>,
    queue: Arc<CommandOutputQueue>,
    live: broadcast::Sender<OutputEvent>,
    log_path: PathBuf,
    snapshot_path: PathBuf,
    capacity: usize,
}

impl OutputSink {
    /// Open the sink for the configured data directory, recovering the ring
    /// from the snapshot if one exists.
    pub fn open(config: &SupervisorConfig) -> Self {
        Self::new(
            config.unified_log_path(),
            config.snapshot_path(),
            config.ring_capacity,
        )
    }

    /// Open a sink with explicit paths.
    ///
    /// A missing, unreadable or corrupt snapshot yields an empty ring; it is
    /// never an error.
    pub fn new(log_path: PathBuf, snapshot_path: PathBuf, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let ring = recover(&snapshot_path, capacity);

        let queue = Arc::new(CommandOutputQueue::new(capacity));
        queue.seed(ring.iter().cloned());

        let (live, _) = broadcast::channel(capacity);

        debug!(
            log = %log_path.display(),
            recovered = ring.len(),
            "Output sink opened"
        );

        Self {
            state: Mutex::new(SinkState { ring, log: None }),
            queue,
            live,
            log_path,
            snapshot_path,
            capacity,
        }
    }

    /// Record one event.
    ///
    /// Pushes to the ring and queue, appends one line to the durable log and
    /// rewrites the snapshot, all under one lock and all before returning.
    pub fn append(&self, event: OutputEvent) {
        let mut state = self.state.lock();

        if state.ring.len() >= self.capacity {
            state.ring.pop_front();
        }
        state.ring.push_back(event.clone());
        self.queue.push(event.clone());

        if let Err(e) = self.write_log_line(&mut state, &event) {
            warn!(path = %self.log_path.display(), error = %e, "Failed to append to unified log");
            // Reopen on the next append
            state.log = None;
        }

        if let Err(e) = self.write_snapshot(&state.ring) {
            warn!(path = %self.snapshot_path.display(), error = %e, "Failed to save output snapshot");
        }

        // Sent under the lock so subscribers observe append order
        let _ = self.live.send(event);
    }

    /// Shorthand for `append(OutputEvent::now(level, message))`.
    pub fn record(&self, level: EventLevel, message: impl Into<String>) {
        self.append(OutputEvent::now(level, message));
    }

    /// The last `n` lines of the durable log, oldest first.
    ///
    /// Falls back to the in-memory ring (formatted the same way) when the log
    /// cannot be read. Never mutates anything.
    pub fn tail(&self, n: usize) -> Vec<String> {
        match read_last_lines(&self.log_path, n) {
            Ok(lines) => lines,
            Err(e) => {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(path = %self.log_path.display(), error = %e, "Unified log unreadable, using ring");
                }
                self.recent(n).iter().map(OutputEvent::log_line).collect()
            }
        }
    }

    /// Lines appended to the durable log since `cursor`, and the cursor to
    /// pass next time.
    ///
    /// Only complete lines are returned; a line still being written stays
    /// behind the returned cursor. A cursor past the end of the file (the log
    /// was rotated or truncated externally) restarts from the beginning.
    pub fn drain_since(&self, cursor: LogCursor) -> (Vec<String>, LogCursor) {
        match read_lines_from(&self.log_path, cursor.0) {
            Ok((lines, next)) => (lines, LogCursor(next)),
            Err(e) => {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(path = %self.log_path.display(), error = %e, "Failed to read unified log");
                }
                (Vec::new(), cursor)
            }
        }
    }

    /// The last `n` events held in memory, oldest first.
    pub fn recent(&self, n: usize) -> Vec<OutputEvent> {
        let state = self.state.lock();
        let skip = state.ring.len().saturating_sub(n);
        state.ring.iter().skip(skip).cloned().collect()
    }

    /// Number of events currently held in the ring.
    pub fn len(&self) -> usize {
        self.state.lock().ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().ring.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The drain-once queue fed by this sink.
    pub fn queue(&self) -> &Arc<CommandOutputQueue> {
        &self.queue
    }

    /// Follow events as they are appended.
    ///
    /// A receiver that falls more than `capacity` events behind observes
    /// `RecvError::Lagged` instead of slowing down appends.
    pub fn subscribe(&self) -> broadcast::Receiver<OutputEvent> {
        self.live.subscribe()
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn snapshot_path(&self) -> &Path {
        &self.snapshot_path
    }

    fn write_log_line(&self, state: &mut SinkState, event: &OutputEvent) -> io::Result<()> {
        if state.log.is_none() {
            if let Some(parent) = self.log_path.parent() {
                fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.log_path)?;
            state.log = Some(file);
        }

        let mut line = event.log_line();
        line.push('\n');

        if let Some(file) = state.log.as_mut() {
            file.write_all(line.as_bytes())?;
            file.flush()?;
        }
        Ok(())
    }

    fn write_snapshot(&self, ring: &VecDeque<OutputEvent>) -> crate::Result<()> {
        let content = serde_json::to_vec_pretty(ring)?;

        if let Some(parent) = self.snapshot_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        // Atomic write: write to temp file, then rename
        let temp_path = self.snapshot_path.with_extension("json.tmp");
        fs::write(&temp_path, content)?;
        fs::rename(&temp_path, &self.snapshot_path)?;
        Ok(())
    }
}

impl std::fmt::Debug for OutputSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputSink")
            .field("log_path", &self.log_path)
            .field("snapshot_path", &self.snapshot_path)
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

fn recover(snapshot_path: &Path, capacity: usize) -> VecDeque<OutputEvent> {
    let bytes = match fs::read(snapshot_path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return VecDeque::new(),
        Err(e) => {
            warn!(path = %snapshot_path.display(), error = %e, "Failed to read output snapshot");
            return VecDeque::new();
        }
    };

    match serde_json::from_slice::<Vec<OutputEvent>>(&bytes) {
        Ok(events) => {
            let skip = events.len().saturating_sub(capacity);
            events.into_iter().skip(skip).collect()
        }
        Err(e) => {
            warn!(path = %snapshot_path.display(), error = %e, "Ignoring corrupt output snapshot");
            VecDeque::new()
        }
    }
}

/// Read the last `n` complete lines of `path`, scanning backwards in blocks
/// so the cost is proportional to the lines wanted, not the file size.
fn read_last_lines(path: &Path, n: usize) -> io::Result<Vec<String>> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    if n == 0 || len == 0 {
        return Ok(Vec::new());
    }

    let mut pos = len;
    let mut chunks: Vec<Vec<u8>> = Vec::new();
    let mut newlines = 0;
    // n + 1 newlines guarantee n complete lines with a known start
    while pos > 0 && newlines <= n {
        let step = TAIL_CHUNK.min(pos);
        pos -= step;
        file.seek(SeekFrom::Start(pos))?;
        let mut chunk = vec![0u8; step as usize];
        file.read_exact(&mut chunk)?;
        newlines += bytecount_newlines(&chunk);
        chunks.push(chunk);
    }
    chunks.reverse();
    let buf = chunks.concat();

    let Some(end) = buf.iter().rposition(|&b| b == b'\n') else {
        return Ok(Vec::new());
    };

    let text = String::from_utf8_lossy(&buf[..end]);
    let mut lines: Vec<&str> = text.split('\n').collect();
    if pos > 0 {
        // Fragment of a line that starts before the scanned region
        lines.remove(0);
    }

    let skip = lines.len().saturating_sub(n);
    Ok(lines
        .into_iter()
        .skip(skip)
        .map(|line| line.trim_end_matches('\r').to_string())
        .collect())
}

/// Read complete lines starting at byte `offset`; returns the lines and the
/// offset just past the last newline consumed.
fn read_lines_from(path: &Path, offset: u64) -> io::Result<(Vec<String>, u64)> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    let start = if offset > len { 0 } else { offset };

    file.seek(SeekFrom::Start(start))?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;

    let Some(last) = buf.iter().rposition(|&b| b == b'\n') else {
        return Ok((Vec::new(), start));
    };

    let lines = String::from_utf8_lossy(&buf[..last])
        .split('\n')
        .map(|line| line.trim_end_matches('\r').to_string())
        .collect();

    Ok((lines, start + last as u64 + 1))
}

fn bytecount_newlines(buf: &[u8]) -> usize {
    buf.iter().filter(|&&b| b == b'\n').count()
}
