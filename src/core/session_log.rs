//! Purpose: Persist a board's console output to rotated, timestamped segment files, plus an
//!          input journal of who sent what to the device.
//! Exports: `SessionLogger`, `SessionLogConfig`, `LoggerStatus`, `LoggerStatusHandle`, `LogSegment`,
//!          `list_segments`, `read_segment`, `list_journals`.
//! Role: Optional sink fed by the proxy link task; independent of how many sessions are attached.
//! Invariants: `record` never blocks the caller; file I/O happens on a dedicated blocking worker.
//! Invariants: Segments hold raw device bytes, so concatenating them in name order reproduces
//!             the recorded stream.
//! Invariants: Input goes to a sidecar `<segment>.input.log` journal (one escaped line per write,
//!             tagged with the session), never into the output segment.
//! Invariants: Failures are captured in `LoggerStatus::last_error`; the next record retries with
//!             a fresh segment.
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle as ThreadHandle;
use std::time::{Duration, Instant, SystemTime};

use bstr::ByteSlice;
use bytes::Bytes;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::core::error::{Error, ErrorKind};
use crate::core::session::SessionId;

const SEGMENT_EXT: &str = ".log";
const COMPRESSED_EXT: &str = ".log.gz";
const JOURNAL_EXT: &str = ".input.log";

#[derive(Clone, Debug)]
pub struct SessionLogConfig {
    pub dir: PathBuf,
    pub max_segment_bytes: u64,
    pub max_segment_age: Duration,
    pub compress: bool,
    pub retention: Option<Duration>,
}

#[derive(Clone, Debug, Default)]
pub struct LoggerStatus {
    pub dir: PathBuf,
    pub current_segment: Option<PathBuf>,
    pub segment_bytes: u64,
    pub total_bytes: u64,
    pub segments_rotated: u64,
    /// Bytes written to the device and recorded in the input journal.
    pub input_bytes: u64,
    pub last_error: Option<String>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LogSegment {
    pub path: PathBuf,
    pub started_at: Option<OffsetDateTime>,
    pub bytes: u64,
    pub compressed: bool,
}

/// Cheap read-only view of a logger's status that outlives borrowing the logger.
#[derive(Clone)]
pub struct LoggerStatusHandle(Arc<Mutex<LoggerStatus>>);

impl LoggerStatusHandle {
    pub fn get(&self) -> LoggerStatus {
        lock_status(&self.0).clone()
    }
}

enum LogCommand {
    Record(Bytes, OffsetDateTime),
    Input(SessionId, Bytes, OffsetDateTime),
    RotateExpired,
    Sweep,
    Flush(oneshot::Sender<()>),
}

pub struct SessionLogger {
    tx: mpsc::UnboundedSender<LogCommand>,
    status: Arc<Mutex<LoggerStatus>>,
    worker: JoinHandle<()>,
}

impl SessionLogger {
    /// Must be called from within a tokio runtime.
    pub fn start(board: &str, config: SessionLogConfig) -> Self {
        let board_dir = config.dir.join(board);
        let status = Arc::new(Mutex::new(LoggerStatus {
            dir: board_dir.clone(),
            ..LoggerStatus::default()
        }));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut writer = SegmentWriter::new(board.to_string(), board_dir, config, Arc::clone(&status));
        let worker = tokio::task::spawn_blocking(move || {
            while let Some(command) = rx.blocking_recv() {
                match command {
                    LogCommand::Record(bytes, at) => writer.record(&bytes, at),
                    LogCommand::Input(session, bytes, at) => writer.record_input(session, &bytes, at),
                    LogCommand::RotateExpired => writer.rotate_expired(),
                    LogCommand::Sweep => writer.sweep(),
                    LogCommand::Flush(done) => {
                        writer.flush();
                        let _ = done.send(());
                    }
                }
            }
            writer.finish();
        });
        Self { tx, status, worker }
    }

    pub fn record(&self, bytes: Bytes, at: OffsetDateTime) {
        if self.tx.send(LogCommand::Record(bytes, at)).is_err() {
            set_error(&self.status, "session log worker is gone");
        }
    }

    /// Journals bytes that `session` got written to the device.
    pub fn record_input(&self, session: SessionId, bytes: Bytes, at: OffsetDateTime) {
        if self.tx.send(LogCommand::Input(session, bytes, at)).is_err() {
            set_error(&self.status, "session log worker is gone");
        }
    }

    /// Closes the current segment if it is older than `max_segment_age`, even on a quiet board.
    pub fn rotate_expired(&self) {
        let _ = self.tx.send(LogCommand::RotateExpired);
    }

    pub fn sweep(&self) {
        let _ = self.tx.send(LogCommand::Sweep);
    }

    /// Resolves once everything recorded so far has been written.
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        if self.tx.send(LogCommand::Flush(done)).is_ok() {
            let _ = wait.await;
        }
    }

    pub fn status(&self) -> LoggerStatus {
        lock_status(&self.status).clone()
    }

    pub fn status_handle(&self) -> LoggerStatusHandle {
        LoggerStatusHandle(Arc::clone(&self.status))
    }

    /// Closes the current segment and waits for pending compression.
    pub async fn close(self) {
        let SessionLogger { tx, worker, .. } = self;
        drop(tx);
        if let Err(err) = worker.await {
            tracing::warn!(error = %err, "session log worker panicked");
        }
    }
}

struct OpenSegment {
    path: PathBuf,
    file: File,
    opened: Instant,
    bytes: u64,
    journal: Option<File>,
}

impl OpenSegment {
    fn journal_path(&self) -> PathBuf {
        journal_path_for(&self.path)
    }
}

struct SegmentWriter {
    board: String,
    dir: PathBuf,
    config: SessionLogConfig,
    status: Arc<Mutex<LoggerStatus>>,
    current: Option<OpenSegment>,
    next_seq: Option<u64>,
    compressors: Vec<ThreadHandle<()>>,
}

impl SegmentWriter {
    fn new(
        board: String,
        dir: PathBuf,
        config: SessionLogConfig,
        status: Arc<Mutex<LoggerStatus>>,
    ) -> Self {
        Self {
            board,
            dir,
            config,
            status,
            current: None,
            next_seq: None,
            compressors: Vec::new(),
        }
    }

    fn record(&mut self, bytes: &[u8], at: OffsetDateTime) {
        let mut remaining = bytes;
        while !remaining.is_empty() {
            if self.current.as_ref().is_some_and(|segment| self.is_full(segment)) {
                self.rotate();
            }
            if self.current.is_none() {
                if let Err(err) = self.open_segment(at) {
                    self.fail(err);
                    return;
                }
            }
            let Some(segment) = self.current.as_mut() else {
                return;
            };
            let room = self.config.max_segment_bytes.saturating_sub(segment.bytes).max(1);
            let take = remaining.len().min(room as usize);
            if let Err(err) = segment.file.write_all(&remaining[..take]) {
                let path = segment.path.clone();
                self.current = None;
                self.fail(
                    Error::new(ErrorKind::Logging)
                        .with_message(format!("failed to write {}", path.display()))
                        .with_source(err),
                );
                return;
            }
            segment.bytes += take as u64;
            let segment_bytes = segment.bytes;
            remaining = &remaining[take..];

            let mut status = lock_status(&self.status);
            status.segment_bytes = segment_bytes;
            status.total_bytes += take as u64;
        }
    }

    fn record_input(&mut self, session: SessionId, bytes: &[u8], at: OffsetDateTime) {
        if self.current.as_ref().is_some_and(|segment| self.is_full(segment)) {
            self.rotate();
        }
        if self.current.is_none() {
            if let Err(err) = self.open_segment(at) {
                self.fail(err);
                return;
            }
        }
        let Some(segment) = self.current.as_mut() else {
            return;
        };
        let stamp = at.format(&Rfc3339).unwrap_or_else(|_| "-".to_string());
        let line = format!("{stamp} {session} {:?}\n", bytes.as_bstr());
        let path = segment.journal_path();
        if segment.journal.is_none() {
            match OpenOptions::new().create(true).append(true).open(&path) {
                Ok(journal) => segment.journal = Some(journal),
                Err(err) => {
                    self.fail(
                        Error::new(ErrorKind::Logging)
                            .with_message(format!("failed to open {}", path.display()))
                            .with_source(err),
                    );
                    return;
                }
            }
        }
        let written = match segment.journal.as_mut() {
            Some(journal) => journal.write_all(line.as_bytes()),
            None => Ok(()),
        };
        match written {
            Ok(()) => lock_status(&self.status).input_bytes += bytes.len() as u64,
            Err(err) => {
                segment.journal = None;
                self.fail(
                    Error::new(ErrorKind::Logging)
                        .with_message(format!("failed to write {}", path.display()))
                        .with_source(err),
                );
            }
        }
    }

    fn rotate_expired(&mut self) {
        let expired = self
            .current
            .as_ref()
            .is_some_and(|segment| segment.opened.elapsed() >= self.config.max_segment_age);
        if expired {
            self.rotate();
        }
    }

    fn is_full(&self, segment: &OpenSegment) -> bool {
        segment.bytes >= self.config.max_segment_bytes
            || segment.opened.elapsed() >= self.config.max_segment_age
    }

    fn open_segment(&mut self, at: OffsetDateTime) -> Result<(), Error> {
        fs::create_dir_all(&self.dir).map_err(|err| {
            Error::new(ErrorKind::Logging)
                .with_message(format!("failed to create {}", self.dir.display()))
                .with_source(err)
        })?;
        let seq = match self.next_seq {
            Some(seq) => seq,
            None => highest_seq(&self.dir, &self.board) + 1,
        };
        self.next_seq = Some(seq + 1);
        let stamp = at
            .format(format_description!("[year][month][day]T[hour][minute][second]"))
            .unwrap_or_else(|_| "00000000T000000".to_string());
        let path = self
            .dir
            .join(format!("{}_{stamp}_{seq:06}{SEGMENT_EXT}", self.board));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|err| {
                Error::new(ErrorKind::Logging)
                    .with_message(format!("failed to open {}", path.display()))
                    .with_source(err)
            })?;
        tracing::debug!(board = %self.board, segment = %path.display(), "opened log segment");
        let mut status = lock_status(&self.status);
        status.current_segment = Some(path.clone());
        status.segment_bytes = 0;
        status.last_error = None;
        drop(status);
        self.current = Some(OpenSegment {
            path,
            file,
            opened: Instant::now(),
            bytes: 0,
            journal: None,
        });
        Ok(())
    }

    fn rotate(&mut self) {
        let Some(segment) = self.current.take() else {
            return;
        };
        if let Err(err) = segment.file.sync_all() {
            tracing::debug!(segment = %segment.path.display(), error = %err, "sync before rotation failed");
        }
        drop(segment.file);
        tracing::info!(
            board = %self.board,
            segment = %segment.path.display(),
            bytes = segment.bytes,
            "rotated log segment"
        );
        {
            let mut status = lock_status(&self.status);
            status.segments_rotated += 1;
            status.current_segment = None;
            status.segment_bytes = 0;
        }
        if self.config.compress {
            self.spawn_compression(segment.path);
        }
        self.sweep();
    }

    fn spawn_compression(&mut self, path: PathBuf) {
        self.compressors.retain(|handle| !handle.is_finished());
        let status = Arc::clone(&self.status);
        let spawned = std::thread::Builder::new()
            .name("labctl-gzip".to_string())
            .spawn(move || {
                if let Err(err) = compress_segment(&path) {
                    tracing::warn!(segment = %path.display(), error = %err, "segment compression failed");
                    set_error(&status, &err.to_string());
                }
            });
        match spawned {
            Ok(handle) => self.compressors.push(handle),
            Err(err) => self.fail(
                Error::new(ErrorKind::Logging)
                    .with_message("failed to spawn compression thread")
                    .with_source(err),
            ),
        }
    }

    fn sweep(&mut self) {
        let Some(retention) = self.config.retention else {
            return;
        };
        let Some(cutoff) = SystemTime::now().checked_sub(retention) else {
            return;
        };
        let segments = match list_segments_in(&self.dir, &self.board) {
            Ok(segments) => segments,
            Err(err) if err.kind() == ErrorKind::NotFound => return,
            Err(err) => {
                self.fail(err);
                return;
            }
        };
        let journals = list_journals_in(&self.dir, &self.board).unwrap_or_default();
        let current = self.current.as_ref().map(|segment| segment.path.clone());
        let current_journal = current.as_deref().map(journal_path_for);
        let paths = segments
            .into_iter()
            .map(|segment| segment.path)
            .chain(journals);
        for path in paths {
            if Some(&path) == current.as_ref() || Some(&path) == current_journal.as_ref() {
                continue;
            }
            let modified = fs::metadata(&path).and_then(|meta| meta.modified());
            let expired = modified.is_ok_and(|modified| modified <= cutoff);
            if !expired {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => {
                    tracing::info!(board = %self.board, file = %path.display(), "removed expired log file")
                }
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => self.fail(
                    Error::new(ErrorKind::Logging)
                        .with_message(format!("failed to remove {}", path.display()))
                        .with_source(err),
                ),
            }
        }
    }

    fn flush(&mut self) {
        if let Some(segment) = self.current.as_mut() {
            let flushed = segment.file.flush().and_then(|()| match segment.journal.as_mut() {
                Some(journal) => journal.flush(),
                None => Ok(()),
            });
            if let Err(err) = flushed {
                let path = segment.path.clone();
                self.fail(
                    Error::new(ErrorKind::Logging)
                        .with_message(format!("failed to flush {}", path.display()))
                        .with_source(err),
                );
            }
        }
    }

    fn finish(&mut self) {
        self.flush();
        if let Some(segment) = self.current.take() {
            drop(segment.file);
            if self.config.compress && segment.bytes > 0 {
                self.spawn_compression(segment.path);
            }
        }
        for handle in self.compressors.drain(..) {
            let _ = handle.join();
        }
    }

    fn fail(&self, err: Error) {
        tracing::warn!(board = %self.board, error = %err, "session logging degraded");
        set_error(&self.status, &err.to_string());
    }
}

fn lock_status(status: &Mutex<LoggerStatus>) -> MutexGuard<'_, LoggerStatus> {
    status.lock().unwrap_or_else(|poison| poison.into_inner())
}

fn set_error(status: &Mutex<LoggerStatus>, message: &str) {
    lock_status(status).last_error = Some(message.to_string());
}

fn compress_segment(path: &Path) -> Result<(), Error> {
    let io_error = |what: &str, err: io::Error| {
        Error::new(ErrorKind::Logging)
            .with_message(format!("failed to {what} {}", path.display()))
            .with_source(err)
    };
    let base = path.to_string_lossy();
    let stem = base.strip_suffix(SEGMENT_EXT).unwrap_or(&base);
    let target = PathBuf::from(format!("{stem}{COMPRESSED_EXT}"));
    let staging = PathBuf::from(format!("{stem}{COMPRESSED_EXT}.tmp"));

    let mut input = File::open(path).map_err(|err| io_error("open", err))?;
    let output = File::create(&staging).map_err(|err| io_error("create archive for", err))?;
    let mut encoder = GzEncoder::new(output, Compression::default());
    io::copy(&mut input, &mut encoder).map_err(|err| io_error("compress", err))?;
    let output = encoder.finish().map_err(|err| io_error("finish archive for", err))?;
    output.sync_all().map_err(|err| io_error("sync archive for", err))?;
    fs::rename(&staging, &target).map_err(|err| io_error("publish archive for", err))?;
    fs::remove_file(path).map_err(|err| io_error("remove", err))?;
    Ok(())
}

fn segment_seq(name: &str, board: &str) -> Option<u64> {
    let rest = name.strip_prefix(board)?.strip_prefix('_')?;
    let rest = rest
        .strip_suffix(COMPRESSED_EXT)
        .or_else(|| rest.strip_suffix(SEGMENT_EXT))?;
    let (stamp, seq) = rest.rsplit_once('_')?;
    if stamp.len() != 15 {
        return None;
    }
    seq.parse().ok()
}

fn journal_seq(name: &str, board: &str) -> Option<u64> {
    let rest = name.strip_prefix(board)?.strip_prefix('_')?;
    let (stamp, seq) = rest.strip_suffix(JOURNAL_EXT)?.rsplit_once('_')?;
    if stamp.len() != 15 {
        return None;
    }
    seq.parse().ok()
}

fn journal_path_for(segment: &Path) -> PathBuf {
    let base = segment.to_string_lossy();
    let stem = base.strip_suffix(SEGMENT_EXT).unwrap_or(&base);
    PathBuf::from(format!("{stem}{JOURNAL_EXT}"))
}

fn segment_started_at(name: &str, board: &str) -> Option<OffsetDateTime> {
    let rest = name.strip_prefix(board)?.strip_prefix('_')?;
    let stamp = rest.get(..15)?;
    let format = format_description!("[year][month][day]T[hour][minute][second]");
    time::PrimitiveDateTime::parse(stamp, format)
        .ok()
        .map(|value| value.assume_utc())
}

fn highest_seq(dir: &Path, board: &str) -> u64 {
    list_segments_in(dir, board)
        .unwrap_or_default()
        .iter()
        .filter_map(|segment| {
            let name = segment.path.file_name()?.to_str()?;
            segment_seq(name, board)
        })
        .max()
        .unwrap_or(0)
}

fn read_log_dir(dir: &Path) -> Result<fs::ReadDir, Error> {
    fs::read_dir(dir).map_err(|err| {
        let kind = if err.kind() == io::ErrorKind::NotFound {
            ErrorKind::NotFound
        } else {
            ErrorKind::Io
        };
        Error::new(kind)
            .with_message(format!("failed to read {}", dir.display()))
            .with_source(err)
    })
}

fn list_segments_in(dir: &Path, board: &str) -> Result<Vec<LogSegment>, Error> {
    let entries = read_log_dir(dir)?;
    let mut segments: BTreeMap<u64, LogSegment> = BTreeMap::new();
    for entry in entries.flatten() {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
            continue;
        };
        let Some(seq) = segment_seq(name, board) else {
            continue;
        };
        let segment = LogSegment {
            started_at: segment_started_at(name, board),
            compressed: name.ends_with(COMPRESSED_EXT),
            bytes: entry.metadata().map(|meta| meta.len()).unwrap_or(0),
            path,
        };
        // A published archive wins over the plain file it is about to replace.
        if segments.get(&seq).is_some_and(|seen| seen.compressed) {
            continue;
        }
        segments.insert(seq, segment);
    }
    Ok(segments.into_values().collect())
}

fn list_journals_in(dir: &Path, board: &str) -> Result<Vec<PathBuf>, Error> {
    let mut journals: Vec<(u64, PathBuf)> = read_log_dir(dir)?
        .flatten()
        .filter_map(|entry| {
            let path = entry.path();
            let seq = journal_seq(path.file_name()?.to_str()?, board)?;
            Some((seq, path))
        })
        .collect();
    journals.sort_by_key(|(seq, _)| *seq);
    Ok(journals.into_iter().map(|(_, path)| path).collect())
}

/// Input journals recorded for `board` under the logger root `dir`, oldest first.
pub fn list_journals(dir: &Path, board: &str) -> Result<Vec<PathBuf>, Error> {
    list_journals_in(&dir.join(board), board)
}

/// Segments recorded for `board` under the logger root `dir`, oldest first.
pub fn list_segments(dir: &Path, board: &str) -> Result<Vec<LogSegment>, Error> {
    list_segments_in(&dir.join(board), board)
}

/// Reads a segment back, decompressing archived ones.
pub fn read_segment(segment: &LogSegment) -> Result<Vec<u8>, Error> {
    let io_error = |err: io::Error| {
        Error::new(ErrorKind::Io)
            .with_message(format!("failed to read {}", segment.path.display()))
            .with_source(err)
    };
    let file = File::open(&segment.path).map_err(io_error)?;
    let mut out = Vec::new();
    if segment.compressed {
        GzDecoder::new(file).read_to_end(&mut out).map_err(io_error)?;
    } else {
        let mut file = file;
        file.read_to_end(&mut out).map_err(io_error)?;
    }
    Ok(out)
}
