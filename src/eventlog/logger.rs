// ABOUTME: Implements EventLogger - queued, single-writer appends to a JSONL
// ABOUTME: operation log, plus replay, statistics, archival, and observers.

use std::io::ErrorKind;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, mpsc, watch};

use super::entry::{ArchiveReport, EventLogEntry, LogFilter, LogInfo, OperationStatistics};
use crate::error::LogError;

/// Lifecycle notifications emitted by the logger.
#[derive(Debug, Clone, PartialEq)]
pub enum LogEvent {
    /// An entry was accepted into the write queue.
    OperationLogged { operation: String },

    /// The writer started appending an entry.
    WriteStart { operation: String },

    /// The writer finished appending an entry.
    WriteComplete { operation: String },

    /// The append failed; the entry is lost.
    WriteFailed { operation: String, error: String },

    /// The write queue drained to zero pending entries.
    QueueEmpty,

    /// A replayed line could not be parsed and was skipped.
    MalformedLine { line: usize, error: String },
}

/// Callback invoked for every [`LogEvent`].
pub type LogObserver = Arc<dyn Fn(&LogEvent) + Send + Sync>;

#[derive(Clone, Default)]
struct Observers(Arc<RwLock<Vec<LogObserver>>>);

impl Observers {
    // Observers run on a snapshot, outside the lock, so they may subscribe
    // further observers. A panicking observer does not stop the writer.
    fn emit(&self, event: &LogEvent) {
        let snapshot: Vec<LogObserver> = self.0.read().clone();
        for observer in &snapshot {
            if catch_unwind(AssertUnwindSafe(|| observer(event))).is_err() {
                tracing::warn!(?event, "log observer panicked");
            }
        }
    }
}

struct QueuedRecord {
    operation: String,
    line: String,
}

/// Durable, append-only operation log.
///
/// [`log_operation`](Self::log_operation) only enqueues; a spawned writer task
/// drains the queue one append at a time so concurrent callers in this process
/// never interleave lines. Nothing here orders writers in other processes.
pub struct EventLogger {
    path: PathBuf,
    sender: mpsc::UnboundedSender<QueuedRecord>,
    pending: Arc<watch::Sender<usize>>,
    observers: Observers,
    // Held by the writer for each append and by whole-file rewrites.
    file_guard: Arc<Mutex<()>>,
}

impl EventLogger {
    /// Create a logger appending to `path` and start its writer task.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let (sender, receiver) = mpsc::unbounded_channel();
        let (pending, _) = watch::channel(0usize);
        let pending = Arc::new(pending);
        let observers = Observers::default();
        let file_guard = Arc::new(Mutex::new(()));

        tokio::spawn(run_writer(
            path.clone(),
            receiver,
            Arc::clone(&pending),
            observers.clone(),
            Arc::clone(&file_guard),
        ));

        Self {
            path,
            sender,
            pending,
            observers,
            file_guard,
        }
    }

    /// Path of the live log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Register an observer for lifecycle notifications.
    pub fn subscribe<F>(&self, observer: F)
    where
        F: Fn(&LogEvent) + Send + Sync + 'static,
    {
        self.observers.0.write().push(Arc::new(observer));
    }

    /// Number of entries queued but not yet appended.
    pub fn pending_writes(&self) -> usize {
        *self.pending.borrow()
    }

    /// Queue an entry for appending. Returns once queued, not once flushed.
    pub fn log_operation(&self, entry: EventLogEntry) -> Result<(), LogError> {
        let line = serde_json::to_string(&entry)?;
        let operation = entry.operation;

        self.pending.send_modify(|n| *n += 1);
        let record = QueuedRecord {
            operation: operation.clone(),
            line,
        };
        if self.sender.send(record).is_err() {
            self.pending.send_modify(|n| *n = n.saturating_sub(1));
            return Err(LogError::WriterClosed);
        }

        self.observers.emit(&LogEvent::OperationLogged { operation });
        Ok(())
    }

    /// Wait until every queued entry has been appended.
    pub async fn wait_for_write_queue_empty(&self, timeout: Duration) -> Result<(), LogError> {
        let mut receiver = self.pending.subscribe();
        match tokio::time::timeout(timeout, receiver.wait_for(|n| *n == 0)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(LogError::WriterClosed),
            Err(_) => Err(LogError::Timeout(timeout)),
        }
    }

    /// Replay entries matching `filter`. Malformed lines are skipped and
    /// reported as [`LogEvent::MalformedLine`].
    pub async fn get_log_entries(&self, filter: &LogFilter) -> Result<Vec<EventLogEntry>, LogError> {
        let raw = {
            let _guard = self.file_guard.lock().await;
            read_if_exists(&self.path).await?
        };

        Ok(self
            .parse_lines(&raw)
            .into_iter()
            .filter_map(|(_, parsed)| parsed)
            .filter(|entry| filter.matches(entry))
            .collect())
    }

    /// Count, success rate, and mean duration, globally and grouped.
    pub async fn get_operation_statistics(&self) -> Result<OperationStatistics, LogError> {
        let entries = self.get_log_entries(&LogFilter::default()).await?;
        Ok(OperationStatistics::from_entries(&entries))
    }

    /// Move entries older than `max_age_days` into a timestamped archive file
    /// beside the live log, keeping the rest (and any unparsable lines) live.
    pub async fn archive_old_entries(&self, max_age_days: u32) -> Result<ArchiveReport, LogError> {
        let _guard = self.file_guard.lock().await;
        let raw = read_if_exists(&self.path).await?;
        let now = Utc::now();
        let cutoff = now - chrono::Duration::days(i64::from(max_age_days));

        let mut archived = Vec::new();
        let mut retained = Vec::new();
        let mut archived_count = 0;
        for (line, parsed) in self.parse_lines(&raw) {
            // Unparsable lines stay live byte for byte.
            let sink = match parsed {
                Some(entry) if entry.timestamp < cutoff => {
                    archived_count += 1;
                    &mut archived
                }
                _ => &mut retained,
            };
            sink.extend_from_slice(line);
            sink.push(b'\n');
        }

        if archived_count == 0 {
            return Ok(ArchiveReport {
                archived_count: 0,
                archive_file: None,
            });
        }

        let archive_file = archive_path(&self.path, now);
        tokio::fs::write(&archive_file, archived).await?;

        let staging = self.path.with_extension("rewrite.tmp");
        tokio::fs::write(&staging, retained).await?;
        tokio::fs::rename(&staging, &self.path).await?;

        tracing::info!(
            archived_count,
            archive = %archive_file.display(),
            "archived old log entries"
        );
        Ok(ArchiveReport {
            archived_count,
            archive_file: Some(archive_file),
        })
    }

    /// Delete the live log. A missing file is not an error.
    pub async fn clear_logs(&self) -> Result<(), LogError> {
        let _guard = self.file_guard.lock().await;
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Size, entry count, and time span of the live log.
    pub async fn get_log_info(&self) -> Result<LogInfo, LogError> {
        let raw = {
            let _guard = self.file_guard.lock().await;
            read_if_exists(&self.path).await?
        };

        let mut info = LogInfo {
            size_bytes: raw.len() as u64,
            ..LogInfo::default()
        };
        for (_, parsed) in self.parse_lines(&raw) {
            let Some(entry) = parsed else { continue };
            info.entry_count += 1;
            let ts = entry.timestamp;
            info.oldest_entry = Some(info.oldest_entry.map_or(ts, |t| t.min(ts)));
            info.newest_entry = Some(info.newest_entry.map_or(ts, |t| t.max(ts)));
        }
        Ok(info)
    }

    /// Parse non-blank lines, reporting failures to observers. Lines are raw
    /// bytes so a torn or non-UTF-8 line is skipped rather than failing the read.
    fn parse_lines<'a>(&self, raw: &'a [u8]) -> Vec<(&'a [u8], Option<EventLogEntry>)> {
        raw.split(|b| *b == b'\n')
            .enumerate()
            .filter(|(_, line)| !line.iter().all(u8::is_ascii_whitespace))
            .map(|(index, line)| match serde_json::from_slice::<EventLogEntry>(line) {
                Ok(entry) => (line, Some(entry)),
                Err(e) => {
                    tracing::warn!(line = index + 1, error = %e, "skipping malformed log line");
                    self.observers.emit(&LogEvent::MalformedLine {
                        line: index + 1,
                        error: e.to_string(),
                    });
                    (line, None)
                }
            })
            .collect()
    }
}

async fn run_writer(
    path: PathBuf,
    mut receiver: mpsc::UnboundedReceiver<QueuedRecord>,
    pending: Arc<watch::Sender<usize>>,
    observers: Observers,
    file_guard: Arc<Mutex<()>>,
) {
    while let Some(record) = receiver.recv().await {
        observers.emit(&LogEvent::WriteStart {
            operation: record.operation.clone(),
        });

        let result = {
            let _guard = file_guard.lock().await;
            append_line(&path, &record.line).await
        };
        match result {
            Ok(()) => observers.emit(&LogEvent::WriteComplete {
                operation: record.operation,
            }),
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "failed to append log entry");
                observers.emit(&LogEvent::WriteFailed {
                    operation: record.operation,
                    error: e.to_string(),
                });
            }
        }

        let mut drained = false;
        pending.send_modify(|n| {
            *n = n.saturating_sub(1);
            drained = *n == 0;
        });
        if drained {
            observers.emit(&LogEvent::QueueEmpty);
        }
    }
    tracing::debug!(path = %path.display(), "log writer stopped");
}

async fn append_line(path: &Path, line: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }

    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    let mut buf = String::with_capacity(line.len() + 1);
    buf.push_str(line);
    buf.push('\n');
    file.write_all(buf.as_bytes()).await?;
    file.flush().await
}

async fn read_if_exists(path: &Path) -> Result<Vec<u8>, LogError> {
    match tokio::fs::read(path).await {
        Ok(raw) => Ok(raw),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

/// `<dir>/<stem>-archive-<YYYYMMDDTHHMMSSmmmZ>.<ext>` beside the live log.
fn archive_path(live: &Path, now: DateTime<Utc>) -> PathBuf {
    let stem = live
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "operations".to_string());
    let extension = live
        .extension()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "jsonl".to_string());
    live.with_file_name(format!(
        "{stem}-archive-{}.{extension}",
        now.format("%Y%m%dT%H%M%S%3fZ")
    ))
}
