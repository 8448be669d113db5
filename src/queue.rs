//! Durable FIFO queue with decoupled soft-delete and flush.
//!
//! The backing store is an append-only JSON-lines log plus a consumption
//! cursor persisted in a sidecar checkpoint file. `delete` only marks
//! records consumed in memory; the cursor moves on disk when `flush` runs.
//! A crash between the two replays the soft-deleted records on reopen,
//! which is exactly the at-least-once contract the delivery protocols rely
//! on. Flush cadence is caller policy: the pull service flushes on every
//! request, the push agent amortizes over a confirmation window.

use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use tracing::{debug, info};

use crate::record::Record;

/// Errors raised by the durable queue.
#[derive(Debug)]
pub enum QueueError {
    /// Backing store unreadable or inconsistent at open time.
    ///
    /// Fatal: requires manual intervention and must never be silently
    /// recovered.
    Corruption { path: PathBuf, reason: String },

    /// I/O failure against the backing store
    Io(std::io::Error),

    /// A record could not be encoded for the log
    Encode(serde_json::Error),
}

impl std::fmt::Display for QueueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueError::Corruption { path, reason } => {
                write!(f, "queue store {} is corrupt: {}", path.display(), reason)
            }
            QueueError::Io(e) => write!(f, "queue I/O error: {}", e),
            QueueError::Encode(e) => write!(f, "failed to encode record for log: {}", e),
        }
    }
}

impl std::error::Error for QueueError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            QueueError::Io(e) => Some(e),
            QueueError::Encode(e) => Some(e),
            QueueError::Corruption { .. } => None,
        }
    }
}

impl From<std::io::Error> for QueueError {
    fn from(err: std::io::Error) -> Self {
        QueueError::Io(err)
    }
}

/// State guarded by the queue mutex.
struct QueueInner {
    /// Append handle to the log file
    log: File,

    /// Records pushed but not yet soft-deleted
    records: VecDeque<Record>,

    /// Durable cursor: records consumed from the start of the log
    consumed: u64,

    /// Records soft-deleted since the last flush
    soft_deleted: u64,
}

/// Append-only, crash-safe FIFO of reading records.
///
/// Created once at process start and shared by the producer loop and the
/// active delivery component. A single mutex guards all queue state; lock
/// hold times are bounded by local file appends, never network I/O.
pub struct DurableQueue {
    log_path: PathBuf,
    cursor_path: PathBuf,
    inner: Mutex<QueueInner>,
    notify: Notify,
}

impl DurableQueue {
    /// Open or create the queue backing store at `path`.
    ///
    /// Replays the log past the persisted cursor into memory. Any
    /// inconsistency (unparsable cursor, cursor beyond the log, malformed
    /// log line) is reported as [`QueueError::Corruption`] and must abort
    /// startup.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, QueueError> {
        let log_path = path.as_ref().to_path_buf();
        let cursor_path = sidecar_cursor_path(&log_path);

        let consumed = read_cursor(&cursor_path)?;
        let records = replay_log(&log_path, consumed)?;

        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;

        info!(
            path = %log_path.display(),
            consumed = consumed,
            pending = records.len(),
            "Opened durable queue"
        );

        Ok(Self {
            log_path,
            cursor_path,
            inner: Mutex::new(QueueInner {
                log,
                records,
                consumed,
                soft_deleted: 0,
            }),
            notify: Notify::new(),
        })
    }

    /// Append a record to the durable log and wake any blocked peek.
    ///
    /// Returns once the record is written to the backing store; never
    /// blocks on network.
    pub fn push(&self, record: Record) -> Result<(), QueueError> {
        let mut line = serde_json::to_vec(&record).map_err(QueueError::Encode)?;
        line.push(b'\n');

        {
            let mut inner = self.lock();
            inner.log.write_all(&line)?;
            inner.log.flush()?;
            inner.records.push_back(record);
            debug!(length = inner.records.len(), "Pushed record into queue");
        }

        self.notify.notify_waiters();
        Ok(())
    }

    /// Return the oldest `min(n, len)` records without removing them.
    ///
    /// Idempotent: repeated calls with no intervening delete return
    /// identical results. An empty queue yields an empty vec.
    pub fn peek(&self, n: usize) -> Vec<Record> {
        let inner = self.lock();
        inner.records.iter().take(n).cloned().collect()
    }

    /// Like [`peek`](Self::peek), but suspends until at least one record is
    /// available.
    ///
    /// Never spins; wake-up is driven by [`push`](Self::push). The caller
    /// cancels by racing this future against the shutdown signal in
    /// `select!`.
    pub async fn peek_blocking(&self, n: usize) -> Vec<Record> {
        loop {
            // Register interest before checking, so a push between the
            // check and the await cannot be missed.
            let notified = self.notify.notified();

            {
                let inner = self.lock();
                if !inner.records.is_empty() {
                    return inner.records.iter().take(n).cloned().collect();
                }
            }

            notified.await;
        }
    }

    /// Soft-delete the oldest `min(k, len)` records.
    ///
    /// In-memory only; not durable until [`flush`](Self::flush) returns.
    /// Returns the number of records actually deleted.
    pub fn delete(&self, k: usize) -> usize {
        let mut inner = self.lock();
        let count = k.min(inner.records.len());
        inner.records.drain(..count);
        inner.soft_deleted += count as u64;
        debug!(
            deleted = count,
            remaining = inner.records.len(),
            "Soft-deleted records"
        );
        count
    }

    /// Persist the consumption cursor so soft-deleted records are not
    /// replayed after a crash.
    ///
    /// When the queue is fully consumed this also compacts the backing
    /// store: the cursor is reset first, then the log is truncated, so a
    /// crash in between replays rather than loses records.
    pub fn flush(&self) -> Result<(), QueueError> {
        let mut inner = self.lock();
        let new_consumed = inner.consumed + inner.soft_deleted;

        if inner.records.is_empty() && new_consumed > 0 {
            write_cursor(&self.cursor_path, 0)?;
            inner.log.set_len(0)?;
            inner.consumed = 0;
            inner.soft_deleted = 0;
            debug!(path = %self.log_path.display(), "Compacted queue store");
            return Ok(());
        }

        if inner.soft_deleted > 0 {
            write_cursor(&self.cursor_path, new_consumed)?;
            inner.consumed = new_consumed;
            inner.soft_deleted = 0;
            debug!(cursor = new_consumed, "Flushed consumption cursor");
        }

        Ok(())
    }

    /// Count of records not yet soft-deleted.
    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    /// Whether the queue currently holds no records.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Final flush on shutdown.
    pub fn close(&self) -> Result<(), QueueError> {
        self.flush()
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        // A poisoned lock means a panic mid-operation; the state itself is
        // still consistent (every mutation is single-step), so keep going.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// The cursor checkpoint lives next to the log with a `.cursor` suffix.
fn sidecar_cursor_path(log_path: &Path) -> PathBuf {
    let mut name = log_path.as_os_str().to_os_string();
    name.push(".cursor");
    PathBuf::from(name)
}

fn read_cursor(cursor_path: &Path) -> Result<u64, QueueError> {
    if !cursor_path.exists() {
        return Ok(0);
    }

    let contents = fs::read_to_string(cursor_path)?;
    contents
        .trim()
        .parse::<u64>()
        .map_err(|_| QueueError::Corruption {
            path: cursor_path.to_path_buf(),
            reason: format!("unparsable cursor value '{}'", contents.trim()),
        })
}

fn write_cursor(cursor_path: &Path, consumed: u64) -> Result<(), QueueError> {
    // Write-then-rename so the checkpoint is never observed half-written.
    let tmp_path = cursor_path.with_extension("cursor.tmp");
    let mut tmp = File::create(&tmp_path)?;
    tmp.write_all(consumed.to_string().as_bytes())?;
    tmp.sync_all()?;
    fs::rename(&tmp_path, cursor_path)?;
    Ok(())
}

fn replay_log(log_path: &Path, consumed: u64) -> Result<VecDeque<Record>, QueueError> {
    if !log_path.exists() {
        if consumed > 0 {
            return Err(QueueError::Corruption {
                path: log_path.to_path_buf(),
                reason: format!("cursor is {} but the log is missing", consumed),
            });
        }
        return Ok(VecDeque::new());
    }

    let contents = fs::read_to_string(log_path)?;
    let lines: Vec<&str> = contents.lines().collect();

    if (lines.len() as u64) < consumed {
        return Err(QueueError::Corruption {
            path: log_path.to_path_buf(),
            reason: format!(
                "cursor is {} but the log holds only {} records",
                consumed,
                lines.len()
            ),
        });
    }

    let mut records = VecDeque::with_capacity(lines.len() - consumed as usize);
    for (index, line) in lines.iter().enumerate().skip(consumed as usize) {
        let record: Record =
            serde_json::from_str(line).map_err(|e| QueueError::Corruption {
                path: log_path.to_path_buf(),
                reason: format!("malformed record at line {}: {}", index + 1, e),
            })?;
        records.push_back(record);
    }

    Ok(records)
}
