//! Quarantine store for records that could not be validated or delivered.
//!
//! Structurally the same backing store as the main queue (append-only JSON
//! lines), but write-once: quarantined records are never automatically
//! retried. They exist purely for offline forensic recovery.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{info, warn};

use crate::queue::{DurableQueue, QueueError};
use crate::record::{QuarantineRecord, Record, SerializationError};

struct StoreInner {
    log: File,
    count: u64,
}

/// Durable side-channel for poison records.
pub struct QuarantineStore {
    path: PathBuf,
    inner: Mutex<StoreInner>,
}

impl QuarantineStore {
    /// Open or create the quarantine backing store at `path`.
    ///
    /// An unreadable store is fatal for the same reason the main queue's
    /// is: silently dropping forensic data defeats its purpose.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, QueueError> {
        let path = path.as_ref().to_path_buf();

        let count = if path.exists() {
            let contents = fs::read_to_string(&path)?;
            for (index, line) in contents.lines().enumerate() {
                serde_json::from_str::<QuarantineRecord>(line).map_err(|e| {
                    QueueError::Corruption {
                        path: path.clone(),
                        reason: format!("malformed quarantine record at line {}: {}", index + 1, e),
                    }
                })?;
            }
            contents.lines().count() as u64
        } else {
            0
        };

        let log = OpenOptions::new().create(true).append(true).open(&path)?;

        info!(path = %path.display(), count = count, "Opened quarantine store");

        Ok(Self {
            path,
            inner: Mutex::new(StoreInner { log, count }),
        })
    }

    /// Durably append a quarantine record. Written once, never retried.
    pub fn write(&self, message: impl Into<String>, payload: Vec<u8>) -> Result<(), QueueError> {
        let record = QuarantineRecord::new(message, payload);
        let mut line = serde_json::to_vec(&record).map_err(QueueError::Encode)?;
        line.push(b'\n');

        let mut inner = self.lock();
        inner.log.write_all(&line)?;
        inner.log.flush()?;
        inner.count += 1;

        warn!(
            id = %record.id,
            reason = %record.message,
            total = inner.count,
            "Quarantined a record"
        );
        Ok(())
    }

    /// Number of quarantined records.
    pub fn len(&self) -> u64 {
        self.lock().count
    }

    /// Whether the store holds no records.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read every quarantined record back, oldest first.
    ///
    /// Forensic access only; nothing in the delivery pipeline consumes
    /// these.
    pub fn records(&self) -> Result<Vec<QuarantineRecord>, QueueError> {
        let contents = fs::read_to_string(&self.path)?;
        let mut records = Vec::new();
        for line in contents.lines() {
            let record =
                serde_json::from_str(line).map_err(|e| QueueError::Corruption {
                    path: self.path.clone(),
                    reason: format!("malformed quarantine record: {}", e),
                })?;
            records.push(record);
        }
        Ok(records)
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Move poisoned records off the head of the main queue into quarantine.
///
/// Called by both delivery components before encoding for the wire. Each
/// head record that fails validation is written to the quarantine store and
/// the main queue's cursor advances (`delete` + `flush`), so a single
/// poisoned record cannot block the pipeline. Returns how many records were
/// quarantined.
pub fn sweep_poisoned(
    queue: &DurableQueue,
    quarantine: &QuarantineStore,
) -> Result<usize, QueueError> {
    let mut swept = 0;

    loop {
        let head = match queue.peek(1).into_iter().next() {
            Some(record) => head_failure(&record),
            None => break,
        };

        match head {
            None => break,
            Some((record, error)) => {
                let payload = serde_json::to_vec(&record).unwrap_or_default();
                quarantine.write(error.to_string(), payload)?;
                queue.delete(1);
                queue.flush()?;
                swept += 1;
            }
        }
    }

    Ok(swept)
}

fn head_failure(record: &Record) -> Option<(Record, SerializationError)> {
    match record.validate() {
        Ok(()) => None,
        Err(error) => Some((record.clone(), error)),
    }
}
