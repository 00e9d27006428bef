//! Append-only saga log.
//!
//! Every job and task transition is appended here before it is applied in
//! memory. Replaying the log from the start through the same transition
//! function reproduces the scheduler state.
//!
//! # Backends
//!
//! - [`MemorySagaLog`]: process-local, used by tests and the `local.memory` preset
//! - [`FileSagaLog`]: JSON lines, synced to disk on every append
//!
//! # Ordering
//!
//! Appends are linearized by a lock inside each backend; the backend assigns
//! the sequence number, so no two entries share a position.

pub mod entry;
pub mod file;

use std::sync::Mutex;

use thiserror::Error;

pub use entry::{SagaEntry, SagaRecord, Transition};
pub use file::FileSagaLog;

#[derive(Error, Debug)]
pub enum SagaLogError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("Corrupt saga log at line {line}: {reason}")]
    Corrupt { line: u64, reason: String },

    #[error("Saga log lock poisoned")]
    Poisoned,
}

/// Lazy, ordered replay of every entry currently in the log.
pub type Replay = Box<dyn Iterator<Item = Result<SagaEntry, SagaLogError>> + Send>;

pub trait SagaLog: Send + Sync + std::fmt::Debug {
    /// Durably append a transition, returning it with its sequence number.
    fn append(&self, record: SagaRecord) -> Result<SagaEntry, SagaLogError>;

    /// Replay from offset 0. Each call starts a fresh pass.
    fn replay(&self) -> Result<Replay, SagaLogError>;

    /// Number of entries in the log.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Replace the whole log with `entries`, which must be strictly
    /// increasing and below the next sequence number. Later appends keep
    /// numbering where the old log left off. Must be atomic: a crash leaves
    /// either the old or the new log.
    fn compact(&self, entries: Vec<SagaEntry>) -> Result<(), SagaLogError>;
}

/// Reject compaction input that would reorder or reuse positions.
pub(crate) fn check_compaction(entries: &[SagaEntry], next_seq: u64) -> Result<(), SagaLogError> {
    let mut floor: Option<u64> = None;
    for (i, entry) in entries.iter().enumerate() {
        let in_order = floor.map_or(true, |prev| entry.seq > prev);
        if !in_order || entry.seq >= next_seq {
            return Err(SagaLogError::Corrupt {
                line: i as u64 + 1,
                reason: format!("compacted entry has sequence {}", entry.seq),
            });
        }
        floor = Some(entry.seq);
    }
    Ok(())
}

#[derive(Debug, Default)]
pub struct MemorySagaLog {
    inner: Mutex<MemoryInner>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    entries: Vec<SagaEntry>,
    next_seq: u64,
}

impl MemorySagaLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<SagaEntry> {
        self.inner
            .lock()
            .map(|inner| inner.entries.clone())
            .unwrap_or_default()
    }
}

impl SagaLog for MemorySagaLog {
    fn append(&self, record: SagaRecord) -> Result<SagaEntry, SagaLogError> {
        let mut inner = self.inner.lock().map_err(|_| SagaLogError::Poisoned)?;
        let entry = record.sequence(inner.next_seq);
        inner.entries.push(entry.clone());
        inner.next_seq += 1;
        Ok(entry)
    }

    fn replay(&self) -> Result<Replay, SagaLogError> {
        let snapshot = self
            .inner
            .lock()
            .map_err(|_| SagaLogError::Poisoned)?
            .entries
            .clone();
        Ok(Box::new(snapshot.into_iter().map(Ok)))
    }

    fn len(&self) -> u64 {
        self.inner
            .lock()
            .map(|inner| inner.entries.len() as u64)
            .unwrap_or(0)
    }

    fn compact(&self, entries: Vec<SagaEntry>) -> Result<(), SagaLogError> {
        let mut inner = self.inner.lock().map_err(|_| SagaLogError::Poisoned)?;
        check_compaction(&entries, inner.next_seq)?;
        inner.entries = entries;
        Ok(())
    }
}
