//! The ordered partition log.
//!
//! Replication is outside this crate: a log only needs to keep records in FIFO
//! order, assign contiguous positions and replay from any position.

mod clock;
mod file;
mod memory;

pub use clock::{Clock, ManualClock, SystemClock};
pub use file::FileLog;
pub use memory::MemoryLog;

use crate::record::{Record, RecordDraft};
use crate::types::{PartitionId, Position};
use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LogError {
    #[error("log I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode record: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("corrupt log at line {line}: {reason}")]
    Corrupt { line: usize, reason: String },

    #[error("log unavailable: {0}")]
    Unavailable(String),
}

impl LogError {
    /// Transient failures that a retry may resolve.
    pub fn is_retriable(&self) -> bool {
        matches!(self, LogError::Io(_) | LogError::Unavailable(_))
    }
}

#[async_trait]
pub trait OrderedLog: Send + Sync {
    fn partition_id(&self) -> PartitionId;

    /// Appends a batch atomically. Records get contiguous positions starting after
    /// the current last position, and one timestamp from the log's clock.
    async fn append(&self, batch: Vec<RecordDraft>) -> Result<Vec<Record>, LogError>;

    /// Up to `max` records starting at `position` (inclusive).
    async fn read_from(&self, position: Position, max: usize) -> Result<Vec<Record>, LogError>;

    /// Position of the last appended record; `0` when the log is empty.
    async fn last_position(&self) -> Result<Position, LogError>;

    /// Resolves once a record at `position` exists.
    async fn await_position(&self, position: Position);
}

/// First position of every log.
pub const FIRST_POSITION: Position = 1;

/// Turns a batch into records at positions `next..`, all sharing `timestamp`.
pub(crate) fn stamp_batch(
    batch: Vec<RecordDraft>,
    next: Position,
    timestamp: crate::types::Timestamp,
    partition_id: PartitionId,
) -> Vec<Record> {
    batch
        .into_iter()
        .enumerate()
        .map(|(i, draft)| draft.into_record(next + i as Position, timestamp, partition_id))
        .collect()
}

/// Up to `max` records starting at `position`, indexed directly.
pub(crate) fn slice_from(records: &[Record], position: Position, max: usize) -> Vec<Record> {
    let start = usize::try_from(position.saturating_sub(FIRST_POSITION)).unwrap_or(usize::MAX);
    let end = start.saturating_add(max).min(records.len());
    records.get(start..end).map(<[Record]>::to_vec).unwrap_or_default()
}
