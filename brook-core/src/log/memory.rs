use super::{slice_from, stamp_batch, Clock, LogError, OrderedLog, FIRST_POSITION};
use crate::record::{Record, RecordDraft};
use crate::types::{PartitionId, Position};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::Notify;

/// In-memory log for tests and single-process embedding.
pub struct MemoryLog {
    partition_id: PartitionId,
    clock: Arc<dyn Clock>,
    records: RwLock<Vec<Record>>,
    appended: Notify,
    failing_appends: AtomicUsize,
}

impl MemoryLog {
    pub fn new(partition_id: PartitionId, clock: Arc<dyn Clock>) -> Self {
        Self {
            partition_id,
            clock,
            records: RwLock::new(Vec::new()),
            appended: Notify::new(),
            failing_appends: AtomicUsize::new(0),
        }
    }

    /// Makes the next `count` appends fail with a retriable error.
    pub fn fail_next_appends(&self, count: usize) {
        self.failing_appends.store(count, Ordering::SeqCst);
    }

    /// Snapshot of every record in the log.
    pub fn records(&self) -> Vec<Record> {
        self.records
            .read()
            .map(|records| records.clone())
            .unwrap_or_default()
    }

    fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    fn lock_error<E: std::fmt::Display>(e: E) -> LogError {
        LogError::Unavailable(format!("Lock: {}", e))
    }
}

#[async_trait]
impl OrderedLog for MemoryLog {
    fn partition_id(&self) -> PartitionId {
        self.partition_id
    }

    async fn append(&self, batch: Vec<RecordDraft>) -> Result<Vec<Record>, LogError> {
        let injected = self
            .failing_appends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if injected.is_ok() {
            return Err(LogError::Unavailable("injected append failure".to_string()));
        }
        if batch.is_empty() {
            return Ok(Vec::new());
        }

        let appended = {
            let mut records = self.records.write().map_err(Self::lock_error)?;
            let last_timestamp = records.last().map(|r| r.timestamp).unwrap_or(i64::MIN);
            let timestamp = self.clock.now_millis().max(last_timestamp);
            let next = records.len() as Position + FIRST_POSITION;
            let appended = stamp_batch(batch, next, timestamp, self.partition_id);
            records.extend(appended.iter().cloned());
            appended
        };
        self.appended.notify_waiters();
        Ok(appended)
    }

    async fn read_from(&self, position: Position, max: usize) -> Result<Vec<Record>, LogError> {
        let records = self.records.read().map_err(Self::lock_error)?;
        Ok(slice_from(&records, position, max))
    }

    async fn last_position(&self) -> Result<Position, LogError> {
        Ok(self.len() as Position)
    }

    async fn await_position(&self, position: Position) {
        loop {
            let notified = self.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.len() as Position >= position {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::ManualClock;
    use crate::record::{RecordValue, TimerRecord};
    use crate::types::{Intent, TimerIntent};
    use std::time::Duration;

    fn draft(key: i64) -> RecordDraft {
        RecordDraft::command(
            key,
            Intent::Timer(TimerIntent::Trigger),
            RecordValue::Timer(TimerRecord::default()),
        )
    }

    #[tokio::test]
    async fn test_append_assigns_contiguous_positions() {
        let clock = Arc::new(ManualClock::new(100));
        let log = MemoryLog::new(1, clock.clone());

        let first = log.append(vec![draft(1), draft(2)]).await.unwrap();
        assert_eq!(first.iter().map(|r| r.position).collect::<Vec<_>>(), vec![1, 2]);
        assert!(first.iter().all(|r| r.timestamp == 100));

        clock.set(50);
        let second = log.append(vec![draft(3)]).await.unwrap();
        assert_eq!(second[0].position, 3);
        // timestamps never go backwards
        assert_eq!(second[0].timestamp, 100);

        let read = log.read_from(2, 10).await.unwrap();
        assert_eq!(read.iter().map(|r| r.key).collect::<Vec<_>>(), vec![2, 3]);
        assert_eq!(log.last_position().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_read_windows() {
        let log = MemoryLog::new(1, Arc::new(ManualClock::new(0)));
        log.append((1..=5).map(draft).collect()).await.unwrap();

        let keys = |records: Vec<Record>| records.iter().map(|r| r.key).collect::<Vec<_>>();
        assert_eq!(keys(log.read_from(0, 2).await.unwrap()), vec![1, 2]);
        assert_eq!(keys(log.read_from(4, 10).await.unwrap()), vec![4, 5]);
        assert_eq!(keys(log.read_from(5, 1).await.unwrap()), vec![5]);
        assert!(log.read_from(6, 10).await.unwrap().is_empty());
        assert!(log.read_from(u64::MAX, usize::MAX).await.unwrap().is_empty());
        assert!(log.read_from(1, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_injected_failures_are_retriable() {
        let log = MemoryLog::new(1, Arc::new(ManualClock::new(0)));
        log.fail_next_appends(1);
        let err = log.append(vec![draft(1)]).await.unwrap_err();
        assert!(err.is_retriable());
        assert!(log.records().is_empty());
        assert_eq!(log.append(vec![draft(1)]).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_await_position_wakes_on_append() {
        let log = Arc::new(MemoryLog::new(1, Arc::new(ManualClock::new(0))));
        let waiter = {
            let log = log.clone();
            tokio::spawn(async move { log.await_position(1).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        log.append(vec![draft(1)]).await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
