use crate::error::{EngineError, HandlerResult, ProcessingError};
use crate::record::{Record, RecordDraft, RecordValue, Rejection};
use crate::types::{Intent, Key};
use serde::{Deserialize, Serialize};

/// Bounds on the follow-up batch of a single record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingLimits {
    pub max_follow_up_records: usize,
    pub max_batch_bytes: usize,
    /// Longest activation a worker may ask for.
    pub max_job_timeout_ms: i64,
}

impl Default for ProcessingLimits {
    fn default() -> Self {
        Self {
            max_follow_up_records: 1024,
            max_batch_bytes: 4 * 1024 * 1024,
            max_job_timeout_ms: 30 * 24 * 60 * 60 * 1000,
        }
    }
}

/// Collects the follow-up records of one input record.
#[derive(Debug)]
pub struct RecordWriter {
    limits: ProcessingLimits,
    drafts: Vec<RecordDraft>,
    bytes: usize,
}

impl RecordWriter {
    pub fn new(limits: ProcessingLimits) -> Self {
        Self {
            limits,
            drafts: Vec::new(),
            bytes: 0,
        }
    }

    pub fn append_command(&mut self, key: Key, intent: Intent, value: RecordValue) -> HandlerResult {
        self.push(RecordDraft::command(key, intent, value))
    }

    pub fn append_event(&mut self, key: Key, intent: Intent, value: RecordValue) -> HandlerResult {
        self.push(RecordDraft::event(key, intent, value))
    }

    pub fn append_rejection(&mut self, command: &Record, rejection: Rejection) -> HandlerResult {
        self.push(RecordDraft::rejection(command, rejection))
    }

    fn push(&mut self, draft: RecordDraft) -> HandlerResult {
        let size = serde_json::to_vec(&draft)
            .map(|bytes| bytes.len())
            .map_err(|e| EngineError::Inconsistent(format!("unencodable record: {e}")))?;
        let records = self.drafts.len() + 1;
        let bytes = self.bytes + size;
        if records > self.limits.max_follow_up_records || bytes > self.limits.max_batch_bytes {
            return Err(ProcessingError::Fatal(EngineError::Overloaded { records, bytes }));
        }
        self.drafts.push(draft);
        self.bytes = bytes;
        Ok(())
    }

    pub fn limits(&self) -> ProcessingLimits {
        self.limits
    }

    pub fn drafts(&self) -> &[RecordDraft] {
        &self.drafts
    }

    pub fn len(&self) -> usize {
        self.drafts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.drafts.is_empty()
    }

    pub fn clear(&mut self) {
        self.drafts.clear();
        self.bytes = 0;
    }

    pub fn into_drafts(self) -> Vec<RecordDraft> {
        self.drafts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::TimerRecord;
    use crate::types::TimerIntent;

    fn timer_event() -> RecordValue {
        RecordValue::Timer(TimerRecord::default())
    }

    #[test]
    fn test_record_limit() {
        let mut writer = RecordWriter::new(ProcessingLimits {
            max_follow_up_records: 2,
            max_batch_bytes: usize::MAX,
            ..ProcessingLimits::default()
        });
        let intent = Intent::Timer(TimerIntent::Created);
        writer.append_event(1, intent, timer_event()).unwrap();
        writer.append_event(2, intent, timer_event()).unwrap();
        let err = writer.append_event(3, intent, timer_event()).unwrap_err();
        assert!(matches!(
            err,
            ProcessingError::Fatal(EngineError::Overloaded { records: 3, .. })
        ));
        assert_eq!(writer.len(), 2);
    }

    #[test]
    fn test_byte_limit() {
        let mut writer = RecordWriter::new(ProcessingLimits {
            max_follow_up_records: 100,
            max_batch_bytes: 64,
            ..ProcessingLimits::default()
        });
        let err = writer
            .append_event(1, Intent::Timer(TimerIntent::Created), timer_event())
            .unwrap_err();
        match err {
            ProcessingError::Fatal(e) => assert!(e.is_retriable()),
            other => panic!("unexpected {other:?}"),
        }
        assert!(writer.is_empty());
    }
}
