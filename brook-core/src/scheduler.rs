//! Due-date index for timers and job deadlines.
//!
//! The index lives outside the deterministic path. It learns about due dates
//! from committed records, and once one passes on the wall clock it appends a
//! command (Timer TRIGGER, Job TIME_OUT). Whether the command still applies is
//! decided by the processor when it reads it back.

use crate::log::{LogError, OrderedLog};
use crate::processor::CommitListener;
use crate::record::{JobRecord, Record, RecordDraft, RecordValue, TimerRecord};
use crate::state::EngineState;
use crate::types::{Intent, JobBatchIntent, JobIntent, Key, RecordType, TimerIntent, Timestamp};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DueEntry {
    Timer(Key),
    JobDeadline(Key),
}

impl DueEntry {
    /// The command appended once the entry is due.
    pub fn command(&self) -> RecordDraft {
        match *self {
            DueEntry::Timer(key) => RecordDraft::command(
                key,
                Intent::Timer(TimerIntent::Trigger),
                RecordValue::Timer(TimerRecord::default()),
            ),
            DueEntry::JobDeadline(key) => RecordDraft::command(
                key,
                Intent::Job(JobIntent::TimeOut),
                RecordValue::Job(JobRecord::default()),
            ),
        }
    }
}

#[derive(Debug, Default)]
struct DueIndex {
    by_due: BTreeSet<(Timestamp, DueEntry)>,
    by_entry: HashMap<DueEntry, Timestamp>,
}

impl DueIndex {
    fn schedule(&mut self, entry: DueEntry, due: Timestamp) {
        if let Some(previous) = self.by_entry.insert(entry, due) {
            self.by_due.remove(&(previous, entry));
        }
        self.by_due.insert((due, entry));
    }

    fn cancel(&mut self, entry: DueEntry) {
        if let Some(due) = self.by_entry.remove(&entry) {
            self.by_due.remove(&(due, entry));
        }
    }

    fn take_due(&mut self, now: Timestamp) -> Vec<(Timestamp, DueEntry)> {
        let mut due = Vec::new();
        while let Some(&(at, entry)) = self.by_due.first() {
            if at > now {
                break;
            }
            self.by_due.remove(&(at, entry));
            self.by_entry.remove(&entry);
            due.push((at, entry));
        }
        due
    }
}

/// Shared between the processing task, which feeds it on commit, and the
/// due-date checker, which drains it.
#[derive(Debug, Default)]
pub struct DueDateScheduler {
    index: Mutex<DueIndex>,
}

impl DueDateScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, DueIndex> {
        self.index.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn schedule(&self, entry: DueEntry, due: Timestamp) {
        self.lock().schedule(entry, due);
    }

    pub fn cancel(&self, entry: DueEntry) {
        self.lock().cancel(entry);
    }

    pub fn len(&self) -> usize {
        self.lock().by_entry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn next_due(&self) -> Option<Timestamp> {
        self.lock().by_due.first().map(|(due, _)| *due)
    }

    /// Replaces the index with the timers and job deadlines held in `state`.
    pub fn seed(&self, state: &EngineState) {
        let mut index = self.lock();
        *index = DueIndex::default();
        for (due, key) in state.timers.due_dates() {
            index.schedule(DueEntry::Timer(key), due);
        }
        for (deadline, key) in state.jobs.deadlines() {
            index.schedule(DueEntry::JobDeadline(key), deadline);
        }
    }

    /// Removes and returns every entry due at `now`, earliest first.
    pub fn take_due(&self, now: Timestamp) -> Vec<(Timestamp, DueEntry)> {
        self.lock().take_due(now)
    }

    /// Appends commands for everything due at `now`. Entries whose append
    /// failed go back into the index.
    pub async fn emit_due(&self, log: &dyn OrderedLog, now: Timestamp) -> Result<usize, LogError> {
        let due = self.take_due(now);
        if due.is_empty() {
            return Ok(0);
        }
        let commands = due.iter().map(|(_, entry)| entry.command()).collect();
        match log.append(commands).await {
            Ok(written) => {
                tracing::debug!(count = written.len(), now, "DueDateScheduler: emitted due commands");
                Ok(written.len())
            }
            Err(e) => {
                let mut index = self.lock();
                for (at, entry) in due {
                    index.schedule(entry, at);
                }
                Err(e)
            }
        }
    }

    /// Updates the index from one committed record.
    pub fn observe(&self, record: &Record) {
        if record.record_type != RecordType::Event {
            return;
        }
        let mut index = self.lock();
        match (&record.intent, &record.value) {
            (Intent::Timer(TimerIntent::Created), RecordValue::Timer(timer)) => {
                index.schedule(DueEntry::Timer(record.key), timer.due_date);
            }
            (Intent::Timer(TimerIntent::Triggered | TimerIntent::Canceled), _) => {
                index.cancel(DueEntry::Timer(record.key));
            }
            (Intent::Job(JobIntent::Activated), RecordValue::Job(job)) => {
                if let Some(deadline) = job.deadline {
                    index.schedule(DueEntry::JobDeadline(record.key), deadline);
                }
            }
            (Intent::JobBatch(JobBatchIntent::Activated), RecordValue::JobBatch(batch)) => {
                for (key, job) in batch.job_keys.iter().zip(&batch.jobs) {
                    if let Some(deadline) = job.deadline {
                        index.schedule(DueEntry::JobDeadline(*key), deadline);
                    }
                }
            }
            (
                Intent::Job(
                    JobIntent::Completed | JobIntent::Failed | JobIntent::TimedOut | JobIntent::Canceled,
                ),
                _,
            ) => {
                index.cancel(DueEntry::JobDeadline(record.key));
            }
            _ => {}
        }
    }
}

impl CommitListener for DueDateScheduler {
    fn on_commit(&self, written: &[Record]) {
        for record in written {
            self.observe(record);
        }
    }
}
