use super::txmap::{Transactional, TxMap};
use crate::record::JobRecord;
use crate::types::{Key, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Job lifecycle. Completed and cancelled jobs are removed from the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Created,
    Activatable,
    Activated,
    /// Failed without retries; waits for an incident to be resolved.
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Created => "CREATED",
            JobState::Activatable => "ACTIVATABLE",
            JobState::Activated => "ACTIVATED",
            JobState::Failed => "FAILED",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub key: Key,
    pub state: JobState,
    pub record: JobRecord,
}

#[derive(Debug, Default, Serialize)]
pub struct JobStore {
    jobs: TxMap<Key, Job>,
    /// (job type, job key) of activatable jobs, in key order.
    activatable: TxMap<(String, Key), ()>,
    /// (deadline, job key) of activated jobs.
    deadlines: TxMap<(Timestamp, Key), ()>,
}

impl JobStore {
    pub fn get(&self, key: Key) -> Option<&Job> {
        self.jobs.get(&key)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn create(&mut self, key: Key, record: JobRecord) {
        self.jobs.insert(
            key,
            Job {
                key,
                state: JobState::Created,
                record,
            },
        );
    }

    pub fn make_activatable(&mut self, key: Key) -> Option<&Job> {
        let previous = self.detach(key)?;
        self.activatable
            .insert((previous.record.job_type.clone(), key), ());
        self.jobs.update(&key, |job| {
            job.state = JobState::Activatable;
            job.record.worker.clear();
            job.record.deadline = None;
        });
        self.jobs.get(&key)
    }

    pub fn activate(&mut self, key: Key, worker: &str, deadline: Timestamp) -> Option<&Job> {
        self.detach(key)?;
        self.deadlines.insert((deadline, key), ());
        self.jobs.update(&key, |job| {
            job.state = JobState::Activated;
            job.record.worker = worker.to_string();
            job.record.deadline = Some(deadline);
        });
        self.jobs.get(&key)
    }

    /// Records a failure. The job becomes activatable again while retries remain.
    pub fn fail(&mut self, key: Key, retries: u32, error_message: &str) -> Option<&Job> {
        self.detach(key)?;
        self.jobs.update(&key, |job| {
            job.record.retries = retries;
            job.record.error_message = error_message.to_string();
            job.state = JobState::Failed;
        });
        if retries > 0 {
            return self.make_activatable(key);
        }
        self.jobs.get(&key)
    }

    pub fn set_retries(&mut self, key: Key, retries: u32) -> Option<&Job> {
        self.jobs.update(&key, |job| job.record.retries = retries)?;
        self.jobs.get(&key)
    }

    pub fn remove(&mut self, key: Key) -> Option<Job> {
        self.detach(key)?;
        self.jobs.remove(&key)
    }

    /// Up to `max` activatable jobs of `job_type`, oldest first.
    pub fn activatable_of_type(&self, job_type: &str, max: usize) -> Vec<Key> {
        self.activatable
            .range((job_type.to_string(), Key::MIN)..=(job_type.to_string(), Key::MAX))
            .take(max)
            .map(|((_, key), _)| *key)
            .collect()
    }

    /// Activated jobs with their deadlines, earliest first.
    pub fn deadlines(&self) -> Vec<(Timestamp, Key)> {
        self.deadlines.iter().map(|(k, _)| *k).collect()
    }

    /// Removes the job from the secondary indexes and returns its current value.
    fn detach(&mut self, key: Key) -> Option<Job> {
        let job = self.jobs.get(&key)?.clone();
        match job.state {
            JobState::Activatable => {
                self.activatable
                    .remove(&(job.record.job_type.clone(), key));
            }
            JobState::Activated => {
                if let Some(deadline) = job.record.deadline {
                    self.deadlines.remove(&(deadline, key));
                }
            }
            JobState::Created | JobState::Failed => {}
        }
        Some(job)
    }
}

impl Transactional for JobStore {
    fn begin(&mut self) {
        self.jobs.begin();
        self.activatable.begin();
        self.deadlines.begin();
    }

    fn commit(&mut self) -> usize {
        self.jobs.commit() + self.activatable.commit() + self.deadlines.commit()
    }

    fn rollback(&mut self) {
        self.jobs.rollback();
        self.activatable.rollback();
        self.deadlines.rollback();
    }
}
