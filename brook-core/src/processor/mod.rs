//! The stream processor.
//!
//! Reads the partition log in order and runs each record through the processor
//! registered for its (record type, intent). A handler stages state mutations
//! and follow-up records; both become visible together once the follow-ups are
//! appended and the transaction commits. Replaying the log through the same
//! processors rebuilds the state.

pub mod context;
mod deployment;
mod incident;
mod instance;
mod job;
pub mod registry;
mod timer;
mod variable;

pub use context::{ProcessingContext, SideEffects};
pub use registry::{Processor, ProcessorRegistry};

use crate::bpmn::{behavior, StepRegistry};
use crate::error::{EngineError, Failure, ProcessingError};
use crate::log::{OrderedLog, FIRST_POSITION};
use crate::record::{Record, RecordDraft};
use crate::state::{EngineState, Transactional};
use crate::types::{PartitionId, Position, RecordType};
use crate::writer::{ProcessingLimits, RecordWriter};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

const REPLAY_READ_BATCH: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Rebuilding state from the log; nothing is appended.
    Replay,
    Processing,
    /// A fatal error stopped processing.
    Halted,
}

/// Outcome of processing one record, before its follow-ups are appended.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessingResult {
    pub source_position: Position,
    pub follow_ups: Vec<RecordDraft>,
    /// The follow-up answering the command's request, if the command carried one.
    pub response: Option<RecordDraft>,
    pub jobs_available: BTreeSet<String>,
    /// Journaled state writes, known once committed.
    pub applied_mutations: usize,
}

/// A record processed and committed by [`StreamProcessor::process_next`].
#[derive(Debug, Clone)]
pub struct Processed {
    pub record: Record,
    pub result: ProcessingResult,
    pub written: Vec<Record>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryReport {
    pub replayed: usize,
    pub next_position: Position,
    pub last_position: Position,
}

/// Observes committed batches. Only called in the processing phase, never during replay.
pub trait CommitListener: Send + Sync {
    fn on_commit(&self, written: &[Record]);

    fn on_jobs_available(&self, _job_types: &BTreeSet<String>) {}
}

pub struct StreamProcessor {
    state: EngineState,
    processors: ProcessorRegistry,
    steps: StepRegistry,
    limits: ProcessingLimits,
    phase: Phase,
    next_position: Position,
    listeners: Vec<Arc<dyn CommitListener>>,
}

impl StreamProcessor {
    pub fn new(partition_id: PartitionId, limits: ProcessingLimits) -> Self {
        Self::with_registries(
            partition_id,
            limits,
            ProcessorRegistry::standard(),
            StepRegistry::standard(),
        )
    }

    pub fn with_registries(
        partition_id: PartitionId,
        limits: ProcessingLimits,
        processors: ProcessorRegistry,
        steps: StepRegistry,
    ) -> Self {
        Self {
            state: EngineState::new(partition_id),
            processors,
            steps,
            limits,
            phase: Phase::Processing,
            next_position: FIRST_POSITION,
            listeners: Vec::new(),
        }
    }

    pub fn state(&self) -> &EngineState {
        &self.state
    }

    pub fn into_state(self) -> EngineState {
        self.state
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Position of the next record to process.
    pub fn next_position(&self) -> Position {
        self.next_position
    }

    pub fn limits(&self) -> ProcessingLimits {
        self.limits
    }

    pub fn set_limits(&mut self, limits: ProcessingLimits) {
        self.limits = limits;
    }

    pub fn add_listener(&mut self, listener: Arc<dyn CommitListener>) {
        self.listeners.push(listener);
    }

    /// Processes one record and leaves its transaction open.
    ///
    /// The caller appends `follow_ups` and then calls [`commit`](Self::commit),
    /// or [`abort`](Self::abort) if the append failed. On error the transaction
    /// is already rolled back.
    pub fn process(&mut self, record: &Record) -> Result<ProcessingResult, EngineError> {
        if self.phase == Phase::Halted {
            return Err(EngineError::Halted(format!(
                "refusing to process position {}",
                record.position
            )));
        }

        self.state.begin();
        let mut writer = RecordWriter::new(self.limits);
        let mut side_effects = SideEffects::default();

        if !record.is_rejection() {
            let outcome = self.run_processor(record, &mut writer, &mut side_effects);
            if let Err(e) = outcome {
                self.state.rollback();
                self.state.begin();
                writer.clear();
                side_effects = SideEffects::default();
                if let Err(e) = self.handle_failure(record, e, &mut writer, &mut side_effects) {
                    self.state.rollback();
                    if !e.is_retriable() {
                        self.halt(record, &e);
                    }
                    return Err(e);
                }
            }
        }

        self.state.mark_processed(record.position);
        let mut follow_ups = writer.into_drafts();
        for draft in &mut follow_ups {
            draft.source_position = Some(record.position);
        }
        let response = attach_response(record, &mut follow_ups);

        Ok(ProcessingResult {
            source_position: record.position,
            follow_ups,
            response,
            jobs_available: side_effects.jobs_available,
            applied_mutations: 0,
        })
    }

    fn run_processor(
        &mut self,
        record: &Record,
        writer: &mut RecordWriter,
        side_effects: &mut SideEffects,
    ) -> Result<(), ProcessingError> {
        let processor = self
            .processors
            .get(record.record_type, record.intent)
            .ok_or(EngineError::MissingProcessor {
                record_type: record.record_type,
                intent: record.intent,
            })?;
        let mut ctx = ProcessingContext {
            state: &mut self.state,
            writer,
            steps: &self.steps,
            record,
            side_effects,
        };
        processor(&mut ctx)
    }

    /// Turns a failed handler into follow-ups in a clean transaction: a rejection
    /// for commands, nothing for stale events, an incident for business failures.
    fn handle_failure(
        &mut self,
        record: &Record,
        error: ProcessingError,
        writer: &mut RecordWriter,
        side_effects: &mut SideEffects,
    ) -> Result<(), EngineError> {
        match error {
            ProcessingError::Rejected(rejection) => {
                if record.record_type == RecordType::Command {
                    if record.source_position.is_some() {
                        // Written by the engine itself; a rejection here is unusual.
                        tracing::warn!(
                            position = record.position,
                            intent = %record.intent,
                            rejection_type = ?rejection.rejection_type,
                            reason = %rejection.reason,
                            "StreamProcessor: internal command rejected"
                        );
                    } else {
                        tracing::debug!(
                            position = record.position,
                            intent = %record.intent,
                            rejection_type = ?rejection.rejection_type,
                            reason = %rejection.reason,
                            "StreamProcessor: command rejected"
                        );
                    }
                    writer.append_rejection(record, rejection).map_err(into_fatal)
                } else {
                    tracing::debug!(
                        position = record.position,
                        intent = %record.intent,
                        reason = %rejection.reason,
                        "StreamProcessor: skipping stale event"
                    );
                    Ok(())
                }
            }
            ProcessingError::Business(failure) => {
                self.raise_incident(record, &failure, writer, side_effects)
            }
            ProcessingError::Fatal(e) => Err(e),
        }
    }

    fn raise_incident(
        &mut self,
        record: &Record,
        failure: &Failure,
        writer: &mut RecordWriter,
        side_effects: &mut SideEffects,
    ) -> Result<(), EngineError> {
        let Some(instance) = self.state.elements.get(record.key).cloned() else {
            return Err(EngineError::Inconsistent(format!(
                "business failure at position {} without an element instance: {}",
                record.position, failure.message
            )));
        };
        let mut ctx = ProcessingContext {
            state: &mut self.state,
            writer,
            steps: &self.steps,
            record,
            side_effects,
        };
        match behavior::raise_incident(&mut ctx, &instance, failure).map_err(into_fatal)? {
            Some(incident_key) => tracing::info!(
                incident_key,
                element_instance_key = instance.key,
                element_id = %instance.element_id,
                error_type = ?failure.error_type,
                "StreamProcessor: incident created"
            ),
            None => tracing::warn!(
                element_instance_key = instance.key,
                error_type = ?failure.error_type,
                "StreamProcessor: element already has an active incident"
            ),
        }
        Ok(())
    }

    fn halt(&mut self, record: &Record, error: &EngineError) {
        tracing::error!(
            position = record.position,
            intent = %record.intent,
            error = %error,
            "StreamProcessor: halting partition"
        );
        self.phase = Phase::Halted;
    }

    /// Makes the open transaction durable once its follow-ups are on the log.
    pub fn commit(&mut self, result: &mut ProcessingResult, written: &[Record]) {
        result.applied_mutations = self.state.commit();
        self.next_position = result.source_position + 1;
        if self.phase != Phase::Processing {
            return;
        }
        for listener in &self.listeners {
            if !written.is_empty() {
                listener.on_commit(written);
            }
            if !result.jobs_available.is_empty() {
                listener.on_jobs_available(&result.jobs_available);
            }
        }
    }

    /// Discards the open transaction; the record will be processed again.
    pub fn abort(&mut self) {
        self.state.rollback();
    }

    /// Processes the next record on the log, if there is one, and appends its
    /// follow-ups as one batch.
    pub async fn process_next(&mut self, log: &dyn OrderedLog) -> Result<Option<Processed>, EngineError> {
        let Some(record) = log.read_from(self.next_position, 1).await?.into_iter().next() else {
            return Ok(None);
        };
        let mut result = self.process(&record)?;
        let written = if result.follow_ups.is_empty() {
            Vec::new()
        } else {
            match log.append(result.follow_ups.clone()).await {
                Ok(written) => written,
                Err(e) => {
                    self.abort();
                    tracing::warn!(
                        position = record.position,
                        error = %e,
                        "StreamProcessor: append failed, record will be retried"
                    );
                    return Err(e.into());
                }
            }
        };
        self.commit(&mut result, &written);
        Ok(Some(Processed {
            record,
            result,
            written,
        }))
    }

    /// Rebuilds state by reprocessing the log from the start.
    ///
    /// Every record whose follow-ups are on the log must regenerate exactly those
    /// follow-ups. Replay stops at the first record whose follow-ups were never
    /// appended; that record is processed live afterwards.
    pub async fn recover(&mut self, log: &dyn OrderedLog) -> Result<RecoveryReport, EngineError> {
        self.phase = Phase::Replay;
        let last_position = log.last_position().await?;

        let mut records = Vec::new();
        let mut position = FIRST_POSITION;
        loop {
            let chunk = log.read_from(position, REPLAY_READ_BATCH).await?;
            if chunk.is_empty() {
                break;
            }
            position += chunk.len() as Position;
            records.extend(chunk);
        }

        let mut logged: HashMap<Position, Vec<&Record>> = HashMap::new();
        for record in &records {
            if let Some(source) = record.source_position {
                logged.entry(source).or_default().push(record);
            }
        }

        let mut replayed = 0;
        for record in &records {
            let mut result = match self.process(record) {
                Ok(result) => result,
                Err(e) if e.is_retriable() => break,
                Err(e) => return Err(e),
            };
            let existing = logged.get(&record.position).map(Vec::as_slice).unwrap_or(&[]);
            if existing.is_empty() && !result.follow_ups.is_empty() {
                self.abort();
                break;
            }
            if let Err(detail) = compare_follow_ups(&result.follow_ups, existing) {
                self.abort();
                self.phase = Phase::Halted;
                tracing::error!(
                    position = record.position,
                    detail = %detail,
                    "StreamProcessor: replay diverged from the log"
                );
                return Err(EngineError::ReplayDivergence {
                    position: record.position,
                    detail,
                });
            }
            self.commit(&mut result, &[]);
            replayed += 1;
        }

        self.phase = Phase::Processing;
        tracing::info!(
            replayed,
            next_position = self.next_position,
            last_position,
            "StreamProcessor: recovery finished"
        );
        Ok(RecoveryReport {
            replayed,
            next_position: self.next_position,
            last_position,
        })
    }
}

fn into_fatal(error: ProcessingError) -> EngineError {
    match error {
        ProcessingError::Fatal(e) => e,
        other => EngineError::Inconsistent(other.to_string()),
    }
}

/// Tags the follow-up that answers the command's request: its rejection, or the
/// first event of the command's value type.
fn attach_response(record: &Record, follow_ups: &mut [RecordDraft]) -> Option<RecordDraft> {
    if record.record_type != RecordType::Command {
        return None;
    }
    let request_id = record.request_id?;
    let value_type = record.value_type();
    let draft = follow_ups.iter_mut().find(|d| match d.record_type {
        RecordType::CommandRejection => true,
        RecordType::Event => d.intent.value_type() == value_type,
        RecordType::Command => false,
    })?;
    draft.request_id = Some(request_id);
    Some(draft.clone())
}

fn compare_follow_ups(regenerated: &[RecordDraft], logged: &[&Record]) -> Result<(), String> {
    if regenerated.len() != logged.len() {
        return Err(format!(
            "regenerated {} follow-up records, but the log holds {}",
            regenerated.len(),
            logged.len()
        ));
    }
    for (draft, record) in regenerated.iter().zip(logged) {
        if !draft.matches(record) {
            return Err(format!(
                "follow-up at position {} differs: logged {} {}, regenerated {} {}",
                record.position, record.intent, record.key, draft.intent, draft.key
            ));
        }
    }
    Ok(())
}
