use crate::bpmn::StepRegistry;
use crate::error::{EngineError, HandlerResult, ProcessingError};
use crate::model::ProcessDefinition;
use crate::record::{Record, RejectionType};
use crate::state::{ElementInstance, EngineState};
use crate::types::{Key, Timestamp};
use crate::writer::RecordWriter;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Effects that only matter once the record's batch is committed.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SideEffects {
    /// Job types that gained activatable jobs.
    pub jobs_available: BTreeSet<String>,
}

/// Everything a handler may touch while processing one record.
pub struct ProcessingContext<'a> {
    pub state: &'a mut EngineState,
    pub writer: &'a mut RecordWriter,
    pub steps: &'a StepRegistry,
    pub record: &'a Record,
    pub side_effects: &'a mut SideEffects,
}

impl<'a> ProcessingContext<'a> {
    /// Logical time of the record being processed.
    pub fn now(&self) -> Timestamp {
        self.record.timestamp
    }

    pub fn next_key(&mut self) -> Key {
        self.state.keys.next_key()
    }

    /// The element instance with `key`, or a NOT_FOUND rejection.
    pub fn element_or_reject(&self, key: Key) -> HandlerResult<ElementInstance> {
        self.state.elements.get(key).cloned().ok_or_else(|| {
            ProcessingError::rejected(
                RejectionType::NotFound,
                format!("Expected to find element instance with key '{key}', but none was found"),
            )
        })
    }

    /// An element instance that must exist for the state to be consistent.
    pub fn element(&self, key: Key) -> HandlerResult<ElementInstance> {
        self.state
            .elements
            .get(key)
            .cloned()
            .ok_or_else(|| EngineError::ScopeTree(format!("element instance {key} not found")).into())
    }

    /// Definition of a running instance; it must have been deployed.
    pub fn definition(&self, key: Key) -> HandlerResult<Arc<ProcessDefinition>> {
        self.state
            .definitions
            .get(key)
            .ok_or_else(|| ProcessingError::inconsistent(format!("process definition {key} not deployed")))
    }

    pub fn job_available(&mut self, job_type: &str) {
        self.side_effects.jobs_available.insert(job_type.to_string());
    }
}
