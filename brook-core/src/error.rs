use crate::log::LogError;
use crate::record::{ErrorType, Rejection, RejectionType};
use crate::state::ScopeError;
use crate::types::{BpmnElementType, Intent, Key, LifecycleState, Position, RecordType};
use thiserror::Error;

/// Errors that stop record processing.
///
/// Retriable variants leave the partition healthy and the record is retried;
/// everything else halts the partition.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("no processor registered for {record_type:?} {intent}")]
    MissingProcessor { record_type: RecordType, intent: Intent },

    #[error("no step handler registered for {element_type:?} in state {state:?}")]
    MissingStepHandler {
        element_type: BpmnElementType,
        state: LifecycleState,
    },

    #[error("scope tree corrupted: {0}")]
    ScopeTree(String),

    #[error("expected to find job with key {0}, but no job found")]
    MissingJob(Key),

    #[error("inconsistent state: {0}")]
    Inconsistent(String),

    #[error("replay diverged at position {position}: {detail}")]
    ReplayDivergence { position: Position, detail: String },

    #[error("follow-up batch of {records} records / {bytes} bytes exceeds the processing limits")]
    Overloaded { records: usize, bytes: usize },

    #[error(transparent)]
    Log(#[from] LogError),

    #[error("partition halted: {0}")]
    Halted(String),
}

impl EngineError {
    pub fn is_retriable(&self) -> bool {
        match self {
            EngineError::Overloaded { .. } => true,
            EngineError::Log(e) => e.is_retriable(),
            _ => false,
        }
    }
}

impl From<ScopeError> for EngineError {
    fn from(e: ScopeError) -> Self {
        EngineError::ScopeTree(e.to_string())
    }
}

/// A business failure raised while executing a lifecycle step. It becomes an incident.
#[derive(Debug, Clone, PartialEq)]
pub struct Failure {
    pub error_type: ErrorType,
    pub message: String,
}

/// Outcome of a failed handler.
#[derive(Debug, Error)]
pub enum ProcessingError {
    /// The command's preconditions no longer hold.
    #[error("rejected: {0}")]
    Rejected(Rejection),

    #[error("{:?}: {}", .0.error_type, .0.message)]
    Business(Failure),

    #[error(transparent)]
    Fatal(#[from] EngineError),
}

impl ProcessingError {
    pub fn rejected(rejection_type: RejectionType, reason: impl Into<String>) -> Self {
        ProcessingError::Rejected(Rejection::new(rejection_type, reason))
    }

    pub fn business(error_type: ErrorType, message: impl Into<String>) -> Self {
        ProcessingError::Business(Failure {
            error_type,
            message: message.into(),
        })
    }

    pub fn inconsistent(message: impl Into<String>) -> Self {
        ProcessingError::Fatal(EngineError::Inconsistent(message.into()))
    }
}

impl From<ScopeError> for ProcessingError {
    fn from(e: ScopeError) -> Self {
        ProcessingError::Fatal(e.into())
    }
}

pub type HandlerResult<T = ()> = Result<T, ProcessingError>;
