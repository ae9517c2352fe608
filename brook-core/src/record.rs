//! Records exchanged through the partition log.
//!
//! A [`Record`] is immutable once appended. Handlers produce [`RecordDraft`]s which
//! the log turns into records by assigning a position and a timestamp.

use crate::model::ProcessModel;
use crate::types::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Variable documents are ordered so that serialization is deterministic.
pub type VariableMap = BTreeMap<String, Value>;

/// Key used by records that do not refer to an entity.
pub const NO_KEY: Key = -1;

// ── Rejections ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectionType {
    NotFound,
    InvalidState,
    InvalidArgument,
    AlreadyExists,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    pub rejection_type: RejectionType,
    pub reason: String,
}

impl Rejection {
    pub fn new(rejection_type: RejectionType, reason: impl Into<String>) -> Self {
        Self {
            rejection_type,
            reason: reason.into(),
        }
    }
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.rejection_type, self.reason)
    }
}

// ── Record ──

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub position: Position,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_position: Option<Position>,
    pub key: Key,
    pub timestamp: Timestamp,
    pub partition_id: PartitionId,
    pub record_type: RecordType,
    pub intent: Intent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection: Option<Rejection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<u64>,
    pub value: RecordValue,
}

impl Record {
    pub fn value_type(&self) -> ValueType {
        self.intent.value_type()
    }

    pub fn is_command(&self) -> bool {
        self.record_type == RecordType::Command
    }

    pub fn is_event(&self) -> bool {
        self.record_type == RecordType::Event
    }

    pub fn is_rejection(&self) -> bool {
        self.record_type == RecordType::CommandRejection
    }
}

/// A record that has not been appended yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordDraft {
    pub key: Key,
    pub record_type: RecordType,
    pub intent: Intent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_position: Option<Position>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection: Option<Rejection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<u64>,
    pub value: RecordValue,
}

impl RecordDraft {
    pub fn command(key: Key, intent: Intent, value: RecordValue) -> Self {
        Self {
            key,
            record_type: RecordType::Command,
            intent,
            source_position: None,
            rejection: None,
            request_id: None,
            value,
        }
    }

    pub fn event(key: Key, intent: Intent, value: RecordValue) -> Self {
        Self {
            record_type: RecordType::Event,
            ..Self::command(key, intent, value)
        }
    }

    /// A rejection of `command`, carrying the command's key, intent, value and request id.
    pub fn rejection(command: &Record, rejection: Rejection) -> Self {
        Self {
            key: command.key,
            record_type: RecordType::CommandRejection,
            intent: command.intent,
            source_position: None,
            rejection: Some(rejection),
            request_id: command.request_id,
            value: command.value.clone(),
        }
    }

    pub fn with_request_id(mut self, request_id: u64) -> Self {
        self.request_id = Some(request_id);
        self
    }

    pub fn into_record(
        self,
        position: Position,
        timestamp: Timestamp,
        partition_id: PartitionId,
    ) -> Record {
        Record {
            position,
            source_position: self.source_position,
            key: self.key,
            timestamp,
            partition_id,
            record_type: self.record_type,
            intent: self.intent,
            rejection: self.rejection,
            request_id: self.request_id,
            value: self.value,
        }
    }

    /// Whether an appended record carries the same content, ignoring position and timestamp.
    pub fn matches(&self, record: &Record) -> bool {
        self.key == record.key
            && self.record_type == record.record_type
            && self.intent == record.intent
            && self.source_position == record.source_position
            && self.rejection == record.rejection
            && self.request_id == record.request_id
            && self.value == record.value
    }
}

// ── Values ──

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordValue {
    Deployment(DeploymentRecord),
    ProcessInstance(ProcessInstanceRecord),
    ProcessInstanceCreation(ProcessInstanceCreationRecord),
    Job(JobRecord),
    JobBatch(JobBatchRecord),
    Incident(IncidentRecord),
    Variable(VariableRecord),
    VariableDocument(VariableDocumentRecord),
    Timer(TimerRecord),
}

impl RecordValue {
    pub fn as_deployment(&self) -> Option<&DeploymentRecord> {
        match self {
            RecordValue::Deployment(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_process_instance(&self) -> Option<&ProcessInstanceRecord> {
        match self {
            RecordValue::ProcessInstance(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_creation(&self) -> Option<&ProcessInstanceCreationRecord> {
        match self {
            RecordValue::ProcessInstanceCreation(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_job(&self) -> Option<&JobRecord> {
        match self {
            RecordValue::Job(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_job_batch(&self) -> Option<&JobBatchRecord> {
        match self {
            RecordValue::JobBatch(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_incident(&self) -> Option<&IncidentRecord> {
        match self {
            RecordValue::Incident(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_variable(&self) -> Option<&VariableRecord> {
        match self {
            RecordValue::Variable(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_variable_document(&self) -> Option<&VariableDocumentRecord> {
        match self {
            RecordValue::VariableDocument(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_timer(&self) -> Option<&TimerRecord> {
        match self {
            RecordValue::Timer(v) => Some(v),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub model: ProcessModel,
    #[serde(default)]
    pub process_definition_key: Key,
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub digest: String,
    /// Set when the model equals the latest deployed version and no new version was created.
    #[serde(default)]
    pub duplicate: bool,
}

impl DeploymentRecord {
    pub fn new(model: ProcessModel) -> Self {
        Self {
            model,
            process_definition_key: NO_KEY,
            version: 0,
            digest: String::new(),
            duplicate: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessInstanceRecord {
    pub bpmn_process_id: String,
    pub version: u32,
    pub process_definition_key: Key,
    pub process_instance_key: Key,
    pub element_id: String,
    pub element_type: BpmnElementType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow_scope_key: Option<Key>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessInstanceCreationRecord {
    pub bpmn_process_id: String,
    /// `None` selects the latest deployed version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,
    #[serde(default)]
    pub process_definition_key: Key,
    #[serde(default)]
    pub process_instance_key: Key,
    #[serde(default)]
    pub variables: VariableMap,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_type: String,
    #[serde(default)]
    pub worker: String,
    #[serde(default)]
    pub retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<Timestamp>,
    /// Activation timeout requested by an ACTIVATE command.
    #[serde(default)]
    pub timeout_ms: i64,
    #[serde(default)]
    pub error_message: String,
    #[serde(default)]
    pub variables: VariableMap,
    #[serde(default)]
    pub bpmn_process_id: String,
    #[serde(default)]
    pub process_definition_key: Key,
    #[serde(default)]
    pub process_instance_key: Key,
    #[serde(default)]
    pub element_id: String,
    #[serde(default)]
    pub element_instance_key: Key,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobBatchRecord {
    pub job_type: String,
    pub worker: String,
    pub timeout_ms: i64,
    pub max_jobs_to_activate: u32,
    #[serde(default)]
    pub job_keys: Vec<Key>,
    #[serde(default)]
    pub jobs: Vec<JobRecord>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorType {
    JobNoRetries,
    IoMappingError,
    ConditionError,
    ExtractValueError,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IncidentRecord {
    pub error_type: ErrorType,
    pub error_message: String,
    pub bpmn_process_id: String,
    pub process_definition_key: Key,
    pub process_instance_key: Key,
    pub element_id: String,
    pub element_instance_key: Key,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_key: Option<Key>,
    pub variable_scope_key: Key,
    /// Lifecycle state the element was in when the failure happened.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_state: Option<LifecycleState>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableRecord {
    pub name: String,
    pub value: Value,
    pub scope_key: Key,
    pub process_instance_key: Key,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UpdateSemantics {
    Local,
    #[default]
    Propagate,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VariableDocumentRecord {
    pub scope_key: Key,
    #[serde(default)]
    pub update_semantics: UpdateSemantics,
    pub variables: VariableMap,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimerRecord {
    pub element_instance_key: Key,
    pub process_instance_key: Key,
    pub process_definition_key: Key,
    /// Element activated or completed when the timer fires.
    pub target_element_id: String,
    pub due_date: Timestamp,
    /// Remaining repetitions; `-1` repeats forever.
    pub repetitions: i32,
    #[serde(default)]
    pub interval_ms: i64,
}
