use serde::{Deserialize, Serialize};
use std::fmt;

/// Entity key. Unique per partition and never reused.
pub type Key = i64;

/// Position of a record in the partition log.
pub type Position = u64;

pub type PartitionId = u16;

/// Milliseconds since the Unix epoch, assigned by the log on append.
pub type Timestamp = i64;

/// Number of low bits reserved for the per-partition key counter.
pub const KEY_COUNTER_BITS: u32 = 51;

pub fn encode_key(partition_id: PartitionId, counter: i64) -> Key {
    ((partition_id as i64) << KEY_COUNTER_BITS) | counter
}

pub fn partition_of(key: Key) -> PartitionId {
    (key >> KEY_COUNTER_BITS) as PartitionId
}

// ── Record classification ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordType {
    Command,
    Event,
    CommandRejection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValueType {
    Deployment,
    ProcessInstance,
    ProcessInstanceCreation,
    Job,
    JobBatch,
    Incident,
    Variable,
    VariableDocument,
    Timer,
}

impl ValueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValueType::Deployment => "DEPLOYMENT",
            ValueType::ProcessInstance => "PROCESS_INSTANCE",
            ValueType::ProcessInstanceCreation => "PROCESS_INSTANCE_CREATION",
            ValueType::Job => "JOB",
            ValueType::JobBatch => "JOB_BATCH",
            ValueType::Incident => "INCIDENT",
            ValueType::Variable => "VARIABLE",
            ValueType::VariableDocument => "VARIABLE_DOCUMENT",
            ValueType::Timer => "TIMER",
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Intents ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeploymentIntent {
    Create,
    Created,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessInstanceIntent {
    Cancel,
    TerminateElement,
    SequenceFlowTaken,
    ElementActivating,
    ElementActivated,
    ElementCompleting,
    ElementCompleted,
    ElementTerminating,
    ElementTerminated,
}

impl ProcessInstanceIntent {
    /// The lifecycle state an element instance enters when this event is written.
    pub fn lifecycle_state(&self) -> Option<LifecycleState> {
        match self {
            ProcessInstanceIntent::ElementActivating => Some(LifecycleState::Activating),
            ProcessInstanceIntent::ElementActivated => Some(LifecycleState::Activated),
            ProcessInstanceIntent::ElementCompleting => Some(LifecycleState::Completing),
            ProcessInstanceIntent::ElementCompleted => Some(LifecycleState::Completed),
            ProcessInstanceIntent::ElementTerminating => Some(LifecycleState::Terminating),
            ProcessInstanceIntent::ElementTerminated => Some(LifecycleState::Terminated),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessInstanceCreationIntent {
    Create,
    Created,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobIntent {
    Created,
    Activate,
    Activated,
    Complete,
    Completed,
    Fail,
    Failed,
    TimeOut,
    TimedOut,
    Cancel,
    Canceled,
    UpdateRetries,
    RetriesUpdated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobBatchIntent {
    Activate,
    Activated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IncidentIntent {
    Create,
    Created,
    Resolve,
    Resolved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VariableIntent {
    Created,
    Updated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VariableDocumentIntent {
    Update,
    Updated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimerIntent {
    Created,
    Trigger,
    Triggered,
    Canceled,
}

/// Intent of a record, tagged by the value type it applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "value_type", content = "intent", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Intent {
    Deployment(DeploymentIntent),
    ProcessInstance(ProcessInstanceIntent),
    ProcessInstanceCreation(ProcessInstanceCreationIntent),
    Job(JobIntent),
    JobBatch(JobBatchIntent),
    Incident(IncidentIntent),
    Variable(VariableIntent),
    VariableDocument(VariableDocumentIntent),
    Timer(TimerIntent),
}

impl Intent {
    pub fn value_type(&self) -> ValueType {
        match self {
            Intent::Deployment(_) => ValueType::Deployment,
            Intent::ProcessInstance(_) => ValueType::ProcessInstance,
            Intent::ProcessInstanceCreation(_) => ValueType::ProcessInstanceCreation,
            Intent::Job(_) => ValueType::Job,
            Intent::JobBatch(_) => ValueType::JobBatch,
            Intent::Incident(_) => ValueType::Incident,
            Intent::Variable(_) => ValueType::Variable,
            Intent::VariableDocument(_) => ValueType::VariableDocument,
            Intent::Timer(_) => ValueType::Timer,
        }
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Intent::Deployment(i) => write!(f, "{}:{:?}", self.value_type(), i),
            Intent::ProcessInstance(i) => write!(f, "{}:{:?}", self.value_type(), i),
            Intent::ProcessInstanceCreation(i) => write!(f, "{}:{:?}", self.value_type(), i),
            Intent::Job(i) => write!(f, "{}:{:?}", self.value_type(), i),
            Intent::JobBatch(i) => write!(f, "{}:{:?}", self.value_type(), i),
            Intent::Incident(i) => write!(f, "{}:{:?}", self.value_type(), i),
            Intent::Variable(i) => write!(f, "{}:{:?}", self.value_type(), i),
            Intent::VariableDocument(i) => write!(f, "{}:{:?}", self.value_type(), i),
            Intent::Timer(i) => write!(f, "{}:{:?}", self.value_type(), i),
        }
    }
}

// ── BPMN runtime classification ──

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BpmnElementType {
    #[default]
    Process,
    SubProcess,
    MultiInstanceBody,
    StartEvent,
    EndEvent,
    ServiceTask,
    ExclusiveGateway,
    ParallelGateway,
    IntermediateCatchEvent,
    BoundaryEvent,
    SequenceFlow,
}

impl BpmnElementType {
    pub fn is_container(&self) -> bool {
        matches!(
            self,
            BpmnElementType::Process
                | BpmnElementType::SubProcess
                | BpmnElementType::MultiInstanceBody
        )
    }
}

/// Lifecycle state of an element instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleState {
    Activating,
    Activated,
    Completing,
    Completed,
    Terminating,
    Terminated,
}

impl LifecycleState {
    pub fn is_final(&self) -> bool {
        matches!(self, LifecycleState::Completed | LifecycleState::Terminated)
    }

    /// States from which a TERMINATING transition is allowed.
    pub fn can_terminate(&self) -> bool {
        matches!(
            self,
            LifecycleState::Activating | LifecycleState::Activated | LifecycleState::Completing
        )
    }

    pub fn intent(&self) -> ProcessInstanceIntent {
        match self {
            LifecycleState::Activating => ProcessInstanceIntent::ElementActivating,
            LifecycleState::Activated => ProcessInstanceIntent::ElementActivated,
            LifecycleState::Completing => ProcessInstanceIntent::ElementCompleting,
            LifecycleState::Completed => ProcessInstanceIntent::ElementCompleted,
            LifecycleState::Terminating => ProcessInstanceIntent::ElementTerminating,
            LifecycleState::Terminated => ProcessInstanceIntent::ElementTerminated,
        }
    }
}
