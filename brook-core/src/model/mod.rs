//! Executable process models.
//!
//! A [`ProcessModel`] is the already-parsed form of a process (loaded from YAML or
//! built in code). Deployment validates it and wraps it in an indexed
//! [`ProcessDefinition`].

pub mod timer;
pub mod validate;

pub use timer::TimerDefinition;
pub use validate::{validate_model, ValidationError};

use crate::mapping::{Condition, Mapping};
use crate::types::{BpmnElementType, Key};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("failed to parse process model: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid process model:\n{}", format_errors(.0))]
    Invalid(Vec<ValidationError>),
}

fn format_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("\n")
}

// ── Helper defaults for serde ──

fn default_retries() -> u32 {
    3
}

fn default_true() -> bool {
    true
}

fn is_false(v: &bool) -> bool {
    !v
}

// ── Model ──

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessModel {
    /// BPMN process id shared by all versions of this process.
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub elements: Vec<ElementModel>,
    #[serde(default)]
    pub flows: Vec<SequenceFlow>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementModel {
    pub id: String,
    /// Enclosing sub-process; `None` for elements directly inside the process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(flatten)]
    pub kind: ElementKind,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<Mapping>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<Mapping>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multi_instance: Option<LoopCharacteristics>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum ElementKind {
    StartEvent,
    EndEvent,
    ServiceTask {
        job_type: String,
        #[serde(default = "default_retries")]
        retries: u32,
    },
    ExclusiveGateway {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        default_flow: Option<String>,
    },
    ParallelGateway,
    SubProcess,
    TimerCatchEvent {
        timer: TimerDefinition,
    },
    BoundaryEvent {
        attached_to: String,
        timer: TimerDefinition,
        #[serde(default = "default_true")]
        cancel_activity: bool,
    },
}

impl ElementKind {
    pub fn element_type(&self) -> BpmnElementType {
        match self {
            ElementKind::StartEvent => BpmnElementType::StartEvent,
            ElementKind::EndEvent => BpmnElementType::EndEvent,
            ElementKind::ServiceTask { .. } => BpmnElementType::ServiceTask,
            ElementKind::ExclusiveGateway { .. } => BpmnElementType::ExclusiveGateway,
            ElementKind::ParallelGateway => BpmnElementType::ParallelGateway,
            ElementKind::SubProcess => BpmnElementType::SubProcess,
            ElementKind::TimerCatchEvent { .. } => BpmnElementType::IntermediateCatchEvent,
            ElementKind::BoundaryEvent { .. } => BpmnElementType::BoundaryEvent,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopCharacteristics {
    #[serde(default, skip_serializing_if = "is_false")]
    pub sequential: bool,
    pub input_collection: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_element: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_collection: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_element: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceFlow {
    pub id: String,
    pub from: String,
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,
}

impl ProcessModel {
    /// Parse a YAML document into a model. Validation is NOT performed here.
    pub fn from_yaml(yaml: &str) -> Result<Self, ModelError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Hex SHA-256 of the canonical JSON form of the model.
    pub fn digest(&self) -> String {
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        hex_digest(&Sha256::digest(&bytes))
    }
}

pub(crate) fn hex_digest(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

// ── Definition ──

/// A deployed, validated process with lookup indexes.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessDefinition {
    pub key: Key,
    pub version: u32,
    pub bpmn_process_id: String,
    pub digest: String,
    #[serde(skip)]
    pub model: ProcessModel,
    #[serde(skip)]
    elements: HashMap<String, usize>,
    #[serde(skip)]
    flows: HashMap<String, usize>,
    #[serde(skip)]
    outgoing: HashMap<String, Vec<String>>,
    #[serde(skip)]
    incoming: HashMap<String, Vec<String>>,
    #[serde(skip)]
    start_events: HashMap<Option<String>, String>,
    #[serde(skip)]
    boundaries: HashMap<String, Vec<String>>,
}

impl ProcessDefinition {
    pub fn new(key: Key, version: u32, digest: String, model: ProcessModel) -> Self {
        let mut elements = HashMap::new();
        let mut start_events = HashMap::new();
        let mut boundaries: HashMap<String, Vec<String>> = HashMap::new();
        for (i, element) in model.elements.iter().enumerate() {
            elements.insert(element.id.clone(), i);
            match &element.kind {
                ElementKind::StartEvent => {
                    start_events.insert(element.scope.clone(), element.id.clone());
                }
                ElementKind::BoundaryEvent { attached_to, .. } => {
                    boundaries
                        .entry(attached_to.clone())
                        .or_default()
                        .push(element.id.clone());
                }
                _ => {}
            }
        }

        let mut flows = HashMap::new();
        let mut outgoing: HashMap<String, Vec<String>> = HashMap::new();
        let mut incoming: HashMap<String, Vec<String>> = HashMap::new();
        for (i, flow) in model.flows.iter().enumerate() {
            flows.insert(flow.id.clone(), i);
            outgoing
                .entry(flow.from.clone())
                .or_default()
                .push(flow.id.clone());
            incoming
                .entry(flow.to.clone())
                .or_default()
                .push(flow.id.clone());
        }

        Self {
            key,
            version,
            bpmn_process_id: model.id.clone(),
            digest,
            model,
            elements,
            flows,
            outgoing,
            incoming,
            start_events,
            boundaries,
        }
    }

    pub fn element(&self, id: &str) -> Option<&ElementModel> {
        self.elements.get(id).map(|&i| &self.model.elements[i])
    }

    pub fn flow(&self, id: &str) -> Option<&SequenceFlow> {
        self.flows.get(id).map(|&i| &self.model.flows[i])
    }

    /// Outgoing flow ids in model order.
    pub fn outgoing(&self, element_id: &str) -> &[String] {
        self.outgoing
            .get(element_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn incoming(&self, element_id: &str) -> &[String] {
        self.incoming
            .get(element_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// The none start event of a scope (`None` = the process itself).
    pub fn start_event(&self, scope: Option<&str>) -> Option<&ElementModel> {
        self.start_events
            .get(&scope.map(str::to_string))
            .and_then(|id| self.element(id))
    }

    pub fn boundary_events(&self, activity_id: &str) -> &[String] {
        self.boundaries
            .get(activity_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}
