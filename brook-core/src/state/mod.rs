//! Partition state. Owned by the stream processor and mutated only while a
//! record is being processed.

pub mod definitions;
pub mod element_instance;
pub mod incidents;
pub mod jobs;
pub mod keys;
pub mod timers;
pub mod txmap;
pub mod variables;

pub use definitions::DefinitionState;
pub use element_instance::{
    ElementInstance, ElementInstanceState, MultiInstanceProgress, ProcessInstanceEntry,
    ProcessInstanceStatus, ScopeError,
};
pub use incidents::{Incident, IncidentState};
pub use jobs::{Job, JobState, JobStore};
pub use keys::KeyGenerator;
pub use timers::TimerState;
pub use txmap::{Transactional, TxCell, TxMap};
pub use variables::{Variable, VariableState, VariableWrite};

use crate::error::EngineError;
use crate::model::hex_digest;
use crate::record::VariableMap;
use crate::types::{Key, PartitionId, Position};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

#[derive(Debug, Serialize)]
pub struct EngineState {
    #[serde(skip)]
    partition_id: PartitionId,
    pub keys: KeyGenerator,
    pub definitions: DefinitionState,
    pub elements: ElementInstanceState,
    pub variables: VariableState,
    pub jobs: JobStore,
    pub incidents: IncidentState,
    pub timers: TimerState,
    last_processed_position: TxCell<Option<Position>>,
}

impl EngineState {
    pub fn new(partition_id: PartitionId) -> Self {
        Self {
            partition_id,
            keys: KeyGenerator::new(partition_id),
            definitions: DefinitionState::default(),
            elements: ElementInstanceState::default(),
            variables: VariableState::default(),
            jobs: JobStore::default(),
            incidents: IncidentState::default(),
            timers: TimerState::default(),
            last_processed_position: TxCell::new(None),
        }
    }

    pub fn partition_id(&self) -> PartitionId {
        self.partition_id
    }

    pub fn last_processed_position(&self) -> Option<Position> {
        *self.last_processed_position.get()
    }

    pub fn mark_processed(&mut self, position: Position) {
        self.last_processed_position.set(Some(position));
    }

    // ── Variables through the scope tree ──

    /// Scope keys from `scope` up to the process instance, nearest first.
    pub fn ancestry(&self, scope: Key) -> Vec<Key> {
        let mut chain = Vec::new();
        let mut current = Some(scope);
        while let Some(key) = current {
            chain.push(key);
            current = self.elements.get(key).and_then(|i| i.flow_scope_key);
        }
        chain
    }

    /// Looks a variable up in `scope` and then in its ancestors.
    pub fn visible_variable(&self, scope: Key, name: &str) -> Option<Value> {
        self.ancestry(scope)
            .into_iter()
            .find_map(|s| self.variables.get_local(s, name).map(|v| v.value.clone()))
    }

    /// Nearest scope, starting at `scope`, that holds `name` locally.
    pub fn defining_scope(&self, scope: Key, name: &str) -> Option<Key> {
        self.ancestry(scope)
            .into_iter()
            .find(|s| self.variables.get_local(*s, name).is_some())
    }

    /// All variables visible from `scope`; inner scopes shadow outer ones.
    pub fn visible_variables(&self, scope: Key) -> VariableMap {
        let mut merged = VariableMap::new();
        for s in self.ancestry(scope).into_iter().rev() {
            merged.extend(self.variables.locals(s));
        }
        merged
    }

    /// Hex SHA-256 over a canonical serialization of the whole state.
    pub fn digest(&self) -> Result<String, EngineError> {
        let mut hasher = Sha256::new();
        // Every collection is backed by a BTreeMap, so the encoding is ordered.
        serde_json::to_writer(&mut hasher, self)
            .map_err(|e| EngineError::Inconsistent(format!("state cannot be encoded for a digest: {e}")))?;
        Ok(hex_digest(&hasher.finalize()))
    }
}

impl Transactional for EngineState {
    fn begin(&mut self) {
        self.keys.begin();
        self.definitions.begin();
        self.elements.begin();
        self.variables.begin();
        self.jobs.begin();
        self.incidents.begin();
        self.timers.begin();
        self.last_processed_position.begin();
    }

    fn commit(&mut self) -> usize {
        self.keys.commit()
            + self.definitions.commit()
            + self.elements.commit()
            + self.variables.commit()
            + self.jobs.commit()
            + self.incidents.commit()
            + self.timers.commit()
            + self.last_processed_position.commit()
    }

    fn rollback(&mut self) {
        self.keys.rollback();
        self.definitions.rollback();
        self.elements.rollback();
        self.variables.rollback();
        self.jobs.rollback();
        self.incidents.rollback();
        self.timers.rollback();
        self.last_processed_position.rollback();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BpmnElementType, LifecycleState};
    use serde_json::json;

    fn scope(key: Key, parent: Option<Key>) -> ElementInstance {
        ElementInstance {
            key,
            state: LifecycleState::Activated,
            element_id: format!("scope{key}"),
            element_type: BpmnElementType::SubProcess,
            flow_scope_key: parent,
            process_instance_key: 1,
            process_definition_key: 9,
            bpmn_process_id: "p".into(),
            version: 1,
            active_children: 0,
            job_key: None,
            loop_counter: 0,
            multi_instance: None,
            interrupted_by: None,
            selected_flow: None,
        }
    }

    fn nested_state() -> EngineState {
        let mut state = EngineState::new(1);
        state.elements.insert(scope(1, None)).unwrap();
        state.elements.insert(scope(2, Some(1))).unwrap();
        state.elements.insert(scope(3, Some(2))).unwrap();
        state.variables.set_local(1, "x", json!("root"), 100);
        state.variables.set_local(1, "y", json!(1), 101);
        state.variables.set_local(2, "x", json!("middle"), 102);
        state
    }

    #[test]
    fn test_lookup_walks_ancestry_with_shadowing() {
        let state = nested_state();
        assert_eq!(state.ancestry(3), vec![3, 2, 1]);
        assert_eq!(state.visible_variable(3, "x"), Some(json!("middle")));
        assert_eq!(state.visible_variable(3, "y"), Some(json!(1)));
        assert_eq!(state.visible_variable(1, "x"), Some(json!("root")));
        assert_eq!(state.defining_scope(3, "y"), Some(1));
        assert!(state.visible_variable(3, "z").is_none());

        let visible = state.visible_variables(3);
        assert_eq!(visible["x"], json!("middle"));
        assert_eq!(visible.len(), 2);
    }

    #[test]
    fn test_rollback_restores_digest() {
        let mut state = nested_state();
        let before = state.digest().unwrap();

        state.begin();
        state.keys.next_key();
        state.variables.set_local(3, "z", json!(true), 103);
        state.elements.remove(3);
        state.mark_processed(7);
        assert_ne!(state.digest().unwrap(), before);
        state.rollback();

        assert_eq!(state.digest().unwrap(), before);
        assert!(state.last_processed_position().is_none());
    }

    #[test]
    fn test_digest_is_stable_hex() {
        let digest = nested_state().digest().unwrap();
        assert_eq!(digest.len(), 64);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(nested_state().digest().unwrap(), digest);
        assert_ne!(EngineState::new(1).digest().unwrap(), digest);
    }
}
