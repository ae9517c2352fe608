//! The scope tree: element instances indexed by key, each pointing at its flow scope.

use super::txmap::{Transactional, TxMap};
use crate::record::ProcessInstanceRecord;
use crate::types::{BpmnElementType, Key, LifecycleState};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementInstance {
    pub key: Key,
    pub state: LifecycleState,
    pub element_id: String,
    pub element_type: BpmnElementType,
    pub flow_scope_key: Option<Key>,
    pub process_instance_key: Key,
    pub process_definition_key: Key,
    pub bpmn_process_id: String,
    pub version: u32,
    /// Child element instances plus in-flight sequence-flow tokens.
    pub active_children: u32,
    pub job_key: Option<Key>,
    /// Position of an inner multi-instance element, starting at 1.
    pub loop_counter: u32,
    pub multi_instance: Option<MultiInstanceProgress>,
    /// Boundary event to activate once this instance is terminated.
    pub interrupted_by: Option<String>,
    /// Outgoing flow chosen by an exclusive gateway.
    pub selected_flow: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiInstanceProgress {
    pub items: Vec<Value>,
    pub spawned: u32,
}

impl ElementInstance {
    pub fn is_root(&self) -> bool {
        self.flow_scope_key.is_none()
    }

    pub fn to_record(&self) -> ProcessInstanceRecord {
        ProcessInstanceRecord {
            bpmn_process_id: self.bpmn_process_id.clone(),
            version: self.version,
            process_definition_key: self.process_definition_key,
            process_instance_key: self.process_instance_key,
            element_id: self.element_id.clone(),
            element_type: self.element_type,
            flow_scope_key: self.flow_scope_key,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessInstanceStatus {
    Active,
    Completed,
    Terminated,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessInstanceEntry {
    pub key: Key,
    pub process_definition_key: Key,
    pub bpmn_process_id: String,
    pub status: ProcessInstanceStatus,
}

#[derive(Debug, thiserror::Error)]
pub enum ScopeError {
    #[error("element instance {0} not found")]
    NotFound(Key),
    #[error("active children of element instance {0} would drop below zero")]
    Underflow(Key),
}

#[derive(Debug, Default, Serialize)]
pub struct ElementInstanceState {
    instances: TxMap<Key, ElementInstance>,
    children: TxMap<(Key, Key), ()>,
    /// Tokens waiting at a parallel join: (scope, gateway id, flow id) -> count.
    joins: TxMap<(Key, String, String), u32>,
    process_instances: TxMap<Key, ProcessInstanceEntry>,
}

impl ElementInstanceState {
    pub fn get(&self, key: Key) -> Option<&ElementInstance> {
        self.instances.get(&key)
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Inserts a new instance and counts it as an active child of its flow scope.
    pub fn insert(&mut self, instance: ElementInstance) -> Result<(), ScopeError> {
        if let Some(parent) = instance.flow_scope_key {
            self.increment_active(parent)?;
            self.children.insert((parent, instance.key), ());
        }
        self.instances.insert(instance.key, instance);
        Ok(())
    }

    /// Removes an instance. The flow scope's active-children count is left to the caller.
    pub fn remove(&mut self, key: Key) -> Option<ElementInstance> {
        let instance = self.instances.remove(&key)?;
        if let Some(parent) = instance.flow_scope_key {
            self.children.remove(&(parent, key));
        }
        Some(instance)
    }

    pub fn set_state(&mut self, key: Key, state: LifecycleState) -> Result<ElementInstance, ScopeError> {
        self.update(key, |instance| {
            instance.state = state;
            instance.clone()
        })
    }

    pub fn update<R>(
        &mut self,
        key: Key,
        f: impl FnOnce(&mut ElementInstance) -> R,
    ) -> Result<R, ScopeError> {
        self.instances.update(&key, f).ok_or(ScopeError::NotFound(key))
    }

    pub fn increment_active(&mut self, key: Key) -> Result<u32, ScopeError> {
        self.update(key, |instance| {
            instance.active_children += 1;
            instance.active_children
        })
    }

    pub fn decrement_active(&mut self, key: Key) -> Result<u32, ScopeError> {
        let current = self
            .get(key)
            .map(|i| i.active_children)
            .ok_or(ScopeError::NotFound(key))?;
        if current == 0 {
            return Err(ScopeError::Underflow(key));
        }
        self.update(key, |instance| {
            instance.active_children -= 1;
            instance.active_children
        })
    }

    /// Child instance keys in creation order.
    pub fn children(&self, parent: Key) -> Vec<Key> {
        self.children
            .range((parent, Key::MIN)..=(parent, Key::MAX))
            .map(|((_, child), _)| *child)
            .collect()
    }

    // ── Parallel joins ──

    /// Records a token arriving at a join over `flow_id`.
    pub fn join_arrive(&mut self, scope: Key, gateway_id: &str, flow_id: &str) -> u32 {
        let key = (scope, gateway_id.to_string(), flow_id.to_string());
        let count = self.joins.get(&key).copied().unwrap_or(0) + 1;
        self.joins.insert(key, count);
        count
    }

    pub fn join_count(&self, scope: Key, gateway_id: &str, flow_id: &str) -> u32 {
        self.joins
            .get(&(scope, gateway_id.to_string(), flow_id.to_string()))
            .copied()
            .unwrap_or(0)
    }

    /// Consumes one token per flow. Callers check every flow has a token first.
    pub fn join_consume(&mut self, scope: Key, gateway_id: &str, flows: &[String]) {
        for flow in flows {
            let key = (scope, gateway_id.to_string(), flow.clone());
            match self.joins.get(&key).copied() {
                Some(n) if n > 1 => {
                    self.joins.insert(key, n - 1);
                }
                Some(_) => {
                    self.joins.remove(&key);
                }
                None => {}
            }
        }
    }

    /// Drops all join tokens of a scope and returns how many were dropped.
    pub fn clear_joins(&mut self, scope: Key) -> u32 {
        let keys: Vec<_> = self
            .joins
            .iter()
            .filter(|((s, _, _), _)| *s == scope)
            .map(|(k, n)| (k.clone(), *n))
            .collect();
        let mut dropped = 0;
        for (key, n) in keys {
            self.joins.remove(&key);
            dropped += n;
        }
        dropped
    }

    // ── Process instances ──

    pub fn put_process_instance(&mut self, entry: ProcessInstanceEntry) {
        self.process_instances.insert(entry.key, entry);
    }

    pub fn process_instance(&self, key: Key) -> Option<&ProcessInstanceEntry> {
        self.process_instances.get(&key)
    }

    pub fn set_process_instance_status(&mut self, key: Key, status: ProcessInstanceStatus) {
        self.process_instances.update(&key, |entry| entry.status = status);
    }

    pub fn instances(&self) -> impl Iterator<Item = &ElementInstance> {
        self.instances.values()
    }
}

impl Transactional for ElementInstanceState {
    fn begin(&mut self) {
        self.instances.begin();
        self.children.begin();
        self.joins.begin();
        self.process_instances.begin();
    }

    fn commit(&mut self) -> usize {
        self.instances.commit()
            + self.children.commit()
            + self.joins.commit()
            + self.process_instances.commit()
    }

    fn rollback(&mut self) {
        self.instances.rollback();
        self.children.rollback();
        self.joins.rollback();
        self.process_instances.rollback();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(key: Key, parent: Option<Key>) -> ElementInstance {
        ElementInstance {
            key,
            state: LifecycleState::Activating,
            element_id: format!("e{key}"),
            element_type: BpmnElementType::ServiceTask,
            flow_scope_key: parent,
            process_instance_key: 1,
            process_definition_key: 100,
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

    #[test]
    fn test_insert_counts_children() {
        let mut state = ElementInstanceState::default();
        state.insert(instance(1, None)).unwrap();
        state.insert(instance(2, Some(1))).unwrap();
        state.insert(instance(3, Some(1))).unwrap();

        assert_eq!(state.get(1).unwrap().active_children, 2);
        assert_eq!(state.children(1), vec![2, 3]);

        state.remove(2);
        assert_eq!(state.decrement_active(1).unwrap(), 1);
        assert_eq!(state.children(1), vec![3]);
    }

    #[test]
    fn test_insert_into_missing_parent_fails() {
        let mut state = ElementInstanceState::default();
        assert!(matches!(
            state.insert(instance(2, Some(99))),
            Err(ScopeError::NotFound(99))
        ));
        assert!(state.get(2).is_none());
    }

    #[test]
    fn test_decrement_below_zero_is_an_error() {
        let mut state = ElementInstanceState::default();
        state.insert(instance(1, None)).unwrap();
        assert!(matches!(state.decrement_active(1), Err(ScopeError::Underflow(1))));
    }

    #[test]
    fn test_join_tokens() {
        let mut state = ElementInstanceState::default();
        assert_eq!(state.join_arrive(1, "join", "a"), 1);
        assert_eq!(state.join_arrive(1, "join", "a"), 2);
        state.join_arrive(1, "join", "b");
        state.join_consume(1, "join", &["a".to_string(), "b".to_string()]);
        assert_eq!(state.join_count(1, "join", "a"), 1);
        assert_eq!(state.join_count(1, "join", "b"), 0);
        assert_eq!(state.clear_joins(1), 1);
    }
}
