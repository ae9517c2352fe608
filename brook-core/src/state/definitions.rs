use super::txmap::{Transactional, TxMap};
use crate::model::ProcessDefinition;
use crate::types::Key;
use serde::Serialize;
use std::sync::Arc;

/// Deployed process definitions, by key and by (bpmn process id, version).
#[derive(Debug, Default, Serialize)]
pub struct DefinitionState {
    definitions: TxMap<Key, Arc<ProcessDefinition>>,
    versions: TxMap<(String, u32), Key>,
}

impl DefinitionState {
    pub fn put(&mut self, definition: ProcessDefinition) {
        self.versions.insert(
            (definition.bpmn_process_id.clone(), definition.version),
            definition.key,
        );
        self.definitions.insert(definition.key, Arc::new(definition));
    }

    pub fn get(&self, key: Key) -> Option<Arc<ProcessDefinition>> {
        self.definitions.get(&key).cloned()
    }

    pub fn by_version(&self, bpmn_process_id: &str, version: u32) -> Option<Arc<ProcessDefinition>> {
        self.versions
            .get(&(bpmn_process_id.to_string(), version))
            .and_then(|key| self.get(*key))
    }

    pub fn latest(&self, bpmn_process_id: &str) -> Option<Arc<ProcessDefinition>> {
        self.versions
            .range((bpmn_process_id.to_string(), 0)..=(bpmn_process_id.to_string(), u32::MAX))
            .next_back()
            .and_then(|(_, key)| self.get(*key))
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}

impl Transactional for DefinitionState {
    fn begin(&mut self) {
        self.definitions.begin();
        self.versions.begin();
    }

    fn commit(&mut self) -> usize {
        self.definitions.commit() + self.versions.commit()
    }

    fn rollback(&mut self) {
        self.definitions.rollback();
        self.versions.rollback();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ProcessModel;

    fn definition(id: &str, key: Key, version: u32) -> ProcessDefinition {
        let model = ProcessModel {
            id: id.to_string(),
            name: None,
            elements: vec![],
            flows: vec![],
        };
        ProcessDefinition::new(key, version, model.digest(), model)
    }

    #[test]
    fn test_latest_version_wins() {
        let mut state = DefinitionState::default();
        state.put(definition("order", 10, 1));
        state.put(definition("order", 20, 2));
        state.put(definition("orders", 30, 1));

        assert_eq!(state.latest("order").map(|d| d.key), Some(20));
        assert_eq!(state.by_version("order", 1).map(|d| d.key), Some(10));
        assert_eq!(state.latest("orders").map(|d| d.key), Some(30));
        assert!(state.latest("unknown").is_none());
    }
}
