use super::txmap::{Transactional, TxMap};
use crate::record::IncidentRecord;
use crate::types::Key;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Incident {
    pub key: Key,
    pub record: IncidentRecord,
}

/// Active incidents. At most one per element instance.
#[derive(Debug, Default, Serialize)]
pub struct IncidentState {
    incidents: TxMap<Key, IncidentRecord>,
    by_element: TxMap<Key, Key>,
    by_process: TxMap<(Key, Key), ()>,
}

impl IncidentState {
    pub fn get(&self, key: Key) -> Option<&IncidentRecord> {
        self.incidents.get(&key)
    }

    /// Key of the active incident of an element instance.
    pub fn for_element(&self, element_instance_key: Key) -> Option<Key> {
        self.by_element.get(&element_instance_key).copied()
    }

    /// Stores a new incident. Returns `false` if the element already has one.
    pub fn create(&mut self, key: Key, record: IncidentRecord) -> bool {
        if self.by_element.contains_key(&record.element_instance_key) {
            return false;
        }
        self.by_element.insert(record.element_instance_key, key);
        self.by_process.insert((record.process_instance_key, key), ());
        self.incidents.insert(key, record);
        true
    }

    pub fn resolve(&mut self, key: Key) -> Option<IncidentRecord> {
        let record = self.incidents.remove(&key)?;
        self.by_element.remove(&record.element_instance_key);
        self.by_process.remove(&(record.process_instance_key, key));
        Some(record)
    }

    pub fn list_for_process(&self, process_instance_key: Key) -> Vec<Incident> {
        self.by_process
            .range((process_instance_key, Key::MIN)..=(process_instance_key, Key::MAX))
            .filter_map(|((_, key), _)| {
                self.incidents.get(key).map(|record| Incident {
                    key: *key,
                    record: record.clone(),
                })
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.incidents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.incidents.is_empty()
    }
}

impl Transactional for IncidentState {
    fn begin(&mut self) {
        self.incidents.begin();
        self.by_element.begin();
        self.by_process.begin();
    }

    fn commit(&mut self) -> usize {
        self.incidents.commit() + self.by_element.commit() + self.by_process.commit()
    }

    fn rollback(&mut self) {
        self.incidents.rollback();
        self.by_element.rollback();
        self.by_process.rollback();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::ErrorType;

    fn incident(process: Key, element: Key) -> IncidentRecord {
        IncidentRecord {
            error_type: ErrorType::IoMappingError,
            error_message: "no variable found with name 'x'".into(),
            bpmn_process_id: "p".into(),
            process_definition_key: 1,
            process_instance_key: process,
            element_id: "task".into(),
            element_instance_key: element,
            job_key: None,
            variable_scope_key: element,
            failed_state: None,
        }
    }

    #[test]
    fn test_at_most_one_incident_per_element() {
        let mut state = IncidentState::default();
        assert!(state.create(10, incident(1, 5)));
        assert!(!state.create(11, incident(1, 5)));
        assert_eq!(state.for_element(5), Some(10));
        assert_eq!(state.len(), 1);

        state.resolve(10);
        assert!(state.create(12, incident(1, 5)));
    }

    #[test]
    fn test_list_per_process_instance() {
        let mut state = IncidentState::default();
        state.create(10, incident(1, 5));
        state.create(11, incident(1, 6));
        state.create(12, incident(2, 7));

        let keys: Vec<_> = state.list_for_process(1).iter().map(|i| i.key).collect();
        assert_eq!(keys, vec![10, 11]);
        assert_eq!(state.list_for_process(2).len(), 1);
        assert!(state.list_for_process(3).is_empty());
    }
}
