use super::txmap::{Transactional, TxMap};
use crate::record::VariableMap;
use crate::types::Key;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    pub key: Key,
    pub value: Value,
}

/// Outcome of a local write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariableWrite {
    Created,
    Updated,
    Unchanged,
}

/// Variables stored per (scope key, name). Ancestry lookups live on `EngineState`,
/// which owns the scope tree.
#[derive(Debug, Default, Serialize)]
pub struct VariableState {
    variables: TxMap<(Key, String), Variable>,
}

impl VariableState {
    pub fn get_local(&self, scope: Key, name: &str) -> Option<&Variable> {
        self.variables.get(&(scope, name.to_string()))
    }

    /// Writes a variable into `scope`. `new_key` is only used when the variable is created.
    pub fn set_local(&mut self, scope: Key, name: &str, value: Value, new_key: Key) -> (Key, VariableWrite) {
        let id = (scope, name.to_string());
        match self.variables.get(&id) {
            Some(existing) if existing.value == value => (existing.key, VariableWrite::Unchanged),
            Some(existing) => {
                let key = existing.key;
                self.variables.insert(id, Variable { key, value });
                (key, VariableWrite::Updated)
            }
            None => {
                self.variables.insert(id, Variable { key: new_key, value });
                (new_key, VariableWrite::Created)
            }
        }
    }

    pub fn locals(&self, scope: Key) -> VariableMap {
        self.variables
            .range((scope, String::new())..)
            .take_while(|((s, _), _)| *s == scope)
            .map(|((_, name), v)| (name.clone(), v.value.clone()))
            .collect()
    }

    pub fn remove_scope(&mut self, scope: Key) {
        let names: Vec<_> = self.locals(scope).into_keys().collect();
        for name in names {
            self.variables.remove(&(scope, name));
        }
    }

    pub fn len(&self) -> usize {
        self.variables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }
}

impl Transactional for VariableState {
    fn begin(&mut self) {
        self.variables.begin();
    }

    fn commit(&mut self) -> usize {
        self.variables.commit()
    }

    fn rollback(&mut self) {
        self.variables.rollback();
    }
}
