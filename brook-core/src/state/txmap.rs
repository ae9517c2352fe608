//! Journaled collections.
//!
//! While a transaction is open every write records the previous value so the
//! transaction can be rolled back. Outside a transaction writes apply directly.

use serde::Serialize;
use std::collections::BTreeMap;
use std::ops::RangeBounds;

/// Transaction control shared by every state collection.
pub trait Transactional {
    fn begin(&mut self);
    /// Drops the journal and returns the number of journaled writes.
    fn commit(&mut self) -> usize;
    fn rollback(&mut self);
}

#[derive(Debug, Clone)]
pub struct TxMap<K, V> {
    entries: BTreeMap<K, V>,
    journal: Option<Vec<(K, Option<V>)>>,
}

impl<K: Ord + Clone, V: Clone> Default for TxMap<K, V> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
            journal: None,
        }
    }
}

impl<K: Ord + Clone, V: Clone> TxMap<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.entries.get(key)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.entries.iter()
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.entries.values()
    }

    pub fn range<R: RangeBounds<K>>(&self, range: R) -> impl DoubleEndedIterator<Item = (&K, &V)> {
        self.entries.range(range)
    }

    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        let previous = self.entries.insert(key.clone(), value);
        self.record(key, previous.clone());
        previous
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let previous = self.entries.remove(key);
        if previous.is_some() {
            self.record(key.clone(), previous.clone());
        }
        previous
    }

    /// Applies `f` to the value under `key`. Returns `None` if the key is absent.
    pub fn update<R>(&mut self, key: &K, f: impl FnOnce(&mut V) -> R) -> Option<R> {
        let value = self.entries.get_mut(key)?;
        let previous = value.clone();
        let result = f(value);
        self.record(key.clone(), Some(previous));
        Some(result)
    }

    fn record(&mut self, key: K, previous: Option<V>) {
        if let Some(journal) = self.journal.as_mut() {
            journal.push((key, previous));
        }
    }
}

impl<K: Ord + Clone, V: Clone> Transactional for TxMap<K, V> {
    fn begin(&mut self) {
        self.journal = Some(Vec::new());
    }

    fn commit(&mut self) -> usize {
        self.journal.take().map(|j| j.len()).unwrap_or(0)
    }

    fn rollback(&mut self) {
        if let Some(journal) = self.journal.take() {
            for (key, previous) in journal.into_iter().rev() {
                match previous {
                    Some(value) => {
                        self.entries.insert(key, value);
                    }
                    None => {
                        self.entries.remove(&key);
                    }
                }
            }
        }
    }
}

impl<K: Serialize, V: Serialize> Serialize for TxMap<K, V> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.entries.iter())
    }
}

/// A single journaled value.
#[derive(Debug, Clone, Default)]
pub struct TxCell<T> {
    value: T,
    saved: Option<Option<T>>,
}

impl<T: Clone> TxCell<T> {
    pub fn new(value: T) -> Self {
        Self { value, saved: None }
    }

    pub fn get(&self) -> &T {
        &self.value
    }

    pub fn set(&mut self, value: T) {
        if let Some(saved) = self.saved.as_mut() {
            if saved.is_none() {
                *saved = Some(self.value.clone());
            }
        }
        self.value = value;
    }
}

impl<T: Clone> Transactional for TxCell<T> {
    fn begin(&mut self) {
        self.saved = Some(None);
    }

    fn commit(&mut self) -> usize {
        match self.saved.take() {
            Some(Some(_)) => 1,
            _ => 0,
        }
    }

    fn rollback(&mut self) {
        if let Some(Some(previous)) = self.saved.take() {
            self.value = previous;
        }
    }
}

impl<T: Serialize> Serialize for TxCell<T> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.value.serialize(serializer)
    }
}
