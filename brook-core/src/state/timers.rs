use super::txmap::{Transactional, TxMap};
use crate::record::TimerRecord;
use crate::types::{Key, Timestamp};
use serde::Serialize;

#[derive(Debug, Default, Serialize)]
pub struct TimerState {
    timers: TxMap<Key, TimerRecord>,
    by_element: TxMap<(Key, Key), ()>,
}

impl TimerState {
    pub fn get(&self, key: Key) -> Option<&TimerRecord> {
        self.timers.get(&key)
    }

    pub fn put(&mut self, key: Key, timer: TimerRecord) {
        self.by_element.insert((timer.element_instance_key, key), ());
        self.timers.insert(key, timer);
    }

    pub fn remove(&mut self, key: Key) -> Option<TimerRecord> {
        let timer = self.timers.remove(&key)?;
        self.by_element.remove(&(timer.element_instance_key, key));
        Some(timer)
    }

    /// Timers owned by an element instance, in key order.
    pub fn for_element(&self, element_instance_key: Key) -> Vec<(Key, TimerRecord)> {
        self.by_element
            .range((element_instance_key, Key::MIN)..=(element_instance_key, Key::MAX))
            .filter_map(|((_, key), _)| self.timers.get(key).map(|t| (*key, t.clone())))
            .collect()
    }

    /// All timers with their due dates.
    pub fn due_dates(&self) -> Vec<(Timestamp, Key)> {
        self.timers.iter().map(|(k, t)| (t.due_date, *k)).collect()
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }
}

impl Transactional for TimerState {
    fn begin(&mut self) {
        self.timers.begin();
        self.by_element.begin();
    }

    fn commit(&mut self) -> usize {
        self.timers.commit() + self.by_element.commit()
    }

    fn rollback(&mut self) {
        self.timers.rollback();
        self.by_element.rollback();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timers_by_element() {
        let mut state = TimerState::default();
        let timer = |element: Key, due: Timestamp| TimerRecord {
            element_instance_key: element,
            due_date: due,
            repetitions: 1,
            ..Default::default()
        };
        state.put(1, timer(7, 100));
        state.put(2, timer(7, 50));
        state.put(3, timer(8, 10));

        let owned: Vec<_> = state.for_element(7).into_iter().map(|(k, _)| k).collect();
        assert_eq!(owned, vec![1, 2]);

        state.remove(1);
        assert_eq!(state.for_element(7).len(), 1);
        assert_eq!(state.due_dates(), vec![(50, 2), (10, 3)]);
    }
}
