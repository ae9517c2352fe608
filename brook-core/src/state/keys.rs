use super::txmap::{Transactional, TxCell};
use crate::types::{encode_key, Key, PartitionId};
use serde::Serialize;

/// Monotonic key source for one partition.
#[derive(Debug, Clone, Serialize)]
pub struct KeyGenerator {
    #[serde(skip)]
    partition_id: PartitionId,
    next: TxCell<i64>,
}

impl KeyGenerator {
    pub fn new(partition_id: PartitionId) -> Self {
        Self {
            partition_id,
            next: TxCell::new(1),
        }
    }

    pub fn next_key(&mut self) -> Key {
        let counter = *self.next.get();
        self.next.set(counter + 1);
        encode_key(self.partition_id, counter)
    }

    /// The key the next call to `next_key` will return.
    pub fn peek(&self) -> Key {
        encode_key(self.partition_id, *self.next.get())
    }
}

impl Transactional for KeyGenerator {
    fn begin(&mut self) {
        self.next.begin();
    }

    fn commit(&mut self) -> usize {
        self.next.commit()
    }

    fn rollback(&mut self) {
        self.next.rollback();
    }
}
