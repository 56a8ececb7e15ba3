//! Volatile [`KVStore`] that test nodes keep their streams in.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
};

use streamlog_rs::storage::pluggables::{KVGet, KVStore};
use streamlog_rs::storage::write_batch::WriteBatch;

type Table = BTreeMap<Vec<u8>, Vec<u8>>;

/// Shared in-memory table. Clones see the same data, like handles to one database.
#[derive(Clone)]
pub(crate) struct MemDB(Arc<Mutex<Table>>);

impl MemDB {
    pub(crate) fn new() -> MemDB {
        MemDB(Arc::new(Mutex::new(Table::new())))
    }
}

impl KVStore for MemDB {
    type WriteBatch = MemWriteBatch;

    /// Applies the batch's operations in the order they were made, under one lock.
    fn write(&mut self, wb: Self::WriteBatch) {
        let mut table = self.0.lock().unwrap();
        for op in wb.0 {
            match op {
                Op::Set(key, value) => {
                    table.insert(key, value);
                }
                Op::Delete(key) => {
                    table.remove(&key);
                }
            }
        }
    }
}

impl KVGet for MemDB {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.0.lock().unwrap().get(key).cloned()
    }
}

enum Op {
    Set(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

pub(crate) struct MemWriteBatch(Vec<Op>);

impl WriteBatch for MemWriteBatch {
    fn new() -> Self {
        MemWriteBatch(Vec::new())
    }

    fn set(&mut self, key: &[u8], value: &[u8]) {
        self.0.push(Op::Set(key.to_vec(), value.to_vec()));
    }

    fn delete(&mut self, key: &[u8]) {
        self.0.push(Op::Delete(key.to_vec()));
    }
}
