use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;

use super::{KeySpace, LocalStore, WriteBatch};
use crate::errors::Error;

type Tables = HashMap<KeySpace, HashMap<Vec<u8>, Bytes>>;

/// An in-memory [LocalStore], used by tests and as the cheapest way to run
/// without on-disk state.
#[derive(Clone, Default)]
pub struct MemoryLocalStore {
    tables: Arc<RwLock<Tables>>,
}

#[async_trait]
impl LocalStore for MemoryLocalStore {
    async fn get(&self, keyspace: KeySpace, key: &[u8]) -> Result<Option<Bytes>, Error> {
        Ok(self
            .tables
            .read()
            .get(&keyspace)
            .and_then(|table| table.get(key))
            .cloned())
    }

    fn begin_write(&self, _estimated_bytes: Option<usize>) -> Box<dyn WriteBatch> {
        Box::new(MemoryWriteBatch {
            tables: self.tables.clone(),
            ops: Vec::new(),
        })
    }

    async fn clear_keyspace(&self, keyspace: KeySpace) -> Result<(), Error> {
        self.tables.write().remove(&keyspace);
        Ok(())
    }
}

enum BatchOp {
    Put(KeySpace, Vec<u8>, Bytes),
    Delete(KeySpace, Vec<u8>),
}

struct MemoryWriteBatch {
    tables: Arc<RwLock<Tables>>,
    ops: Vec<BatchOp>,
}

#[async_trait]
impl WriteBatch for MemoryWriteBatch {
    fn put(&mut self, keyspace: KeySpace, key: &[u8], value: &[u8]) {
        self.ops.push(BatchOp::Put(
            keyspace,
            key.to_vec(),
            Bytes::copy_from_slice(value),
        ));
    }

    fn delete(&mut self, keyspace: KeySpace, key: &[u8]) {
        self.ops.push(BatchOp::Delete(keyspace, key.to_vec()));
    }

    async fn flush(&mut self) -> Result<(), Error> {
        let mut tables = self.tables.write();
        for op in self.ops.drain(..) {
            match op {
                BatchOp::Put(keyspace, key, value) => {
                    tables.entry(keyspace).or_default().insert(key, value);
                }
                BatchOp::Delete(keyspace, key) => {
                    if let Some(table) = tables.get_mut(&keyspace) {
                        table.remove(&key);
                    }
                }
            }
        }
        Ok(())
    }
}
