use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use redb::{Database, TableDefinition};
use tracing::instrument;

use super::{KeySpace, LocalStore, WriteBatch};
use crate::errors::Error;

const BLOB_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("blob");
const BLOBMETA_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("blobmeta");
const TREE_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("tree");
const CONFIG_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("config");

fn table(keyspace: KeySpace) -> TableDefinition<'static, &'static [u8], &'static [u8]> {
    match keyspace {
        KeySpace::Blob => BLOB_TABLE,
        KeySpace::BlobMeta => BLOBMETA_TABLE,
        KeySpace::Tree => TREE_TABLE,
        KeySpace::Config => CONFIG_TABLE,
    }
}

/// A [LocalStore] backed by a single redb database file, one table per key
/// space.
#[derive(Clone)]
pub struct RedbLocalStore {
    // Wrapped in an Arc to be able to move it into spawn_blocking.
    db: Arc<Database>,
}

impl RedbLocalStore {
    /// Opens (creating if necessary) the database at the given path.
    pub async fn new(path: PathBuf) -> Result<Self, Error> {
        if path == PathBuf::from("/") {
            return Err(Error::StorageError(
                "cowardly refusing to open / with redb".to_string(),
            ));
        }

        let db = tokio::task::spawn_blocking(|| -> Result<_, redb::Error> {
            let db = redb::Database::create(path)?;
            create_schema(&db)?;
            Ok(db)
        })
        .await??;

        Ok(Self { db: Arc::new(db) })
    }

    /// Constructs a new instance using the in-memory backend.
    pub fn new_temporary() -> Result<Self, Error> {
        let db =
            redb::Database::builder().create_with_backend(redb::backends::InMemoryBackend::new())?;

        create_schema(&db)?;

        Ok(Self { db: Arc::new(db) })
    }
}

/// Ensures all tables are present.
fn create_schema(db: &redb::Database) -> Result<(), redb::Error> {
    let txn = db.begin_write()?;
    for keyspace in KeySpace::ALL {
        txn.open_table(table(keyspace))?;
    }
    txn.commit()?;

    Ok(())
}

#[async_trait]
impl LocalStore for RedbLocalStore {
    #[instrument(skip_all, fields(keyspace = keyspace.name()))]
    async fn get(&self, keyspace: KeySpace, key: &[u8]) -> Result<Option<Bytes>, Error> {
        let db = self.db.clone();
        let key = key.to_vec();

        let value = tokio::task::spawn_blocking(move || -> Result<_, Error> {
            let txn = db.begin_read().map_err(redb::Error::from)?;
            let table = txn.open_table(table(keyspace))?;
            Ok(table
                .get(&*key)?
                .map(|guard| Bytes::copy_from_slice(guard.value())))
        })
        .await??;

        Ok(value)
    }

    fn begin_write(&self, _estimated_bytes: Option<usize>) -> Box<dyn WriteBatch> {
        Box::new(RedbWriteBatch {
            db: self.db.clone(),
            ops: Vec::new(),
        })
    }

    #[instrument(skip_all, fields(keyspace = keyspace.name()))]
    async fn clear_keyspace(&self, keyspace: KeySpace) -> Result<(), Error> {
        let db = self.db.clone();

        tokio::task::spawn_blocking(move || -> Result<(), Error> {
            let txn = db.begin_write()?;
            // Dropping and reopening the table inside one transaction makes
            // the clear atomic for readers.
            txn.delete_table(table(keyspace))?;
            txn.open_table(table(keyspace))?;
            txn.commit()?;
            Ok(())
        })
        .await??;

        Ok(())
    }
}

enum BatchOp {
    Put(KeySpace, Vec<u8>, Vec<u8>),
    Delete(KeySpace, Vec<u8>),
}

/// Buffers writes in memory; a single redb write transaction applies them
/// all on flush. Concurrent batches serialize at commit time inside redb.
struct RedbWriteBatch {
    db: Arc<Database>,
    ops: Vec<BatchOp>,
}

#[async_trait]
impl WriteBatch for RedbWriteBatch {
    fn put(&mut self, keyspace: KeySpace, key: &[u8], value: &[u8]) {
        self.ops
            .push(BatchOp::Put(keyspace, key.to_vec(), value.to_vec()));
    }

    fn delete(&mut self, keyspace: KeySpace, key: &[u8]) {
        self.ops.push(BatchOp::Delete(keyspace, key.to_vec()));
    }

    async fn flush(&mut self) -> Result<(), Error> {
        if self.ops.is_empty() {
            return Ok(());
        }

        let db = self.db.clone();
        let ops = std::mem::take(&mut self.ops);

        tokio::task::spawn_blocking(move || -> Result<(), Error> {
            let txn = db.begin_write()?;
            {
                for op in &ops {
                    match op {
                        BatchOp::Put(keyspace, key, value) => {
                            let mut table = txn.open_table(table(*keyspace))?;
                            table.insert(&**key, &**value)?;
                        }
                        BatchOp::Delete(keyspace, key) => {
                            let mut table = txn.open_table(table(*keyspace))?;
                            table.remove(&**key)?;
                        }
                    }
                }
            }
            txn.commit()?;
            Ok(())
        })
        .await??;

        Ok(())
    }
}
