use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use redb::{Database, TableDefinition};
use tracing::instrument;
use weft_castore::{Error, ObjectId};

use super::{Overlay, OverlayDir};
use crate::inodes::InodeNumber;

const DIR_TABLE: TableDefinition<u64, Vec<u8>> = TableDefinition::new("dir");
const FILE_TABLE: TableDefinition<u64, Vec<u8>> = TableDefinition::new("file");
const SHA1_TABLE: TableDefinition<u64, Vec<u8>> = TableDefinition::new("sha1");
const META_TABLE: TableDefinition<&str, u64> = TableDefinition::new("meta");

const NEXT_INODE_KEY: &str = "next-inode";

/// A single-file overlay, used where the host filesystem cannot be trusted
/// with the POSIX operations [super::FsOverlay] relies on. Directory
/// contents live in one table, file contents in another.
#[derive(Clone)]
pub struct RedbOverlay {
    // Arc so the database can move into spawn_blocking.
    db: Arc<Database>,
}

impl RedbOverlay {
    pub fn new(path: PathBuf) -> Result<Self, Error> {
        let db = redb::Database::create(path)?;
        create_schema(&db)?;
        Ok(Self { db: Arc::new(db) })
    }

    pub fn new_temporary() -> Result<Self, Error> {
        let db =
            redb::Database::builder().create_with_backend(redb::backends::InMemoryBackend::new())?;
        create_schema(&db)?;
        Ok(Self { db: Arc::new(db) })
    }

    async fn with_write<F, T>(&self, op: F) -> Result<T, Error>
    where
        F: FnOnce(&redb::WriteTransaction) -> Result<T, Error> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || -> Result<T, Error> {
            let txn = db.begin_write()?;
            let out = op(&txn)?;
            txn.commit()?;
            Ok(out)
        })
        .await?
    }

    async fn read_value(
        &self,
        table_def: TableDefinition<'static, u64, Vec<u8>>,
        inode: InodeNumber,
    ) -> Result<Option<Vec<u8>>, Error> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || -> Result<Option<Vec<u8>>, Error> {
            let txn = db.begin_read()?;
            let table = txn.open_table(table_def)?;
            Ok(table.get(inode)?.map(|guard| guard.value()))
        })
        .await?
    }
}

fn create_schema(db: &Database) -> Result<(), Error> {
    let txn = db.begin_write()?;
    txn.open_table(DIR_TABLE)?;
    txn.open_table(FILE_TABLE)?;
    txn.open_table(SHA1_TABLE)?;
    txn.open_table(META_TABLE)?;
    txn.commit()?;
    Ok(())
}

#[async_trait]
impl Overlay for RedbOverlay {
    #[instrument(skip(self, dir))]
    async fn save_overlay_dir(&self, inode: InodeNumber, dir: &OverlayDir) -> Result<(), Error> {
        let payload = dir.serialize();
        self.with_write(move |txn| {
            let mut table = txn.open_table(DIR_TABLE)?;
            table.insert(inode, payload)?;
            Ok(())
        })
        .await
    }

    async fn load_overlay_dir(&self, inode: InodeNumber) -> Result<Option<OverlayDir>, Error> {
        match self.read_value(DIR_TABLE, inode).await? {
            None => Ok(None),
            Some(data) => Ok(Some(OverlayDir::deserialize(&data).map_err(|e| {
                Error::StorageError(format!("overlay dir {inode}: {e}"))
            })?)),
        }
    }

    #[instrument(skip(self, contents, sha1), fields(size = contents.len()))]
    async fn save_overlay_file(
        &self,
        inode: InodeNumber,
        contents: &[u8],
        sha1: Option<&ObjectId>,
    ) -> Result<(), Error> {
        let contents = contents.to_vec();
        let sha1 = sha1.map(|s| s.as_slice().to_vec());
        self.with_write(move |txn| {
            let mut files = txn.open_table(FILE_TABLE)?;
            files.insert(inode, contents)?;
            let mut sidecars = txn.open_table(SHA1_TABLE)?;
            match sha1 {
                Some(sha1) => {
                    sidecars.insert(inode, sha1)?;
                }
                None => {
                    sidecars.remove(inode)?;
                }
            }
            Ok(())
        })
        .await
    }

    async fn load_overlay_file(&self, inode: InodeNumber) -> Result<Option<Bytes>, Error> {
        Ok(self.read_value(FILE_TABLE, inode).await?.map(Bytes::from))
    }

    async fn load_file_sha1(&self, inode: InodeNumber) -> Result<Option<ObjectId>, Error> {
        match self.read_value(SHA1_TABLE, inode).await? {
            None => Ok(None),
            Some(data) => Ok(Some(ObjectId::try_from(data).map_err(|e| {
                Error::StorageError(format!("overlay sha1 {inode}: {e}"))
            })?)),
        }
    }

    #[instrument(skip(self))]
    async fn remove_overlay_data(&self, inode: InodeNumber) -> Result<(), Error> {
        self.with_write(move |txn| {
            txn.open_table(FILE_TABLE)?.remove(inode)?;
            txn.open_table(DIR_TABLE)?.remove(inode)?;
            txn.open_table(SHA1_TABLE)?.remove(inode)?;
            Ok(())
        })
        .await
    }

    async fn update_used_inode_number(&self, inode: InodeNumber) -> Result<(), Error> {
        self.with_write(move |txn| {
            txn.open_table(META_TABLE)?.insert(NEXT_INODE_KEY, inode)?;
            Ok(())
        })
        .await
    }

    async fn load_next_inode_number(&self) -> Result<Option<InodeNumber>, Error> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || -> Result<Option<u64>, Error> {
            let txn = db.begin_read()?;
            let table = txn.open_table(META_TABLE)?;
            Ok(table.get(NEXT_INODE_KEY)?.map(|guard| guard.value()))
        })
        .await?
    }
}
