use async_trait::async_trait;
use bytes::Bytes;

use crate::errors::Error;

mod memory;
mod redb;

pub use self::memory::MemoryLocalStore;
pub use self::redb::RedbLocalStore;

/// The column families of the local store. Keys are raw content hashes (or
/// other opaque bytes); values are opaque to the store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum KeySpace {
    Blob,
    BlobMeta,
    Tree,
    Config,
}

impl KeySpace {
    pub const ALL: [KeySpace; 4] = [
        KeySpace::Blob,
        KeySpace::BlobMeta,
        KeySpace::Tree,
        KeySpace::Config,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            KeySpace::Blob => "blob",
            KeySpace::BlobMeta => "blobmeta",
            KeySpace::Tree => "tree",
            KeySpace::Config => "config",
        }
    }
}

/// A persistent key-value cache with named column families.
///
/// Implementations may be an embedded database or plain memory. Callers get
/// exactly this contract: per-batch durability on flush, no visibility of
/// unflushed writes, no ordering guarantees across key spaces.
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Looks up a single value. `Ok(None)` means the key is absent.
    async fn get(&self, keyspace: KeySpace, key: &[u8]) -> Result<Option<Bytes>, Error>;

    /// Opens a write batch. Multiple batches may be open concurrently;
    /// writes land atomically and become visible when the batch is flushed.
    /// The size hint lets implementations preallocate.
    fn begin_write(&self, estimated_bytes: Option<usize>) -> Box<dyn WriteBatch>;

    /// Atomically drops every key in the given key space.
    async fn clear_keyspace(&self, keyspace: KeySpace) -> Result<(), Error>;

    /// Convenience single put: a one-entry batch, flushed.
    async fn put(&self, keyspace: KeySpace, key: &[u8], value: &[u8]) -> Result<(), Error> {
        let mut batch = self.begin_write(Some(value.len()));
        batch.put(keyspace, key, value);
        batch.flush().await
    }
}

#[async_trait]
pub trait WriteBatch: Send {
    fn put(&mut self, keyspace: KeySpace, key: &[u8], value: &[u8]);

    /// Queues a deletion; applied atomically with the batch.
    fn delete(&mut self, keyspace: KeySpace, key: &[u8]);

    /// Persists the batch. Flushing an empty batch is a no-op.
    async fn flush(&mut self) -> Result<(), Error>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::sync::Arc;

    fn memory_store() -> Arc<dyn LocalStore> {
        Arc::new(MemoryLocalStore::default())
    }

    fn redb_store() -> Arc<dyn LocalStore> {
        Arc::new(RedbLocalStore::new_temporary().unwrap())
    }

    #[rstest]
    #[case::memory(memory_store())]
    #[case::redb(redb_store())]
    #[tokio::test]
    async fn put_get_roundtrip(#[case] store: Arc<dyn LocalStore>) {
        assert_eq!(None, store.get(KeySpace::Blob, b"k").await.unwrap());

        store.put(KeySpace::Blob, b"k", b"v").await.unwrap();
        assert_eq!(
            Some(Bytes::from_static(b"v")),
            store.get(KeySpace::Blob, b"k").await.unwrap()
        );

        // other key spaces are unaffected
        assert_eq!(None, store.get(KeySpace::Tree, b"k").await.unwrap());
    }

    #[rstest]
    #[case::memory(memory_store())]
    #[case::redb(redb_store())]
    #[tokio::test]
    async fn batch_not_visible_until_flush(#[case] store: Arc<dyn LocalStore>) {
        let mut batch = store.begin_write(None);
        batch.put(KeySpace::Tree, b"a", b"1");
        batch.put(KeySpace::Tree, b"b", b"2");

        assert_eq!(None, store.get(KeySpace::Tree, b"a").await.unwrap());

        batch.flush().await.unwrap();
        assert_eq!(
            Some(Bytes::from_static(b"1")),
            store.get(KeySpace::Tree, b"a").await.unwrap()
        );
        assert_eq!(
            Some(Bytes::from_static(b"2")),
            store.get(KeySpace::Tree, b"b").await.unwrap()
        );
    }

    #[rstest]
    #[case::memory(memory_store())]
    #[case::redb(redb_store())]
    #[tokio::test]
    async fn batch_delete(#[case] store: Arc<dyn LocalStore>) {
        store.put(KeySpace::Blob, b"k", b"v").await.unwrap();

        let mut batch = store.begin_write(None);
        batch.delete(KeySpace::Blob, b"k");
        batch.flush().await.unwrap();

        assert_eq!(None, store.get(KeySpace::Blob, b"k").await.unwrap());
    }

    #[rstest]
    #[case::memory(memory_store())]
    #[case::redb(redb_store())]
    #[tokio::test]
    async fn clear_keyspace_only_clears_one(#[case] store: Arc<dyn LocalStore>) {
        store.put(KeySpace::Blob, b"k", b"v").await.unwrap();
        store.put(KeySpace::BlobMeta, b"k", b"m").await.unwrap();

        store.clear_keyspace(KeySpace::Blob).await.unwrap();

        assert_eq!(None, store.get(KeySpace::Blob, b"k").await.unwrap());
        assert_eq!(
            Some(Bytes::from_static(b"m")),
            store.get(KeySpace::BlobMeta, b"k").await.unwrap()
        );
    }
}
