use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tracing::instrument;

use super::BackingStore;
use crate::context::FetchContext;
use crate::digests::ObjectId;
use crate::errors::FetchError;
use crate::model::{Blob, ObjectKind, Tree};

/// An in-memory [BackingStore].
///
/// Besides holding objects, it counts accesses per object and supports
/// injecting transient failures and corrupt blob contents, which is what
/// the read pipeline tests exercise. Concurrent fetches of the same id are
/// serialized on a per-id gate, matching the coalescing contract real
/// backends provide.
#[derive(Clone, Default)]
pub struct FakeBackingStore {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    blobs: RwLock<HashMap<ObjectId, Bytes>>,
    trees: RwLock<HashMap<ObjectId, Tree>>,
    // snapshot hash -> root tree id
    roots: RwLock<HashMap<ObjectId, ObjectId>>,

    access_counts: Mutex<HashMap<ObjectId, u64>>,
    // ids whose next n fetches fail with a transient error
    transient_failures: Mutex<HashMap<ObjectId, u32>>,
    // ids which return these (wrong) contents instead of the stored ones
    corrupt_contents: RwLock<HashMap<ObjectId, Bytes>>,

    fetch_gates: Mutex<HashMap<ObjectId, Arc<tokio::sync::Mutex<()>>>>,
}

impl FakeBackingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a blob under the hash of its contents, returning the id.
    pub fn put_blob(&self, contents: &[u8]) -> ObjectId {
        let id = ObjectId::sha1_of(contents);
        self.inner
            .blobs
            .write()
            .insert(id.clone(), Bytes::copy_from_slice(contents));
        id
    }

    /// Stores a tree, returning its id.
    pub fn put_tree(&self, tree: Tree) -> ObjectId {
        let id = tree.id();
        self.inner.trees.write().insert(id.clone(), tree);
        id
    }

    /// Registers a snapshot hash resolving to a previously stored tree.
    pub fn put_root(&self, root: ObjectId, tree_id: ObjectId) {
        self.inner.roots.write().insert(root, tree_id);
    }

    /// How many fetches reached this store for the given id.
    pub fn access_count(&self, id: &ObjectId) -> u64 {
        self.inner
            .access_counts
            .lock()
            .get(id)
            .copied()
            .unwrap_or(0)
    }

    /// Makes the next `n` fetches of `id` fail with a transient error.
    pub fn fail_next(&self, id: &ObjectId, n: u32) {
        self.inner
            .transient_failures
            .lock()
            .insert(id.clone(), n);
    }

    /// Makes fetches of `id` return `contents` instead of the stored bytes,
    /// so the blob no longer matches its id.
    pub fn corrupt_blob(&self, id: &ObjectId, contents: &[u8]) {
        self.inner
            .corrupt_contents
            .write()
            .insert(id.clone(), Bytes::copy_from_slice(contents));
    }

    /// Ends a [FakeBackingStore::corrupt_blob] injection.
    pub fn clear_corruption(&self, id: &ObjectId) {
        self.inner.corrupt_contents.write().remove(id);
    }

    /// Serializes fetches of `id` behind the held guard, so tests can keep
    /// a load in flight while they race other operations against it.
    pub async fn block_fetches(&self, id: &ObjectId) -> tokio::sync::OwnedMutexGuard<()> {
        self.gate_for(id).lock_owned().await
    }

    fn gate_for(&self, id: &ObjectId) -> Arc<tokio::sync::Mutex<()>> {
        self.inner
            .fetch_gates
            .lock()
            .entry(id.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn note_access(&self, id: &ObjectId) -> Result<(), FetchError> {
        *self
            .inner
            .access_counts
            .lock()
            .entry(id.clone())
            .or_insert(0) += 1;

        let mut failures = self.inner.transient_failures.lock();
        if let Some(remaining) = failures.get_mut(id) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(FetchError::Transient(format!(
                    "injected failure fetching {id}"
                )));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl BackingStore for FakeBackingStore {
    #[instrument(skip(self, ctx), fields(root=%root))]
    async fn get_root_tree(&self, root: &ObjectId, ctx: &FetchContext) -> Result<Tree, FetchError> {
        let tree_id = self
            .inner
            .roots
            .read()
            .get(root)
            .cloned()
            .ok_or_else(|| FetchError::not_found(ObjectKind::Tree, root))?;
        self.get_tree(&tree_id, ctx).await
    }

    #[instrument(skip(self, _ctx), fields(tree.id=%id))]
    async fn get_tree(&self, id: &ObjectId, _ctx: &FetchContext) -> Result<Tree, FetchError> {
        let _gate = self.gate_for(id).lock_owned().await;
        self.note_access(id)?;
        self.inner
            .trees
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| FetchError::not_found(ObjectKind::Tree, id))
    }

    #[instrument(skip(self, _ctx), fields(blob.id=%id))]
    async fn get_blob(&self, id: &ObjectId, _ctx: &FetchContext) -> Result<Blob, FetchError> {
        let _gate = self.gate_for(id).lock_owned().await;
        self.note_access(id)?;

        if let Some(bad) = self.inner.corrupt_contents.read().get(id) {
            return Ok(Blob::new(id.clone(), bad.clone()));
        }

        self.inner
            .blobs
            .read()
            .get(id)
            .map(|contents| Blob::new(id.clone(), contents.clone()))
            .ok_or_else(|| FetchError::not_found(ObjectKind::Blob, id))
    }

    #[instrument(skip_all, fields(count = ids.len()))]
    async fn prefetch_blobs(
        &self,
        ids: &[ObjectId],
        _ctx: &FetchContext,
    ) -> Result<(), FetchError> {
        // Nothing to warm up in memory, but keep the bookkeeping honest.
        for id in ids {
            let _ = self.note_access(id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures;

    #[tokio::test]
    async fn blob_roundtrip_and_counting() {
        let store = FakeBackingStore::new();
        let id = store.put_blob(b"hello\n");
        let ctx = FetchContext::new(1);

        let blob = store.get_blob(&id, &ctx).await.unwrap();
        assert_eq!(b"hello\n"[..], blob.contents()[..]);
        assert_eq!(1, store.access_count(&id));

        store.get_blob(&id, &ctx).await.unwrap();
        assert_eq!(2, store.access_count(&id));
    }

    #[tokio::test]
    async fn missing_blob_is_not_found() {
        let store = FakeBackingStore::new();
        let ctx = FetchContext::new(1);
        let err = store
            .get_blob(&fixtures::BLOB_A_ID, &ctx)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(err.to_string().starts_with("blob "));
        assert!(err.to_string().ends_with(" not found"));
    }

    #[tokio::test]
    async fn injected_transient_failures_run_out() {
        let store = FakeBackingStore::new();
        let id = store.put_blob(b"x");
        store.fail_next(&id, 2);
        let ctx = FetchContext::new(1);

        assert!(store.get_blob(&id, &ctx).await.unwrap_err().is_transient());
        assert!(store.get_blob(&id, &ctx).await.unwrap_err().is_transient());
        assert!(store.get_blob(&id, &ctx).await.is_ok());
    }

    #[tokio::test]
    async fn root_resolution() {
        let store = FakeBackingStore::new();
        let tree_id = store.put_tree(fixtures::tree_ab());
        let root = ObjectId::sha1_of(b"some-snapshot");
        store.put_root(root.clone(), tree_id);
        let ctx = FetchContext::new(1);

        let tree = store.get_root_tree(&root, &ctx).await.unwrap();
        assert!(tree.get(b"A").is_some());
    }
}
