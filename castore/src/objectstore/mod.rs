//! The shared read pipeline in front of the backing store: in-memory caches,
//! then the local store, then the backing store itself.
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use tracing::{instrument, warn};

use crate::backingstore::BackingStore;
use crate::context::{FetchContext, FetchCounters, FetchOrigin};
use crate::digests::ObjectId;
use crate::errors::FetchError;
use crate::localstore::{KeySpace, LocalStore};
use crate::model::{Blob, BlobMetadata, ObjectKind, Tree};

mod blob_cache;

pub use self::blob_cache::{BlobCache, BlobHandle, BlobInterest};

#[derive(Clone, Debug)]
pub struct ObjectStoreConfig {
    pub tree_cache_entries: NonZeroUsize,
    pub metadata_cache_entries: NonZeroUsize,
    pub blob_cache_bytes: usize,
    /// Every Nth backing store fetch from one process logs a fetch-heavy
    /// event; past the first interval the process's requests run at low
    /// priority.
    pub fetch_heavy_log_interval: u64,
    /// Additional attempts after a transient backing store failure.
    pub transient_retries: u32,
}

impl Default for ObjectStoreConfig {
    fn default() -> Self {
        Self {
            tree_cache_entries: NonZeroUsize::new(2048).unwrap(),
            metadata_cache_entries: NonZeroUsize::new(16 * 1024).unwrap(),
            blob_cache_bytes: 40 * 1024 * 1024,
            fetch_heavy_log_interval: 2000,
            transient_retries: 2,
        }
    }
}

/// Thread-safe facade over the object read pipeline.
///
/// Reads try the in-memory cache, then the local store, then the backing
/// store; whatever tier answered is recorded in the [FetchContext]. Values
/// fetched remotely are written through to the local store together with
/// their derived metadata. The store does not deduplicate concurrent
/// fetches of the same key; the backing store coalesces in-flight
/// duplicates, and once a value landed on disk later callers hit the disk
/// cache.
pub struct ObjectStore {
    backing: Arc<dyn BackingStore>,
    local: Arc<dyn LocalStore>,

    tree_cache: Mutex<LruCache<ObjectId, Arc<Tree>>>,
    metadata_cache: Mutex<LruCache<ObjectId, BlobMetadata>>,
    blob_cache: BlobCache,

    counters: FetchCounters,
    config: ObjectStoreConfig,
}

impl ObjectStore {
    pub fn new(backing: Arc<dyn BackingStore>, local: Arc<dyn LocalStore>) -> Arc<Self> {
        Self::with_config(backing, local, ObjectStoreConfig::default())
    }

    pub fn with_config(
        backing: Arc<dyn BackingStore>,
        local: Arc<dyn LocalStore>,
        config: ObjectStoreConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            backing,
            local,
            tree_cache: Mutex::new(LruCache::new(config.tree_cache_entries)),
            metadata_cache: Mutex::new(LruCache::new(config.metadata_cache_entries)),
            blob_cache: BlobCache::new(config.blob_cache_bytes),
            counters: FetchCounters::default(),
            config,
        })
    }

    pub fn counters(&self) -> &FetchCounters {
        &self.counters
    }

    pub fn blob_cache(&self) -> &BlobCache {
        &self.blob_cache
    }

    /// Drops the in-memory caches (blob entries with live handles stay).
    pub fn flush_memory_caches(&self) {
        self.tree_cache.lock().clear();
        self.metadata_cache.lock().clear();
        self.blob_cache.flush();
    }

    #[instrument(skip(self, ctx), fields(blob.id=%id, pid=ctx.pid()))]
    pub async fn get_blob(
        &self,
        id: &ObjectId,
        ctx: &FetchContext,
    ) -> Result<Arc<Blob>, FetchError> {
        if ctx.is_cancelled() {
            return Err(FetchError::Cancelled);
        }

        if let Some(blob) = self.blob_cache.get(id) {
            ctx.record_fetch(ObjectKind::Blob, FetchOrigin::MemoryCache);
            return Ok(blob);
        }

        if let Some(raw) = self.local.get(KeySpace::Blob, id.as_slice()).await? {
            let actual = ObjectId::sha1_of(&raw);
            if actual != *id {
                self.evict_blob(id).await?;
                return Err(FetchError::ObjectCorrupt {
                    kind: ObjectKind::Blob,
                    id: id.clone(),
                    actual,
                });
            }
            let blob = Arc::new(Blob::new(id.clone(), raw));
            self.blob_cache
                .insert(blob.clone(), BlobInterest::UnlikelyNeededAgain);
            ctx.record_fetch(ObjectKind::Blob, FetchOrigin::DiskCache);
            return Ok(blob);
        }

        self.note_backing_fetch(ctx);
        let blob = retry_transient(self.config.transient_retries, || {
            self.backing.get_blob(id, ctx)
        })
        .await?;

        // Never cache contents that don't hash to the requested id.
        let metadata = blob.metadata();
        if metadata.sha1 != *id {
            return Err(FetchError::ObjectCorrupt {
                kind: ObjectKind::Blob,
                id: id.clone(),
                actual: metadata.sha1,
            });
        }

        let mut batch = self
            .local
            .begin_write(Some(blob.contents().len() + metadata.to_bytes().len()));
        batch.put(KeySpace::Blob, id.as_slice(), blob.contents());
        batch.put(KeySpace::BlobMeta, id.as_slice(), &metadata.to_bytes());
        batch.flush().await?;

        self.metadata_cache.lock().put(id.clone(), metadata);
        let blob = Arc::new(blob);
        self.blob_cache
            .insert(blob.clone(), BlobInterest::UnlikelyNeededAgain);
        ctx.record_fetch(ObjectKind::Blob, FetchOrigin::BackingStore);
        Ok(blob)
    }

    #[instrument(skip(self, ctx), fields(tree.id=%id, pid=ctx.pid()))]
    pub async fn get_tree(
        &self,
        id: &ObjectId,
        ctx: &FetchContext,
    ) -> Result<Arc<Tree>, FetchError> {
        if ctx.is_cancelled() {
            return Err(FetchError::Cancelled);
        }

        if let Some(tree) = self.tree_cache.lock().get(id) {
            ctx.record_fetch(ObjectKind::Tree, FetchOrigin::MemoryCache);
            return Ok(tree.clone());
        }

        if let Some(raw) = self.local.get(KeySpace::Tree, id.as_slice()).await? {
            let actual = ObjectId::sha1_of(&raw);
            if actual != *id {
                let mut batch = self.local.begin_write(None);
                batch.delete(KeySpace::Tree, id.as_slice());
                batch.flush().await?;
                return Err(FetchError::ObjectCorrupt {
                    kind: ObjectKind::Tree,
                    id: id.clone(),
                    actual,
                });
            }
            let tree = Arc::new(
                Tree::deserialize(&raw)
                    .map_err(|e| crate::Error::StorageError(e.to_string()))?,
            );
            self.tree_cache.lock().put(id.clone(), tree.clone());
            ctx.record_fetch(ObjectKind::Tree, FetchOrigin::DiskCache);
            return Ok(tree);
        }

        self.note_backing_fetch(ctx);
        let tree = retry_transient(self.config.transient_retries, || {
            self.backing.get_tree(id, ctx)
        })
        .await?;
        self.store_tree(&tree).await?;
        let tree = Arc::new(tree);
        self.tree_cache.lock().put(id.clone(), tree.clone());
        ctx.record_fetch(ObjectKind::Tree, FetchOrigin::BackingStore);
        Ok(tree)
    }

    /// Resolves a snapshot hash to its root tree. Resolution always goes to
    /// the backing store; the resulting tree is cached under its own id.
    #[instrument(skip(self, ctx), fields(root=%root, pid=ctx.pid()))]
    pub async fn get_root_tree(
        &self,
        root: &ObjectId,
        ctx: &FetchContext,
    ) -> Result<Arc<Tree>, FetchError> {
        self.note_backing_fetch(ctx);
        let tree = retry_transient(self.config.transient_retries, || {
            self.backing.get_root_tree(root, ctx)
        })
        .await?;
        self.store_tree(&tree).await?;
        let id = tree.id();
        let tree = Arc::new(tree);
        self.tree_cache.lock().put(id, tree.clone());
        ctx.record_fetch(ObjectKind::Tree, FetchOrigin::BackingStore);
        Ok(tree)
    }

    #[instrument(skip(self, ctx), fields(blob.id=%id))]
    pub async fn get_blob_metadata(
        &self,
        id: &ObjectId,
        ctx: &FetchContext,
    ) -> Result<BlobMetadata, FetchError> {
        if let Some(metadata) = self.metadata_cache.lock().get(id) {
            ctx.record_fetch(ObjectKind::Blob, FetchOrigin::MemoryCache);
            return Ok(metadata.clone());
        }

        if let Some(raw) = self.local.get(KeySpace::BlobMeta, id.as_slice()).await? {
            let metadata = BlobMetadata::from_bytes(&raw)
                .map_err(|e| crate::Error::StorageError(e.to_string()))?;
            self.metadata_cache.lock().put(id.clone(), metadata.clone());
            ctx.record_fetch(ObjectKind::Blob, FetchOrigin::DiskCache);
            return Ok(metadata);
        }

        // Deriving from the blob populates the metadata caches as a side
        // effect, wherever the blob comes from.
        let blob = self.get_blob(id, ctx).await?;
        let metadata = blob.metadata();
        self.local
            .put(KeySpace::BlobMeta, id.as_slice(), &metadata.to_bytes())
            .await?;
        self.metadata_cache.lock().put(id.clone(), metadata.clone());
        Ok(metadata)
    }

    pub async fn get_blob_sha1(
        &self,
        id: &ObjectId,
        ctx: &FetchContext,
    ) -> Result<ObjectId, FetchError> {
        Ok(self.get_blob_metadata(id, ctx).await?.sha1)
    }

    pub async fn get_blob_size(&self, id: &ObjectId, ctx: &FetchContext) -> Result<u64, FetchError> {
        Ok(self.get_blob_metadata(id, ctx).await?.size)
    }

    /// Forwards a prefetch hint for the blobs not already present locally.
    #[instrument(skip_all, fields(count = ids.len()))]
    pub async fn prefetch_blobs(
        &self,
        ids: &[ObjectId],
        ctx: &FetchContext,
    ) -> Result<(), FetchError> {
        let mut missing = Vec::new();
        for id in ids {
            if self.blob_cache.contains(id) {
                continue;
            }
            if self.local.get(KeySpace::Blob, id.as_slice()).await?.is_some() {
                continue;
            }
            missing.push(id.clone());
        }
        if missing.is_empty() {
            return Ok(());
        }
        self.backing.prefetch_blobs(&missing, ctx).await
    }

    async fn store_tree(&self, tree: &Tree) -> Result<(), FetchError> {
        let raw = tree.serialize();
        let id = ObjectId::sha1_of(&raw);
        let mut batch = self.local.begin_write(Some(raw.len()));
        batch.put(KeySpace::Tree, id.as_slice(), &raw);
        batch.flush().await?;
        Ok(())
    }

    async fn evict_blob(&self, id: &ObjectId) -> Result<(), FetchError> {
        let mut batch = self.local.begin_write(None);
        batch.delete(KeySpace::Blob, id.as_slice());
        batch.delete(KeySpace::BlobMeta, id.as_slice());
        batch.flush().await?;
        Ok(())
    }

    fn note_backing_fetch(&self, ctx: &FetchContext) {
        let count = self.counters.record(ctx.pid());
        let interval = self.config.fetch_heavy_log_interval;
        if interval > 0 {
            if count % interval == 0 {
                warn!(
                    pid = ctx.pid(),
                    fetch_count = count,
                    "process is fetch-heavy"
                );
            }
            if count >= interval {
                ctx.deprioritize();
            }
        }
    }
}

async fn retry_transient<T, F, Fut>(retries: u32, mut operation: F) -> Result<T, FetchError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, FetchError>>,
{
    let mut attempts_left = retries;
    loop {
        match operation().await {
            Err(e) if e.is_transient() && attempts_left > 0 => {
                attempts_left -= 1;
                warn!(error = %e, attempts_left, "retrying transient fetch failure");
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests;
