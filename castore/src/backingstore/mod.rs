use async_trait::async_trait;

use crate::context::FetchContext;
use crate::digests::ObjectId;
use crate::errors::FetchError;
use crate::model::{Blob, Tree};

mod fake;

pub use self::fake::FakeBackingStore;

/// The base trait for the authoritative source of immutable objects.
///
/// Implementations may serialize requests, batch them, coalesce in-flight
/// duplicates, and log per-process access; the read pipeline above relies on
/// that coalescing rather than deduplicating on its own. All operations may
/// fail with [FetchError::NotFound] (permanent) or
/// [FetchError::Transient] (retried by the caller).
#[async_trait]
pub trait BackingStore: Send + Sync {
    /// Resolves a snapshot hash to its root tree.
    async fn get_root_tree(&self, root: &ObjectId, ctx: &FetchContext) -> Result<Tree, FetchError>;

    /// Fetches a single tree by its id.
    async fn get_tree(&self, id: &ObjectId, ctx: &FetchContext) -> Result<Tree, FetchError>;

    /// Fetches a single blob by its id.
    async fn get_blob(&self, id: &ObjectId, ctx: &FetchContext) -> Result<Blob, FetchError>;

    /// Hints that the given blobs will be wanted soon. Implementations may
    /// batch these into fewer round-trips; failures are not reported per id.
    async fn prefetch_blobs(&self, ids: &[ObjectId], ctx: &FetchContext)
        -> Result<(), FetchError>;
}

#[async_trait]
impl<A> BackingStore for A
where
    A: AsRef<dyn BackingStore> + Send + Sync,
{
    async fn get_root_tree(&self, root: &ObjectId, ctx: &FetchContext) -> Result<Tree, FetchError> {
        self.as_ref().get_root_tree(root, ctx).await
    }

    async fn get_tree(&self, id: &ObjectId, ctx: &FetchContext) -> Result<Tree, FetchError> {
        self.as_ref().get_tree(id, ctx).await
    }

    async fn get_blob(&self, id: &ObjectId, ctx: &FetchContext) -> Result<Blob, FetchError> {
        self.as_ref().get_blob(id, ctx).await
    }

    async fn prefetch_blobs(
        &self,
        ids: &[ObjectId],
        ctx: &FetchContext,
    ) -> Result<(), FetchError> {
        self.as_ref().prefetch_blobs(ids, ctx).await
    }
}
