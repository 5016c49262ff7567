//! Regular file and symlink inodes.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use parking_lot::Mutex as SyncMutex;
use tokio::sync::Mutex;
use tracing::instrument;
use weft_castore::context::FetchContext;
use weft_castore::objectstore::BlobHandle;
use weft_castore::path::PathComponent;
use weft_castore::{Blob, FetchError, ObjectId};

use super::{InodeAttr, InodeError, InodeLocation, InodeMetadata, InodeNumber};
use crate::latch::Latch;
use crate::mount::Mount;

/// Byte ranges of the source blob served to readers so far. Once the whole
/// blob has been read we stop biasing the cache towards keeping it.
#[derive(Debug, Default)]
pub(crate) struct CoverageSet {
    // disjoint, sorted [start, end) ranges
    ranges: Vec<(u64, u64)>,
}

impl CoverageSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, start: u64, end: u64) {
        if start >= end {
            return;
        }
        self.ranges.push((start, end));
        self.ranges.sort_unstable();
        let mut merged: Vec<(u64, u64)> = Vec::with_capacity(self.ranges.len());
        for &(start, end) in &self.ranges {
            match merged.last_mut() {
                Some((_, last_end)) if start <= *last_end => *last_end = (*last_end).max(end),
                _ => merged.push((start, end)),
            }
        }
        self.ranges = merged;
    }

    pub fn covers(&self, start: u64, end: u64) -> bool {
        if start >= end {
            return true;
        }
        self.ranges
            .iter()
            .any(|&(s, e)| s <= start && end <= e)
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

type LoadOutcome = Result<Option<Arc<Blob>>, FetchError>;

/// The content state machine. Each variant carries only the fields valid in
/// that state.
#[derive(Debug)]
enum FileState {
    /// Contents live in the object store under `hash`; no fetch in flight.
    NotLoading {
        hash: ObjectId,
        coverage: CoverageSet,
        /// Biases the in-memory blob cache towards keeping the blob while
        /// the file is still being read.
        cache_handle: Option<BlobHandle>,
    },
    /// A fetch is in flight; waiters share the latch. A fulfilment of
    /// `Ok(None)` means the file was materialized mid-load and the waiter
    /// must re-examine the state.
    Loading {
        hash: ObjectId,
        latch: Arc<Latch<LoadOutcome>>,
    },
    /// User modifications live in the overlay. Terminal.
    Materialized,
}

/// Inode for a single regular file or symlink.
#[derive(Debug)]
pub struct FileInode {
    number: InodeNumber,
    location: SyncMutex<InodeLocation>,
    state: Mutex<FileState>,
    metadata: SyncMutex<InodeMetadata>,
    unlinked: AtomicBool,
}

impl FileInode {
    /// An inode whose contents are the object `hash`.
    pub fn from_source(
        number: InodeNumber,
        parent: InodeNumber,
        name: PathComponent,
        hash: ObjectId,
        mode: u32,
        uid: u32,
        gid: u32,
    ) -> Arc<Self> {
        Arc::new(Self {
            number,
            location: SyncMutex::new(InodeLocation { parent, name }),
            state: Mutex::new(FileState::NotLoading {
                hash,
                coverage: CoverageSet::new(),
                cache_handle: None,
            }),
            metadata: SyncMutex::new(InodeMetadata::new(mode, uid, gid)),
            unlinked: AtomicBool::new(false),
        })
    }

    /// An inode whose contents already live in the overlay (locally created
    /// files, and files restored after a restart).
    pub fn materialized(
        number: InodeNumber,
        parent: InodeNumber,
        name: PathComponent,
        mode: u32,
        uid: u32,
        gid: u32,
    ) -> Arc<Self> {
        Arc::new(Self {
            number,
            location: SyncMutex::new(InodeLocation { parent, name }),
            state: Mutex::new(FileState::Materialized),
            metadata: SyncMutex::new(InodeMetadata::new(mode, uid, gid)),
            unlinked: AtomicBool::new(false),
        })
    }

    pub fn number(&self) -> InodeNumber {
        self.number
    }

    pub fn location(&self) -> InodeLocation {
        self.location.lock().clone()
    }

    pub fn set_location(&self, parent: InodeNumber, name: PathComponent) {
        *self.location.lock() = InodeLocation { parent, name };
    }

    pub fn mark_unlinked(&self) {
        self.unlinked.store(true, Ordering::Release);
    }

    pub fn is_unlinked(&self) -> bool {
        self.unlinked.load(Ordering::Acquire)
    }

    pub fn metadata(&self) -> InodeMetadata {
        self.metadata.lock().clone()
    }

    pub fn update_metadata(&self, f: impl FnOnce(&mut InodeMetadata)) {
        f(&mut self.metadata.lock())
    }

    pub async fn is_materialized(&self) -> bool {
        matches!(*self.state.lock().await, FileState::Materialized)
    }

    /// The source hash, unless the file is materialized.
    pub async fn source_hash(&self) -> Option<ObjectId> {
        match &*self.state.lock().await {
            FileState::NotLoading { hash, .. } | FileState::Loading { hash, .. } => {
                Some(hash.clone())
            }
            FileState::Materialized => None,
        }
    }

    /// Attaches this file's path to corruption errors; everything else
    /// passes through.
    fn map_fetch_error(&self, mount: &Mount, e: FetchError) -> InodeError {
        match e {
            FetchError::ObjectCorrupt { id, actual, .. } => InodeError::Corrupt {
                path: mount
                    .path_for(self.number)
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| format!("inode {}", self.number)),
                expected: id,
                actual,
            },
            other => other.into(),
        }
    }

    /// Runs the read-through state machine until the contents are at hand:
    /// `Some(blob)` from the object store, or `None` meaning the inode is
    /// materialized and the overlay holds the contents.
    ///
    /// After every await the state is re-examined; a load that raced with a
    /// materialization starts over.
    pub(crate) async fn load_blob(
        &self,
        mount: &Mount,
        ctx: &FetchContext,
    ) -> Result<Option<Arc<Blob>>, InodeError> {
        loop {
            let mut state = self.state.lock().await;
            match &*state {
                FileState::Materialized => return Ok(None),

                FileState::Loading { latch, .. } => {
                    let latch = latch.clone();
                    drop(state);
                    match latch.wait().await {
                        Ok(Some(blob)) => return Ok(Some(blob)),
                        // materialized mid-load; re-examine the state
                        Ok(None) => continue,
                        Err(e) => return Err(self.map_fetch_error(mount, e)),
                    }
                }

                FileState::NotLoading { hash, .. } => {
                    let hash = hash.clone();
                    let latch = Arc::new(Latch::new());
                    *state = FileState::Loading {
                        hash: hash.clone(),
                        latch: latch.clone(),
                    };
                    // Deposit the latch, then release the inode lock for
                    // the duration of the fetch.
                    drop(state);

                    let result = mount.store().get_blob(&hash, ctx).await;

                    let mut state = self.state.lock().await;
                    match &*state {
                        FileState::Loading { latch: current, .. }
                            if Arc::ptr_eq(current, &latch) =>
                        {
                            match result {
                                Ok(blob) => {
                                    let cache_handle =
                                        mount.store().blob_cache().express_interest(&hash);
                                    *state = FileState::NotLoading {
                                        hash,
                                        coverage: CoverageSet::new(),
                                        cache_handle,
                                    };
                                    drop(state);
                                    latch.fulfil(Ok(Some(blob.clone())));
                                    return Ok(Some(blob));
                                }
                                Err(e) => {
                                    *state = FileState::NotLoading {
                                        hash,
                                        coverage: CoverageSet::new(),
                                        cache_handle: None,
                                    };
                                    drop(state);
                                    latch.fulfil(Err(e.clone()));
                                    return Err(self.map_fetch_error(mount, e));
                                }
                            }
                        }
                        // The state moved under us (materialization); the
                        // fetch still populated the caches. Re-dispatch.
                        _ => continue,
                    }
                }
            }
        }
    }

    /// Moves the inode to the materialized state, seeding the overlay file
    /// from the blob (or from nothing when truncating). Returns whether
    /// this call performed the transition; the caller is responsible for
    /// propagating materialization to the parent afterwards.
    pub(crate) async fn materialize(
        &self,
        mount: &Mount,
        truncate_to_zero: bool,
        ctx: &FetchContext,
    ) -> Result<bool, InodeError> {
        if truncate_to_zero {
            // Truncation never needs the old contents, so skip the load.
            let mut state = self.state.lock().await;
            match &*state {
                FileState::Materialized => return Ok(false),
                FileState::NotLoading { .. } => {
                    mount
                        .overlay()
                        .save_overlay_file(self.number, b"", None)
                        .await?;
                    *state = FileState::Materialized;
                    return Ok(true);
                }
                FileState::Loading { latch, .. } => {
                    let latch = latch.clone();
                    mount
                        .overlay()
                        .save_overlay_file(self.number, b"", None)
                        .await?;
                    *state = FileState::Materialized;
                    drop(state);
                    // Wake the in-flight load's waiters with the sentinel;
                    // they re-examine the state and find the overlay.
                    latch.fulfil(Ok(None));
                    return Ok(true);
                }
            }
        }

        loop {
            match self.load_blob(mount, ctx).await? {
                None => return Ok(false),
                Some(blob) => {
                    let mut state = self.state.lock().await;
                    match &*state {
                        FileState::Materialized => return Ok(false),
                        FileState::NotLoading { .. } => {
                            // The stored bytes equal the source blob, so the
                            // sha1 sidecar saves recomputing the hash later.
                            mount
                                .overlay()
                                .save_overlay_file(self.number, blob.contents(), Some(blob.id()))
                                .await?;
                            *state = FileState::Materialized;
                            return Ok(true);
                        }
                        FileState::Loading { .. } => continue,
                    }
                }
            }
        }
    }

    #[instrument(skip_all, fields(inode = self.number, offset, size))]
    pub async fn read(
        &self,
        mount: &Mount,
        offset: u64,
        size: u32,
        ctx: &FetchContext,
    ) -> Result<Bytes, InodeError> {
        let contents: Bytes = match self.load_blob(mount, ctx).await? {
            Some(blob) => {
                let contents = blob.contents().clone();

                let mut state = self.state.lock().await;
                if let FileState::NotLoading {
                    coverage,
                    cache_handle,
                    ..
                } = &mut *state
                {
                    let end = (offset + size as u64).min(blob.size());
                    coverage.add(offset.min(blob.size()), end);
                    if coverage.covers(0, blob.size()) {
                        // fully read; stop biasing the cache
                        *cache_handle = None;
                    }
                }
                contents
            }
            None => self.overlay_contents(mount).await?,
        };

        self.update_metadata(|m| m.atime = SystemTime::now());

        let len = contents.len() as u64;
        let start = offset.min(len);
        let end = (offset + size as u64).min(len);
        Ok(contents.slice(start as usize..end as usize))
    }

    #[instrument(skip_all, fields(inode = self.number, offset, size = data.len()))]
    pub async fn write(
        &self,
        mount: &Mount,
        offset: u64,
        data: &[u8],
        ctx: &FetchContext,
    ) -> Result<u32, InodeError> {
        let newly_materialized = self.materialize(mount, false, ctx).await?;

        {
            // Hold the state lock for the read-modify-write so concurrent
            // writers serialize.
            let _state = self.state.lock().await;
            let existing = mount
                .overlay()
                .load_overlay_file(self.number)
                .await?
                .unwrap_or_default();
            let mut buf = existing.to_vec();
            let end = offset as usize + data.len();
            if buf.len() < end {
                buf.resize(end, 0);
            }
            buf[offset as usize..end].copy_from_slice(data);
            mount
                .overlay()
                .save_overlay_file(self.number, &buf, None)
                .await?;
        }

        self.update_metadata(|m| {
            let now = SystemTime::now();
            m.mtime = now;
            m.ctime = now;
        });

        if newly_materialized {
            mount.propagate_materialization(self.number).await?;
        }
        if let Some(path) = mount.path_for(self.number) {
            mount.journal().record_changed(path);
        }

        Ok(data.len() as u32)
    }

    /// setattr(size): truncate or extend.
    pub async fn set_size(
        &self,
        mount: &Mount,
        size: u64,
        ctx: &FetchContext,
    ) -> Result<(), InodeError> {
        let newly_materialized = self.materialize(mount, size == 0, ctx).await?;

        {
            let _state = self.state.lock().await;
            let existing = mount
                .overlay()
                .load_overlay_file(self.number)
                .await?
                .unwrap_or_default();
            if existing.len() as u64 != size {
                let mut buf = existing.to_vec();
                buf.resize(size as usize, 0);
                mount
                    .overlay()
                    .save_overlay_file(self.number, &buf, None)
                    .await?;
            }
        }

        self.update_metadata(|m| {
            let now = SystemTime::now();
            m.mtime = now;
            m.ctime = now;
        });

        if newly_materialized {
            mount.propagate_materialization(self.number).await?;
        }
        if let Some(path) = mount.path_for(self.number) {
            mount.journal().record_changed(path);
        }
        Ok(())
    }

    /// fallocate: ensure the byte range exists in the overlay file.
    pub async fn fallocate(
        &self,
        mount: &Mount,
        offset: u64,
        length: u64,
        ctx: &FetchContext,
    ) -> Result<(), InodeError> {
        let newly_materialized = self.materialize(mount, false, ctx).await?;

        {
            let _state = self.state.lock().await;
            let existing = mount
                .overlay()
                .load_overlay_file(self.number)
                .await?
                .unwrap_or_default();
            let wanted = (offset + length) as usize;
            if existing.len() < wanted {
                let mut buf = existing.to_vec();
                buf.resize(wanted, 0);
                mount
                    .overlay()
                    .save_overlay_file(self.number, &buf, None)
                    .await?;
            }
        }

        if newly_materialized {
            mount.propagate_materialization(self.number).await?;
            if let Some(path) = mount.path_for(self.number) {
                mount.journal().record_changed(path);
            }
        }
        Ok(())
    }

    /// Overlay writes land synchronously, so fsync has nothing extra to do.
    pub async fn fsync(&self, _datasync: bool) -> Result<(), InodeError> {
        Ok(())
    }

    pub async fn attr(&self, mount: &Mount, ctx: &FetchContext) -> Result<InodeAttr, InodeError> {
        let size = match self.source_hash().await {
            Some(hash) => mount.store().get_blob_size(&hash, ctx).await?,
            None => self.overlay_contents(mount).await?.len() as u64,
        };

        let metadata = self.metadata();
        Ok(InodeAttr {
            ino: self.number,
            size,
            mode: metadata.mode,
            nlink: 1,
            uid: metadata.uid,
            gid: metadata.gid,
            atime: metadata.atime,
            mtime: metadata.mtime,
            ctime: metadata.ctime,
        })
    }

    /// The SHA-1 of the current contents. Served from metadata (or the
    /// overlay sidecar) without materializing where possible.
    pub async fn sha1(&self, mount: &Mount, ctx: &FetchContext) -> Result<ObjectId, InodeError> {
        match self.source_hash().await {
            Some(hash) => Ok(mount.store().get_blob_sha1(&hash, ctx).await?),
            None => {
                if let Some(sha1) = mount.overlay().load_file_sha1(self.number).await? {
                    return Ok(sha1);
                }
                let contents = self.overlay_contents(mount).await?;
                Ok(ObjectId::sha1_of(&contents))
            }
        }
    }

    /// Symlink target bytes.
    pub async fn readlink(&self, mount: &Mount, ctx: &FetchContext) -> Result<Bytes, InodeError> {
        match self.load_blob(mount, ctx).await? {
            Some(blob) => Ok(blob.contents().clone()),
            None => self.overlay_contents(mount).await,
        }
    }

    async fn overlay_contents(&self, mount: &Mount) -> Result<Bytes, InodeError> {
        mount
            .overlay()
            .load_overlay_file(self.number)
            .await?
            .ok_or_else(|| {
                weft_castore::Error::StorageError(format!(
                    "materialized inode {} has no overlay file",
                    self.number
                ))
                .into()
            })
    }
}

#[cfg(test)]
mod tests {
    use super::CoverageSet;

    #[test]
    fn coverage_merges_adjacent_ranges() {
        let mut coverage = CoverageSet::new();
        assert!(coverage.is_empty());

        coverage.add(0, 10);
        coverage.add(20, 30);
        assert!(!coverage.covers(0, 30));
        assert!(coverage.covers(0, 10));

        coverage.add(10, 20);
        assert!(coverage.covers(0, 30));
    }

    #[test]
    fn coverage_ignores_empty_ranges() {
        let mut coverage = CoverageSet::new();
        coverage.add(5, 5);
        assert!(coverage.is_empty());
        assert!(coverage.covers(3, 3));
    }
}
