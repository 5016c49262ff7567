//! Directory inodes.
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex as SyncMutex;
use tokio::sync::Mutex;
use tracing::instrument;
use weft_castore::context::FetchContext;
use weft_castore::path::PathComponent;
use weft_castore::{ObjectId, Tree};

use super::{
    FileInode, InodeAttr, InodeError, InodeHandle, InodeLocation, InodeMetadata, InodeNumber,
};
use crate::mount::Mount;
use crate::overlay::{OverlayDir, OverlayDirEntry};

pub(crate) const S_IFMT: u32 = 0o170000;
pub(crate) const S_IFDIR: u32 = 0o040000;
pub(crate) const S_IFREG: u32 = 0o100000;
pub(crate) const S_IFLNK: u32 = 0o120000;

/// One name in a directory. The common case is an unloaded child: no inode
/// number assigned, contents described entirely by the source hash.
#[derive(Clone, Debug)]
pub struct DirEntry {
    pub mode: u32,
    /// Id of the source object; None for locally created or materialized
    /// entries.
    pub source_hash: Option<ObjectId>,
    pub materialized: bool,
    /// Assigned lazily on first lookup or readdir.
    pub inode: Option<InodeNumber>,
}

impl DirEntry {
    pub fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }

    pub fn is_symlink(&self) -> bool {
        self.mode & S_IFMT == S_IFLNK
    }
}

/// The synchronized contents of a [TreeInode].
#[derive(Clone, Debug, Default)]
pub struct Dir {
    pub entries: BTreeMap<PathComponent, DirEntry>,
    /// The tree this directory was sourced from, if any.
    pub source_hash: Option<ObjectId>,
    pub materialized: bool,
}

impl Dir {
    pub fn from_tree(tree: &Tree) -> Self {
        let entries = tree
            .entries()
            .map(|entry| {
                (
                    entry.name().clone(),
                    DirEntry {
                        mode: entry.mode(),
                        source_hash: Some(entry.id().clone()),
                        materialized: false,
                        inode: None,
                    },
                )
            })
            .collect();
        Self {
            entries,
            source_hash: Some(tree.id()),
            materialized: false,
        }
    }

    pub fn from_overlay(overlay_dir: &OverlayDir) -> Self {
        let entries = overlay_dir
            .entries
            .iter()
            .map(|entry| {
                (
                    entry.name.clone(),
                    DirEntry {
                        mode: entry.mode,
                        source_hash: entry.source_hash.clone(),
                        materialized: entry.materialized,
                        inode: (entry.inode != 0).then_some(entry.inode),
                    },
                )
            })
            .collect();
        Self {
            entries,
            source_hash: None,
            materialized: true,
        }
    }

    pub fn to_overlay(&self) -> OverlayDir {
        OverlayDir {
            entries: self
                .entries
                .iter()
                .map(|(name, entry)| OverlayDirEntry {
                    name: name.clone(),
                    mode: entry.mode,
                    source_hash: entry.source_hash.clone(),
                    materialized: entry.materialized,
                    inode: entry.inode.unwrap_or(0),
                })
                .collect(),
        }
    }
}

/// A directory listing row, as handed to the kernel channel.
#[derive(Clone, Debug)]
pub struct DirListEntry {
    pub name: PathComponent,
    pub inode: InodeNumber,
    pub mode: u32,
}

/// Inode for a directory.
#[derive(Debug)]
pub struct TreeInode {
    number: InodeNumber,
    location: SyncMutex<InodeLocation>,
    dir: Mutex<Dir>,
    metadata: SyncMutex<InodeMetadata>,
    unlinked: AtomicBool,
}

impl TreeInode {
    pub fn new(
        number: InodeNumber,
        parent: InodeNumber,
        name: PathComponent,
        dir: Dir,
        mode: u32,
        uid: u32,
        gid: u32,
    ) -> Arc<Self> {
        Arc::new(Self {
            number,
            location: SyncMutex::new(InodeLocation { parent, name }),
            dir: Mutex::new(dir),
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

    pub fn attr(&self) -> InodeAttr {
        let metadata = self.metadata();
        InodeAttr {
            ino: self.number,
            size: 4096,
            mode: metadata.mode,
            nlink: 2,
            uid: metadata.uid,
            gid: metadata.gid,
            atime: metadata.atime,
            mtime: metadata.mtime,
            ctime: metadata.ctime,
        }
    }

    pub async fn is_materialized(&self) -> bool {
        self.dir.lock().await.materialized
    }

    pub async fn source_hash(&self) -> Option<ObjectId> {
        self.dir.lock().await.source_hash.clone()
    }

    pub async fn is_empty_dir(&self) -> bool {
        self.dir.lock().await.entries.is_empty()
    }

    pub async fn entry_names(&self) -> Vec<PathComponent> {
        self.dir.lock().await.entries.keys().cloned().collect()
    }

    pub async fn get_entry(&self, name: &PathComponent) -> Option<DirEntry> {
        self.dir.lock().await.entries.get(name).cloned()
    }

    async fn save_dir(&self, mount: &Mount, dir: &Dir) -> Result<(), InodeError> {
        mount
            .overlay()
            .save_overlay_dir(self.number, &dir.to_overlay())
            .await?;
        Ok(())
    }

    /// Looks a child up by name, loading it if necessary. Concurrent
    /// lookups of the same child share one load.
    #[instrument(skip(self, mount, ctx), fields(parent = self.number, name = %name))]
    pub async fn get_or_load_child(
        self: &Arc<Self>,
        mount: &Mount,
        name: &PathComponent,
        ctx: &FetchContext,
    ) -> Result<InodeHandle, InodeError> {
        let (child_ino, snapshot) = {
            let mut dir = self.dir.lock().await;
            let number = self.number;
            let entry = dir
                .entries
                .get_mut(name)
                .ok_or_else(|| InodeError::enoent(number))?;
            let ino = match entry.inode {
                Some(ino) => ino,
                None => {
                    let ino = mount.allocate_inode().await?;
                    entry.inode = Some(ino);
                    ino
                }
            };
            if let Some(handle) = mount.inodes().get(ino) {
                return Ok(handle);
            }
            (ino, entry.clone())
        };

        if !snapshot.is_dir() {
            // Files are cheap to construct; insert races settle in the map.
            let (uid, gid) = mount.owner();
            let file = if snapshot.materialized {
                FileInode::materialized(
                    child_ino,
                    self.number,
                    name.clone(),
                    snapshot.mode,
                    uid,
                    gid,
                )
            } else {
                let hash = snapshot.source_hash.clone().ok_or_else(|| {
                    weft_castore::Error::StorageError(format!(
                        "entry {name} has neither a source hash nor overlay data"
                    ))
                })?;
                FileInode::from_source(
                    child_ino,
                    self.number,
                    name.clone(),
                    hash,
                    snapshot.mode,
                    uid,
                    gid,
                )
            };
            return Ok(mount.inodes().insert(InodeHandle::File(file)));
        }

        // Tree children involve I/O; all concurrent lookups for the same
        // child share a single loading promise.
        match mount.inodes().claim_load(child_ino) {
            Err(latch) => latch.wait().await,
            Ok(latch) => {
                let result = self
                    .load_child_tree(mount, child_ino, name, &snapshot, ctx)
                    .await;
                mount.inodes().finish_load(child_ino, &latch, result.clone());
                result
            }
        }
    }

    async fn load_child_tree(
        self: &Arc<Self>,
        mount: &Mount,
        child_ino: InodeNumber,
        name: &PathComponent,
        entry: &DirEntry,
        ctx: &FetchContext,
    ) -> Result<InodeHandle, InodeError> {
        let dir = if entry.materialized {
            let overlay_dir = mount
                .overlay()
                .load_overlay_dir(child_ino)
                .await?
                .ok_or_else(|| {
                    weft_castore::Error::StorageError(format!(
                        "materialized directory {child_ino} has no overlay payload"
                    ))
                })?;
            Dir::from_overlay(&overlay_dir)
        } else {
            let hash = entry.source_hash.clone().ok_or_else(|| {
                weft_castore::Error::StorageError(format!(
                    "directory entry {name} has neither a source hash nor overlay data"
                ))
            })?;
            let tree = mount.store().get_tree(&hash, ctx).await?;
            Dir::from_tree(&tree)
        };

        let (uid, gid) = mount.owner();
        let inode = TreeInode::new(
            child_ino,
            self.number,
            name.clone(),
            dir,
            entry.mode,
            uid,
            gid,
        );
        Ok(mount.inodes().insert(InodeHandle::Tree(inode)))
    }

    /// Lists the directory, assigning inode numbers to entries that never
    /// had one. Synthetic `.`/`..` entries are the kernel channel's job.
    pub async fn readdir(&self, mount: &Mount) -> Result<Vec<DirListEntry>, InodeError> {
        let mut dir = self.dir.lock().await;
        let mut out = Vec::with_capacity(dir.entries.len());
        for (name, entry) in dir.entries.iter_mut() {
            let inode = match entry.inode {
                Some(ino) => ino,
                None => {
                    let ino = mount.allocate_inode().await?;
                    entry.inode = Some(ino);
                    ino
                }
            };
            out.push(DirListEntry {
                name: name.clone(),
                inode,
                mode: entry.mode,
            });
        }
        Ok(out)
    }

    /// Creates a regular file (or, with `S_IFLNK` mode bits and target
    /// contents, a symlink). The new inode starts out materialized.
    #[instrument(skip(self, mount, contents), fields(parent = self.number, name = %name))]
    pub async fn create_file(
        self: &Arc<Self>,
        mount: &Mount,
        name: &PathComponent,
        mode: u32,
        uid: u32,
        gid: u32,
        contents: &[u8],
    ) -> Result<Arc<FileInode>, InodeError> {
        let path = mount
            .path_for(self.number)
            .ok_or_else(|| InodeError::enoent(self.number))?
            .join(name);

        let file = {
            let mut dir = self.dir.lock().await;
            if self.is_unlinked() {
                return Err(InodeError::enoent(self.number));
            }
            if dir.entries.contains_key(name) {
                return Err(InodeError::eexist(self.number));
            }

            let ino = mount.allocate_inode().await?;
            mount.overlay().save_overlay_file(ino, contents, None).await?;

            let file = FileInode::materialized(ino, self.number, name.clone(), mode, uid, gid);
            mount.inodes().insert(InodeHandle::File(file.clone()));

            dir.entries.insert(
                name.clone(),
                DirEntry {
                    mode,
                    source_hash: None,
                    materialized: true,
                    inode: Some(ino),
                },
            );
            dir.materialized = true;
            self.save_dir(mount, &dir).await?;
            file
        };

        mount.propagate_materialization(self.number).await?;
        mount.journal().record_created(path);
        Ok(file)
    }

    #[instrument(skip(self, mount), fields(parent = self.number, name = %name))]
    pub async fn mkdir(
        self: &Arc<Self>,
        mount: &Mount,
        name: &PathComponent,
        mode: u32,
        uid: u32,
        gid: u32,
    ) -> Result<Arc<TreeInode>, InodeError> {
        let path = mount
            .path_for(self.number)
            .ok_or_else(|| InodeError::enoent(self.number))?
            .join(name);
        let mode = (mode & !S_IFMT) | S_IFDIR;

        let child = {
            let mut dir = self.dir.lock().await;
            if self.is_unlinked() {
                return Err(InodeError::enoent(self.number));
            }
            if dir.entries.contains_key(name) {
                return Err(InodeError::eexist(self.number));
            }

            let ino = mount.allocate_inode().await?;
            let child_dir = Dir {
                entries: BTreeMap::new(),
                source_hash: None,
                materialized: true,
            };
            mount
                .overlay()
                .save_overlay_dir(ino, &child_dir.to_overlay())
                .await?;

            let child = TreeInode::new(ino, self.number, name.clone(), child_dir, mode, uid, gid);
            mount.inodes().insert(InodeHandle::Tree(child.clone()));

            dir.entries.insert(
                name.clone(),
                DirEntry {
                    mode,
                    source_hash: None,
                    materialized: true,
                    inode: Some(ino),
                },
            );
            dir.materialized = true;
            self.save_dir(mount, &dir).await?;
            child
        };

        mount.propagate_materialization(self.number).await?;
        mount.journal().record_created(path);
        Ok(child)
    }

    #[instrument(skip(self, mount), fields(parent = self.number, name = %name))]
    pub async fn unlink(
        self: &Arc<Self>,
        mount: &Mount,
        name: &PathComponent,
    ) -> Result<(), InodeError> {
        let path = mount
            .path_for(self.number)
            .ok_or_else(|| InodeError::enoent(self.number))?
            .join(name);

        let removed = {
            let mut dir = self.dir.lock().await;
            let number = self.number;
            let entry = dir
                .entries
                .get(name)
                .cloned()
                .ok_or_else(|| InodeError::enoent(number))?;
            if entry.is_dir() {
                return Err(InodeError::eisdir(number));
            }
            dir.entries.remove(name);
            dir.materialized = true;
            self.save_dir(mount, &dir).await?;
            entry
        };

        mount.propagate_materialization(self.number).await?;
        mount.journal().record_removed(path);
        self.release_unlinked_child(mount, &removed).await
    }

    #[instrument(skip(self, mount, ctx), fields(parent = self.number, name = %name))]
    pub async fn rmdir(
        self: &Arc<Self>,
        mount: &Mount,
        name: &PathComponent,
        ctx: &FetchContext,
    ) -> Result<(), InodeError> {
        let path = mount
            .path_for(self.number)
            .ok_or_else(|| InodeError::enoent(self.number))?
            .join(name);

        // Taken before any inode lock, same as rename: the emptiness check
        // reaches into the child.
        let _rename_guard = mount.rename_lock().lock().await;

        let removed = {
            let mut dir = self.dir.lock().await;
            let number = self.number;
            let entry = dir
                .entries
                .get(name)
                .cloned()
                .ok_or_else(|| InodeError::enoent(number))?;
            if !entry.is_dir() {
                return Err(InodeError::enotdir(number));
            }

            let empty = match entry.inode.and_then(|ino| mount.inodes().get(ino)) {
                Some(InodeHandle::Tree(child)) => child.is_empty_dir().await,
                Some(InodeHandle::File(_)) => return Err(InodeError::enotdir(number)),
                None => {
                    if entry.materialized {
                        let ino = entry.inode.ok_or_else(|| {
                            weft_castore::Error::StorageError(
                                "materialized directory entry without an inode number".into(),
                            )
                        })?;
                        match mount.overlay().load_overlay_dir(ino).await? {
                            Some(payload) => payload.entries.is_empty(),
                            None => true,
                        }
                    } else {
                        match entry.source_hash {
                            Some(ref hash) => {
                                mount.store().get_tree(hash, ctx).await?.is_empty()
                            }
                            None => true,
                        }
                    }
                }
            };
            if !empty {
                return Err(InodeError::enotempty(number));
            }

            dir.entries.remove(name);
            dir.materialized = true;
            self.save_dir(mount, &dir).await?;
            entry
        };

        mount.propagate_materialization(self.number).await?;
        mount.journal().record_removed(path);
        self.release_unlinked_child(mount, &removed).await
    }

    /// Post-unlink bookkeeping: the child stays alive while the kernel
    /// still references it; its overlay data goes when the last reference
    /// drops.
    async fn release_unlinked_child(
        &self,
        mount: &Mount,
        entry: &DirEntry,
    ) -> Result<(), InodeError> {
        let Some(ino) = entry.inode else {
            return Ok(());
        };
        if let Some(handle) = mount.inodes().get(ino) {
            handle.mark_unlinked();
        }
        if mount.inodes().lookup_count(ino) == 0 {
            mount.overlay().remove_overlay_data(ino).await?;
            mount.inodes().remove(ino);
        }
        Ok(())
    }

    /// Records that child `name` (inode `child_ino`) became materialized.
    /// Returns true when both this directory and the entry already were,
    /// meaning upward propagation can stop.
    pub(crate) async fn note_child_materialized(
        &self,
        mount: &Mount,
        name: &PathComponent,
        child_ino: InodeNumber,
    ) -> Result<bool, InodeError> {
        let mut dir = self.dir.lock().await;
        let Some(entry) = dir.entries.get_mut(name) else {
            // concurrently unlinked; nothing left to record
            return Ok(true);
        };
        let entry_settled = entry.materialized && entry.inode == Some(child_ino);
        entry.materialized = true;
        entry.inode = Some(child_ino);
        entry.source_hash = None;
        let dir_settled = dir.materialized;
        dir.materialized = true;
        self.save_dir(mount, &dir).await?;
        Ok(entry_settled && dir_settled)
    }
}

/// Renames `src_name` in `src_parent` to `dst_name` in `dst_parent`.
///
/// The mount-global rename lock serializes all renames; the two directory
/// locks are then taken in inode number order.
#[instrument(skip_all, fields(src = %src_name, dst = %dst_name))]
pub async fn rename(
    mount: &Mount,
    src_parent: Arc<TreeInode>,
    src_name: &PathComponent,
    dst_parent: Arc<TreeInode>,
    dst_name: &PathComponent,
) -> Result<(), InodeError> {
    let _rename_guard = mount.rename_lock().lock().await;

    let src_path = mount
        .path_for(src_parent.number())
        .ok_or_else(|| InodeError::enoent(src_parent.number()))?
        .join(src_name);
    let dst_path = mount
        .path_for(dst_parent.number())
        .ok_or_else(|| InodeError::enoent(dst_parent.number()))?
        .join(dst_name);

    let (moved, replaced) = if src_parent.number() == dst_parent.number() {
        let mut dir = src_parent.dir.lock().await;

        let entry = dir
            .entries
            .get(src_name)
            .cloned()
            .ok_or_else(|| InodeError::enoent(src_parent.number()))?;
        let replaced = check_replaceable(dst_parent.number(), dir.entries.get(dst_name))?;

        dir.entries.remove(src_name);
        dir.entries.insert(dst_name.clone(), entry.clone());
        dir.materialized = true;
        src_parent.save_dir(mount, &dir).await?;
        (entry, replaced)
    } else {
        // Acquire in inode number order to avoid deadlock.
        let (mut src_dir, mut dst_dir) = if src_parent.number() < dst_parent.number() {
            let src = src_parent.dir.lock().await;
            let dst = dst_parent.dir.lock().await;
            (src, dst)
        } else {
            let dst = dst_parent.dir.lock().await;
            let src = src_parent.dir.lock().await;
            (src, dst)
        };

        let entry = src_dir
            .entries
            .get(src_name)
            .cloned()
            .ok_or_else(|| InodeError::enoent(src_parent.number()))?;
        let replaced = check_replaceable(dst_parent.number(), dst_dir.entries.get(dst_name))?;

        src_dir.entries.remove(src_name);
        dst_dir.entries.insert(dst_name.clone(), entry.clone());
        src_dir.materialized = true;
        dst_dir.materialized = true;
        src_parent.save_dir(mount, &src_dir).await?;
        dst_parent.save_dir(mount, &dst_dir).await?;
        (entry, replaced)
    };

    // The moved child, if loaded, now hangs off the destination parent.
    if let Some(ino) = moved.inode {
        if let Some(handle) = mount.inodes().get(ino) {
            match handle {
                InodeHandle::File(f) => f.set_location(dst_parent.number(), dst_name.clone()),
                InodeHandle::Tree(t) => t.set_location(dst_parent.number(), dst_name.clone()),
            }
        }
    }

    if let Some(ref replaced_entry) = replaced {
        dst_parent
            .release_unlinked_child(mount, replaced_entry)
            .await?;
    }

    match replaced {
        Some(_) => mount.journal().record_replaced(src_path, dst_path),
        None => mount.journal().record_renamed(src_path, dst_path),
    }

    mount.propagate_materialization(src_parent.number()).await?;
    mount.propagate_materialization(dst_parent.number()).await?;
    Ok(())
}

/// A rename may replace an existing file; directory targets are refused.
fn check_replaceable(
    parent_ino: InodeNumber,
    existing: Option<&DirEntry>,
) -> Result<Option<DirEntry>, InodeError> {
    match existing {
        None => Ok(None),
        Some(entry) if entry.is_dir() => Err(InodeError::enotempty(parent_ino)),
        Some(entry) => Ok(Some(entry.clone())),
    }
}
