//! The mount: exclusive owner of the object store facade, overlay, journal
//! and inode arena for one checkout.
use std::sync::Arc;

use parking_lot::Mutex as SyncMutex;
use tokio::sync::Mutex;
use tracing::instrument;
use weft_castore::context::FetchContext;
use weft_castore::objectstore::ObjectStore;
use weft_castore::path::{PathComponent, RepoPath};
use weft_castore::ObjectId;

use crate::inodes::{
    Dir, InodeError, InodeHandle, InodeMap, InodeNumber, TreeInode, FIRST_DYNAMIC_INODE,
    ROOT_INODE,
};
use crate::journal::Journal;
use crate::overlay::{InodeAllocator, Overlay, DEFAULT_RESERVATION_BATCH};

pub struct Mount {
    store: Arc<ObjectStore>,
    overlay: Arc<dyn Overlay>,
    journal: Journal,
    inodes: InodeMap,
    allocator: InodeAllocator,
    /// Mount-global; acquired before any inode lock by rename and rmdir.
    rename_lock: Mutex<()>,
    root_hash: SyncMutex<ObjectId>,
    uid: u32,
    gid: u32,
}

impl Mount {
    /// Opens a mount over the given stores. The root directory comes from
    /// the overlay when a previous incarnation materialized it, otherwise
    /// from the backing store's root tree.
    pub async fn new(
        store: Arc<ObjectStore>,
        overlay: Arc<dyn Overlay>,
        root_hash: ObjectId,
    ) -> Result<Arc<Self>, InodeError> {
        let next_inode = overlay
            .load_next_inode_number()
            .await?
            .unwrap_or(FIRST_DYNAMIC_INODE);
        Self::open(store, overlay, root_hash, next_inode).await
    }

    /// Opens a mount taken over from a predecessor daemon, resuming inode
    /// allocation above the handed-over watermark.
    pub async fn resume(
        store: Arc<ObjectStore>,
        overlay: Arc<dyn Overlay>,
        root_hash: ObjectId,
        next_inode: InodeNumber,
    ) -> Result<Arc<Self>, InodeError> {
        Self::open(store, overlay, root_hash, next_inode).await
    }

    #[instrument(skip(store, overlay), fields(root = %root_hash))]
    async fn open(
        store: Arc<ObjectStore>,
        overlay: Arc<dyn Overlay>,
        root_hash: ObjectId,
        next_inode: InodeNumber,
    ) -> Result<Arc<Self>, InodeError> {
        let allocator = InodeAllocator::new(
            next_inode.max(FIRST_DYNAMIC_INODE),
            DEFAULT_RESERVATION_BATCH,
        );

        let mount = Arc::new(Self {
            store,
            overlay,
            journal: Journal::new(root_hash.clone()),
            inodes: InodeMap::default(),
            allocator,
            rename_lock: Mutex::new(()),
            root_hash: SyncMutex::new(root_hash.clone()),
            uid: unsafe { libc::getuid() },
            gid: unsafe { libc::getgid() },
        });

        let root_dir = match mount.overlay.load_overlay_dir(ROOT_INODE).await? {
            Some(overlay_dir) => Dir::from_overlay(&overlay_dir),
            None => {
                let ctx = FetchContext::new(std::process::id());
                let tree = mount.store.get_root_tree(&root_hash, &ctx).await?;
                Dir::from_tree(&tree)
            }
        };

        // The root's name is never consulted; paths resolve relative to it.
        let root_name: PathComponent = "root".try_into().expect("static name is valid");
        let root = TreeInode::new(
            ROOT_INODE,
            ROOT_INODE,
            root_name,
            root_dir,
            0o040755,
            mount.uid,
            mount.gid,
        );
        mount.inodes.insert(InodeHandle::Tree(root));

        Ok(mount)
    }

    pub fn store(&self) -> &ObjectStore {
        &self.store
    }

    pub fn overlay(&self) -> &dyn Overlay {
        self.overlay.as_ref()
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    pub fn inodes(&self) -> &InodeMap {
        &self.inodes
    }

    pub fn rename_lock(&self) -> &Mutex<()> {
        &self.rename_lock
    }

    /// uid/gid reported for inodes, i.e. the daemon's own identity.
    pub fn owner(&self) -> (u32, u32) {
        (self.uid, self.gid)
    }

    pub fn root(&self) -> Arc<TreeInode> {
        self.inodes
            .get_tree(ROOT_INODE)
            .expect("the root inode is loaded for the life of the mount")
    }

    pub fn root_hash(&self) -> ObjectId {
        self.root_hash.lock().clone()
    }

    /// Moves the head snapshot hash (the journal records the transition).
    pub fn update_snapshot(&self, to: ObjectId) {
        *self.root_hash.lock() = to.clone();
        self.journal.record_hash_update(to);
    }

    pub async fn allocate_inode(&self) -> Result<InodeNumber, InodeError> {
        Ok(self.allocator.allocate(self.overlay.as_ref()).await?)
    }

    pub fn next_inode_number(&self) -> InodeNumber {
        self.allocator.next_inode_number()
    }

    /// The repo-relative path of a loaded inode, computed by walking parent
    /// links. None if the inode (or an ancestor) is no longer loaded.
    pub fn path_for(&self, ino: InodeNumber) -> Option<RepoPath> {
        let mut components = Vec::new();
        let mut current = ino;
        while current != ROOT_INODE {
            let handle = self.inodes.get(current)?;
            let location = handle.location();
            components.push(location.name);
            current = location.parent;
        }

        let mut path = RepoPath::root();
        for component in components.iter().rev() {
            path = path.join(component);
        }
        Some(path)
    }

    /// Walks ancestors from `start`'s parent upward, recording the
    /// materialization in each directory until it hits one that already
    /// knew. Called after the triggering inode's own lock is released.
    pub async fn propagate_materialization(&self, start: InodeNumber) -> Result<(), InodeError> {
        let mut ino = start;
        while ino != ROOT_INODE {
            let Some(handle) = self.inodes.get(ino) else {
                break;
            };
            let location = handle.location();
            let parent = self.inodes.get_tree(location.parent)?;
            let settled = parent
                .note_child_materialized(self, &location.name, ino)
                .await?;
            if settled {
                break;
            }
            ino = location.parent;
        }
        Ok(())
    }

    /// Kernel forget: drops lookup references; an unlinked inode with no
    /// remaining references loses its overlay data and leaves the arena.
    pub async fn forget(&self, ino: InodeNumber, nlookup: u64) -> Result<(), InodeError> {
        if self.inodes.forget(ino, nlookup) > 0 {
            return Ok(());
        }
        if let Some(handle) = self.inodes.get(ino) {
            let unlinked = match &handle {
                InodeHandle::File(f) => f.is_unlinked(),
                InodeHandle::Tree(t) => t.is_unlinked(),
            };
            if unlinked {
                self.overlay.remove_overlay_data(ino).await?;
                self.inodes.remove(ino);
            }
        }
        Ok(())
    }

    /// Resolves a repo-relative path from the root, loading inodes on the
    /// way.
    pub async fn resolve(
        self: &Arc<Self>,
        path: &RepoPath,
        ctx: &FetchContext,
    ) -> Result<InodeHandle, InodeError> {
        let mut current = InodeHandle::Tree(self.root());
        for component in path.components() {
            let number = current.number();
            let tree = current
                .as_tree()
                .ok_or_else(|| InodeError::enotdir(number))?;
            current = tree.get_or_load_child(self, &component, ctx).await?;
        }
        Ok(current)
    }

    /// Clean shutdown: flush the allocator watermark.
    pub async fn close(&self) -> Result<(), InodeError> {
        self.overlay
            .close(self.allocator.next_inode_number())
            .await?;
        Ok(())
    }
}
