//! The inode layer: a persistent tree of [TreeInode] and [FileInode]
//! objects.
//!
//! Inodes live in an arena ([InodeMap]) keyed by inode number. Parents hold
//! their children's numbers inside their directory state; children hold
//! their parent's number. There are no strong reference cycles by
//! construction.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use weft_castore::path::PathComponent;
use weft_castore::FetchError;

mod file;
mod tree;

pub use file::FileInode;
pub use tree::{rename, Dir, DirEntry, DirListEntry, TreeInode};
pub(crate) use tree::{S_IFDIR, S_IFLNK, S_IFMT, S_IFREG};

pub type InodeNumber = u64;

/// The mount root. Matches the kernel's root inode id.
pub const ROOT_INODE: InodeNumber = 1;
/// The synthetic control directory at the mount root.
pub const DOT_DIR_INODE: InodeNumber = 2;
/// The `root` marker file inside the control directory.
pub const DOT_ROOT_MARKER_INODE: InodeNumber = 3;
/// First number the allocator may issue.
pub const FIRST_DYNAMIC_INODE: InodeNumber = 4;

/// Where an inode currently hangs in the tree. Renames move it.
#[derive(Clone, Debug)]
pub struct InodeLocation {
    pub parent: InodeNumber,
    pub name: PathComponent,
}

/// Mode, ownership and timestamps, kept apart from the content state.
#[derive(Clone, Debug)]
pub struct InodeMetadata {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
}

impl InodeMetadata {
    pub fn new(mode: u32, uid: u32, gid: u32) -> Self {
        let now = SystemTime::now();
        Self {
            mode,
            uid,
            gid,
            atime: now,
            mtime: now,
            ctime: now,
        }
    }
}

/// Attributes as reported to the kernel.
#[derive(Clone, Debug)]
pub struct InodeAttr {
    pub ino: InodeNumber,
    pub size: u64,
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
}

/// Structural errors tied to an inode, plus pass-through fetch and storage
/// failures. Clone so a shared load latch can hand the same failure to
/// every waiter.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum InodeError {
    #[error("errno {errno} on inode {ino}")]
    Errno { ino: InodeNumber, errno: i32 },

    /// An object backing this inode does not hash to its id. The path makes
    /// the log line actionable.
    #[error("corrupt data at {path}: expected {expected}, got {actual}")]
    Corrupt {
        path: String,
        expected: weft_castore::ObjectId,
        actual: weft_castore::ObjectId,
    },

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Storage(#[from] weft_castore::Error),
}

impl InodeError {
    pub fn enoent(ino: InodeNumber) -> Self {
        Self::Errno {
            ino,
            errno: libc::ENOENT,
        }
    }

    pub fn eexist(ino: InodeNumber) -> Self {
        Self::Errno {
            ino,
            errno: libc::EEXIST,
        }
    }

    pub fn enotdir(ino: InodeNumber) -> Self {
        Self::Errno {
            ino,
            errno: libc::ENOTDIR,
        }
    }

    pub fn eisdir(ino: InodeNumber) -> Self {
        Self::Errno {
            ino,
            errno: libc::EISDIR,
        }
    }

    pub fn enotempty(ino: InodeNumber) -> Self {
        Self::Errno {
            ino,
            errno: libc::ENOTEMPTY,
        }
    }

    pub fn eperm(ino: InodeNumber) -> Self {
        Self::Errno {
            ino,
            errno: libc::EPERM,
        }
    }

    pub fn einval(ino: InodeNumber) -> Self {
        Self::Errno {
            ino,
            errno: libc::EINVAL,
        }
    }

    /// The kernel-facing errno for this error. Everything unclassified is
    /// an I/O error.
    pub fn errno(&self) -> i32 {
        match self {
            InodeError::Errno { errno, .. } => *errno,
            InodeError::Corrupt { .. } => libc::EIO,
            InodeError::Fetch(FetchError::NotFound { .. }) => libc::ENOENT,
            InodeError::Fetch(FetchError::Cancelled) => libc::EINTR,
            InodeError::Fetch(_) => libc::EIO,
            InodeError::Storage(_) => libc::EIO,
        }
    }
}

/// A loaded inode, shared out of the [InodeMap].
#[derive(Clone, Debug)]
pub enum InodeHandle {
    File(Arc<FileInode>),
    Tree(Arc<TreeInode>),
}

impl InodeHandle {
    pub fn number(&self) -> InodeNumber {
        match self {
            InodeHandle::File(f) => f.number(),
            InodeHandle::Tree(t) => t.number(),
        }
    }

    pub fn is_tree(&self) -> bool {
        matches!(self, InodeHandle::Tree(_))
    }

    pub fn as_tree(&self) -> Option<Arc<TreeInode>> {
        match self {
            InodeHandle::Tree(t) => Some(t.clone()),
            InodeHandle::File(_) => None,
        }
    }

    pub fn as_file(&self) -> Option<Arc<FileInode>> {
        match self {
            InodeHandle::File(f) => Some(f.clone()),
            InodeHandle::Tree(_) => None,
        }
    }

    pub fn location(&self) -> InodeLocation {
        match self {
            InodeHandle::File(f) => f.location(),
            InodeHandle::Tree(t) => t.location(),
        }
    }

    pub fn mark_unlinked(&self) {
        match self {
            InodeHandle::File(f) => f.mark_unlinked(),
            InodeHandle::Tree(t) => t.mark_unlinked(),
        }
    }

    pub fn is_unlinked(&self) -> bool {
        match self {
            InodeHandle::File(f) => f.is_unlinked(),
            InodeHandle::Tree(t) => t.is_unlinked(),
        }
    }
}

type InodeLoadLatch = crate::latch::Latch<Result<InodeHandle, InodeError>>;

/// Process-wide arena of loaded inodes, plus the table of in-flight loads
/// and the kernel lookup counts.
#[derive(Default)]
pub struct InodeMap {
    inodes: RwLock<HashMap<InodeNumber, InodeHandle>>,
    pending: Mutex<HashMap<InodeNumber, Arc<InodeLoadLatch>>>,
    lookup_counts: Mutex<HashMap<InodeNumber, u64>>,
}

impl InodeMap {
    pub fn get(&self, ino: InodeNumber) -> Option<InodeHandle> {
        self.inodes.read().get(&ino).cloned()
    }

    pub fn get_tree(&self, ino: InodeNumber) -> Result<Arc<TreeInode>, InodeError> {
        match self.get(ino) {
            Some(InodeHandle::Tree(t)) => Ok(t),
            Some(InodeHandle::File(_)) => Err(InodeError::enotdir(ino)),
            None => Err(InodeError::enoent(ino)),
        }
    }

    pub fn get_file(&self, ino: InodeNumber) -> Result<Arc<FileInode>, InodeError> {
        match self.get(ino) {
            Some(InodeHandle::File(f)) => Ok(f),
            Some(InodeHandle::Tree(_)) => Err(InodeError::eisdir(ino)),
            None => Err(InodeError::enoent(ino)),
        }
    }

    /// Inserts a handle. If another caller raced the same number in first,
    /// the earlier handle wins and is returned.
    pub fn insert(&self, handle: InodeHandle) -> InodeHandle {
        let mut inodes = self.inodes.write();
        inodes
            .entry(handle.number())
            .or_insert_with(|| handle.clone())
            .clone()
    }

    /// Unloads an inode from memory. Distinct from unlinking: the overlay
    /// payload is untouched.
    pub fn remove(&self, ino: InodeNumber) {
        self.inodes.write().remove(&ino);
        self.lookup_counts.lock().remove(&ino);
    }

    pub fn len(&self) -> usize {
        self.inodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inodes.read().is_empty()
    }

    /// Claims the load of `ino`, or returns the latch to wait on if another
    /// caller got there first.
    pub fn claim_load(&self, ino: InodeNumber) -> Result<Arc<InodeLoadLatch>, Arc<InodeLoadLatch>> {
        let mut pending = self.pending.lock();
        match pending.get(&ino) {
            Some(latch) => Err(latch.clone()),
            None => {
                let latch = Arc::new(InodeLoadLatch::new());
                pending.insert(ino, latch.clone());
                Ok(latch)
            }
        }
    }

    /// Completes a claimed load: publishes the result to all waiters.
    pub fn finish_load(
        &self,
        ino: InodeNumber,
        latch: &Arc<InodeLoadLatch>,
        result: Result<InodeHandle, InodeError>,
    ) {
        self.pending.lock().remove(&ino);
        latch.fulfil(result);
    }

    /// Bumps the kernel lookup count for an inode.
    pub fn note_lookup(&self, ino: InodeNumber) {
        *self.lookup_counts.lock().entry(ino).or_insert(0) += 1;
    }

    /// Kernel forget: decrements by `count`, returning the remainder.
    pub fn forget(&self, ino: InodeNumber, count: u64) -> u64 {
        let mut counts = self.lookup_counts.lock();
        match counts.get_mut(&ino) {
            None => 0,
            Some(current) => {
                *current = current.saturating_sub(count);
                let remaining = *current;
                if remaining == 0 {
                    counts.remove(&ino);
                }
                remaining
            }
        }
    }

    pub fn lookup_count(&self, ino: InodeNumber) -> u64 {
        self.lookup_counts.lock().get(&ino).copied().unwrap_or(0)
    }

    /// Snapshot of every loaded inode, for the takeover message.
    pub fn snapshot(&self) -> Vec<InodeHandle> {
        self.inodes.read().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_counts_saturate() {
        let map = InodeMap::default();
        map.note_lookup(5);
        map.note_lookup(5);
        assert_eq!(2, map.lookup_count(5));
        assert_eq!(1, map.forget(5, 1));
        assert_eq!(0, map.forget(5, 10));
        assert_eq!(0, map.lookup_count(5));
    }

    #[test]
    fn claim_load_is_exclusive() {
        let map = InodeMap::default();
        let first = map.claim_load(9);
        assert!(first.is_ok());
        let second = map.claim_load(9);
        assert!(second.is_err());

        let latch = first.unwrap();
        map.finish_load(9, &latch, Err(InodeError::enoent(9)));
        // a new claim succeeds once the previous load finished
        assert!(map.claim_load(9).is_ok());
    }
}
