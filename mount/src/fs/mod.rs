//! The kernel channel: translates kernel filesystem callbacks into inode
//! operations and serializes the responses.
//!
//! Requests arrive on the FUSE server threads; the handlers bridge into the
//! tokio runtime for every operation that may suspend, the same way the
//! rest of the daemon does its async work.
use std::collections::HashMap;
use std::ffi::CStr;
use std::future::Future;
use std::io::{self, Read};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuse_backend_rs::abi::fuse_abi::{stat64, Attr, CreateIn, SetattrValid};
use fuse_backend_rs::api::filesystem::{
    Context, DirEntry as FuseDirEntry, Entry, FileSystem, FsOptions, OpenOptions, ZeroCopyReader,
    ZeroCopyWriter, ROOT_ID,
};
use parking_lot::RwLock;
use tracing::warn;
use weft_castore::context::FetchContext;
use weft_castore::path::PathComponent;

use crate::inodes::{
    InodeAttr, InodeError, InodeHandle, InodeNumber, DOT_DIR_INODE, DOT_ROOT_MARKER_INODE,
    S_IFDIR, S_IFLNK, S_IFMT, S_IFREG,
};
use crate::mount::Mount;

pub mod fuse;
mod request;

pub use request::{RequestEvent, RequestInfo, RequestKind, RequestTracker};

/// The synthetic control directory at the mount root. Invisible to readdir;
/// it and its children reject setattr.
pub const DOT_DIR_NAME: &[u8] = b".weft";
const DOT_ROOT_MARKER_NAME: &[u8] = b"root";

const ATTR_TIMEOUT: Duration = Duration::from_secs(1);
const ENTRY_TIMEOUT: Duration = Duration::from_secs(1);

/// The FUSE-facing filesystem over a [Mount].
pub struct WorkingCopyFs {
    mount: Arc<Mount>,
    tracker: RequestTracker,

    /// Open file and directory handles, mapped to their inode.
    file_handles: RwLock<HashMap<u64, InodeNumber>>,
    next_file_handle: AtomicU64,

    tokio_handle: tokio::runtime::Handle,
}

impl WorkingCopyFs {
    pub fn new(mount: Arc<Mount>) -> Self {
        Self {
            mount,
            tracker: RequestTracker::new(),
            file_handles: RwLock::new(HashMap::new()),
            next_file_handle: AtomicU64::new(1),
            tokio_handle: tokio::runtime::Handle::current(),
        }
    }

    pub fn mount(&self) -> &Arc<Mount> {
        &self.mount
    }

    /// The tracing interface: enumerate and subscribe to live requests.
    pub fn tracker(&self) -> &RequestTracker {
        &self.tracker
    }

    /// Bridges an async inode operation onto the calling kernel thread.
    fn run<T, F>(&self, fut: F) -> io::Result<T>
    where
        T: Send + 'static,
        F: Future<Output = Result<T, InodeError>> + Send + 'static,
    {
        let task = self.tokio_handle.spawn(fut);
        self.tokio_handle
            .block_on(task)
            .map_err(|_| io::Error::from_raw_os_error(libc::EIO))?
            .map_err(io_error)
    }

    fn alloc_handle(&self, inode: InodeNumber) -> u64 {
        let fh = self.next_file_handle.fetch_add(1, Ordering::SeqCst);
        self.file_handles.write().insert(fh, inode);
        fh
    }

    fn handle_inode(&self, handle: u64) -> io::Result<InodeNumber> {
        self.file_handles
            .read()
            .get(&handle)
            .copied()
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EBADF))
    }

    fn root_marker_contents(&self) -> Vec<u8> {
        let mut contents = self.mount.root_hash().to_hex().into_bytes();
        contents.push(b'\n');
        contents
    }

    fn dot_dir_attr(&self) -> Attr {
        let (uid, gid) = self.mount.owner();
        synthetic_attr(DOT_DIR_INODE, 0, S_IFDIR | 0o555, 2, uid, gid)
    }

    fn dot_marker_attr(&self) -> Attr {
        let (uid, gid) = self.mount.owner();
        synthetic_attr(
            DOT_ROOT_MARKER_INODE,
            self.root_marker_contents().len() as u64,
            S_IFREG | 0o444,
            1,
            uid,
            gid,
        )
    }

    fn entry_for_attr(attr: Attr) -> Entry {
        Entry {
            inode: attr.ino,
            attr: attr.into(),
            attr_timeout: ATTR_TIMEOUT,
            entry_timeout: ENTRY_TIMEOUT,
            ..Default::default()
        }
    }

    /// Shared by every operation that ends in an `Entry` reply.
    fn lookup_child_entry(
        &self,
        ctx: &Context,
        parent: InodeNumber,
        name: PathComponent,
    ) -> io::Result<Entry> {
        let mount = self.mount.clone();
        let pid = ctx.pid as u32;
        let attr = self.run(async move {
            let fetch_ctx = FetchContext::new(pid);
            let tree = mount.inodes().get_tree(parent)?;
            let handle = tree.get_or_load_child(&mount, &name, &fetch_ctx).await?;
            mount.inodes().note_lookup(handle.number());
            attr_of(&mount, &handle, &fetch_ctx).await
        })?;
        Ok(Self::entry_for_attr(to_fuse_attr(&attr)))
    }
}

async fn attr_of(
    mount: &Mount,
    handle: &InodeHandle,
    ctx: &FetchContext,
) -> Result<InodeAttr, InodeError> {
    match handle {
        InodeHandle::File(f) => f.attr(mount, ctx).await,
        InodeHandle::Tree(t) => Ok(t.attr()),
    }
}

fn io_error(e: InodeError) -> io::Error {
    io::Error::from_raw_os_error(e.errno())
}

fn timespec(t: SystemTime) -> (u64, u32) {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => (d.as_secs(), d.subsec_nanos()),
        Err(_) => (0, 0),
    }
}

fn system_time(secs: i64, nsecs: i64) -> SystemTime {
    if secs < 0 {
        return UNIX_EPOCH;
    }
    UNIX_EPOCH + Duration::new(secs as u64, (nsecs.max(0) as u32).min(999_999_999))
}

fn synthetic_attr(ino: InodeNumber, size: u64, mode: u32, nlink: u32, uid: u32, gid: u32) -> Attr {
    Attr {
        ino,
        size,
        blksize: 4096,
        blocks: size.div_ceil(512),
        mode,
        nlink,
        uid,
        gid,
        ..Default::default()
    }
}

fn to_fuse_attr(attr: &InodeAttr) -> Attr {
    let (atime, atimensec) = timespec(attr.atime);
    let (mtime, mtimensec) = timespec(attr.mtime);
    let (ctime, ctimensec) = timespec(attr.ctime);
    Attr {
        ino: attr.ino,
        size: attr.size,
        blksize: 4096,
        blocks: attr.size.div_ceil(512),
        mode: attr.mode,
        nlink: attr.nlink,
        uid: attr.uid,
        gid: attr.gid,
        atime,
        atimensec,
        mtime,
        mtimensec,
        ctime,
        ctimensec,
        ..Default::default()
    }
}

fn parse_name(name: &CStr, errno: i32) -> io::Result<PathComponent> {
    name.try_into()
        .map_err(|_| io::Error::from_raw_os_error(errno))
}

impl FileSystem for WorkingCopyFs {
    type Inode = u64;
    type Handle = u64;

    fn init(&self, _capable: FsOptions) -> io::Result<FsOptions> {
        Ok(FsOptions::empty())
    }

    #[tracing::instrument(skip_all, fields(rq.parent = parent, rq.name = ?name))]
    fn lookup(&self, ctx: &Context, parent: Self::Inode, name: &CStr) -> io::Result<Entry> {
        let guard = self.tracker.begin(RequestKind::Lookup, ctx.pid as u32);
        guard.mark_started();

        if parent == DOT_DIR_INODE {
            return if name.to_bytes() == DOT_ROOT_MARKER_NAME {
                Ok(Self::entry_for_attr(self.dot_marker_attr()))
            } else {
                Err(io::Error::from_raw_os_error(libc::ENOENT))
            };
        }
        if parent == ROOT_ID && name.to_bytes() == DOT_DIR_NAME {
            return Ok(Self::entry_for_attr(self.dot_dir_attr()));
        }

        let name = parse_name(name, libc::ENOENT)?;
        self.lookup_child_entry(ctx, parent, name)
    }

    fn forget(&self, ctx: &Context, inode: Self::Inode, count: u64) {
        let guard = self.tracker.begin(RequestKind::Forget, ctx.pid as u32);
        guard.mark_started();

        if inode == DOT_DIR_INODE || inode == DOT_ROOT_MARKER_INODE {
            return;
        }
        let mount = self.mount.clone();
        let result = self.run(async move { mount.forget(inode, count).await });
        if let Err(e) = result {
            warn!(inode, error = %e, "forget failed");
        }
    }

    #[tracing::instrument(skip_all, fields(rq.inode = inode))]
    fn getattr(
        &self,
        ctx: &Context,
        inode: Self::Inode,
        _handle: Option<Self::Handle>,
    ) -> io::Result<(stat64, Duration)> {
        let guard = self.tracker.begin(RequestKind::Getattr, ctx.pid as u32);
        guard.mark_started();

        if inode == DOT_DIR_INODE {
            return Ok((self.dot_dir_attr().into(), ATTR_TIMEOUT));
        }
        if inode == DOT_ROOT_MARKER_INODE {
            return Ok((self.dot_marker_attr().into(), ATTR_TIMEOUT));
        }

        let mount = self.mount.clone();
        let pid = ctx.pid as u32;
        let attr = self.run(async move {
            let fetch_ctx = FetchContext::new(pid);
            let number = inode;
            let handle = mount
                .inodes()
                .get(inode)
                .ok_or_else(|| InodeError::enoent(number))?;
            attr_of(&mount, &handle, &fetch_ctx).await
        })?;
        Ok((to_fuse_attr(&attr).into(), ATTR_TIMEOUT))
    }

    #[tracing::instrument(skip_all, fields(rq.inode = inode))]
    fn setattr(
        &self,
        ctx: &Context,
        inode: Self::Inode,
        attr: stat64,
        _handle: Option<Self::Handle>,
        valid: SetattrValid,
    ) -> io::Result<(stat64, Duration)> {
        let guard = self.tracker.begin(RequestKind::Setattr, ctx.pid as u32);
        guard.mark_started();

        // The control directory and its children are immutable.
        if inode == DOT_DIR_INODE || inode == DOT_ROOT_MARKER_INODE {
            return Err(io::Error::from_raw_os_error(libc::EPERM));
        }

        let mount = self.mount.clone();
        let pid = ctx.pid as u32;
        let updated = self.run(async move {
            let fetch_ctx = FetchContext::new(pid);
            let number = inode;
            let handle = mount
                .inodes()
                .get(inode)
                .ok_or_else(|| InodeError::enoent(number))?;

            if let InodeHandle::File(ref file) = handle {
                if valid.contains(SetattrValid::SIZE) {
                    file.set_size(&mount, attr.st_size.max(0) as u64, &fetch_ctx)
                        .await?;
                }
            }

            let apply = |m: &mut crate::inodes::InodeMetadata| {
                let now = SystemTime::now();
                if valid.contains(SetattrValid::MODE) {
                    m.mode = (m.mode & S_IFMT) | (attr.st_mode & !S_IFMT);
                }
                if valid.contains(SetattrValid::UID) {
                    m.uid = attr.st_uid;
                }
                if valid.contains(SetattrValid::GID) {
                    m.gid = attr.st_gid;
                }
                if valid.contains(SetattrValid::ATIME_NOW) {
                    m.atime = now;
                } else if valid.contains(SetattrValid::ATIME) {
                    m.atime = system_time(attr.st_atime, attr.st_atime_nsec);
                }
                if valid.contains(SetattrValid::MTIME_NOW) {
                    m.mtime = now;
                } else if valid.contains(SetattrValid::MTIME) {
                    m.mtime = system_time(attr.st_mtime, attr.st_mtime_nsec);
                }
                if valid.contains(SetattrValid::CTIME) {
                    m.ctime = system_time(attr.st_ctime, attr.st_ctime_nsec);
                } else if !valid.is_empty() {
                    m.ctime = now;
                }
            };
            match handle {
                InodeHandle::File(ref f) => f.update_metadata(apply),
                InodeHandle::Tree(ref t) => t.update_metadata(apply),
            }

            attr_of(&mount, &handle, &fetch_ctx).await
        })?;
        Ok((to_fuse_attr(&updated).into(), ATTR_TIMEOUT))
    }

    #[tracing::instrument(skip_all, fields(rq.inode = inode))]
    fn readlink(&self, ctx: &Context, inode: Self::Inode) -> io::Result<Vec<u8>> {
        let guard = self.tracker.begin(RequestKind::Readlink, ctx.pid as u32);
        guard.mark_started();

        let mount = self.mount.clone();
        let pid = ctx.pid as u32;
        self.run(async move {
            let fetch_ctx = FetchContext::new(pid);
            let file = mount.inodes().get_file(inode)?;
            if file.metadata().mode & S_IFMT != S_IFLNK {
                return Err(InodeError::einval(inode));
            }
            Ok(file.readlink(&mount, &fetch_ctx).await?.to_vec())
        })
    }

    #[tracing::instrument(skip_all, fields(rq.parent = parent, rq.name = ?name))]
    fn symlink(
        &self,
        ctx: &Context,
        linkname: &CStr,
        parent: Self::Inode,
        name: &CStr,
    ) -> io::Result<Entry> {
        let guard = self.tracker.begin(RequestKind::Symlink, ctx.pid as u32);
        guard.mark_started();

        if parent == DOT_DIR_INODE {
            return Err(io::Error::from_raw_os_error(libc::EACCES));
        }

        if parent == ROOT_ID && name.to_bytes() == DOT_DIR_NAME {
            return Err(io::Error::from_raw_os_error(libc::EPERM));
        }
        let name = parse_name(name, libc::EINVAL)?;
        let target = linkname.to_bytes().to_vec();

        let mount = self.mount.clone();
        let (uid, gid) = (ctx.uid, ctx.gid);
        let pid = ctx.pid as u32;
        let attr = self.run(async move {
            let fetch_ctx = FetchContext::new(pid);
            let tree = mount.inodes().get_tree(parent)?;
            let file = tree
                .create_file(&mount, &name, S_IFLNK | 0o777, uid, gid, &target)
                .await?;
            mount.inodes().note_lookup(file.number());
            file.attr(&mount, &fetch_ctx).await
        })?;
        Ok(Self::entry_for_attr(to_fuse_attr(&attr)))
    }

    #[tracing::instrument(skip_all, fields(rq.parent = inode, rq.name = ?name))]
    fn mknod(
        &self,
        ctx: &Context,
        inode: Self::Inode,
        name: &CStr,
        mode: u32,
        _rdev: u32,
        umask: u32,
    ) -> io::Result<Entry> {
        let guard = self.tracker.begin(RequestKind::Mknod, ctx.pid as u32);
        guard.mark_started();

        if inode == DOT_DIR_INODE {
            return Err(io::Error::from_raw_os_error(libc::EACCES));
        }

        // Only regular files; no devices or fifos in a working copy.
        if mode & S_IFMT != S_IFREG && mode & S_IFMT != 0 {
            return Err(io::Error::from_raw_os_error(libc::EPERM));
        }
        if inode == ROOT_ID && name.to_bytes() == DOT_DIR_NAME {
            return Err(io::Error::from_raw_os_error(libc::EPERM));
        }
        let name = parse_name(name, libc::EINVAL)?;
        let file_mode = S_IFREG | (mode & !umask & 0o7777);

        let mount = self.mount.clone();
        let (uid, gid) = (ctx.uid, ctx.gid);
        let pid = ctx.pid as u32;
        let attr = self.run(async move {
            let fetch_ctx = FetchContext::new(pid);
            let tree = mount.inodes().get_tree(inode)?;
            let file = tree
                .create_file(&mount, &name, file_mode, uid, gid, b"")
                .await?;
            mount.inodes().note_lookup(file.number());
            file.attr(&mount, &fetch_ctx).await
        })?;
        Ok(Self::entry_for_attr(to_fuse_attr(&attr)))
    }

    #[tracing::instrument(skip_all, fields(rq.parent = parent, rq.name = ?name))]
    fn mkdir(
        &self,
        ctx: &Context,
        parent: Self::Inode,
        name: &CStr,
        mode: u32,
        umask: u32,
    ) -> io::Result<Entry> {
        let guard = self.tracker.begin(RequestKind::Mkdir, ctx.pid as u32);
        guard.mark_started();

        if parent == DOT_DIR_INODE {
            return Err(io::Error::from_raw_os_error(libc::EACCES));
        }

        if parent == ROOT_ID && name.to_bytes() == DOT_DIR_NAME {
            return Err(io::Error::from_raw_os_error(libc::EPERM));
        }
        let name = parse_name(name, libc::EINVAL)?;
        let dir_mode = mode & !umask & 0o7777;

        let mount = self.mount.clone();
        let (uid, gid) = (ctx.uid, ctx.gid);
        let attr = self.run(async move {
            let tree = mount.inodes().get_tree(parent)?;
            let child = tree.mkdir(&mount, &name, dir_mode, uid, gid).await?;
            mount.inodes().note_lookup(child.number());
            Ok(child.attr())
        })?;
        Ok(Self::entry_for_attr(to_fuse_attr(&attr)))
    }

    #[tracing::instrument(skip_all, fields(rq.parent = parent, rq.name = ?name))]
    fn unlink(&self, ctx: &Context, parent: Self::Inode, name: &CStr) -> io::Result<()> {
        let guard = self.tracker.begin(RequestKind::Unlink, ctx.pid as u32);
        guard.mark_started();

        if parent == DOT_DIR_INODE {
            return Err(io::Error::from_raw_os_error(libc::EACCES));
        }

        if parent == ROOT_ID && name.to_bytes() == DOT_DIR_NAME {
            return Err(io::Error::from_raw_os_error(libc::EPERM));
        }
        let name = parse_name(name, libc::ENOENT)?;
        let mount = self.mount.clone();
        self.run(async move {
            let tree = mount.inodes().get_tree(parent)?;
            tree.unlink(&mount, &name).await
        })
    }

    #[tracing::instrument(skip_all, fields(rq.parent = parent, rq.name = ?name))]
    fn rmdir(&self, ctx: &Context, parent: Self::Inode, name: &CStr) -> io::Result<()> {
        let guard = self.tracker.begin(RequestKind::Rmdir, ctx.pid as u32);
        guard.mark_started();

        if parent == DOT_DIR_INODE {
            return Err(io::Error::from_raw_os_error(libc::EACCES));
        }

        if parent == ROOT_ID && name.to_bytes() == DOT_DIR_NAME {
            return Err(io::Error::from_raw_os_error(libc::EPERM));
        }
        let name = parse_name(name, libc::ENOENT)?;
        let mount = self.mount.clone();
        let pid = ctx.pid as u32;
        self.run(async move {
            let fetch_ctx = FetchContext::new(pid);
            let tree = mount.inodes().get_tree(parent)?;
            tree.rmdir(&mount, &name, &fetch_ctx).await
        })
    }

    #[tracing::instrument(skip_all, fields(rq.olddir = olddir, rq.newdir = newdir))]
    fn rename(
        &self,
        ctx: &Context,
        olddir: Self::Inode,
        oldname: &CStr,
        newdir: Self::Inode,
        newname: &CStr,
        flags: u32,
    ) -> io::Result<()> {
        let guard = self.tracker.begin(RequestKind::Rename, ctx.pid as u32);
        guard.mark_started();

        if olddir == DOT_DIR_INODE || newdir == DOT_DIR_INODE {
            return Err(io::Error::from_raw_os_error(libc::EACCES));
        }

        // RENAME_EXCHANGE / RENAME_NOREPLACE are not supported.
        if flags != 0 {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        if olddir == ROOT_ID && oldname.to_bytes() == DOT_DIR_NAME {
            return Err(io::Error::from_raw_os_error(libc::EPERM));
        }
        if newdir == ROOT_ID && newname.to_bytes() == DOT_DIR_NAME {
            return Err(io::Error::from_raw_os_error(libc::EPERM));
        }
        let oldname = parse_name(oldname, libc::ENOENT)?;
        let newname = parse_name(newname, libc::EINVAL)?;

        let mount = self.mount.clone();
        self.run(async move {
            let src = mount.inodes().get_tree(olddir)?;
            let dst = mount.inodes().get_tree(newdir)?;
            crate::inodes::rename(&mount, src, &oldname, dst, &newname).await
        })
    }

    #[tracing::instrument(skip_all, fields(rq.inode = inode))]
    fn open(
        &self,
        ctx: &Context,
        inode: Self::Inode,
        _flags: u32,
        _fuse_flags: u32,
    ) -> io::Result<(Option<Self::Handle>, OpenOptions, Option<u32>)> {
        let guard = self.tracker.begin(RequestKind::Open, ctx.pid as u32);
        guard.mark_started();

        if inode == DOT_ROOT_MARKER_INODE {
            return Ok((Some(self.alloc_handle(inode)), OpenOptions::empty(), None));
        }

        let mount = self.mount.clone();
        self.run(async move {
            // just validate the inode kind; reads go through the inode
            mount.inodes().get_file(inode)?;
            Ok(())
        })?;
        Ok((Some(self.alloc_handle(inode)), OpenOptions::empty(), None))
    }

    #[tracing::instrument(skip_all, fields(rq.parent = parent, rq.name = ?name))]
    fn create(
        &self,
        ctx: &Context,
        parent: Self::Inode,
        name: &CStr,
        args: CreateIn,
    ) -> io::Result<(Entry, Option<Self::Handle>, OpenOptions, Option<u32>)> {
        let guard = self.tracker.begin(RequestKind::Create, ctx.pid as u32);
        guard.mark_started();

        if parent == DOT_DIR_INODE {
            return Err(io::Error::from_raw_os_error(libc::EACCES));
        }

        if parent == ROOT_ID && name.to_bytes() == DOT_DIR_NAME {
            return Err(io::Error::from_raw_os_error(libc::EPERM));
        }
        let name = parse_name(name, libc::EINVAL)?;
        let file_mode = S_IFREG | (args.mode & !args.umask & 0o7777);

        let mount = self.mount.clone();
        let (uid, gid) = (ctx.uid, ctx.gid);
        let pid = ctx.pid as u32;
        let attr = self.run(async move {
            let fetch_ctx = FetchContext::new(pid);
            let tree = mount.inodes().get_tree(parent)?;
            let file = tree
                .create_file(&mount, &name, file_mode, uid, gid, b"")
                .await?;
            mount.inodes().note_lookup(file.number());
            file.attr(&mount, &fetch_ctx).await
        })?;

        let entry = Self::entry_for_attr(to_fuse_attr(&attr));
        let fh = self.alloc_handle(entry.inode);
        Ok((entry, Some(fh), OpenOptions::empty(), None))
    }

    #[tracing::instrument(skip_all, fields(rq.inode = inode, rq.offset = offset, rq.size = size))]
    fn read(
        &self,
        ctx: &Context,
        inode: Self::Inode,
        handle: Self::Handle,
        w: &mut dyn ZeroCopyWriter,
        size: u32,
        offset: u64,
        _lock_owner: Option<u64>,
        _flags: u32,
    ) -> io::Result<usize> {
        let guard = self.tracker.begin(RequestKind::Read, ctx.pid as u32);
        guard.mark_started();

        let target = self.handle_inode(handle).unwrap_or(inode);
        if target == DOT_ROOT_MARKER_INODE {
            let contents = self.root_marker_contents();
            let len = contents.len() as u64;
            let start = offset.min(len) as usize;
            let end = (offset + size as u64).min(len) as usize;
            return w.write(&contents[start..end]);
        }

        let mount = self.mount.clone();
        let pid = ctx.pid as u32;
        let data = self.run(async move {
            let fetch_ctx = FetchContext::new(pid);
            let file = mount.inodes().get_file(target)?;
            file.read(&mount, offset, size, &fetch_ctx).await
        })?;
        w.write(&data)
    }

    #[tracing::instrument(skip_all, fields(rq.inode = inode, rq.offset = offset, rq.size = size))]
    fn write(
        &self,
        ctx: &Context,
        inode: Self::Inode,
        handle: Self::Handle,
        r: &mut dyn ZeroCopyReader,
        size: u32,
        offset: u64,
        _lock_owner: Option<u64>,
        _delayed_write: bool,
        _flags: u32,
        _fuse_flags: u32,
    ) -> io::Result<usize> {
        let guard = self.tracker.begin(RequestKind::Write, ctx.pid as u32);
        guard.mark_started();

        let target = self.handle_inode(handle).unwrap_or(inode);
        if target == DOT_ROOT_MARKER_INODE {
            return Err(io::Error::from_raw_os_error(libc::EPERM));
        }

        let mut data = vec![0u8; size as usize];
        r.read_exact(&mut data)?;

        let mount = self.mount.clone();
        let pid = ctx.pid as u32;
        let written = self.run(async move {
            let fetch_ctx = FetchContext::new(pid);
            let file = mount.inodes().get_file(target)?;
            file.write(&mount, offset, &data, &fetch_ctx).await
        })?;
        Ok(written as usize)
    }

    fn flush(
        &self,
        ctx: &Context,
        _inode: Self::Inode,
        _handle: Self::Handle,
        _lock_owner: u64,
    ) -> io::Result<()> {
        let guard = self.tracker.begin(RequestKind::Flush, ctx.pid as u32);
        guard.mark_started();
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(rq.inode = inode))]
    fn fsync(
        &self,
        ctx: &Context,
        inode: Self::Inode,
        datasync: bool,
        _handle: Self::Handle,
    ) -> io::Result<()> {
        let guard = self.tracker.begin(RequestKind::Fsync, ctx.pid as u32);
        guard.mark_started();

        let mount = self.mount.clone();
        self.run(async move {
            let file = mount.inodes().get_file(inode)?;
            file.fsync(datasync).await
        })
    }

    #[tracing::instrument(skip_all, fields(rq.inode = inode, rq.offset = offset))]
    fn fallocate(
        &self,
        ctx: &Context,
        inode: Self::Inode,
        _handle: Self::Handle,
        mode: u32,
        offset: u64,
        length: u64,
    ) -> io::Result<()> {
        let guard = self.tracker.begin(RequestKind::Fallocate, ctx.pid as u32);
        guard.mark_started();

        // punch/collapse modes are not supported
        if mode != 0 {
            return Err(io::Error::from_raw_os_error(libc::EOPNOTSUPP));
        }

        let mount = self.mount.clone();
        let pid = ctx.pid as u32;
        self.run(async move {
            let fetch_ctx = FetchContext::new(pid);
            let file = mount.inodes().get_file(inode)?;
            file.fallocate(&mount, offset, length, &fetch_ctx).await
        })
    }

    fn release(
        &self,
        ctx: &Context,
        _inode: Self::Inode,
        _flags: u32,
        handle: Self::Handle,
        _flush: bool,
        _flock_release: bool,
        _lock_owner: Option<u64>,
    ) -> io::Result<()> {
        let guard = self.tracker.begin(RequestKind::Release, ctx.pid as u32);
        guard.mark_started();
        self.file_handles.write().remove(&handle);
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(rq.inode = inode))]
    fn opendir(
        &self,
        ctx: &Context,
        inode: Self::Inode,
        _flags: u32,
    ) -> io::Result<(Option<Self::Handle>, OpenOptions)> {
        let guard = self.tracker.begin(RequestKind::Opendir, ctx.pid as u32);
        guard.mark_started();

        if inode == DOT_DIR_INODE {
            return Ok((Some(self.alloc_handle(inode)), OpenOptions::empty()));
        }

        let mount = self.mount.clone();
        self.run(async move {
            mount.inodes().get_tree(inode)?;
            Ok(())
        })?;
        Ok((Some(self.alloc_handle(inode)), OpenOptions::empty()))
    }

    #[tracing::instrument(skip_all, fields(rq.inode = inode, rq.offset = offset))]
    fn readdir(
        &self,
        ctx: &Context,
        inode: Self::Inode,
        _handle: Self::Handle,
        _size: u32,
        offset: u64,
        add_entry: &mut dyn FnMut(FuseDirEntry) -> io::Result<usize>,
    ) -> io::Result<()> {
        let guard = self.tracker.begin(RequestKind::Readdir, ctx.pid as u32);
        guard.mark_started();

        // (name, ino, type bits)
        let mut rows: Vec<(Vec<u8>, u64, u32)> = Vec::new();

        if inode == DOT_DIR_INODE {
            rows.push((b".".to_vec(), DOT_DIR_INODE, S_IFDIR));
            rows.push((b"..".to_vec(), ROOT_ID, S_IFDIR));
            rows.push((DOT_ROOT_MARKER_NAME.to_vec(), DOT_ROOT_MARKER_INODE, S_IFREG));
        } else {
            let mount = self.mount.clone();
            let listed = self.run(async move {
                let tree = mount.inodes().get_tree(inode)?;
                let parent = tree.location().parent;
                let entries = tree.readdir(&mount).await?;
                Ok((parent, entries))
            })?;
            let (parent, entries) = listed;
            rows.push((b".".to_vec(), inode, S_IFDIR));
            rows.push((b"..".to_vec(), parent, S_IFDIR));
            rows.extend(
                entries
                    .into_iter()
                    .map(|e| (e.name.as_bytes().to_vec(), e.inode, e.mode & S_IFMT)),
            );
        }

        for (i, (name, ino, type_bits)) in rows.iter().enumerate().skip(offset as usize) {
            let written = add_entry(FuseDirEntry {
                ino: *ino,
                offset: (i + 1) as u64,
                type_: *type_bits,
                name,
            })?;
            // a full buffer reports 0 written
            if written == 0 {
                break;
            }
        }
        Ok(())
    }

    fn releasedir(
        &self,
        ctx: &Context,
        _inode: Self::Inode,
        _flags: u32,
        handle: Self::Handle,
    ) -> io::Result<()> {
        let guard = self.tracker.begin(RequestKind::Releasedir, ctx.pid as u32);
        guard.mark_started();
        self.file_handles.write().remove(&handle);
        Ok(())
    }

    fn statfs(&self, ctx: &Context, _inode: Self::Inode) -> io::Result<libc::statvfs64> {
        let guard = self.tracker.begin(RequestKind::Statfs, ctx.pid as u32);
        guard.mark_started();

        // Not backed by a block device; report sane fixed geometry.
        let mut st: libc::statvfs64 = unsafe { std::mem::zeroed() };
        st.f_bsize = 4096;
        st.f_frsize = 4096;
        st.f_namemax = 255;
        Ok(st)
    }

    fn access(&self, ctx: &Context, _inode: Self::Inode, _mask: u32) -> io::Result<()> {
        let guard = self.tracker.begin(RequestKind::Access, ctx.pid as u32);
        guard.mark_started();
        Ok(())
    }
}
