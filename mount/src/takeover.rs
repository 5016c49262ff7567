//! The graceful-restart (takeover) protocol.
//!
//! A successor daemon connects to the takeover socket in the state
//! directory, the two sides negotiate a protocol version, and the old
//! daemon sends its live mounts without ever unmounting: serialized state
//! in the frame body, kernel-connection and lock descriptors out-of-band.
//!
//! Frames reuse the helper framing: an 8-byte (length, type) header with
//! fds on the header, then the body. The reply's type field is the 4-byte
//! message tag (`ERROR` or `MOUNTS`) that keeps the format extensible.
use std::io;
use std::os::fd::{OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};

use tracing::{info, instrument, warn};
use weft_castore::{ObjectId, OBJECT_ID_LEN};

use crate::inodes::{InodeHandle, InodeNumber};
use crate::mount::Mount;
use crate::wire::{recv_frame, send_frame, Reader, WireError, Writer};

/// Protocol versions this daemon can speak, ascending.
pub const SUPPORTED_VERSIONS: &[u32] = &[1];

const MESSAGE_TYPE_VERSIONS: u32 = 0;
const MESSAGE_TYPE_ERROR: u32 = 1;
const MESSAGE_TYPE_MOUNTS: u32 = 2;
const MESSAGE_TYPE_ACK: u32 = 3;

/// One loaded inode in the handoff snapshot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SerializedInode {
    pub inode: InodeNumber,
    pub parent: InodeNumber,
    pub is_dir: bool,
    pub materialized: bool,
    pub source_hash: Option<ObjectId>,
}

/// An open kernel file handle, mapped to its inode.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SerializedFileHandle {
    pub handle: u64,
    pub inode: InodeNumber,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SerializedMount {
    pub mount_path: PathBuf,
    pub state_dir: PathBuf,
    pub root_hash: ObjectId,
    pub bind_mounts: Vec<(PathBuf, PathBuf)>,
    pub file_handles: Vec<SerializedFileHandle>,
    pub inode_snapshot: Vec<SerializedInode>,
}

/// Everything a successor needs to carry on serving.
///
/// Descriptors accompany the message out-of-band in a fixed order: the
/// process lock fd, the control-service fd, then one kernel-connection fd
/// per mount (in `mounts` order).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TakeoverData {
    pub version: u32,
    pub next_inode_number: InodeNumber,
    pub mounts: Vec<SerializedMount>,
}

fn put_path(w: &mut Writer, path: &Path) {
    w.put_len_bytes(path.as_os_str().as_bytes());
}

fn read_path(r: &mut Reader) -> Result<PathBuf, WireError> {
    Ok(PathBuf::from(std::ffi::OsStr::from_bytes(
        r.read_len_bytes()?,
    )))
}

fn read_object_id(r: &mut Reader) -> Result<ObjectId, WireError> {
    ObjectId::try_from(r.read_bytes(OBJECT_ID_LEN)?.to_vec())
        .map_err(|e| WireError::Malformed(e.to_string()))
}

const INODE_FLAG_DIR: u8 = 1 << 0;
const INODE_FLAG_MATERIALIZED: u8 = 1 << 1;
const INODE_FLAG_HAS_HASH: u8 = 1 << 2;

impl TakeoverData {
    pub fn serialize(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.put_u32(self.version);
        w.put_u64(self.next_inode_number);
        w.put_u32(self.mounts.len() as u32);
        for mount in &self.mounts {
            put_path(&mut w, &mount.mount_path);
            put_path(&mut w, &mount.state_dir);
            w.put_bytes(mount.root_hash.as_slice());

            w.put_u32(mount.bind_mounts.len() as u32);
            for (client_path, mount_path) in &mount.bind_mounts {
                put_path(&mut w, client_path);
                put_path(&mut w, mount_path);
            }

            w.put_u32(mount.file_handles.len() as u32);
            for fh in &mount.file_handles {
                w.put_u64(fh.handle);
                w.put_u64(fh.inode);
            }

            w.put_u32(mount.inode_snapshot.len() as u32);
            for inode in &mount.inode_snapshot {
                w.put_u64(inode.inode);
                w.put_u64(inode.parent);
                let mut flags = 0u8;
                if inode.is_dir {
                    flags |= INODE_FLAG_DIR;
                }
                if inode.materialized {
                    flags |= INODE_FLAG_MATERIALIZED;
                }
                if inode.source_hash.is_some() {
                    flags |= INODE_FLAG_HAS_HASH;
                }
                w.put_u8(flags);
                if let Some(ref hash) = inode.source_hash {
                    w.put_bytes(hash.as_slice());
                }
            }
        }
        w.finish()
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, WireError> {
        let mut r = Reader::new(data);
        let version = r.read_u32()?;
        let next_inode_number = r.read_u64()?;
        let mount_count = r.read_u32()?;

        let mut mounts = Vec::with_capacity(mount_count as usize);
        for _ in 0..mount_count {
            let mount_path = read_path(&mut r)?;
            let state_dir = read_path(&mut r)?;
            let root_hash = read_object_id(&mut r)?;

            let bind_count = r.read_u32()?;
            let mut bind_mounts = Vec::with_capacity(bind_count as usize);
            for _ in 0..bind_count {
                let client_path = read_path(&mut r)?;
                let target = read_path(&mut r)?;
                bind_mounts.push((client_path, target));
            }

            let fh_count = r.read_u32()?;
            let mut file_handles = Vec::with_capacity(fh_count as usize);
            for _ in 0..fh_count {
                file_handles.push(SerializedFileHandle {
                    handle: r.read_u64()?,
                    inode: r.read_u64()?,
                });
            }

            let inode_count = r.read_u32()?;
            let mut inode_snapshot = Vec::with_capacity(inode_count as usize);
            for _ in 0..inode_count {
                let inode = r.read_u64()?;
                let parent = r.read_u64()?;
                let flags = r.read_u8()?;
                let source_hash = if flags & INODE_FLAG_HAS_HASH != 0 {
                    Some(read_object_id(&mut r)?)
                } else {
                    None
                };
                inode_snapshot.push(SerializedInode {
                    inode,
                    parent,
                    is_dir: flags & INODE_FLAG_DIR != 0,
                    materialized: flags & INODE_FLAG_MATERIALIZED != 0,
                    source_hash,
                });
            }

            mounts.push(SerializedMount {
                mount_path,
                state_dir,
                root_hash,
                bind_mounts,
                file_handles,
                inode_snapshot,
            });
        }

        r.expect_end()?;
        Ok(Self {
            version,
            next_inode_number,
            mounts,
        })
    }
}

/// Builds the snapshot of one live mount for the handoff message.
pub async fn serialize_mount(
    mount: &Mount,
    mount_path: PathBuf,
    state_dir: PathBuf,
    bind_mounts: Vec<(PathBuf, PathBuf)>,
    file_handles: Vec<SerializedFileHandle>,
) -> SerializedMount {
    let mut inode_snapshot = Vec::new();
    for handle in mount.inodes().snapshot() {
        let location = handle.location();
        let serialized = match handle {
            InodeHandle::File(file) => SerializedInode {
                inode: file.number(),
                parent: location.parent,
                is_dir: false,
                materialized: file.is_materialized().await,
                source_hash: file.source_hash().await,
            },
            InodeHandle::Tree(tree) => SerializedInode {
                inode: tree.number(),
                parent: location.parent,
                is_dir: true,
                materialized: tree.is_materialized().await,
                source_hash: tree.source_hash().await,
            },
        };
        inode_snapshot.push(serialized);
    }

    SerializedMount {
        mount_path,
        state_dir,
        root_hash: mount.root_hash(),
        bind_mounts,
        file_handles,
        inode_snapshot,
    }
}

/// The name of the takeover socket inside the state directory.
pub const TAKEOVER_SOCKET_NAME: &str = "takeover.sock";

/// Binds the takeover socket, replacing a stale one.
pub fn bind_socket(state_dir: &Path) -> io::Result<UnixListener> {
    let path = state_dir.join(TAKEOVER_SOCKET_NAME);
    let _ = std::fs::remove_file(&path);
    UnixListener::bind(path)
}

/// Serves a single takeover handshake on an accepted connection.
///
/// Returns `Ok(true)` when the mounts were handed off (the caller must
/// stop serving them), `Ok(false)` when the handshake ended benignly
/// (version mismatch) and this daemon keeps running. Transport errors
/// after shutdown began are returned as `Err`; the caller rolls back and
/// keeps serving.
#[instrument(skip_all)]
pub fn serve_handshake(
    stream: &UnixStream,
    data: &TakeoverData,
    fds: &[RawFd],
) -> io::Result<bool> {
    let (msg_type, body, _fds) = recv_frame(stream)?;
    if msg_type != MESSAGE_TYPE_VERSIONS {
        send_error(stream, "expected version negotiation")?;
        return Ok(false);
    }

    let client_versions = parse_versions(&body)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
    let version = match best_version(&client_versions) {
        Some(version) => version,
        None => {
            warn!(?client_versions, "no mutually supported takeover version");
            send_error(stream, "no mutually supported protocol version")?;
            return Ok(false);
        }
    };

    let message = TakeoverData {
        version,
        ..data.clone()
    };
    send_frame(stream, MESSAGE_TYPE_MOUNTS, &message.serialize(), fds)?;

    // The successor acknowledges; a vanished peer here means rollback.
    let (ack_type, _, _) = recv_frame(stream)?;
    if ack_type != MESSAGE_TYPE_ACK {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "successor did not acknowledge the handoff",
        ));
    }

    info!(version, mounts = message.mounts.len(), "mounts handed off");
    Ok(true)
}

/// Client side: requests the predecessor's mounts over its takeover
/// socket. Any transport failure is fatal for the caller only; the old
/// daemon keeps running.
#[instrument(skip_all, fields(socket = %socket_path.display()))]
pub fn request_takeover(socket_path: &Path) -> io::Result<(TakeoverData, Vec<OwnedFd>)> {
    let stream = UnixStream::connect(socket_path)?;

    let mut w = Writer::new();
    w.put_u32(SUPPORTED_VERSIONS.len() as u32);
    for version in SUPPORTED_VERSIONS {
        w.put_u32(*version);
    }
    send_frame(&stream, MESSAGE_TYPE_VERSIONS, &w.finish(), &[])?;

    let (msg_type, body, fds) = recv_frame(&stream)?;
    match msg_type {
        MESSAGE_TYPE_MOUNTS => {
            let data = TakeoverData::deserialize(&body)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
            send_frame(&stream, MESSAGE_TYPE_ACK, &[], &[])?;
            Ok((data, fds))
        }
        MESSAGE_TYPE_ERROR => {
            let mut r = Reader::new(&body);
            let message = r
                .read_len_bytes()
                .map(|b| String::from_utf8_lossy(b).into_owned())
                .unwrap_or_default();
            Err(io::Error::new(io::ErrorKind::Other, message))
        }
        other => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unexpected takeover message type {other}"),
        )),
    }
}

fn send_error(stream: &UnixStream, message: &str) -> io::Result<()> {
    let mut w = Writer::new();
    w.put_len_bytes(message.as_bytes());
    send_frame(stream, MESSAGE_TYPE_ERROR, &w.finish(), &[])
}

fn parse_versions(body: &[u8]) -> Result<Vec<u32>, WireError> {
    let mut r = Reader::new(body);
    let count = r.read_u32()?;
    let mut versions = Vec::with_capacity(count as usize);
    for _ in 0..count {
        versions.push(r.read_u32()?);
    }
    r.expect_end()?;
    Ok(versions)
}

fn best_version(client_versions: &[u32]) -> Option<u32> {
    client_versions
        .iter()
        .filter(|v| SUPPORTED_VERSIONS.contains(v))
        .max()
        .copied()
}
