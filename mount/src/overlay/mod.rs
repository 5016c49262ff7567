//! Local storage for materialized file and directory contents, indexed by
//! inode number.
use async_trait::async_trait;
use bytes::Bytes;
use weft_castore::path::PathComponent;
use weft_castore::{Error, ObjectId, OBJECT_ID_LEN};

use crate::inodes::InodeNumber;
use crate::wire::{Reader, WireError, Writer};

mod allocator;
mod fs;
mod redb;

pub use self::allocator::{InodeAllocator, DEFAULT_RESERVATION_BATCH};
pub use self::fs::FsOverlay;
pub use self::redb::RedbOverlay;

const DIR_FORMAT_VERSION: u32 = 1;

const FLAG_MATERIALIZED: u8 = 1 << 0;
const FLAG_HAS_HASH: u8 = 1 << 1;

/// One name in a serialized overlay directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OverlayDirEntry {
    pub name: PathComponent,
    pub mode: u32,
    /// The id of the source-control object this entry was sourced from.
    /// None once the entry is materialized or if it was created locally.
    pub source_hash: Option<ObjectId>,
    pub materialized: bool,
    /// The child's inode number, or 0 if none was ever assigned.
    pub inode: InodeNumber,
}

/// The directory payload stored in the overlay.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OverlayDir {
    pub entries: Vec<OverlayDirEntry>,
}

impl OverlayDir {
    /// `u32 version`, `u32 count`, then per entry inode, mode, flags,
    /// length-prefixed name and (if flagged) source hash.
    pub fn serialize(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.put_u32(DIR_FORMAT_VERSION);
        w.put_u32(self.entries.len() as u32);
        for entry in &self.entries {
            w.put_u64(entry.inode);
            w.put_u32(entry.mode);
            let mut flags = 0u8;
            if entry.materialized {
                flags |= FLAG_MATERIALIZED;
            }
            if entry.source_hash.is_some() {
                flags |= FLAG_HAS_HASH;
            }
            w.put_u8(flags);
            w.put_len_bytes(entry.name.as_bytes());
            if let Some(ref hash) = entry.source_hash {
                w.put_bytes(hash.as_slice());
            }
        }
        w.finish()
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, WireError> {
        let mut r = Reader::new(data);
        let version = r.read_u32()?;
        if version != DIR_FORMAT_VERSION {
            return Err(WireError::UnsupportedVersion(version));
        }
        let count = r.read_u32()?;
        let mut entries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let inode = r.read_u64()?;
            let mode = r.read_u32()?;
            let flags = r.read_u8()?;
            let name: PathComponent = r
                .read_len_bytes()?
                .try_into()
                .map_err(|e| WireError::Malformed(format!("{e}")))?;
            let source_hash = if flags & FLAG_HAS_HASH != 0 {
                Some(
                    ObjectId::try_from(r.read_bytes(OBJECT_ID_LEN)?.to_vec())
                        .map_err(|e| WireError::Malformed(format!("{e}")))?,
                )
            } else {
                None
            };
            entries.push(OverlayDirEntry {
                name,
                mode,
                source_hash,
                materialized: flags & FLAG_MATERIALIZED != 0,
                inode,
            });
        }
        r.expect_end()?;
        Ok(Self { entries })
    }
}

/// The store for materialized inode payloads.
///
/// One writer per inode; directory saves replace the payload atomically with
/// respect to concurrent readers. The store also persists the inode number
/// high watermark so allocation survives unclean shutdown.
#[async_trait]
pub trait Overlay: Send + Sync {
    async fn save_overlay_dir(&self, inode: InodeNumber, dir: &OverlayDir) -> Result<(), Error>;

    async fn load_overlay_dir(&self, inode: InodeNumber) -> Result<Option<OverlayDir>, Error>;

    /// Replaces the file payload. The optional sha1 records that the stored
    /// bytes still equal the source blob, so the hash needn't be recomputed.
    async fn save_overlay_file(
        &self,
        inode: InodeNumber,
        contents: &[u8],
        sha1: Option<&ObjectId>,
    ) -> Result<(), Error>;

    async fn load_overlay_file(&self, inode: InodeNumber) -> Result<Option<Bytes>, Error>;

    /// The sha1 sidecar, if the file payload is unmodified from its source.
    async fn load_file_sha1(&self, inode: InodeNumber) -> Result<Option<ObjectId>, Error>;

    /// Removes both the file and the directory payload for an inode.
    async fn remove_overlay_data(&self, inode: InodeNumber) -> Result<(), Error>;

    /// Persists a high watermark; always >= any issued inode number.
    async fn update_used_inode_number(&self, inode: InodeNumber) -> Result<(), Error>;

    /// The persisted watermark, if any.
    async fn load_next_inode_number(&self) -> Result<Option<InodeNumber>, Error>;

    /// Flushes the final watermark on clean shutdown.
    async fn close(&self, next_inode: InodeNumber) -> Result<(), Error> {
        self.update_used_inode_number(next_inode).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use rstest::rstest;

    use super::*;

    fn sample_dir() -> OverlayDir {
        OverlayDir {
            entries: vec![
                OverlayDirEntry {
                    name: "a".try_into().unwrap(),
                    mode: 0o100644,
                    source_hash: Some(ObjectId::sha1_of(b"a")),
                    materialized: false,
                    inode: 0,
                },
                OverlayDirEntry {
                    name: "b".try_into().unwrap(),
                    mode: 0o040755,
                    source_hash: None,
                    materialized: true,
                    inode: 17,
                },
            ],
        }
    }

    #[test]
    fn dir_payload_roundtrip() {
        let dir = sample_dir();
        let data = dir.serialize();
        assert_eq!(dir, OverlayDir::deserialize(&data).unwrap());
    }

    #[test]
    fn dir_payload_rejects_trailing_garbage() {
        let mut data = sample_dir().serialize();
        data.push(0);
        assert_eq!(
            Err(WireError::TrailingData(1)),
            OverlayDir::deserialize(&data)
        );
    }

    fn fs_overlay() -> (tempfile::TempDir, Arc<dyn Overlay>) {
        let dir = tempfile::tempdir().unwrap();
        let overlay = FsOverlay::new(dir.path().to_path_buf());
        (dir, Arc::new(overlay))
    }

    fn redb_overlay() -> (tempfile::TempDir, Arc<dyn Overlay>) {
        let dir = tempfile::tempdir().unwrap();
        let overlay = RedbOverlay::new(dir.path().join("overlay.redb")).unwrap();
        (dir, Arc::new(overlay))
    }

    #[rstest]
    #[case::fs(fs_overlay())]
    #[case::redb(redb_overlay())]
    #[tokio::test]
    async fn file_roundtrip(#[case] fixture: (tempfile::TempDir, Arc<dyn Overlay>)) {
        let (_dir, overlay) = fixture;

        assert_eq!(None, overlay.load_overlay_file(10).await.unwrap());

        let sha1 = ObjectId::sha1_of(b"contents");
        overlay
            .save_overlay_file(10, b"contents", Some(&sha1))
            .await
            .unwrap();
        assert_eq!(
            Some(Bytes::from_static(b"contents")),
            overlay.load_overlay_file(10).await.unwrap()
        );
        assert_eq!(Some(sha1), overlay.load_file_sha1(10).await.unwrap());

        // rewriting without a sidecar clears it
        overlay.save_overlay_file(10, b"changed", None).await.unwrap();
        assert_eq!(None, overlay.load_file_sha1(10).await.unwrap());

        overlay.remove_overlay_data(10).await.unwrap();
        assert_eq!(None, overlay.load_overlay_file(10).await.unwrap());
    }

    #[rstest]
    #[case::fs(fs_overlay())]
    #[case::redb(redb_overlay())]
    #[tokio::test]
    async fn dir_roundtrip(#[case] fixture: (tempfile::TempDir, Arc<dyn Overlay>)) {
        let (_dir, overlay) = fixture;

        assert_eq!(None, overlay.load_overlay_dir(5).await.unwrap());
        let dir = sample_dir();
        overlay.save_overlay_dir(5, &dir).await.unwrap();
        assert_eq!(Some(dir), overlay.load_overlay_dir(5).await.unwrap());

        overlay.remove_overlay_data(5).await.unwrap();
        assert_eq!(None, overlay.load_overlay_dir(5).await.unwrap());
    }

    #[rstest]
    #[case::fs(fs_overlay())]
    #[case::redb(redb_overlay())]
    #[tokio::test]
    async fn watermark_roundtrip(#[case] fixture: (tempfile::TempDir, Arc<dyn Overlay>)) {
        let (_dir, overlay) = fixture;

        assert_eq!(None, overlay.load_next_inode_number().await.unwrap());
        overlay.update_used_inode_number(4096).await.unwrap();
        assert_eq!(Some(4096), overlay.load_next_inode_number().await.unwrap());

        overlay.close(8192).await.unwrap();
        assert_eq!(Some(8192), overlay.load_next_inode_number().await.unwrap());
    }
}
