use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::instrument;
use weft_castore::{Error, ObjectId};

use super::{Overlay, OverlayDir};
use crate::inodes::InodeNumber;

/// A plain filesystem-backed overlay: one file per materialized inode,
/// arranged in 256 sharded subdirectories indexed by inode number.
///
/// Layout under the root:
///   `<shard>/<ino>`       file contents
///   `<shard>/<ino>.dir`   serialized directory payload
///   `<shard>/<ino>.sha1`  sha1 sidecar
///   `next-inode`          allocation high watermark
pub struct FsOverlay {
    root: PathBuf,
}

impl FsOverlay {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn shard_dir(&self, inode: InodeNumber) -> PathBuf {
        self.root.join(format!("{:02x}", inode & 0xff))
    }

    fn file_path(&self, inode: InodeNumber) -> PathBuf {
        self.shard_dir(inode).join(inode.to_string())
    }

    fn dir_path(&self, inode: InodeNumber) -> PathBuf {
        self.shard_dir(inode).join(format!("{inode}.dir"))
    }

    fn sha1_path(&self, inode: InodeNumber) -> PathBuf {
        self.shard_dir(inode).join(format!("{inode}.sha1"))
    }

    fn watermark_path(&self) -> PathBuf {
        self.root.join("next-inode")
    }

    /// Write-to-temp plus rename, so readers only ever observe complete
    /// payloads.
    async fn write_atomic(&self, path: &PathBuf, contents: &[u8]) -> Result<(), Error> {
        let parent = path.parent().expect("overlay paths have parents");
        tokio::fs::create_dir_all(parent).await?;

        let mut tmp = path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, contents).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    async fn read_optional(&self, path: &PathBuf) -> Result<Option<Bytes>, Error> {
        match tokio::fs::read(path).await {
            Ok(data) => Ok(Some(data.into())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove_optional(&self, path: &PathBuf) -> Result<(), Error> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl Overlay for FsOverlay {
    #[instrument(skip(self, dir))]
    async fn save_overlay_dir(&self, inode: InodeNumber, dir: &OverlayDir) -> Result<(), Error> {
        self.write_atomic(&self.dir_path(inode), &dir.serialize())
            .await
    }

    async fn load_overlay_dir(&self, inode: InodeNumber) -> Result<Option<OverlayDir>, Error> {
        match self.read_optional(&self.dir_path(inode)).await? {
            None => Ok(None),
            Some(data) => Ok(Some(OverlayDir::deserialize(&data).map_err(|e| {
                Error::StorageError(format!("overlay dir {inode}: {e}"))
            })?)),
        }
    }

    #[instrument(skip(self, contents, sha1), fields(size = contents.len()))]
    async fn save_overlay_file(
        &self,
        inode: InodeNumber,
        contents: &[u8],
        sha1: Option<&ObjectId>,
    ) -> Result<(), Error> {
        self.write_atomic(&self.file_path(inode), contents).await?;
        match sha1 {
            Some(sha1) => {
                self.write_atomic(&self.sha1_path(inode), sha1.as_slice())
                    .await
            }
            None => self.remove_optional(&self.sha1_path(inode)).await,
        }
    }

    async fn load_overlay_file(&self, inode: InodeNumber) -> Result<Option<Bytes>, Error> {
        self.read_optional(&self.file_path(inode)).await
    }

    async fn load_file_sha1(&self, inode: InodeNumber) -> Result<Option<ObjectId>, Error> {
        match self.read_optional(&self.sha1_path(inode)).await? {
            None => Ok(None),
            Some(data) => Ok(Some(ObjectId::try_from(data.to_vec()).map_err(|e| {
                Error::StorageError(format!("overlay sha1 {inode}: {e}"))
            })?)),
        }
    }

    #[instrument(skip(self))]
    async fn remove_overlay_data(&self, inode: InodeNumber) -> Result<(), Error> {
        self.remove_optional(&self.file_path(inode)).await?;
        self.remove_optional(&self.dir_path(inode)).await?;
        self.remove_optional(&self.sha1_path(inode)).await
    }

    async fn update_used_inode_number(&self, inode: InodeNumber) -> Result<(), Error> {
        self.write_atomic(&self.watermark_path(), &inode.to_le_bytes())
            .await
    }

    async fn load_next_inode_number(&self) -> Result<Option<InodeNumber>, Error> {
        match self.read_optional(&self.watermark_path()).await? {
            None => Ok(None),
            Some(data) => {
                let raw: [u8; 8] = data[..]
                    .try_into()
                    .map_err(|_| Error::StorageError("malformed next-inode file".into()))?;
                Ok(Some(InodeNumber::from_le_bytes(raw)))
            }
        }
    }
}
