//! Value types for content-addressed objects: blobs, blob metadata and
//! trees, plus the length-prefixed tree wire format used by the local store.
use bytes::Bytes;
use thiserror::Error;

use crate::digests::{ObjectId, OBJECT_ID_LEN};
use crate::path::PathComponent;

/// What kind of object an identifier refers to. Mostly used to keep error
/// messages precise.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObjectKind {
    Blob,
    Tree,
}

impl std::fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ObjectKind::Blob => write!(f, "blob"),
            ObjectKind::Tree => write!(f, "tree"),
        }
    }
}

/// An immutable (id, contents) pair.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Blob {
    id: ObjectId,
    contents: Bytes,
}

impl Blob {
    pub fn new(id: ObjectId, contents: Bytes) -> Self {
        Self { id, contents }
    }

    pub fn id(&self) -> &ObjectId {
        &self.id
    }

    pub fn contents(&self) -> &Bytes {
        &self.contents
    }

    pub fn size(&self) -> u64 {
        self.contents.len() as u64
    }

    /// Derives the metadata most callers actually want, without keeping the
    /// contents around.
    pub fn metadata(&self) -> BlobMetadata {
        BlobMetadata {
            sha1: ObjectId::sha1_of(&self.contents),
            size: self.size(),
        }
    }
}

/// The SHA-1 and size of a blob's contents. Cached eagerly, since size and
/// hash queries vastly outnumber content reads.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlobMetadata {
    pub sha1: ObjectId,
    pub size: u64,
}

impl BlobMetadata {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(OBJECT_ID_LEN + 8);
        out.extend_from_slice(self.sha1.as_slice());
        out.extend_from_slice(&self.size.to_le_bytes());
        out
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, TreeFormatError> {
        if data.len() != OBJECT_ID_LEN + 8 {
            return Err(TreeFormatError::Truncated);
        }
        let sha1 = ObjectId::try_from(data[..OBJECT_ID_LEN].to_vec())
            .map_err(|_| TreeFormatError::Truncated)?;
        let size = u64::from_le_bytes(data[OBJECT_ID_LEN..].try_into().unwrap());
        Ok(Self { sha1, size })
    }
}

/// The type of a tree entry. Permission bits are a function of the type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryKind {
    RegularFile,
    ExecutableFile,
    Symlink,
    Tree,
}

impl EntryKind {
    pub fn is_tree(&self) -> bool {
        matches!(self, EntryKind::Tree)
    }

    /// The st_mode value for entries of this kind.
    pub fn mode(&self) -> u32 {
        match self {
            EntryKind::RegularFile => 0o100644,
            EntryKind::ExecutableFile => 0o100755,
            EntryKind::Symlink => 0o120777,
            EntryKind::Tree => 0o040755,
        }
    }

    fn tag(&self) -> u8 {
        match self {
            EntryKind::RegularFile => 0,
            EntryKind::ExecutableFile => 1,
            EntryKind::Symlink => 2,
            EntryKind::Tree => 3,
        }
    }

    fn from_tag(tag: u8) -> Result<Self, TreeFormatError> {
        match tag {
            0 => Ok(EntryKind::RegularFile),
            1 => Ok(EntryKind::ExecutableFile),
            2 => Ok(EntryKind::Symlink),
            3 => Ok(EntryKind::Tree),
            _ => Err(TreeFormatError::UnknownEntryKind(tag)),
        }
    }
}

/// A single name inside a [Tree], pointing at another object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TreeEntry {
    name: PathComponent,
    id: ObjectId,
    kind: EntryKind,
}

impl TreeEntry {
    pub fn new(name: PathComponent, id: ObjectId, kind: EntryKind) -> Self {
        Self { name, id, kind }
    }

    pub fn name(&self) -> &PathComponent {
        &self.name
    }

    pub fn id(&self) -> &ObjectId {
        &self.id
    }

    pub fn kind(&self) -> EntryKind {
        self.kind
    }

    pub fn mode(&self) -> u32 {
        self.kind.mode()
    }
}

const TREE_FORMAT_VERSION: u32 = 1;

#[derive(Error, Debug, PartialEq)]
pub enum TreeFormatError {
    #[error("unsupported tree format version {0}")]
    UnsupportedVersion(u32),
    #[error("unknown tree entry kind tag {0}")]
    UnknownEntryKind(u8),
    #[error("truncated tree data")]
    Truncated,
    #[error("{0} trailing bytes after the last entry")]
    TrailingData(usize),
    #[error("entry {0} is not in sorted order")]
    WrongSorting(PathComponent),
    #[error("{0} is a duplicate name")]
    DuplicateName(PathComponent),
    #[error("invalid entry name")]
    InvalidName,
}

/// An immutable, ordered collection of [TreeEntry], the directory object of
/// the content-addressed model.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Tree {
    entries: Vec<TreeEntry>,
}

impl Tree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_from_iter(
        entries: impl IntoIterator<Item = TreeEntry>,
    ) -> Result<Self, TreeFormatError> {
        let mut tree = Self::new();
        for entry in entries {
            tree.add(entry)?;
        }
        Ok(tree)
    }

    /// Adds an entry, preserving name order. Duplicate names are rejected.
    pub fn add(&mut self, entry: TreeEntry) -> Result<(), TreeFormatError> {
        let pos = match self
            .entries
            .binary_search_by_key(&entry.name().as_bytes(), |e| e.name().as_bytes())
        {
            Err(pos) => pos,
            Ok(_) => return Err(TreeFormatError::DuplicateName(entry.name.clone())),
        };
        self.entries.insert(pos, entry);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates entries ordered by name.
    pub fn entries(&self) -> impl Iterator<Item = &TreeEntry> + Send + Sync + '_ {
        self.entries.iter()
    }

    pub fn get(&self, name: &[u8]) -> Option<&TreeEntry> {
        self.entries
            .binary_search_by_key(&name, |e| e.name().as_bytes())
            .ok()
            .map(|idx| &self.entries[idx])
    }

    /// The id of a tree is the hash of its serialized form.
    pub fn id(&self) -> ObjectId {
        ObjectId::sha1_of(&self.serialize())
    }

    /// The on-disk form: `u32 version`, `u32 count`, then per entry a type
    /// tag, a length-prefixed name, the mode and a length-prefixed object id.
    /// All integers little-endian.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&TREE_FORMAT_VERSION.to_le_bytes());
        out.extend_from_slice(&(self.entries.len() as u32).to_le_bytes());
        for entry in &self.entries {
            out.push(entry.kind.tag());
            let name = entry.name.as_bytes();
            out.extend_from_slice(&(name.len() as u16).to_le_bytes());
            out.extend_from_slice(name);
            out.extend_from_slice(&entry.mode().to_le_bytes());
            out.push(entry.id.as_slice().len() as u8);
            out.extend_from_slice(entry.id.as_slice());
        }
        out
    }

    /// Inverse of [Tree::serialize]. Rejects unknown versions and tags,
    /// unsorted or duplicate names, and trailing garbage.
    pub fn deserialize(data: &[u8]) -> Result<Self, TreeFormatError> {
        let mut r = Reader::new(data);
        let version = r.read_u32()?;
        if version != TREE_FORMAT_VERSION {
            return Err(TreeFormatError::UnsupportedVersion(version));
        }
        let count = r.read_u32()?;

        let mut tree = Tree::new();
        let mut previous_name: Option<PathComponent> = None;
        for _ in 0..count {
            let kind = EntryKind::from_tag(r.read_u8()?)?;
            let name_len = r.read_u16()? as usize;
            let name: PathComponent = r
                .read_bytes(name_len)?
                .try_into()
                .map_err(|_| TreeFormatError::InvalidName)?;
            let _mode = r.read_u32()?;
            let id_len = r.read_u8()? as usize;
            let id = ObjectId::try_from(r.read_bytes(id_len)?.to_vec())
                .map_err(|_| TreeFormatError::Truncated)?;

            if let Some(ref prev) = previous_name {
                if prev.as_bytes() >= name.as_bytes() {
                    return Err(if prev == &name {
                        TreeFormatError::DuplicateName(name)
                    } else {
                        TreeFormatError::WrongSorting(name)
                    });
                }
            }
            previous_name = Some(name.clone());

            // entries arrive pre-sorted, so push instead of add
            tree.entries.push(TreeEntry::new(name, id, kind));
        }

        if !r.is_empty() {
            return Err(TreeFormatError::TrailingData(r.remaining()));
        }
        Ok(tree)
    }
}

/// Cursor over a byte slice for the hand-rolled wire formats.
pub(crate) struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pos == self.data.len()
    }

    pub(crate) fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub(crate) fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], TreeFormatError> {
        if self.remaining() < n {
            return Err(TreeFormatError::Truncated);
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub(crate) fn read_u8(&mut self) -> Result<u8, TreeFormatError> {
        Ok(self.read_bytes(1)?[0])
    }

    pub(crate) fn read_u16(&mut self) -> Result<u16, TreeFormatError> {
        Ok(u16::from_le_bytes(self.read_bytes(2)?.try_into().unwrap()))
    }

    pub(crate) fn read_u32(&mut self) -> Result<u32, TreeFormatError> {
        Ok(u32::from_le_bytes(self.read_bytes(4)?.try_into().unwrap()))
    }

    pub(crate) fn read_u64(&mut self) -> Result<u64, TreeFormatError> {
        Ok(u64::from_le_bytes(self.read_bytes(8)?.try_into().unwrap()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures;

    fn sample_tree() -> Tree {
        Tree::try_from_iter([
            TreeEntry::new(
                "A".try_into().unwrap(),
                fixtures::BLOB_A_ID.clone(),
                EntryKind::RegularFile,
            ),
            TreeEntry::new(
                "B".try_into().unwrap(),
                fixtures::BLOB_B_ID.clone(),
                EntryKind::ExecutableFile,
            ),
            TreeEntry::new(
                "sub".try_into().unwrap(),
                fixtures::EMPTY_TREE_ID.clone(),
                EntryKind::Tree,
            ),
        ])
        .unwrap()
    }

    #[test]
    fn add_keeps_entries_sorted() {
        let mut tree = Tree::new();
        for name in ["z", "a", "m"] {
            tree.add(TreeEntry::new(
                name.try_into().unwrap(),
                fixtures::BLOB_A_ID.clone(),
                EntryKind::RegularFile,
            ))
            .unwrap();
        }
        let names: Vec<_> = tree.entries().map(|e| e.name().to_string()).collect();
        assert_eq!(vec!["a", "m", "z"], names);
    }

    #[test]
    fn add_rejects_duplicates() {
        let mut tree = Tree::new();
        let entry = TreeEntry::new(
            "a".try_into().unwrap(),
            fixtures::BLOB_A_ID.clone(),
            EntryKind::RegularFile,
        );
        tree.add(entry.clone()).unwrap();
        assert_eq!(
            Err(TreeFormatError::DuplicateName("a".try_into().unwrap())),
            tree.add(entry)
        );
    }

    #[test]
    fn serialize_roundtrip() {
        let tree = sample_tree();
        let data = tree.serialize();
        assert_eq!(tree, Tree::deserialize(&data).unwrap());
    }

    #[test]
    fn deserialize_rejects_trailing_garbage() {
        let mut data = sample_tree().serialize();
        data.push(0xff);
        assert_eq!(
            Err(TreeFormatError::TrailingData(1)),
            Tree::deserialize(&data)
        );
    }

    #[test]
    fn deserialize_rejects_bad_version() {
        let mut data = sample_tree().serialize();
        data[0] = 9;
        assert_eq!(
            Err(TreeFormatError::UnsupportedVersion(9)),
            Tree::deserialize(&data)
        );
    }

    #[test]
    fn deserialize_rejects_truncation() {
        let data = sample_tree().serialize();
        assert_eq!(
            Err(TreeFormatError::Truncated),
            Tree::deserialize(&data[..data.len() - 3])
        );
    }

    #[test]
    fn blob_metadata_derivation() {
        let blob = Blob::new(
            ObjectId::sha1_of(b"hello\n"),
            bytes::Bytes::from_static(b"hello\n"),
        );
        let metadata = blob.metadata();
        assert_eq!(6, metadata.size);
        assert_eq!(*blob.id(), metadata.sha1);
        assert_eq!(
            metadata,
            BlobMetadata::from_bytes(&metadata.to_bytes()).unwrap()
        );
    }
}
