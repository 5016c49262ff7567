//! Shared test data.
use std::sync::LazyLock;

use crate::digests::ObjectId;
use crate::model::{EntryKind, Tree, TreeEntry};

pub const BLOB_A_CONTENTS: &[u8] = b"hello\n";
pub const BLOB_B_CONTENTS: &[u8] = b"world\n";
pub const EMPTY_BLOB_CONTENTS: &[u8] = b"";

pub static BLOB_A_ID: LazyLock<ObjectId> = LazyLock::new(|| ObjectId::sha1_of(BLOB_A_CONTENTS));
pub static BLOB_B_ID: LazyLock<ObjectId> = LazyLock::new(|| ObjectId::sha1_of(BLOB_B_CONTENTS));
pub static EMPTY_BLOB_ID: LazyLock<ObjectId> =
    LazyLock::new(|| ObjectId::sha1_of(EMPTY_BLOB_CONTENTS));

pub static EMPTY_TREE_ID: LazyLock<ObjectId> = LazyLock::new(|| Tree::new().id());

/// The snapshot hash used by most scenarios.
pub static ROOT_ID: LazyLock<ObjectId> = LazyLock::new(|| ObjectId::sha1_of(b"snapshot-1"));

/// A flat tree `{A: "hello\n", B: "world\n"}`.
pub fn tree_ab() -> Tree {
    Tree::try_from_iter([
        TreeEntry::new(
            "A".try_into().unwrap(),
            BLOB_A_ID.clone(),
            EntryKind::RegularFile,
        ),
        TreeEntry::new(
            "B".try_into().unwrap(),
            BLOB_B_ID.clone(),
            EntryKind::RegularFile,
        ),
    ])
    .unwrap()
}
