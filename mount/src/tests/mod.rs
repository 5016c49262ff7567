//! End-to-end scenarios driven directly against the inode layer, with an
//! in-memory backing store and local store and a real overlay directory.
use std::sync::Arc;
use std::time::Duration;

use weft_castore::backingstore::FakeBackingStore;
use weft_castore::context::FetchContext;
use weft_castore::fixtures;
use weft_castore::localstore::{LocalStore, MemoryLocalStore};
use weft_castore::objectstore::ObjectStore;
use weft_castore::path::{PathComponent, RepoPath};
use weft_castore::{EntryKind, ObjectId, Tree, TreeEntry};

use crate::inodes::{self, InodeError, InodeHandle};
use crate::journal::PathChangeInfo;
use crate::mount::Mount;
use crate::overlay::FsOverlay;
use crate::takeover;

struct Harness {
    backing: FakeBackingStore,
    local: Arc<dyn LocalStore>,
    mount: Arc<Mount>,
    overlay_dir: tempfile::TempDir,
}

fn fetch_ctx() -> FetchContext {
    FetchContext::new(1000)
}

fn name(s: &str) -> PathComponent {
    s.try_into().unwrap()
}

fn path(s: &str) -> RepoPath {
    s.parse().unwrap()
}

/// A mount over the flat `{A: "hello\n", B: "world\n"}` root.
async fn flat_harness() -> Harness {
    let backing = FakeBackingStore::new();
    let tree_id = backing.put_tree(fixtures::tree_ab());
    backing.put_blob(fixtures::BLOB_A_CONTENTS);
    backing.put_blob(fixtures::BLOB_B_CONTENTS);
    backing.put_root(fixtures::ROOT_ID.clone(), tree_id);
    harness_over(backing).await
}

/// A mount over `{d1: {A: "hello\n"}, d2: {B: "world\n"}}`.
async fn nested_harness() -> Harness {
    let backing = FakeBackingStore::new();
    let a = backing.put_blob(fixtures::BLOB_A_CONTENTS);
    let b = backing.put_blob(fixtures::BLOB_B_CONTENTS);
    let d1 = backing.put_tree(
        Tree::try_from_iter([TreeEntry::new(name("A"), a, EntryKind::RegularFile)]).unwrap(),
    );
    let d2 = backing.put_tree(
        Tree::try_from_iter([TreeEntry::new(name("B"), b, EntryKind::RegularFile)]).unwrap(),
    );
    let root = backing.put_tree(
        Tree::try_from_iter([
            TreeEntry::new(name("d1"), d1, EntryKind::Tree),
            TreeEntry::new(name("d2"), d2, EntryKind::Tree),
        ])
        .unwrap(),
    );
    backing.put_root(fixtures::ROOT_ID.clone(), root);
    harness_over(backing).await
}

async fn harness_over(backing: FakeBackingStore) -> Harness {
    let local: Arc<dyn LocalStore> = Arc::new(MemoryLocalStore::default());
    let store = ObjectStore::new(Arc::new(backing.clone()), local.clone());
    let overlay_dir = tempfile::tempdir().unwrap();
    let overlay = Arc::new(FsOverlay::new(overlay_dir.path().to_path_buf()));
    let mount = Mount::new(store, overlay, fixtures::ROOT_ID.clone())
        .await
        .unwrap();
    Harness {
        backing,
        local,
        mount,
        overlay_dir,
    }
}

async fn resolve_file(
    harness: &Harness,
    repo_path: &str,
) -> Arc<crate::inodes::FileInode> {
    harness
        .mount
        .resolve(&path(repo_path), &fetch_ctx())
        .await
        .unwrap()
        .as_file()
        .unwrap()
}

async fn resolve_tree(
    harness: &Harness,
    repo_path: &str,
) -> Arc<crate::inodes::TreeInode> {
    harness
        .mount
        .resolve(&path(repo_path), &fetch_ctx())
        .await
        .unwrap()
        .as_tree()
        .unwrap()
}

#[tokio::test]
async fn stat_read_stat_fetches_once() {
    let harness = flat_harness().await;
    let ctx = fetch_ctx();
    let file = resolve_file(&harness, "A").await;

    let attr = file.attr(&harness.mount, &ctx).await.unwrap();
    assert_eq!(fixtures::BLOB_A_CONTENTS.len() as u64, attr.size);
    let fetches_after_first_stat = harness.backing.access_count(&fixtures::BLOB_A_ID);

    let data = file.read(&harness.mount, 0, 4096, &ctx).await.unwrap();
    assert_eq!(fixtures::BLOB_A_CONTENTS, &data[..]);

    // the second stat is served from the metadata cache
    let attr = file.attr(&harness.mount, &ctx).await.unwrap();
    assert_eq!(fixtures::BLOB_A_CONTENTS.len() as u64, attr.size);
    assert_eq!(
        fetches_after_first_stat,
        harness.backing.access_count(&fixtures::BLOB_A_ID)
    );
    assert!(harness.backing.access_count(&fixtures::BLOB_A_ID) <= 1);
}

#[tokio::test]
async fn write_then_read_back_with_one_journal_delta() {
    let harness = flat_harness().await;
    let ctx = fetch_ctx();
    let file = resolve_file(&harness, "A").await;

    // the usual truncate-then-write sequence of a plain `echo HI > A`
    file.set_size(&harness.mount, 0, &ctx).await.unwrap();
    file.write(&harness.mount, 0, b"HI", &ctx).await.unwrap();

    let data = file.read(&harness.mount, 0, 4096, &ctx).await.unwrap();
    assert_eq!(b"HI", &data[..]);

    // repeated changes to the same path compact into a single delta
    assert_eq!(1, harness.mount.journal().entry_count());
    let range = harness.mount.journal().accumulate_range(1).unwrap();
    assert_eq!(
        Some(&PathChangeInfo::CHANGED),
        range.changed_files.get(&path("A"))
    );
    assert_eq!(1, range.changed_files.len());

    // the parent picked up the materialization
    assert!(harness.mount.root().is_materialized().await);
}

#[tokio::test]
async fn unlink_removes_name_and_journals_it() {
    let harness = flat_harness().await;
    let ctx = fetch_ctx();
    let root = harness.mount.root();

    // load it first so the inode is live while being unlinked
    let file = resolve_file(&harness, "A").await;
    root.unlink(&harness.mount, &name("A")).await.unwrap();
    assert!(file.is_unlinked());

    let err = root
        .get_or_load_child(&harness.mount, &name("A"), &ctx)
        .await
        .unwrap_err();
    assert_eq!(libc::ENOENT, err.errno());

    let range = harness.mount.journal().accumulate_range(1).unwrap();
    assert_eq!(
        Some(&PathChangeInfo::REMOVED),
        range.changed_files.get(&path("A"))
    );
}

#[tokio::test]
async fn cross_directory_rename_materializes_both_parents() {
    let harness = nested_harness().await;
    let d1 = resolve_tree(&harness, "d1").await;
    let d2 = resolve_tree(&harness, "d2").await;

    inodes::rename(&harness.mount, d1.clone(), &name("A"), d2.clone(), &name("C"))
        .await
        .unwrap();

    assert!(d1.is_materialized().await);
    assert!(d2.is_materialized().await);
    assert!(d1.get_entry(&name("A")).await.is_none());
    assert!(d2.get_entry(&name("C")).await.is_some());

    let range = harness.mount.journal().accumulate_range(1).unwrap();
    assert_eq!(2, range.changed_files.len());
    assert_eq!(
        Some(&PathChangeInfo::REMOVED),
        range.changed_files.get(&path("d1/A"))
    );
    assert_eq!(
        Some(&PathChangeInfo::CREATED),
        range.changed_files.get(&path("d2/C"))
    );
    // renames leave the snapshot hash alone
    assert_eq!(range.from_hash, range.to_hash);

    // the moved file reads through its new location
    let file = resolve_file(&harness, "d2/C").await;
    let data = file
        .read(&harness.mount, 0, 4096, &fetch_ctx())
        .await
        .unwrap();
    assert_eq!(fixtures::BLOB_A_CONTENTS, &data[..]);
}

#[tokio::test]
async fn takeover_preserves_created_files() {
    let harness = flat_harness().await;
    let ctx = fetch_ctx();
    let root = harness.mount.root();
    let (uid, gid) = harness.mount.owner();

    let d = root
        .mkdir(&harness.mount, &name("D"), 0o755, uid, gid)
        .await
        .unwrap();
    let x = d
        .create_file(&harness.mount, &name("x"), 0o100644, uid, gid, b"")
        .await
        .unwrap();
    x.write(&harness.mount, 0, b"persisted bytes", &ctx)
        .await
        .unwrap();

    // Handshake over a real socket in the state directory.
    let state_dir = tempfile::tempdir().unwrap();
    let listener = takeover::bind_socket(state_dir.path()).unwrap();
    let serialized = takeover::serialize_mount(
        &harness.mount,
        "/mnt/checkout".into(),
        state_dir.path().to_path_buf(),
        Vec::new(),
        Vec::new(),
    )
    .await;
    let data = takeover::TakeoverData {
        version: takeover::SUPPORTED_VERSIONS[0],
        next_inode_number: harness.mount.next_inode_number(),
        mounts: vec![serialized],
    };

    let server = std::thread::spawn({
        let data = data.clone();
        move || {
            let (stream, _) = listener.accept().unwrap();
            takeover::serve_handshake(&stream, &data, &[])
        }
    });
    let socket_path = state_dir.path().join(takeover::TAKEOVER_SOCKET_NAME);
    let (received, _fds) = tokio::task::spawn_blocking(move || {
        takeover::request_takeover(&socket_path)
    })
    .await
    .unwrap()
    .unwrap();
    assert!(server.join().unwrap().unwrap());
    assert_eq!(data, received);

    // The old daemon goes away; the successor resumes over the same
    // overlay with the inherited allocator watermark.
    let old_watermark = received.next_inode_number;
    drop(harness.mount);

    let store = ObjectStore::new(
        Arc::new(harness.backing.clone()),
        harness.local.clone(),
    );
    let overlay = Arc::new(FsOverlay::new(harness.overlay_dir.path().to_path_buf()));
    let mount = Mount::resume(
        store,
        overlay,
        received.mounts[0].root_hash.clone(),
        old_watermark,
    )
    .await
    .unwrap();

    let d = mount
        .resolve(&path("D"), &ctx)
        .await
        .unwrap()
        .as_tree()
        .unwrap();
    let names: Vec<_> = d.entry_names().await;
    assert_eq!(vec![name("x")], names);

    let x = mount
        .resolve(&path("D/x"), &ctx)
        .await
        .unwrap()
        .as_file()
        .unwrap();
    let data = x.read(&mount, 0, 4096, &ctx).await.unwrap();
    assert_eq!(b"persisted bytes", &data[..]);

    // freshly allocated numbers stay above everything handed over
    let fresh = mount.allocate_inode().await.unwrap();
    assert!(fresh >= old_watermark);
}

#[tokio::test]
async fn corrupt_backing_blob_fails_the_read_with_details() {
    let harness = flat_harness().await;
    let ctx = fetch_ctx();
    harness
        .backing
        .corrupt_blob(&fixtures::BLOB_A_ID, b"evil contents");

    let file = resolve_file(&harness, "A").await;
    let err = file.read(&harness.mount, 0, 4096, &ctx).await.unwrap_err();
    match &err {
        InodeError::Corrupt {
            path: err_path,
            expected,
            actual,
        } => {
            assert_eq!("A", err_path);
            assert_eq!(*fixtures::BLOB_A_ID, *expected);
            assert_eq!(ObjectId::sha1_of(b"evil contents"), *actual);
        }
        other => panic!("expected corruption error, got {other:?}"),
    }
    let message = err.to_string();
    assert!(message.contains("A"), "{message}");
    assert!(message.contains(&fixtures::BLOB_A_ID.to_hex()), "{message}");

    // once the injection ends, the read recovers
    harness.backing.clear_corruption(&fixtures::BLOB_A_ID);
    let data = file.read(&harness.mount, 0, 4096, &ctx).await.unwrap();
    assert_eq!(fixtures::BLOB_A_CONTENTS, &data[..]);
}

#[tokio::test]
async fn concurrent_reads_issue_a_single_backing_fetch() {
    let harness = flat_harness().await;
    let file = resolve_file(&harness, "A").await;

    // Stall the fetch so both readers are in flight together.
    let gate = harness
        .backing
        .block_fetches(&fixtures::BLOB_A_ID)
        .await;

    let readers: Vec<_> = (0..2)
        .map(|_| {
            let mount = harness.mount.clone();
            let file = file.clone();
            tokio::spawn(async move {
                let ctx = fetch_ctx();
                file.read(&mount, 0, 4096, &ctx).await
            })
        })
        .collect();

    tokio::time::sleep(Duration::from_millis(50)).await;
    drop(gate);

    for reader in readers {
        let data = reader.await.unwrap().unwrap();
        assert_eq!(fixtures::BLOB_A_CONTENTS, &data[..]);
    }
    assert_eq!(1, harness.backing.access_count(&fixtures::BLOB_A_ID));
}

#[tokio::test]
async fn truncate_during_load_wins_the_race() {
    let harness = flat_harness().await;
    let ctx = fetch_ctx();
    let file = resolve_file(&harness, "A").await;

    let gate = harness
        .backing
        .block_fetches(&fixtures::BLOB_A_ID)
        .await;

    // reader blocks inside the fetch
    let reader = tokio::spawn({
        let mount = harness.mount.clone();
        let file = file.clone();
        async move {
            let ctx = fetch_ctx();
            file.read(&mount, 0, 4096, &ctx).await
        }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    // truncation skips the load, fulfils the latch with the sentinel and
    // materializes the file
    file.set_size(&harness.mount, 0, &ctx).await.unwrap();
    assert!(file.is_materialized().await);

    drop(gate);
    let data = reader.await.unwrap().unwrap();
    assert!(data.is_empty(), "readers observe the empty overlay file");
}

#[tokio::test]
async fn mkdir_create_and_listing() {
    let harness = flat_harness().await;
    let root = harness.mount.root();
    let (uid, gid) = harness.mount.owner();

    let d = root
        .mkdir(&harness.mount, &name("new-dir"), 0o755, uid, gid)
        .await
        .unwrap();
    assert_eq!(
        libc::EEXIST,
        root.mkdir(&harness.mount, &name("new-dir"), 0o755, uid, gid)
            .await
            .unwrap_err()
            .errno()
    );

    d.create_file(&harness.mount, &name("f"), 0o100644, uid, gid, b"")
        .await
        .unwrap();
    assert_eq!(
        libc::EEXIST,
        d.create_file(&harness.mount, &name("f"), 0o100644, uid, gid, b"")
            .await
            .unwrap_err()
            .errno()
    );

    let listing = root.readdir(&harness.mount).await.unwrap();
    let names: Vec<String> = listing.iter().map(|e| e.name.to_string()).collect();
    assert_eq!(vec!["A", "B", "new-dir"], names);

    assert_eq!(
        libc::ENOTEMPTY,
        root.rmdir(&harness.mount, &name("new-dir"), &fetch_ctx())
            .await
            .unwrap_err()
            .errno()
    );
    d.unlink(&harness.mount, &name("f")).await.unwrap();
    root.rmdir(&harness.mount, &name("new-dir"), &fetch_ctx())
        .await
        .unwrap();
    assert!(root.get_entry(&name("new-dir")).await.is_none());
}

#[tokio::test]
async fn symlink_roundtrip() {
    let harness = flat_harness().await;
    let ctx = fetch_ctx();
    let root = harness.mount.root();
    let (uid, gid) = harness.mount.owner();

    let link = root
        .create_file(
            &harness.mount,
            &name("link"),
            0o120777,
            uid,
            gid,
            b"A",
        )
        .await
        .unwrap();
    let target = link.readlink(&harness.mount, &ctx).await.unwrap();
    assert_eq!(b"A", &target[..]);
}

#[tokio::test]
async fn sha1_is_served_without_materializing() {
    let harness = flat_harness().await;
    let ctx = fetch_ctx();
    let file = resolve_file(&harness, "A").await;

    let sha1 = file.sha1(&harness.mount, &ctx).await.unwrap();
    assert_eq!(*fixtures::BLOB_A_ID, sha1);
    assert!(!file.is_materialized().await);

    // after a content-preserving materialization the sidecar answers
    file.fallocate(&harness.mount, 0, 1, &ctx).await.unwrap();
    assert!(file.is_materialized().await);
    let sha1_again = file.sha1(&harness.mount, &ctx).await.unwrap();
    assert_eq!(*fixtures::BLOB_A_ID, sha1_again);
}

#[tokio::test]
async fn unloaded_source_directories_resolve_after_restart_of_map() {
    let harness = nested_harness().await;
    let ctx = fetch_ctx();

    // concurrent lookups of the same unloaded directory share one load
    let lookups: Vec<_> = (0..4)
        .map(|_| {
            let mount = harness.mount.clone();
            tokio::spawn(async move {
                let ctx = fetch_ctx();
                mount.resolve(&path("d1"), &ctx).await.map(|h| h.number())
            })
        })
        .collect();
    let mut numbers = Vec::new();
    for lookup in lookups {
        numbers.push(lookup.await.unwrap().unwrap());
    }
    numbers.dedup();
    assert_eq!(1, numbers.len());

    let handle = harness.mount.resolve(&path("d1"), &ctx).await.unwrap();
    assert!(matches!(handle, InodeHandle::Tree(_)));
    assert_eq!(Some(path("d1")), harness.mount.path_for(handle.number()));
}
