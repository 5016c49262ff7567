use std::sync::Arc;

use super::*;
use crate::backingstore::FakeBackingStore;
use crate::fixtures;
use crate::localstore::MemoryLocalStore;

fn pipeline() -> (FakeBackingStore, Arc<dyn LocalStore>, Arc<ObjectStore>) {
    let backing = FakeBackingStore::new();
    let local: Arc<dyn LocalStore> = Arc::new(MemoryLocalStore::default());
    let store = ObjectStore::new(Arc::new(backing.clone()), local.clone());
    (backing, local, store)
}

#[tokio::test]
async fn disk_hit_after_backing_fetch() {
    let (backing, _local, store) = pipeline();
    let id = backing.put_blob(fixtures::BLOB_A_CONTENTS);
    let ctx = FetchContext::new(1);

    let blob = store.get_blob(&id, &ctx).await.unwrap();
    assert_eq!(fixtures::BLOB_A_CONTENTS, &blob.contents()[..]);
    assert_eq!(Some(FetchOrigin::BackingStore), ctx.last_origin());

    // Forget the memory tier; the second read must come from disk without
    // touching the backing store again.
    store.flush_memory_caches();
    let ctx2 = FetchContext::new(1);
    store.get_blob(&id, &ctx2).await.unwrap();
    assert_eq!(Some(FetchOrigin::DiskCache), ctx2.last_origin());
    assert_eq!(1, backing.access_count(&id));
}

#[tokio::test]
async fn memory_hit_on_immediate_reread() {
    let (backing, _local, store) = pipeline();
    let id = backing.put_blob(fixtures::BLOB_A_CONTENTS);
    let ctx = FetchContext::new(1);

    store.get_blob(&id, &ctx).await.unwrap();
    store.get_blob(&id, &ctx).await.unwrap();
    assert_eq!(Some(FetchOrigin::MemoryCache), ctx.last_origin());
    assert_eq!(1, backing.access_count(&id));
}

#[tokio::test]
async fn metadata_cached_after_blob_fetch() {
    let (backing, _local, store) = pipeline();
    let id = backing.put_blob(fixtures::BLOB_A_CONTENTS);
    let ctx = FetchContext::new(1);

    let size = store.get_blob_size(&id, &ctx).await.unwrap();
    assert_eq!(fixtures::BLOB_A_CONTENTS.len() as u64, size);
    assert_eq!(1, backing.access_count(&id));

    // sha1 is served from the metadata cache, not the backing store
    let sha1 = store.get_blob_sha1(&id, &ctx).await.unwrap();
    assert_eq!(id, sha1);
    assert_eq!(1, backing.access_count(&id));

    // even with memory caches flushed, the local store has the metadata
    store.flush_memory_caches();
    let ctx2 = FetchContext::new(1);
    store.get_blob_sha1(&id, &ctx2).await.unwrap();
    assert_eq!(1, backing.access_count(&id));
}

#[tokio::test]
async fn not_found_propagates() {
    let (_backing, _local, store) = pipeline();
    let ctx = FetchContext::new(1);

    let err = store
        .get_blob(&fixtures::BLOB_A_ID, &ctx)
        .await
        .unwrap_err();
    assert!(err.is_not_found());
    let message = err.to_string();
    assert!(
        message.starts_with("blob ") && message.ends_with(" not found"),
        "unexpected message: {message}"
    );
}

#[tokio::test]
async fn per_process_fetch_counts() {
    let (backing, _local, store) = pipeline();
    let a = backing.put_blob(b"one");
    let b = backing.put_blob(b"two");

    let ctx_a = FetchContext::new(100);
    let ctx_b = FetchContext::new(200);

    store.get_blob(&a, &ctx_a).await.unwrap();
    store.get_blob(&b, &ctx_a).await.unwrap();
    store.get_blob(&a, &ctx_b).await.unwrap();

    assert_eq!(2, store.counters().count_for(100));
    // ctx_b's fetch of `a` was served from cache, so no backing fetch counted
    assert_eq!(0, store.counters().count_for(200));

    store.get_blob(&b, &ctx_b).await.unwrap();
    assert_eq!(0, store.counters().count_for(200));
    store.flush_memory_caches();

    let c = backing.put_blob(b"three");
    store.get_blob(&c, &ctx_b).await.unwrap();
    assert_eq!(1, store.counters().count_for(200));
}

#[tokio::test]
async fn fetch_heavy_deprioritizes() {
    let backing = FakeBackingStore::new();
    let local: Arc<dyn LocalStore> = Arc::new(MemoryLocalStore::default());
    let store = ObjectStore::with_config(
        Arc::new(backing.clone()),
        local,
        ObjectStoreConfig {
            fetch_heavy_log_interval: 2,
            ..Default::default()
        },
    );

    let ctx = FetchContext::new(7);
    for i in 0..3 {
        let id = backing.put_blob(format!("payload-{i}").as_bytes());
        store.get_blob(&id, &ctx).await.unwrap();
    }
    assert_eq!(crate::context::FetchPriority::Low, ctx.priority());
}

#[tokio::test]
async fn corrupt_local_entry_fails_and_is_evicted() {
    let (backing, local, store) = pipeline();
    let id = backing.put_blob(fixtures::BLOB_A_CONTENTS);

    // poison the disk cache entry under the blob's key
    local
        .put(KeySpace::Blob, id.as_slice(), b"not the real contents")
        .await
        .unwrap();

    let ctx = FetchContext::new(1);
    let err = store.get_blob(&id, &ctx).await.unwrap_err();
    match err {
        FetchError::ObjectCorrupt {
            kind,
            id: bad_id,
            actual,
        } => {
            assert_eq!(ObjectKind::Blob, kind);
            assert_eq!(id, bad_id);
            assert_eq!(ObjectId::sha1_of(b"not the real contents"), actual);
        }
        other => panic!("expected corruption error, got {other:?}"),
    }

    // the poisoned key was evicted, so the next read recovers remotely
    let blob = store.get_blob(&id, &ctx).await.unwrap();
    assert_eq!(fixtures::BLOB_A_CONTENTS, &blob.contents()[..]);
    assert_eq!(Some(FetchOrigin::BackingStore), ctx.last_origin());
}

#[tokio::test]
async fn transient_errors_are_retried() {
    let (backing, _local, store) = pipeline();
    let id = backing.put_blob(b"flaky");
    backing.fail_next(&id, 2);

    let ctx = FetchContext::new(1);
    let blob = store.get_blob(&id, &ctx).await.unwrap();
    assert_eq!(b"flaky"[..], blob.contents()[..]);

    // more failures than retry budget surface the error
    let id2 = backing.put_blob(b"broken");
    backing.fail_next(&id2, 3);
    store.flush_memory_caches();
    assert!(store.get_blob(&id2, &ctx).await.unwrap_err().is_transient());
}

#[tokio::test]
async fn tree_roundtrip_through_tiers() {
    let (backing, _local, store) = pipeline();
    let tree_id = backing.put_tree(fixtures::tree_ab());
    let ctx = FetchContext::new(1);

    let tree = store.get_tree(&tree_id, &ctx).await.unwrap();
    assert_eq!(Some(FetchOrigin::BackingStore), ctx.last_origin());
    assert!(tree.get(b"A").is_some());

    store.flush_memory_caches();
    let ctx2 = FetchContext::new(1);
    let tree2 = store.get_tree(&tree_id, &ctx2).await.unwrap();
    assert_eq!(Some(FetchOrigin::DiskCache), ctx2.last_origin());
    assert_eq!(*tree, *tree2);
}

#[tokio::test]
async fn root_tree_resolution_populates_tree_cache() {
    let (backing, _local, store) = pipeline();
    let tree_id = backing.put_tree(fixtures::tree_ab());
    backing.put_root(fixtures::ROOT_ID.clone(), tree_id.clone());
    let ctx = FetchContext::new(1);

    let root_tree = store.get_root_tree(&fixtures::ROOT_ID, &ctx).await.unwrap();
    assert_eq!(tree_id, root_tree.id());

    // the tree is now cached under its own id
    let again = store.get_tree(&tree_id, &ctx).await.unwrap();
    assert_eq!(Some(FetchOrigin::MemoryCache), ctx.last_origin());
    assert_eq!(*root_tree, *again);
}

#[tokio::test]
async fn prefetch_skips_known_blobs() {
    let (backing, _local, store) = pipeline();
    let known = backing.put_blob(b"known");
    let unknown = backing.put_blob(b"unknown");
    let ctx = FetchContext::new(1);

    store.get_blob(&known, &ctx).await.unwrap();
    let before = backing.access_count(&known);

    store
        .prefetch_blobs(&[known.clone(), unknown.clone()], &ctx)
        .await
        .unwrap();

    assert_eq!(before, backing.access_count(&known));
    assert_eq!(1, backing.access_count(&unknown));
}
