use std::sync::{Arc, Weak};

use lru::LruCache;
use parking_lot::Mutex;

use crate::digests::ObjectId;
use crate::model::Blob;

/// How much a caller cares about a blob staying cached.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlobInterest {
    /// The caller keeps a [BlobHandle]; the entry is not evicted while any
    /// handle is alive.
    WantHandle,
    /// Cache it, but it can go first when space is needed.
    UnlikelyNeededAgain,
}

struct CacheEntry {
    blob: Arc<Blob>,
    handles: usize,
}

struct Inner {
    entries: LruCache<ObjectId, CacheEntry>,
    total_bytes: usize,
    max_bytes: usize,
}

/// An in-memory blob cache bounded by total contents size rather than entry
/// count. Eviction walks from the least recently used end but skips entries
/// with live interest handles.
#[derive(Clone)]
pub struct BlobCache {
    inner: Arc<Mutex<Inner>>,
}

impl BlobCache {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                entries: LruCache::unbounded(),
                total_bytes: 0,
                max_bytes,
            })),
        }
    }

    pub fn get(&self, id: &ObjectId) -> Option<Arc<Blob>> {
        self.inner.lock().entries.get(id).map(|e| e.blob.clone())
    }

    /// Inserts a blob. With [BlobInterest::WantHandle] the returned handle
    /// pins the entry until dropped.
    pub fn insert(&self, blob: Arc<Blob>, interest: BlobInterest) -> Option<BlobHandle> {
        let id = blob.id().clone();
        let size = blob.size() as usize;
        let mut inner = self.inner.lock();

        match inner.entries.get_mut(&id) {
            Some(entry) => {
                if interest == BlobInterest::WantHandle {
                    entry.handles += 1;
                }
            }
            None => {
                let handles = (interest == BlobInterest::WantHandle) as usize;
                inner.entries.put(id.clone(), CacheEntry { blob, handles });
                inner.total_bytes += size;
                evict(&mut inner);
            }
        }

        (interest == BlobInterest::WantHandle).then(|| BlobHandle {
            cache: Arc::downgrade(&self.inner),
            id,
        })
    }

    /// Registers additional interest in an already cached blob.
    pub fn express_interest(&self, id: &ObjectId) -> Option<BlobHandle> {
        let mut inner = self.inner.lock();
        let entry = inner.entries.get_mut(id)?;
        entry.handles += 1;
        Some(BlobHandle {
            cache: Arc::downgrade(&self.inner),
            id: id.clone(),
        })
    }

    /// Drops every entry without a live handle.
    pub fn flush(&self) {
        let mut inner = self.inner.lock();
        let pinned: Vec<_> = inner
            .entries
            .iter()
            .filter(|(_, e)| e.handles > 0)
            .map(|(id, e)| (id.clone(), e.blob.clone(), e.handles))
            .collect();
        inner.entries.clear();
        inner.total_bytes = 0;
        for (id, blob, handles) in pinned {
            inner.total_bytes += blob.size() as usize;
            inner.entries.put(id, CacheEntry { blob, handles });
        }
    }

    pub fn contains(&self, id: &ObjectId) -> bool {
        self.inner.lock().entries.contains(id)
    }

    #[cfg(test)]
    fn total_bytes(&self) -> usize {
        self.inner.lock().total_bytes
    }
}

fn evict(inner: &mut Inner) {
    // Bounded walk: each entry is popped at most once, pinned ones go back
    // to the hot end.
    let mut requeue = Vec::new();
    let mut budget = inner.entries.len();
    while inner.total_bytes > inner.max_bytes && budget > 0 {
        budget -= 1;
        match inner.entries.pop_lru() {
            None => break,
            Some((id, entry)) => {
                if entry.handles > 0 {
                    requeue.push((id, entry));
                } else {
                    inner.total_bytes -= entry.blob.size() as usize;
                }
            }
        }
    }
    for (id, entry) in requeue {
        inner.entries.put(id, entry);
    }
}

/// Keeps one blob pinned in the [BlobCache]. Dropping the handle releases
/// the pin; the cache itself is only weakly referenced so handles may
/// outlive it.
#[derive(Debug)]
pub struct BlobHandle {
    cache: Weak<Mutex<Inner>>,
    id: ObjectId,
}

impl Drop for BlobHandle {
    fn drop(&mut self) {
        if let Some(cache) = self.cache.upgrade() {
            let mut inner = cache.lock();
            if let Some(entry) = inner.entries.peek_mut(&self.id) {
                entry.handles = entry.handles.saturating_sub(1);
            }
            evict(&mut inner);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures;

    fn blob(contents: &[u8]) -> Arc<Blob> {
        Arc::new(Blob::new(
            ObjectId::sha1_of(contents),
            bytes::Bytes::copy_from_slice(contents),
        ))
    }

    #[test]
    fn evicts_least_recently_used_first() {
        let cache = BlobCache::new(8);
        let a = blob(b"aaaa");
        let b = blob(b"bbbb");
        let c = blob(b"cccc");

        cache.insert(a.clone(), BlobInterest::UnlikelyNeededAgain);
        cache.insert(b.clone(), BlobInterest::UnlikelyNeededAgain);
        // touch a so b is the eviction candidate
        assert!(cache.get(a.id()).is_some());
        cache.insert(c.clone(), BlobInterest::UnlikelyNeededAgain);

        assert!(cache.get(b.id()).is_none());
        assert!(cache.get(a.id()).is_some());
        assert!(cache.get(c.id()).is_some());
        assert_eq!(8, cache.total_bytes());
    }

    #[test]
    fn handles_pin_entries() {
        let cache = BlobCache::new(4);
        let a = blob(b"aaaa");
        let handle = cache.insert(a.clone(), BlobInterest::WantHandle);
        assert!(handle.is_some());

        // over budget, but a is pinned
        cache.insert(blob(b"bbbb"), BlobInterest::UnlikelyNeededAgain);
        assert!(cache.get(a.id()).is_some());

        drop(handle);
        // now inserting evicts a
        cache.insert(blob(b"cccc"), BlobInterest::UnlikelyNeededAgain);
        assert!(cache.get(a.id()).is_none());
    }

    #[test]
    fn flush_spares_pinned_entries() {
        let cache = BlobCache::new(1024);
        let a = Arc::new(Blob::new(
            fixtures::BLOB_A_ID.clone(),
            bytes::Bytes::from_static(fixtures::BLOB_A_CONTENTS),
        ));
        let _handle = cache.insert(a.clone(), BlobInterest::WantHandle);
        cache.insert(blob(b"other"), BlobInterest::UnlikelyNeededAgain);

        cache.flush();
        assert!(cache.contains(a.id()));
        assert!(!cache.contains(&ObjectId::sha1_of(b"other")));
    }
}
