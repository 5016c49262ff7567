use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Mutex;
use weft_castore::Error;

use super::Overlay;
use crate::inodes::InodeNumber;

/// Hands out inode numbers from a reserved range so the create hot path is
/// a single atomic increment. The watermark persisted in the overlay is
/// always >= any issued number; crossing the end of the current range
/// persists the next one before numbers from it are handed out.
pub struct InodeAllocator {
    next: AtomicU64,
    reserved_until: AtomicU64,
    refill: Mutex<()>,
    batch: u64,
}

pub const DEFAULT_RESERVATION_BATCH: u64 = 1024;

impl InodeAllocator {
    /// `start` is the first number that may be issued (typically the
    /// persisted watermark, or the first dynamic inode number on a fresh
    /// overlay).
    pub fn new(start: InodeNumber, batch: u64) -> Self {
        Self {
            next: AtomicU64::new(start),
            reserved_until: AtomicU64::new(start),
            refill: Mutex::new(()),
            batch: batch.max(1),
        }
    }

    /// The next number that would be issued. This is what takeover hands to
    /// the successor, and what `close` persists.
    pub fn next_inode_number(&self) -> InodeNumber {
        self.next.load(Ordering::SeqCst)
    }

    pub async fn allocate(&self, overlay: &dyn Overlay) -> Result<InodeNumber, Error> {
        let n = self.next.fetch_add(1, Ordering::SeqCst);
        if n < self.reserved_until.load(Ordering::SeqCst) {
            return Ok(n);
        }

        let _refill = self.refill.lock().await;
        // Someone may have extended the reservation while we waited.
        if n >= self.reserved_until.load(Ordering::SeqCst) {
            let new_end = n + self.batch;
            overlay.update_used_inode_number(new_end).await?;
            self.reserved_until.store(new_end, Ordering::SeqCst);
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::overlay::RedbOverlay;

    #[tokio::test]
    async fn issues_monotonic_numbers() {
        let overlay = Arc::new(RedbOverlay::new_temporary().unwrap());
        let allocator = InodeAllocator::new(4, 8);

        let mut last = 0;
        for _ in 0..20 {
            let n = allocator.allocate(overlay.as_ref()).await.unwrap();
            assert!(n > last || last == 0);
            last = n;
        }
        assert_eq!(24, allocator.next_inode_number());
    }

    #[tokio::test]
    async fn watermark_covers_issued_numbers() {
        let overlay = Arc::new(RedbOverlay::new_temporary().unwrap());
        let allocator = InodeAllocator::new(4, 8);

        for _ in 0..10 {
            let n = allocator.allocate(overlay.as_ref()).await.unwrap();
            let watermark = overlay.load_next_inode_number().await.unwrap().unwrap();
            assert!(watermark >= n, "watermark {watermark} below issued {n}");
        }
    }

    #[tokio::test]
    async fn concurrent_allocations_are_unique() {
        let overlay: Arc<RedbOverlay> = Arc::new(RedbOverlay::new_temporary().unwrap());
        let allocator = Arc::new(InodeAllocator::new(4, 16));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let allocator = allocator.clone();
                let overlay = overlay.clone();
                tokio::spawn(async move {
                    let mut numbers = Vec::new();
                    for _ in 0..50 {
                        numbers.push(allocator.allocate(overlay.as_ref()).await.unwrap());
                    }
                    numbers
                })
            })
            .collect();

        let mut all = Vec::new();
        for task in tasks {
            all.extend(task.await.unwrap());
        }
        all.sort_unstable();
        all.dedup();
        assert_eq!(8 * 50, all.len());
    }
}
