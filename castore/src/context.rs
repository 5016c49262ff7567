//! Per-request fetch context and process-wide fetch accounting.
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use parking_lot::Mutex;

use crate::model::ObjectKind;

/// How urgently a fetch should be served by the backing store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum FetchPriority {
    Low = 0,
    Normal = 1,
}

/// Which tier of the read pipeline satisfied a fetch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FetchOrigin {
    MemoryCache,
    DiskCache,
    BackingStore,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FetchRecord {
    pub kind: ObjectKind,
    pub origin: FetchOrigin,
}

/// Carried through every object store operation. Identifies the requesting
/// process, tracks where results came from, and carries the cancellation
/// and priority bits.
pub struct FetchContext {
    pid: u32,
    priority: AtomicU8,
    cancelled: AtomicBool,
    fetches: Mutex<Vec<FetchRecord>>,
}

impl FetchContext {
    pub fn new(pid: u32) -> Self {
        Self {
            pid,
            priority: AtomicU8::new(FetchPriority::Normal as u8),
            cancelled: AtomicBool::new(false),
            fetches: Mutex::new(Vec::new()),
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn priority(&self) -> FetchPriority {
        if self.priority.load(Ordering::Relaxed) == FetchPriority::Low as u8 {
            FetchPriority::Low
        } else {
            FetchPriority::Normal
        }
    }

    /// Drops this request's priority. Invoked when the owning process has
    /// crossed the fetch-heavy threshold.
    pub fn deprioritize(&self) {
        self.priority
            .store(FetchPriority::Low as u8, Ordering::Relaxed);
    }

    /// Marks the fetch as abandoned by its caller. The load itself still
    /// completes and populates caches; only the awaiter gives up.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    pub fn record_fetch(&self, kind: ObjectKind, origin: FetchOrigin) {
        self.fetches.lock().push(FetchRecord { kind, origin });
    }

    pub fn fetches(&self) -> Vec<FetchRecord> {
        self.fetches.lock().clone()
    }

    pub fn last_origin(&self) -> Option<FetchOrigin> {
        self.fetches.lock().last().map(|r| r.origin)
    }
}

/// Process-wide table of cumulative backing store fetches per client pid.
/// Every `log_interval`-th fetch from one process emits a structured log
/// event, and the context is deprioritized past the same threshold.
pub struct FetchCounters {
    counts: Mutex<HashMap<u32, u64>>,
}

impl Default for FetchCounters {
    fn default() -> Self {
        Self {
            counts: Mutex::new(HashMap::new()),
        }
    }
}

impl FetchCounters {
    /// Bumps the count for `pid`, returning the new cumulative total.
    pub fn record(&self, pid: u32) -> u64 {
        let mut counts = self.counts.lock();
        let count = counts.entry(pid).or_insert(0);
        *count += 1;
        *count
    }

    pub fn count_for(&self, pid: u32) -> u64 {
        self.counts.lock().get(&pid).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distinct_pids_count_separately() {
        let counters = FetchCounters::default();
        assert_eq!(1, counters.record(100));
        assert_eq!(2, counters.record(100));
        assert_eq!(1, counters.record(200));
        assert_eq!(2, counters.count_for(100));
        assert_eq!(1, counters.count_for(200));
        assert_eq!(0, counters.count_for(300));
    }

    #[test]
    fn deprioritize_is_sticky() {
        let ctx = FetchContext::new(42);
        assert_eq!(FetchPriority::Normal, ctx.priority());
        ctx.deprioritize();
        assert_eq!(FetchPriority::Low, ctx.priority());
    }
}
