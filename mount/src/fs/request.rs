//! Per-request bookkeeping for the kernel channel: every live request is
//! registered in a per-kind table, and lifecycle events go out on a
//! broadcast channel for the tracing interface.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::broadcast;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Lookup,
    Forget,
    Getattr,
    Setattr,
    Readlink,
    Symlink,
    Mknod,
    Mkdir,
    Unlink,
    Rmdir,
    Rename,
    Open,
    Read,
    Write,
    Flush,
    Fsync,
    Fallocate,
    Release,
    Opendir,
    Readdir,
    Releasedir,
    Create,
    Statfs,
    Access,
}

#[derive(Clone, Debug)]
pub struct RequestInfo {
    pub id: u64,
    pub kind: RequestKind,
    pub pid: u32,
    pub queued_at: Instant,
    pub started_at: Option<Instant>,
}

#[derive(Clone, Debug)]
pub enum RequestEvent {
    Queued {
        id: u64,
        kind: RequestKind,
        pid: u32,
    },
    Started {
        id: u64,
        kind: RequestKind,
        queue_time: Duration,
    },
    Finished {
        id: u64,
        kind: RequestKind,
        serve_time: Duration,
    },
}

struct Inner {
    next_id: AtomicU64,
    live: Mutex<HashMap<u64, RequestInfo>>,
    events: broadcast::Sender<RequestEvent>,
}

/// Registry of outstanding kernel requests.
#[derive(Clone)]
pub struct RequestTracker {
    inner: Arc<Inner>,
}

impl Default for RequestTracker {
    fn default() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(Inner {
                next_id: AtomicU64::new(1),
                live: Mutex::new(HashMap::new()),
                events,
            }),
        }
    }
}

impl RequestTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a request as queued and returns its guard. Dropping the
    /// guard finishes the request.
    pub fn begin(&self, kind: RequestKind, pid: u32) -> RequestGuard {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let queued_at = Instant::now();
        self.inner.live.lock().insert(
            id,
            RequestInfo {
                id,
                kind,
                pid,
                queued_at,
                started_at: None,
            },
        );
        let _ = self.inner.events.send(RequestEvent::Queued { id, kind, pid });
        RequestGuard {
            inner: self.inner.clone(),
            id,
            kind,
            queued_at,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RequestEvent> {
        self.inner.events.subscribe()
    }

    /// Every outstanding request.
    pub fn outstanding(&self) -> Vec<RequestInfo> {
        self.inner.live.lock().values().cloned().collect()
    }

    /// Outstanding requests of one kind.
    pub fn outstanding_of_kind(&self, kind: RequestKind) -> Vec<RequestInfo> {
        self.inner
            .live
            .lock()
            .values()
            .filter(|info| info.kind == kind)
            .cloned()
            .collect()
    }
}

pub struct RequestGuard {
    inner: Arc<Inner>,
    id: u64,
    kind: RequestKind,
    queued_at: Instant,
}

impl RequestGuard {
    /// Marks the transition from queued to executing.
    pub fn mark_started(&self) {
        let now = Instant::now();
        if let Some(info) = self.inner.live.lock().get_mut(&self.id) {
            info.started_at = Some(now);
        }
        let _ = self.inner.events.send(RequestEvent::Started {
            id: self.id,
            kind: self.kind,
            queue_time: now.duration_since(self.queued_at),
        });
    }
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        let info = self.inner.live.lock().remove(&self.id);
        let served_from = info
            .and_then(|info| info.started_at)
            .unwrap_or(self.queued_at);
        let _ = self.inner.events.send(RequestEvent::Finished {
            id: self.id,
            kind: self.kind,
            serve_time: served_from.elapsed(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_lifecycle() {
        let tracker = RequestTracker::new();
        let mut events = tracker.subscribe();

        let guard = tracker.begin(RequestKind::Read, 42);
        guard.mark_started();
        assert_eq!(1, tracker.outstanding().len());
        assert_eq!(1, tracker.outstanding_of_kind(RequestKind::Read).len());
        assert!(tracker.outstanding_of_kind(RequestKind::Write).is_empty());

        drop(guard);
        assert!(tracker.outstanding().is_empty());

        assert!(matches!(
            events.try_recv().unwrap(),
            RequestEvent::Queued { pid: 42, .. }
        ));
        assert!(matches!(events.try_recv().unwrap(), RequestEvent::Started { .. }));
        assert!(matches!(
            events.try_recv().unwrap(),
            RequestEvent::Finished { .. }
        ));
    }
}
