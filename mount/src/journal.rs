//! The append-only log of working-copy mutations.
//!
//! Deltas form a singly linked chain from the newest entry backwards.
//! Repeated edits to one file merge into the head delta instead of growing
//! the chain, and a configurable memory cap prunes the tail, so the journal
//! stays bounded no matter how busy the checkout is.
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::warn;
use weft_castore::path::RepoPath;
use weft_castore::ObjectId;

/// Whether a path existed before and after the change a delta records.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PathChangeInfo {
    pub existed_before: bool,
    pub existed_after: bool,
}

impl PathChangeInfo {
    pub const CREATED: PathChangeInfo = PathChangeInfo {
        existed_before: false,
        existed_after: true,
    };
    pub const REMOVED: PathChangeInfo = PathChangeInfo {
        existed_before: true,
        existed_after: false,
    };
    pub const CHANGED: PathChangeInfo = PathChangeInfo {
        existed_before: true,
        existed_after: true,
    };
}

/// One link in the journal chain.
#[derive(Debug)]
pub struct JournalDelta {
    from_sequence: u64,
    to_sequence: u64,
    from_time: SystemTime,
    to_time: SystemTime,
    from_hash: ObjectId,
    to_hash: ObjectId,
    changed_files: BTreeMap<RepoPath, PathChangeInfo>,
    unclean_paths: Option<BTreeSet<RepoPath>>,
    /// Estimated heap footprint, counted against the journal memory cap.
    cost: usize,
    previous: Mutex<Option<Arc<JournalDelta>>>,
}

impl JournalDelta {
    pub fn from_sequence(&self) -> u64 {
        self.from_sequence
    }

    pub fn to_sequence(&self) -> u64 {
        self.to_sequence
    }

    pub fn changed_files(&self) -> &BTreeMap<RepoPath, PathChangeInfo> {
        &self.changed_files
    }

    fn estimate_cost(
        changed_files: &BTreeMap<RepoPath, PathChangeInfo>,
        unclean_paths: &Option<BTreeSet<RepoPath>>,
    ) -> usize {
        let base = std::mem::size_of::<JournalDelta>();
        let files: usize = changed_files
            .keys()
            .map(|p| p.as_bytes().len() + 64)
            .sum();
        let unclean: usize = unclean_paths
            .iter()
            .flatten()
            .map(|p| p.as_bytes().len() + 64)
            .sum();
        base + files + unclean
    }
}

impl Drop for JournalDelta {
    fn drop(&mut self) {
        // Unlink the chain iteratively. A naive drop would recurse once per
        // delta and overflow the stack on long chains.
        let mut next = self.previous.lock().take();
        while let Some(delta) = next {
            match Arc::try_unwrap(delta) {
                Ok(delta) => next = delta.previous.lock().take(),
                // Someone else still holds this tail; their drop continues
                // the walk.
                Err(_) => break,
            }
        }
    }
}

/// The result of merging a range of deltas.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JournalDeltaRange {
    pub from_sequence: u64,
    pub to_sequence: u64,
    pub from_time: SystemTime,
    pub to_time: SystemTime,
    pub from_hash: ObjectId,
    pub to_hash: ObjectId,
    pub changed_files: BTreeMap<RepoPath, PathChangeInfo>,
    pub unclean_paths: BTreeSet<RepoPath>,
    /// True when compaction or memory pressure has forgotten deltas inside
    /// the requested range.
    pub is_truncated: bool,
}

/// A point in the journal, stable across the life of one mount.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JournalPosition {
    pub mount_generation: u64,
    pub sequence: u64,
    pub snapshot_hash: ObjectId,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JournalStats {
    pub entry_count: usize,
    pub memory_usage: usize,
    pub earliest_timestamp: SystemTime,
    pub latest_timestamp: SystemTime,
}

/// Debug view of one delta, newest-to-oldest.
#[derive(Clone, Debug)]
pub struct JournalDeltaInfo {
    pub from_position: JournalPosition,
    pub to_position: JournalPosition,
    pub changed_paths: Vec<RepoPath>,
}

struct JournalState {
    latest: Option<Arc<JournalDelta>>,
    next_sequence: u64,
    current_hash: ObjectId,
    memory_limit: Option<usize>,
    memory_usage: usize,
    entry_count: usize,
    /// Highest sequence number whose delta has been pruned away.
    forgotten_through: u64,
}

/// The journal proper. Recording is infallible and never blocks on I/O.
pub struct Journal {
    state: Mutex<JournalState>,
    mount_generation: u64,
    publish: watch::Sender<u64>,
}

impl Journal {
    pub fn new(initial_hash: ObjectId) -> Self {
        let (publish, _) = watch::channel(0);
        Self {
            state: Mutex::new(JournalState {
                latest: None,
                next_sequence: 1,
                current_hash: initial_hash,
                memory_limit: None,
                memory_usage: 0,
                entry_count: 0,
                forgotten_through: 0,
            }),
            mount_generation: rand::random(),
            publish,
        }
    }

    pub fn mount_generation(&self) -> u64 {
        self.mount_generation
    }

    /// Observers get the latest sequence number on every append.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.publish.subscribe()
    }

    pub fn position(&self) -> JournalPosition {
        let state = self.state.lock();
        JournalPosition {
            mount_generation: self.mount_generation,
            sequence: state.next_sequence - 1,
            snapshot_hash: state.current_hash.clone(),
        }
    }

    pub fn record_created(&self, path: RepoPath) {
        self.append_single(path, PathChangeInfo::CREATED);
    }

    pub fn record_removed(&self, path: RepoPath) {
        self.append_single(path, PathChangeInfo::REMOVED);
    }

    pub fn record_changed(&self, path: RepoPath) {
        self.append_single(path, PathChangeInfo::CHANGED);
    }

    /// The destination did not exist: the rename contributes exactly two
    /// path entries and leaves the snapshot hash alone.
    pub fn record_renamed(&self, old: RepoPath, new: RepoPath) {
        let mut changed = BTreeMap::new();
        changed.insert(old, PathChangeInfo::REMOVED);
        changed.insert(new, PathChangeInfo::CREATED);
        self.append(changed, None, None);
    }

    /// The destination existed and was replaced.
    pub fn record_replaced(&self, old: RepoPath, new: RepoPath) {
        let mut changed = BTreeMap::new();
        changed.insert(old, PathChangeInfo::REMOVED);
        changed.insert(new, PathChangeInfo::CHANGED);
        self.append(changed, None, None);
    }

    /// Moves the head snapshot hash.
    pub fn record_hash_update(&self, to: ObjectId) {
        self.append(BTreeMap::new(), None, Some(to));
    }

    /// Hash update with an explicit source, for resets that skip history.
    pub fn record_hash_update_from(&self, from: ObjectId, to: ObjectId) {
        self.state.lock().current_hash = from;
        self.append(BTreeMap::new(), None, Some(to));
    }

    /// Records paths a checkout could not update cleanly.
    pub fn record_unclean_paths(
        &self,
        from: ObjectId,
        to: ObjectId,
        paths: BTreeSet<RepoPath>,
    ) {
        self.state.lock().current_hash = from;
        self.append(BTreeMap::new(), Some(paths), Some(to));
    }

    fn append_single(&self, path: RepoPath, info: PathChangeInfo) {
        // Tail merge: a repeated edit to the same single file advances the
        // head delta's sequence number instead of allocating a new delta.
        if info == PathChangeInfo::CHANGED {
            let mut state = self.state.lock();
            let can_merge = match state.latest {
                Some(ref latest) => {
                    Arc::strong_count(latest) == 1
                        && latest.unclean_paths.is_none()
                        && latest.from_hash == latest.to_hash
                        && latest.to_hash == state.current_hash
                        && latest.changed_files.len() == 1
                        && latest.changed_files.get(&path) == Some(&PathChangeInfo::CHANGED)
                }
                None => false,
            };
            if can_merge {
                let latest = state.latest.take().unwrap();
                let latest = Arc::try_unwrap(latest).expect("checked sole ownership");
                let sequence = state.next_sequence;
                state.next_sequence += 1;

                let merged = JournalDelta {
                    from_sequence: latest.from_sequence,
                    to_sequence: sequence,
                    from_time: latest.from_time,
                    to_time: SystemTime::now(),
                    from_hash: latest.from_hash.clone(),
                    to_hash: latest.to_hash.clone(),
                    changed_files: latest.changed_files.clone(),
                    unclean_paths: None,
                    cost: latest.cost,
                    previous: Mutex::new(latest.previous.lock().take()),
                };
                state.latest = Some(Arc::new(merged));
                drop(state);
                let _ = self.publish.send(sequence);
                return;
            }
        }

        let mut changed = BTreeMap::new();
        changed.insert(path, info);
        self.append(changed, None, None);
    }

    fn append(
        &self,
        changed_files: BTreeMap<RepoPath, PathChangeInfo>,
        unclean_paths: Option<BTreeSet<RepoPath>>,
        new_hash: Option<ObjectId>,
    ) {
        let mut state = self.state.lock();
        let sequence = state.next_sequence;
        state.next_sequence += 1;

        let from_hash = state.current_hash.clone();
        let to_hash = new_hash.unwrap_or_else(|| from_hash.clone());
        state.current_hash = to_hash.clone();

        let now = SystemTime::now();
        let cost = JournalDelta::estimate_cost(&changed_files, &unclean_paths);
        let delta = JournalDelta {
            from_sequence: sequence,
            to_sequence: sequence,
            from_time: now,
            to_time: now,
            from_hash,
            to_hash,
            changed_files,
            unclean_paths,
            cost,
            previous: Mutex::new(state.latest.take()),
        };
        state.latest = Some(Arc::new(delta));
        state.entry_count += 1;
        state.memory_usage += cost;

        Self::enforce_memory_limit(&mut state);
        drop(state);
        let _ = self.publish.send(sequence);
    }

    /// Caps the chain's estimated memory. At least one delta is always
    /// retained.
    pub fn set_memory_limit(&self, limit: usize) {
        let mut state = self.state.lock();
        state.memory_limit = Some(limit);
        Self::enforce_memory_limit(&mut state);
    }

    pub fn memory_usage(&self) -> usize {
        self.state.lock().memory_usage
    }

    fn enforce_memory_limit(state: &mut JournalState) {
        let Some(limit) = state.memory_limit else {
            return;
        };
        while state.entry_count > 1 && state.memory_usage > limit {
            if !Self::prune_oldest(state) {
                break;
            }
        }
    }

    /// Unlinks the oldest delta. Returns false if only one delta remains.
    fn prune_oldest(state: &mut JournalState) -> bool {
        let Some(latest) = state.latest.clone() else {
            return false;
        };
        if latest.previous.lock().is_none() {
            return false;
        }

        let mut cursor = latest;
        loop {
            let next = {
                let guard = cursor.previous.lock();
                guard.clone().expect("checked below before advancing")
            };
            if next.previous.lock().is_none() {
                *cursor.previous.lock() = None;
                state.memory_usage = state.memory_usage.saturating_sub(next.cost);
                state.entry_count -= 1;
                state.forgotten_through = state.forgotten_through.max(next.to_sequence);
                return true;
            }
            cursor = next;
        }
    }

    /// Merges every delta whose sequence is >= `limit` into one summary,
    /// newest first. Returns None when nothing has been recorded yet.
    pub fn accumulate_range(&self, limit: u64) -> Option<JournalDeltaRange> {
        let state = self.state.lock();
        let latest = state.latest.clone()?;

        let mut result = JournalDeltaRange {
            from_sequence: latest.to_sequence,
            to_sequence: latest.to_sequence,
            from_time: latest.to_time,
            to_time: latest.to_time,
            from_hash: latest.to_hash.clone(),
            to_hash: latest.to_hash.clone(),
            changed_files: BTreeMap::new(),
            unclean_paths: BTreeSet::new(),
            is_truncated: limit <= state.forgotten_through,
        };

        let mut cursor = Some(latest);
        while let Some(delta) = cursor {
            if delta.to_sequence < limit {
                break;
            }

            result.from_sequence = delta.from_sequence;
            result.from_time = delta.from_time;
            result.from_hash = delta.from_hash.clone();

            for (path, info) in &delta.changed_files {
                match result.changed_files.get_mut(path) {
                    Some(existing) => {
                        // The newest entry's existed_before must match this
                        // older entry's existed_after, or the chain records
                        // an impossible sequence of events.
                        if existing.existed_before != info.existed_after {
                            warn!(
                                path = %path,
                                "impossible journal sequence while merging deltas"
                            );
                        }
                        existing.existed_before = info.existed_before;
                    }
                    None => {
                        result.changed_files.insert(path.clone(), *info);
                    }
                }
            }
            if let Some(ref unclean) = delta.unclean_paths {
                result.unclean_paths.extend(unclean.iter().cloned());
            }

            cursor = delta.previous.lock().clone();
        }

        Some(result)
    }

    pub fn stats(&self) -> Option<JournalStats> {
        let state = self.state.lock();
        let latest = state.latest.as_ref()?;

        let mut earliest = latest.from_time;
        let mut cursor = latest.previous.lock().clone();
        while let Some(delta) = cursor {
            earliest = delta.from_time;
            cursor = delta.previous.lock().clone();
        }

        Some(JournalStats {
            entry_count: state.entry_count,
            memory_usage: state.memory_usage,
            earliest_timestamp: earliest,
            latest_timestamp: latest.to_time,
        })
    }

    /// Debug snapshot of the chain, newest-to-oldest.
    pub fn deltas(&self) -> Vec<JournalDeltaInfo> {
        let state = self.state.lock();
        let mut out = Vec::with_capacity(state.entry_count);
        let mut cursor = state.latest.clone();
        while let Some(delta) = cursor {
            out.push(JournalDeltaInfo {
                from_position: JournalPosition {
                    mount_generation: self.mount_generation,
                    sequence: delta.from_sequence,
                    snapshot_hash: delta.from_hash.clone(),
                },
                to_position: JournalPosition {
                    mount_generation: self.mount_generation,
                    sequence: delta.to_sequence,
                    snapshot_hash: delta.to_hash.clone(),
                },
                changed_paths: delta.changed_files.keys().cloned().collect(),
            });
            cursor = delta.previous.lock().clone();
        }
        out
    }

    pub fn entry_count(&self) -> usize {
        self.state.lock().entry_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_castore::fixtures;

    fn path(s: &str) -> RepoPath {
        s.parse().unwrap()
    }

    fn journal() -> Journal {
        Journal::new(fixtures::ROOT_ID.clone())
    }

    #[test]
    fn created_removed_changed_shapes() {
        let journal = journal();
        journal.record_created(path("a"));
        journal.record_removed(path("b"));
        journal.record_changed(path("c"));

        let range = journal.accumulate_range(1).unwrap();
        assert_eq!(1, range.from_sequence);
        assert_eq!(3, range.to_sequence);
        assert_eq!(
            Some(&PathChangeInfo::CREATED),
            range.changed_files.get(&path("a"))
        );
        assert_eq!(
            Some(&PathChangeInfo::REMOVED),
            range.changed_files.get(&path("b"))
        );
        assert_eq!(
            Some(&PathChangeInfo::CHANGED),
            range.changed_files.get(&path("c"))
        );
        assert!(!range.is_truncated);
    }

    #[test]
    fn repeated_changes_compact_in_place() {
        let journal = journal();
        journal.record_changed(path("x"));
        journal.record_changed(path("x"));
        journal.record_changed(path("x"));

        assert_eq!(1, journal.entry_count());
        let range = journal.accumulate_range(1).unwrap();
        assert_eq!(1, range.from_sequence);
        assert_eq!(3, range.to_sequence);
        assert_eq!(1, range.changed_files.len());
    }

    #[test]
    fn compaction_does_not_cross_other_events() {
        let journal = journal();
        journal.record_changed(path("x"));
        journal.record_changed(path("y"));
        journal.record_changed(path("x"));

        assert_eq!(3, journal.entry_count());
    }

    #[test]
    fn accumulate_folds_existed_bits() {
        let journal = journal();
        journal.record_created(path("a"));
        journal.record_changed(path("a"));

        let range = journal.accumulate_range(1).unwrap();
        // oldest existed_before (false) with newest existed_after (true)
        assert_eq!(
            Some(&PathChangeInfo::CREATED),
            range.changed_files.get(&path("a"))
        );

        journal.record_removed(path("a"));
        let range = journal.accumulate_range(1).unwrap();
        assert_eq!(
            Some(&PathChangeInfo {
                existed_before: false,
                existed_after: false
            }),
            range.changed_files.get(&path("a"))
        );
    }

    #[test]
    fn accumulate_respects_limit() {
        let journal = journal();
        journal.record_created(path("a"));
        journal.record_created(path("b"));
        journal.record_created(path("c"));

        let range = journal.accumulate_range(3).unwrap();
        assert_eq!(3, range.from_sequence);
        assert_eq!(3, range.to_sequence);
        assert_eq!(1, range.changed_files.len());
        assert!(range.changed_files.contains_key(&path("c")));
    }

    #[test]
    fn accumulate_is_idempotent() {
        let journal = journal();
        journal.record_created(path("a"));
        journal.record_changed(path("a"));
        journal.record_renamed(path("a"), path("b"));

        let first = journal.accumulate_range(1).unwrap();
        let second = journal.accumulate_range(1).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn rename_records_two_paths_and_keeps_hash() {
        let journal = journal();
        journal.record_renamed(path("a"), path("d/b"));

        let range = journal.accumulate_range(1).unwrap();
        assert_eq!(2, range.changed_files.len());
        assert_eq!(
            Some(&PathChangeInfo::REMOVED),
            range.changed_files.get(&path("a"))
        );
        assert_eq!(
            Some(&PathChangeInfo::CREATED),
            range.changed_files.get(&path("d/b"))
        );
        assert_eq!(range.from_hash, range.to_hash);
    }

    #[test]
    fn hash_update_moves_head() {
        let journal = journal();
        let new_hash = weft_castore::ObjectId::sha1_of(b"snapshot-2");
        journal.record_hash_update(new_hash.clone());

        let range = journal.accumulate_range(1).unwrap();
        assert_eq!(*fixtures::ROOT_ID, range.from_hash);
        assert_eq!(new_hash, range.to_hash);
        assert_eq!(new_hash, journal.position().snapshot_hash);
    }

    #[test]
    fn memory_limit_zero_retains_one_delta() {
        let journal = journal();
        journal.record_created(path("a"));
        journal.record_created(path("b"));
        journal.record_created(path("c"));
        assert_eq!(3, journal.entry_count());

        journal.set_memory_limit(0);
        assert_eq!(1, journal.entry_count());

        let range = journal.accumulate_range(1).unwrap();
        assert!(range.is_truncated);
        assert_eq!(3, range.from_sequence);
        assert_eq!(3, range.to_sequence);

        // ranges entirely inside the retained head are not truncated
        let head_only = journal.accumulate_range(3).unwrap();
        assert!(!head_only.is_truncated);
    }

    #[test]
    fn long_chain_drop_does_not_recurse() {
        let journal = journal();
        for i in 0..200_000u32 {
            journal.record_created(path(&format!("f{i}")));
        }
        assert_eq!(200_000, journal.entry_count());
        drop(journal);
    }

    #[test]
    fn deltas_enumerate_newest_first() {
        let journal = journal();
        journal.record_created(path("a"));
        journal.record_created(path("b"));

        let deltas = journal.deltas();
        assert_eq!(2, deltas.len());
        assert_eq!(2, deltas[0].to_position.sequence);
        assert_eq!(1, deltas[1].to_position.sequence);
        assert_eq!(
            journal.mount_generation(),
            deltas[0].to_position.mount_generation
        );
    }

    #[test]
    fn subscribers_see_appends() {
        let journal = journal();
        let rx = journal.subscribe();
        journal.record_created(path("a"));
        assert_eq!(1, *rx.borrow());
    }

    #[test]
    fn stats_track_entries() {
        let journal = journal();
        assert!(journal.stats().is_none());
        journal.record_created(path("a"));
        journal.record_changed(path("a"));
        let stats = journal.stats().unwrap();
        assert_eq!(2, stats.entry_count);
        assert!(stats.memory_usage > 0);
        assert!(stats.earliest_timestamp <= stats.latest_timestamp);
    }
}
