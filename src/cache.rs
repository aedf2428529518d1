//! Caches: record ownership, limits and eviction.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::config::{CacheOptions, FrontendOptions};
use crate::error::Error;
use crate::frontend::Frontend;
use crate::key::{GlobalLocation, Key, KeyHandle, Location};
use crate::lock::mutex_lock;
use crate::lru::{LruList, NodeRef};
use crate::record::RecordCell;
use crate::registry;
use crate::scheduler;
use crate::writer::RecordWriter;

const SOURCE: &str = "cache";

/// How many LRU-tail entries one lookup may evict. Bounds the work done
/// under the lock while keeping limit enforcement eventual.
const OPPORTUNISTIC_EVICTIONS: usize = 2;

/// Bookkeeping kept next to a record slot, guarded by the cache mutex. The
/// record itself lives behind its own gate and needs no cache lock.
pub(crate) struct RecordWithMeta {
    /// Memory charged to this record: its own frames, not its references.
    pub memory_used: usize,
    /// Time of most recent use.
    pub last_used: Instant,
    pub node: NodeRef,
    /// Records that included this one; evicted when this record is.
    pub included_in: Vec<GlobalLocation>,
    pub cell: Arc<RecordCell>,
}

pub(crate) type Bucket = HashMap<KeyHandle, RecordWithMeta>;

pub(crate) struct CacheState {
    pub memory_used: usize,
    pub lru: LruList,
    /// One bucket per frontend, indexed by frontend id.
    pub buckets: Vec<Bucket>,
}

/// Unified storage for cached records with shared eviction limits.
///
/// One mutex guards all of a cache's bookkeeping; record contents are
/// immutable once populated and read without it.
pub struct Cache {
    id: usize,
    memory_limit: usize,
    lru_limit: Duration,
    state: Mutex<CacheState>,
}

impl Cache {
    /// Create a cache and register it for cross-cache dependencies.
    ///
    /// See [`CacheOptions`] for the eviction limits; enforcement trims up
    /// to two least recently used records per lookup, so bounds hold
    /// eventually rather than immediately.
    pub fn new(options: CacheOptions) -> Arc<Cache> {
        registry::register(|id| Cache {
            id,
            memory_limit: options.memory_limit as usize,
            lru_limit: options.lru_limit,
            state: Mutex::new(CacheState {
                memory_used: 0,
                lru: LruList::default(),
                buckets: Vec::new(),
            }),
        })
    }

    /// Create a frontend with default options.
    pub fn new_frontend<K: Key>(
        self: &Arc<Self>,
        generator: impl Fn(&K, &mut RecordWriter) -> Result<(), Error> + Send + Sync + 'static,
    ) -> Frontend<K> {
        self.new_frontend_with(FrontendOptions::default(), generator)
    }

    /// Create a frontend with explicit options.
    pub fn new_frontend_with<K: Key>(
        self: &Arc<Self>,
        options: FrontendOptions,
        generator: impl Fn(&K, &mut RecordWriter) -> Result<(), Error> + Send + Sync + 'static,
    ) -> Frontend<K> {
        let id = {
            let mut state = mutex_lock(&self.state, SOURCE, "new_frontend");
            state.buckets.push(Bucket::new());
            state.buckets.len() - 1
        };
        Frontend::new(id, Arc::clone(self), options, Box::new(generator))
    }

    pub(crate) fn id(&self) -> usize {
        self.id
    }

    /// Memory currently charged to live records, in bytes.
    pub fn memory_used(&self) -> usize {
        mutex_lock(&self.state, SOURCE, "memory_used").memory_used
    }

    /// Number of live records across all frontends.
    pub fn record_count(&self) -> usize {
        mutex_lock(&self.state, SOURCE, "record_count")
            .buckets
            .iter()
            .map(|bucket| bucket.len())
            .sum()
    }

    /// Evict every record of every frontend after `delay`.
    pub fn evict_all(&self, delay: Duration) {
        let mut state = mutex_lock(&self.state, SOURCE, "evict_all");
        let state = &mut *state;
        for frontend in 0..state.buckets.len() {
            self.evict_frontend_locked(state, frontend, delay);
        }
    }

    /// Find or insert the record slot at `loc`.
    ///
    /// `fresh` is true when this call created the slot, electing the caller
    /// as its populator. Trims the LRU tail on the way out while a limit is
    /// exceeded.
    pub(crate) fn get_or_create(&self, loc: &Location) -> (Arc<RecordCell>, bool) {
        let mut state = mutex_lock(&self.state, SOURCE, "get_or_create");
        let state = &mut *state;
        let now = Instant::now();

        let existing = match state.buckets[loc.frontend].get_mut(&loc.key) {
            Some(meta) => {
                meta.last_used = now;
                Some((meta.node, Arc::clone(&meta.cell)))
            }
            None => None,
        };
        let (cell, fresh) = match existing {
            Some((node, cell)) => {
                state.lru.move_to_front(node);
                (cell, false)
            }
            None => {
                let cell = RecordCell::new();
                let node = state.lru.push_front(loc.clone());
                state.buckets[loc.frontend].insert(
                    loc.key.clone(),
                    RecordWithMeta {
                        memory_used: 0,
                        last_used: now,
                        node,
                        included_in: Vec::new(),
                        cell: Arc::clone(&cell),
                    },
                );
                (cell, true)
            }
        };

        self.evict_pressured(state, now);

        debug!(
            cache = self.id,
            frontend = loc.frontend,
            key = ?loc.key,
            outcome = if fresh { "miss" } else { "hit" },
            "record lookup"
        );
        (cell, fresh)
    }

    /// Evict up to [`OPPORTUNISTIC_EVICTIONS`] LRU-tail entries while a
    /// limit is exceeded.
    fn evict_pressured(&self, state: &mut CacheState, now: Instant) {
        for _ in 0..OPPORTUNISTIC_EVICTIONS {
            let Some(tail) = state.lru.back().cloned() else {
                break;
            };
            if self.memory_limit != 0 && state.memory_used > self.memory_limit {
                self.evict_locked(state, &tail, Duration::ZERO);
                continue;
            }
            if !self.lru_limit.is_zero() {
                let Some(meta) = state.buckets[tail.frontend].get(&tail.key) else {
                    warn!(cache = self.id, "lru tail missing from its bucket");
                    break;
                };
                if now.duration_since(meta.last_used) > self.lru_limit {
                    self.evict_locked(state, &tail, Duration::ZERO);
                    continue;
                }
            }
            break;
        }
    }

    /// Commit a populated record's memory.
    ///
    /// No-op when the slot was evicted or reassigned while the record was
    /// being populated: such a record never contributes to the total and is
    /// freed when its last handle drops.
    pub(crate) fn set_used_memory(&self, cell: &Arc<RecordCell>, loc: &Location, memory_used: usize) {
        let mut state = mutex_lock(&self.state, SOURCE, "set_used_memory");
        let state = &mut *state;
        if let Some(meta) = state.buckets[loc.frontend].get_mut(&loc.key)
            && Arc::ptr_eq(&meta.cell, cell)
        {
            meta.memory_used = memory_used;
            state.memory_used += memory_used;
        }
    }

    /// Evict `loc` after `delay`; zero evicts immediately.
    pub(crate) fn evict(&self, loc: &Location, delay: Duration) {
        let mut state = mutex_lock(&self.state, SOURCE, "evict");
        self.evict_locked(&mut state, loc, delay);
    }

    /// Inner eviction routine; assumes the cache mutex is held via `state`.
    ///
    /// Same-cache dependants are evicted inline under the held lock;
    /// cross-cache dependants are dispatched to detached threads so no two
    /// cache locks are ever held by one thread.
    fn evict_locked(&self, state: &mut CacheState, loc: &Location, delay: Duration) {
        if !state.buckets[loc.frontend].contains_key(&loc.key) {
            return;
        }
        if !delay.is_zero() {
            scheduler::schedule(
                GlobalLocation {
                    cache: self.id,
                    frontend: loc.frontend,
                    key: loc.key.clone(),
                },
                delay,
            );
            return;
        }

        let Some(meta) = state.buckets[loc.frontend].remove(&loc.key) else {
            return;
        };
        state.lru.remove(meta.node);
        state.memory_used = state.memory_used.saturating_sub(meta.memory_used);
        debug!(cache = self.id, frontend = loc.frontend, key = ?loc.key, "record evicted");

        for parent in meta.included_in {
            if parent.cache == self.id {
                self.evict_locked(state, &parent.local(), Duration::ZERO);
            } else {
                thread::spawn(move || evict_global(&parent));
            }
        }
    }

    pub(crate) fn evict_frontend(&self, frontend: usize, delay: Duration) {
        let mut state = mutex_lock(&self.state, SOURCE, "evict_frontend");
        self.evict_frontend_locked(&mut state, frontend, delay);
    }

    fn evict_frontend_locked(&self, state: &mut CacheState, frontend: usize, delay: Duration) {
        for key in snapshot_keys(state, frontend) {
            self.evict_locked(state, &Location { frontend, key }, delay);
        }
    }

    pub(crate) fn evict_by_func(
        &self,
        frontend: usize,
        delay: Duration,
        matcher: &dyn Fn(&KeyHandle) -> Result<bool, Error>,
    ) -> Result<(), Error> {
        let mut state = mutex_lock(&self.state, SOURCE, "evict_by_func");
        let state = &mut *state;
        for key in snapshot_keys(state, frontend) {
            // A recursive cascade may have removed the key during this
            // sweep; skip it to spare the matcher.
            if !state.buckets[frontend].contains_key(&key) {
                continue;
            }
            if matcher(&key)? {
                self.evict_locked(state, &Location { frontend, key }, delay);
            }
        }
        Ok(())
    }

    /// Whether a record slot exists at (`frontend`, `key`).
    #[cfg(test)]
    pub(crate) fn contains(&self, frontend: usize, key: &KeyHandle) -> bool {
        mutex_lock(&self.state, SOURCE, "contains").buckets[frontend].contains_key(key)
    }

    /// Verify the cross-structure invariants: the LRU list and the buckets
    /// reference each other, list order is monotone in last-used times and
    /// memory accounting matches component sizes.
    #[cfg(test)]
    pub(crate) fn assert_consistent(&self) {
        let state = mutex_lock(&self.state, SOURCE, "assert_consistent");

        let mut previous: Option<Instant> = None;
        let mut listed = 0usize;
        for (node, loc) in state.lru.iter() {
            let meta = state.buckets[loc.frontend]
                .get(&loc.key)
                .unwrap_or_else(|| panic!("lru node for missing record: {loc:?}"));
            assert_eq!(meta.node, node, "record does not point back at its node");
            if let Some(previous) = previous {
                assert!(previous >= meta.last_used, "lru list out of order");
            }
            previous = Some(meta.last_used);
            listed += 1;
        }

        let mut total = 0usize;
        let mut entries = 0usize;
        for (frontend, bucket) in state.buckets.iter().enumerate() {
            for (key, meta) in bucket {
                entries += 1;
                let loc = state
                    .lru
                    .location_of(meta.node)
                    .unwrap_or_else(|| panic!("record without lru node: {key:?}"));
                assert_eq!(loc.frontend, frontend, "node points at wrong frontend");
                assert_eq!(&loc.key, key, "node points at wrong key");

                let record_size = match meta.cell.peek() {
                    Some(Ok(record)) => record.components().iter().map(|c| c.size()).sum(),
                    _ => 0,
                };
                assert_eq!(meta.memory_used, record_size, "record memory mismatch");
                total += meta.memory_used;
            }
        }
        assert_eq!(listed, entries, "lru list and buckets differ in size");
        assert_eq!(state.memory_used, total, "cache memory mismatch");
    }
}

/// Record that `parent` includes `child`, so evicting the child cascades to
/// the parent. A child already evicted is silently ignored: the parent
/// holds the record itself, only key-addressed lookup is gone.
pub(crate) fn register_dependency(parent: GlobalLocation, child: GlobalLocation) {
    let Some(cache) = registry::get(child.cache) else {
        return;
    };
    let mut state = mutex_lock(&cache.state, SOURCE, "register_dependency");
    if let Some(meta) = state.buckets[child.frontend].get_mut(&child.key) {
        meta.included_in.push(parent);
    }
}

/// Evict a record anywhere, resolving its cache through the registry.
pub(crate) fn evict_global(loc: &GlobalLocation) {
    if let Some(cache) = registry::get(loc.cache) {
        cache.evict(&loc.local(), Duration::ZERO);
    }
}

/// Snapshot of a bucket's keys, so eviction can mutate while iterating.
fn snapshot_keys(state: &CacheState, frontend: usize) -> Vec<KeyHandle> {
    state.buckets[frontend].keys().cloned().collect()
}
