//! Residency cache (C3): a reference-counted, thread-safe LRU that owns
//! the serialized image of every evictable object and enforces a hard
//! memory ceiling by evicting unpinned victims.

pub mod evictable;
pub mod serializer;

pub use evictable::Evictable;
pub use serializer::{Allocation, Deserializer, Serializer};

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::{Mutex, RwLock};

use crate::stats::Stats;

const UNLOADED: u8 = 0;
const LOADING: u8 = 1;
const LOADED: u8 = 2;
const EVICTING: u8 = 3;

struct Record<E> {
    evictable: Arc<E>,
    state: AtomicU8,
    marked: AtomicBool,
    ref_count: AtomicU32,
    /// `size_bytes()` observed the last time this record transitioned to
    /// `Loaded`, so `evict_marked` can subtract the right delta without
    /// re-querying a now-evicted object.
    resident_size: AtomicUsize,
}

/// A ref-counted, thread-safe LRU cache enforcing a hard byte budget.
///
/// One instance exists per evictable *kind* (shapes get their own instance
/// sized by `geometry_cache_bytes`, `CachedBvh`s get another sized by
/// `bvh_cache_bytes` — see §6), rather than one generic cache templated
/// over every kind at once.
pub struct ResidencyCache<E: Evictable> {
    max_bytes: u64,
    used_bytes: AtomicU64,
    // Boxed so that a `CachedPtr`'s raw pointer into a record's `ref_count`
    // stays valid even when `register` grows this `Vec` and moves the
    // (thin) `Box` pointers around; the boxed allocation itself never
    // moves.
    records: RwLock<Vec<Box<Record<E>>>>,
    index: RwLock<AHashMap<usize, usize>>,
    evict_mutex: Mutex<()>,
    stats: Arc<Stats>,
}

impl<E: Evictable> ResidencyCache<E> {
    pub fn new(max_bytes: u64, stats: Arc<Stats>) -> Self {
        ResidencyCache {
            max_bytes,
            used_bytes: AtomicU64::new(0),
            records: RwLock::new(Vec::new()),
            index: RwLock::new(AHashMap::new()),
            evict_mutex: Mutex::new(()),
            stats,
        }
    }

    pub fn used_bytes(&self) -> u64 {
        self.used_bytes.load(Ordering::SeqCst)
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    /// Registers a new evictable. The object must already have had
    /// `serialize` called on it (preprocessing's job, not the cache's) and
    /// must currently be non-resident.
    pub fn register(&self, evictable: Arc<E>) -> CacheHandle {
        debug_assert!(!evictable.is_resident());
        let key = Arc::as_ptr(&evictable) as usize;
        let record = Record {
            evictable,
            state: AtomicU8::new(UNLOADED),
            marked: AtomicBool::new(false),
            ref_count: AtomicU32::new(0),
            resident_size: AtomicUsize::new(0),
        };

        let mut records = self.records.write();
        let slot = records.len();
        records.push(Box::new(record));
        drop(records);

        self.index.write().insert(key, slot);
        CacheHandle(slot)
    }

    /// Looks up the handle for an already-registered evictable by identity,
    /// so callers that share evictables (e.g. a `Shape` referenced by
    /// several `SceneObject`s) can register once and reuse the handle.
    pub fn handle_of(&self, evictable: &Arc<E>) -> Option<CacheHandle> {
        let key = Arc::as_ptr(evictable) as usize;
        self.index.read().get(&key).copied().map(CacheHandle)
    }

    fn slot_for(&self, handle: CacheHandle) -> usize {
        handle.0
    }

    /// `make_resident(e)`: the central operation of the residency cache.
    /// See the contract in spec.md §4.3, reproduced step-for-step below.
    pub fn make_resident(
        &self,
        handle: CacheHandle,
        deserializer: &dyn Deserializer,
    ) -> CachedPtr<E> {
        let slot = self.slot_for(handle);
        let records = self.records.read();
        let record = &records[slot];

        // Step 1: clear marked (touched).
        record.marked.store(false, Ordering::Relaxed);

        // Step 2: bump ref_count *before* observing state. This ordering is
        // what prevents the evictor from completing an eviction on an item
        // that is concurrently being acquired (see `evict_marked`).
        record.ref_count.fetch_add(1, Ordering::SeqCst);

        // Step 3: if Evicting, spin until it is not (forward progress is
        // guaranteed: the evictor re-checks ref_count under Evicting and
        // restores Loaded if it is non-zero, so it cannot hold this state
        // forever against a holder that has already bumped ref_count).
        loop {
            let state = record.state.load(Ordering::Acquire);
            if state != EVICTING {
                break;
            }
            std::hint::spin_loop();
        }

        loop {
            let state = record.state.load(Ordering::Acquire);
            match state {
                LOADED => {
                    self.stats.record_cache_hit();
                    return CachedPtr::new(record.evictable.clone(), &record.ref_count);
                }
                UNLOADED => {
                    if record
                        .state
                        .compare_exchange(
                            UNLOADED,
                            LOADING,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        self.stats.record_cache_miss();
                        // Winner: load off the hot path.
                        let before = record.evictable.size_bytes();
                        record.evictable.make_resident(deserializer);
                        let after = record.evictable.size_bytes();
                        let delta = after.saturating_sub(before) as u64;
                        self.used_bytes.fetch_add(delta, Ordering::SeqCst);
                        record.resident_size.store(after, Ordering::Relaxed);
                        record.state.store(LOADED, Ordering::Release);

                        if self.used_bytes.load(Ordering::SeqCst) > self.max_bytes {
                            self.evict_marked();
                        }
                        return CachedPtr::new(record.evictable.clone(), &record.ref_count);
                    }
                    // Lost the race; reobserve.
                }
                LOADING => {
                    std::hint::spin_loop();
                }
                EVICTING => {
                    // Raced with a fresh eviction right after our spin
                    // above; loop back to the outer wait.
                    std::hint::spin_loop();
                }
                _ => unreachable!("invalid cache item state"),
            }
        }
    }

    /// Bypasses the LRU policy entirely. Caller guarantees `ref_count == 0`
    /// for this item; used by preprocessing to deterministically release
    /// memory between passes.
    pub fn force_evict(&self, handle: CacheHandle) {
        let records = self.records.read();
        let record = &records[self.slot_for(handle)];
        debug_assert_eq!(record.ref_count.load(Ordering::SeqCst), 0);

        let state = record.state.swap(EVICTING, Ordering::AcqRel);
        if state != LOADED {
            record.state.store(state, Ordering::Release);
            return;
        }
        let before = record.resident_size.load(Ordering::Relaxed) as u64;
        record.evictable.evict();
        self.used_bytes.fetch_sub(before, Ordering::SeqCst);
        record.state.store(UNLOADED, Ordering::Release);
        self.stats.record_eviction();
    }

    /// Sweeps all items, evicting unmarked, unpinned, loaded victims
    /// (second-chance / CLOCK policy: survivors are marked so they get one
    /// more sweep before being considered again).
    pub fn evict_marked(&self) {
        let _guard = self.evict_mutex.lock();

        if self.used_bytes.load(Ordering::SeqCst) <= self.max_bytes {
            return;
        }

        let records = self.records.read();
        for record in records.iter() {
            if self.used_bytes.load(Ordering::SeqCst) <= self.max_bytes {
                break;
            }

            // Second-chance policy: an item is only eligible once it has
            // gone a full sweep without being touched by `make_resident`
            // (which clears `marked`). Whether or not it's evicted below,
            // every item visited gets `marked = true` so an item touched
            // since the last sweep survives exactly one more.
            let eligible = record.marked.load(Ordering::Acquire)
                && record.ref_count.load(Ordering::SeqCst) == 0;

            if eligible
                && record
                    .state
                    .compare_exchange(LOADED, EVICTING, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            {
                if record.ref_count.load(Ordering::SeqCst) != 0 {
                    record.state.store(LOADED, Ordering::Release);
                } else {
                    let before = record.resident_size.load(Ordering::Relaxed) as u64;
                    record.evictable.evict();
                    self.used_bytes.fetch_sub(before, Ordering::SeqCst);
                    record.state.store(UNLOADED, Ordering::Release);
                    self.stats.record_eviction();
                }
            }

            record.marked.store(true, Ordering::Release);
        }
    }

    #[cfg(test)]
    fn state_of(&self, handle: CacheHandle) -> u8 {
        self.records.read()[self.slot_for(handle)]
            .state
            .load(Ordering::SeqCst)
    }

    #[cfg(test)]
    fn ref_count_of(&self, handle: CacheHandle) -> u32 {
        self.records.read()[self.slot_for(handle)]
            .ref_count
            .load(Ordering::SeqCst)
    }
}

/// Opaque slot reference returned by [`ResidencyCache::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheHandle(usize);

/// A ref-counted, shared handle pinning an evictable's residency.
///
/// Uses a raw atomic counter rather than `Arc`'s built-in refcount because
/// the cache needs to *observe* the count directly (to decide eviction
/// eligibility), not merely rely on drop order.
pub struct CachedPtr<E: Evictable> {
    evictable: Arc<E>,
    ref_count: *const AtomicU32,
}

// SAFETY: `ref_count` points at a field of a `Record` stored in a
// `ResidencyCache`, which outlives every `CachedPtr` handed out from it
// (the cache never removes a record, only evicts its payload).
unsafe impl<E: Evictable> Send for CachedPtr<E> {}
unsafe impl<E: Evictable> Sync for CachedPtr<E> {}

impl<E: Evictable> CachedPtr<E> {
    fn new(evictable: Arc<E>, ref_count: &AtomicU32) -> Self {
        CachedPtr {
            evictable,
            ref_count: ref_count as *const AtomicU32,
        }
    }

    pub fn get(&self) -> &E {
        &self.evictable
    }
}

impl<E: Evictable> std::ops::Deref for CachedPtr<E> {
    type Target = E;

    fn deref(&self) -> &E {
        &self.evictable
    }
}

impl<E: Evictable> Clone for CachedPtr<E> {
    fn clone(&self) -> Self {
        // SAFETY: see the `unsafe impl Send/Sync` justification above.
        unsafe { (*self.ref_count).fetch_add(1, Ordering::SeqCst) };
        CachedPtr {
            evictable: self.evictable.clone(),
            ref_count: self.ref_count,
        }
    }
}

impl<E: Evictable> Drop for CachedPtr<E> {
    fn drop(&mut self) {
        // SAFETY: see the `unsafe impl Send/Sync` justification above.
        unsafe { (*self.ref_count).fetch_sub(1, Ordering::SeqCst) };
    }
}
