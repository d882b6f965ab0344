//! Handle pool with per-thread provider/collector caches.
//!
//! Each thread keeps, per pool, a provider (handles ready to hand out) and a
//! collector (handles given back). Acquire and release only touch those; the
//! pool mutex is taken when a provider runs dry or a collector holds more than
//! `retained` full batches, so lock traffic drops by a factor of `skip_unit`.
//! A thread's caches are returned to the pool when the thread exits.

use super::freelist::{Batch, FreeList};
use crate::core::error::{Error, ObjectClass, Result};
use crate::system::metrics::Metrics;
use parking_lot::Mutex;
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::trace;

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CACHES: RefCell<HashMap<u64, ThreadCache>> = RefCell::new(HashMap::new());
}

/// Exclusive claim on one pooled object.
///
/// Not `Clone`: whoever holds the handle owns the slot until it is given back.
#[derive(Debug, PartialEq, Eq)]
pub struct Handle(u32);

impl Handle {
    /// Slot index inside the catalogue.
    #[inline]
    pub fn index(&self) -> usize {
        self.0 as usize
    }

    /// Give up the typed claim, e.g. to publish the slot in a shared index.
    #[inline]
    pub(crate) fn into_raw(self) -> u32 {
        self.0
    }

    /// Re-take a claim previously published with [`Handle::into_raw`].
    #[inline]
    pub(crate) fn from_raw(raw: u32) -> Self {
        Handle(raw)
    }
}

struct PoolShared {
    id: u64,
    class: ObjectClass,
    capacity: usize,
    skip_unit: usize,
    retained: usize,
    global: Mutex<FreeList>,
}

/// Fixed-size pool of slot handles for one object class.
pub(crate) struct SlotPool {
    shared: Arc<PoolShared>,
}

/// Per-thread staging for one pool.
struct ThreadCache {
    provider: Vec<u32>,
    collecting: Batch,  // partially filled collector batch
    collected: Vec<Batch>, // full collector batches, oldest first
    home: Weak<PoolShared>,
}

impl ThreadCache {
    fn new(home: &Arc<PoolShared>) -> Self {
        Self {
            provider: Vec::new(),
            collecting: Batch::with_capacity(home.skip_unit),
            collected: Vec::new(),
            home: Arc::downgrade(home),
        }
    }

    fn held(&self) -> usize {
        self.provider.len()
            + self.collecting.len()
            + self.collected.iter().map(Batch::len).sum::<usize>()
    }

    fn drain_into(&mut self, list: &mut FreeList) {
        list.splice(Batch(std::mem::take(&mut self.provider)));
        list.splice(std::mem::take(&mut self.collecting));
        for batch in self.collected.drain(..) {
            list.splice(batch);
        }
    }
}

impl Drop for ThreadCache {
    fn drop(&mut self) {
        if let Some(home) = self.home.upgrade() {
            let mut global = home.global.lock();
            self.drain_into(&mut global);
        }
    }
}

impl SlotPool {
    /// Pool of `capacity` handles (rounded down to whole batches).
    pub(crate) fn new(class: ObjectClass, capacity: usize, skip_unit: usize, retained: usize) -> Self {
        let capacity = capacity - capacity % skip_unit;
        Self {
            shared: Arc::new(PoolShared {
                id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
                class,
                capacity,
                skip_unit,
                retained,
                global: Mutex::new(FreeList::filled(capacity, skip_unit)),
            }),
        }
    }

    /// Total handles owned by the pool, wherever they currently sit.
    pub(crate) fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Handles in the global list.
    pub(crate) fn available(&self) -> usize {
        self.shared.global.lock().len()
    }

    /// Entries in the global skip directory.
    pub(crate) fn skip_len(&self) -> usize {
        self.shared.global.lock().skip_len()
    }

    /// Handles parked in the calling thread's caches.
    pub(crate) fn cached_here(&self) -> usize {
        CACHES
            .try_with(|c| c.borrow().get(&self.shared.id).map_or(0, ThreadCache::held))
            .unwrap_or(0)
    }

    /// Take a handle, refilling the thread's provider from the pool when empty.
    pub(crate) fn acquire(&self) -> Result<Handle> {
        let cached = CACHES.try_with(|c| {
            let mut caches = c.borrow_mut();
            let cache = self.cache_in(&mut caches);
            if let Some(h) = cache.provider.pop() {
                return Ok(Handle(h));
            }
            self.refill(cache)?;
            cache.provider.pop().map(Handle).ok_or(Error::PoolExhausted(self.shared.class))
        });
        match cached {
            Ok(result) => result,
            // thread-local storage already torn down: go straight to the pool
            Err(_) => self
                .shared
                .global
                .lock()
                .pop()
                .map(Handle)
                .ok_or(Error::PoolExhausted(self.shared.class)),
        }
    }

    /// Give a handle back to the calling thread's collector.
    pub(crate) fn release(&self, handle: Handle) {
        let raw = handle.into_raw();
        debug_assert!((raw as usize) < self.shared.capacity);
        let cached = CACHES.try_with(|c| {
            let mut caches = c.borrow_mut();
            let cache = self.cache_in(&mut caches);
            cache.collecting.0.push(raw);
            if cache.collecting.len() == self.shared.skip_unit {
                let full = std::mem::replace(
                    &mut cache.collecting,
                    Batch::with_capacity(self.shared.skip_unit),
                );
                cache.collected.push(full);
                if cache.collected.len() > self.shared.retained {
                    let spill = cache.collected.remove(0);
                    self.shared.global.lock().splice(spill);
                    Metrics::global().pool_spills.inc();
                    trace!(class = %self.shared.class, "collector batch spilled");
                }
            }
        });
        if cached.is_err() {
            self.shared.global.lock().push(raw);
        }
    }

    /// Return everything the calling thread caches for this pool.
    pub(crate) fn flush_local(&self) {
        let _ = CACHES.try_with(|c| {
            if let Some(mut cache) = c.borrow_mut().remove(&self.shared.id) {
                let mut global = self.shared.global.lock();
                cache.drain_into(&mut global);
            }
        });
    }

    fn cache_in<'a>(&self, caches: &'a mut HashMap<u64, ThreadCache>) -> &'a mut ThreadCache {
        if !caches.contains_key(&self.shared.id) {
            // entries of dropped pools are dead weight
            caches.retain(|_, c| c.home.strong_count() > 0);
        }
        caches
            .entry(self.shared.id)
            .or_insert_with(|| ThreadCache::new(&self.shared))
    }

    fn refill(&self, cache: &mut ThreadCache) -> Result<()> {
        // recycle this thread's own returns before touching the pool
        if let Some(batch) = cache.collected.pop() {
            cache.provider = batch.0;
            return Ok(());
        }
        let detached = self.shared.global.lock().detach();
        match detached {
            Some(batch) => {
                Metrics::global().pool_refills.inc();
                trace!(class = %self.shared.class, n = batch.len(), "provider refilled");
                cache.provider = batch.0;
                Ok(())
            }
            None if !cache.collecting.is_empty() => {
                cache.provider = std::mem::take(&mut cache.collecting).0;
                Ok(())
            }
            None => Err(Error::PoolExhausted(self.shared.class)),
        }
    }
}
