//! Reader/writer lock primitives for log records
//!
//! Records are guarded by `lock_api::RwLock<RawRecordLock, _>`. The raw lock is
//! either the plain `parking_lot` lock or [`BiasedRawRwLock`], a read-biased
//! lock whose readers publish themselves in a process-wide table instead of
//! touching the lock word. A writer revokes the bias, drains the published
//! readers, and keeps the bias off for a window proportional to how long the
//! revocation took. The `biased-lock` feature selects the biased variant.

use once_cell::sync::Lazy;
use parking_lot::lock_api::{self, GuardNoSend, RawRwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;

/// Raw lock used by every log record.
#[cfg(not(feature = "biased-lock"))]
pub type RawRecordLock = parking_lot::RawRwLock;

/// Raw lock used by every log record.
#[cfg(feature = "biased-lock")]
pub type RawRecordLock = BiasedRawRwLock;

/// Reader/writer lock over record state.
pub type RecordRwLock<T> = lock_api::RwLock<RawRecordLock, T>;
/// Shared guard of a [`RecordRwLock`].
pub type RecordReadGuard<'a, T> = lock_api::RwLockReadGuard<'a, RawRecordLock, T>;
/// Exclusive guard of a [`RecordRwLock`].
pub type RecordWriteGuard<'a, T> = lock_api::RwLockWriteGuard<'a, RawRecordLock, T>;

const VISIBLE_SLOTS: usize = 4096;
const INHIBIT_MULTIPLIER: u64 = 9;

/// Published fast-path readers: each slot holds the address of a lock one
/// thread is reading, or zero.
static VISIBLE_READERS: [AtomicUsize; VISIBLE_SLOTS] = [const { AtomicUsize::new(0) }; VISIBLE_SLOTS];

static CLOCK_BASE: Lazy<Instant> = Lazy::new(Instant::now);
static NEXT_THREAD_TAG: AtomicUsize = AtomicUsize::new(1);

thread_local! {
    static THREAD_TAG: usize = NEXT_THREAD_TAG.fetch_add(1, Ordering::Relaxed);
}

#[inline]
fn now_nanos() -> u64 {
    CLOCK_BASE.elapsed().as_nanos() as u64
}

/// Read-biased reader/writer lock with writer revocation.
pub struct BiasedRawRwLock {
    inner: parking_lot::RawRwLock,
    rbias: AtomicBool,
    inhibit_until: AtomicU64, // nanos since CLOCK_BASE
}

impl BiasedRawRwLock {
    #[inline]
    fn addr(&self) -> usize {
        self as *const Self as usize
    }

    #[inline]
    fn slot(&self) -> &'static AtomicUsize {
        let tag = THREAD_TAG.with(|t| *t) as u64;
        let mixed = (self.addr() as u64 ^ tag.rotate_left(32)).wrapping_mul(0x9E37_79B9_7F4A_7C15);
        &VISIBLE_READERS[(mixed >> 52) as usize & (VISIBLE_SLOTS - 1)]
    }

    fn try_fast_read(&self) -> bool {
        if !self.rbias.load(Ordering::Acquire) {
            return false;
        }
        let slot = self.slot();
        if slot
            .compare_exchange(0, self.addr(), Ordering::SeqCst, Ordering::Relaxed)
            .is_ok()
        {
            if self.rbias.load(Ordering::SeqCst) {
                return true;
            }
            // lost against a revoking writer
            slot.store(0, Ordering::Release);
        }
        false
    }

    fn restore_bias(&self) {
        if !self.rbias.load(Ordering::Relaxed)
            && now_nanos() >= self.inhibit_until.load(Ordering::Relaxed)
        {
            self.rbias.store(true, Ordering::Release);
        }
    }

    /// Turn the bias off and drain published readers. Must be called with the
    /// inner lock held exclusively. Without `wait`, gives up on the first
    /// visible reader and returns false.
    fn revoke(&self, wait: bool) -> bool {
        self.rbias.store(false, Ordering::SeqCst);
        let start = now_nanos();
        let addr = self.addr();
        for slot in VISIBLE_READERS.iter() {
            while slot.load(Ordering::Acquire) == addr {
                if !wait {
                    return false;
                }
                std::thread::yield_now();
            }
        }
        let now = now_nanos();
        self.inhibit_until
            .store(now + (now - start) * INHIBIT_MULTIPLIER, Ordering::Relaxed);
        true
    }

    /// Whether readers currently take the table fast path.
    pub fn is_biased(&self) -> bool {
        self.rbias.load(Ordering::Acquire)
    }
}

unsafe impl RawRwLock for BiasedRawRwLock {
    const INIT: Self = Self {
        inner: <parking_lot::RawRwLock as RawRwLock>::INIT,
        rbias: AtomicBool::new(true),
        inhibit_until: AtomicU64::new(0),
    };

    // the visible-reader slot is keyed by the locking thread
    type GuardMarker = GuardNoSend;

    fn lock_shared(&self) {
        if self.try_fast_read() {
            return;
        }
        self.inner.lock_shared();
        self.restore_bias();
    }

    fn try_lock_shared(&self) -> bool {
        if self.try_fast_read() {
            return true;
        }
        if self.inner.try_lock_shared() {
            self.restore_bias();
            true
        } else {
            false
        }
    }

    unsafe fn unlock_shared(&self) {
        let released = self
            .slot()
            .compare_exchange(self.addr(), 0, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok();
        if !released {
            self.inner.unlock_shared();
        }
    }

    fn lock_exclusive(&self) {
        self.inner.lock_exclusive();
        if self.rbias.load(Ordering::Acquire) {
            self.revoke(true);
        }
    }

    fn try_lock_exclusive(&self) -> bool {
        if !self.inner.try_lock_exclusive() {
            return false;
        }
        if self.rbias.load(Ordering::Acquire) && !self.revoke(false) {
            unsafe { self.inner.unlock_exclusive() };
            return false;
        }
        true
    }

    unsafe fn unlock_exclusive(&self) {
        self.inner.unlock_exclusive();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    type Biased<T> = lock_api::RwLock<BiasedRawRwLock, T>;

    #[test]
    fn biased_readers_share_and_writer_excludes() {
        // Goal: fast-path readers coexist; a try-write fails while any reader is visible
        let lock = Biased::new(7u32);
        let r1 = lock.read();
        let r2 = lock.try_read().expect("second reader");
        assert_eq!(*r1 + *r2, 14);
        assert!(lock.try_write().is_none());
        drop(r1);
        drop(r2);
        let mut w = lock.try_write().expect("writer after readers left");
        *w = 9;
        drop(w);
        assert_eq!(*lock.read(), 9);
    }

    #[test]
    fn writer_revokes_bias_then_readers_restore_it() {
        // Goal: a writer turns the bias off; slow readers turn it back on after the inhibit window
        let lock = Biased::new(0u64);
        assert!(unsafe { lock.raw() }.is_biased());
        *lock.write() += 1;
        assert!(!unsafe { lock.raw() }.is_biased());
        std::thread::sleep(std::time::Duration::from_millis(5));
        drop(lock.read());
        assert!(unsafe { lock.raw() }.is_biased());
    }

    #[test]
    fn biased_lock_counts_under_contention() {
        // Goal: mixed readers and writers never lose an increment
        let lock = Arc::new(Biased::new(0u64));
        let threads: Vec<_> = (0..8)
            .map(|i| {
                let lock = lock.clone();
                std::thread::spawn(move || {
                    for _ in 0..2_000 {
                        if i % 2 == 0 {
                            *lock.write() += 1;
                        } else {
                            let v = *lock.read();
                            assert!(v <= 8_000);
                        }
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(*lock.read(), 8_000);
    }

    #[test]
    fn record_lock_alias_supports_try_locks() {
        let lock = RecordRwLock::new(1u8);
        let g = lock.try_write().unwrap();
        assert!(lock.try_read().is_none());
        drop(g);
        assert!(lock.try_read().is_some());
    }
}
