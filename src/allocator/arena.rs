//! Persistent backing stores and log data buffers.

use super::pool::{Handle, SlotPool};
use crate::core::error::{ObjectClass, Result};
use crate::radix::Granule;
use memmap2::{MmapOptions, MmapRaw};
use std::fs::OpenOptions;
use std::path::Path;
use std::ptr::NonNull;
use std::sync::atomic::{fence, AtomicU64, Ordering};

/// One pre-sized, zero-filled, shared mapping of a scratch file.
pub(crate) struct Backing {
    map: MmapRaw,
    len: usize,
}

impl Backing {
    pub(crate) fn create(dir: &Path, name: &str, len: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(dir.join(name))?;
        file.set_len(len)?;
        let map = MmapOptions::new().len(len as usize).map_raw(&file)?;
        Ok(Self { map, len: len as usize })
    }

    #[inline]
    pub(crate) fn as_mut_ptr(&self) -> *mut u8 {
        self.map.as_mut_ptr()
    }

    /// The store viewed as 64-bit words.
    pub(crate) fn words(&self) -> &[AtomicU64] {
        // SAFETY: the mapping is page aligned, lives as long as `self`, and is
        // only ever accessed through atomics.
        unsafe { std::slice::from_raw_parts(self.map.as_ptr() as *const AtomicU64, self.len / 8) }
    }

    /// Persistence barrier over `[offset, offset + len)`.
    pub(crate) fn persist(&self, offset: usize, len: usize, sync: bool) -> Result<()> {
        fence(Ordering::SeqCst);
        if sync && len > 0 {
            self.map.flush_range(offset, len)?;
        }
        Ok(())
    }
}

/// Exclusively owned log data buffer of one granule.
///
/// Points into its class's backing store, which the allocator keeps mapped
/// for as long as any buffer can be alive.
pub struct LogBuf {
    ptr: NonNull<u8>,
    granule: Granule,
    handle: Handle,
}

// SAFETY: a LogBuf is the only path to its bytes and is not Clone.
unsafe impl Send for LogBuf {}
unsafe impl Sync for LogBuf {}

impl LogBuf {
    /// Size class of the buffer.
    #[inline]
    pub fn granule(&self) -> Granule {
        self.granule
    }

    /// Buffer contents.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.granule.size()) }
    }

    /// Mutable buffer contents.
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.granule.size()) }
    }
}

impl std::fmt::Debug for LogBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogBuf")
            .field("granule", &self.granule)
            .field("slot", &self.handle.index())
            .finish()
    }
}

/// Log buffers of one granule class.
pub(crate) struct LogArena {
    granule: Granule,
    store: Backing,
    pool: SlotPool,
}

impl LogArena {
    pub(crate) fn new(dir: &Path, granule: Granule, bytes: u64, skip_unit: usize, retained: usize) -> Result<Self> {
        let count = (bytes >> granule.shift()) as usize;
        let count = count - count % skip_unit;
        let store = Backing::create(dir, &format!("logs-{}.log", granule), (count * granule.size()) as u64)?;
        Ok(Self {
            granule,
            store,
            pool: SlotPool::new(ObjectClass::Log(granule), count, skip_unit, retained),
        })
    }

    pub(crate) fn acquire(&self) -> Result<LogBuf> {
        let handle = self.pool.acquire()?;
        // SAFETY: handle < count, so the buffer lies inside the non-null mapping
        let ptr = unsafe {
            NonNull::new_unchecked(self.store.as_mut_ptr().add(handle.index() * self.granule.size()))
        };
        Ok(LogBuf {
            ptr,
            granule: self.granule,
            handle,
        })
    }

    pub(crate) fn release(&self, buf: LogBuf) {
        debug_assert_eq!(buf.granule, self.granule);
        self.pool.release(buf.handle);
    }

    pub(crate) fn persist(&self, buf: &LogBuf, offset: usize, len: usize, sync: bool) -> Result<()> {
        self.store
            .persist(buf.handle.index() * self.granule.size() + offset, len, sync)
    }

    pub(crate) fn pool(&self) -> &SlotPool {
        &self.pool
    }
}
