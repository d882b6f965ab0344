//! Pool allocator for every fixed-size object the engine uses.
//!
//! Four catalogues are pre-sized at start-up and never grow: mapping
//! descriptors, radix nodes, log records, and log data buffers (one pool per
//! granule class). Their persistent parts live in files under a
//! process-private scratch directory that is removed when the allocator drops.
//!
//! ```text
//!   <pmem_path>/.pmem-mmio-<pid>-XXXX/
//!       mmio-0.log        4 words per descriptor (epoch, inode, size, policy)
//!       index-0.log       2 words per log record (packed meta, granule base)
//!       logs-4K.log ...   one file per granule class
//! ```

mod arena;
mod freelist;
mod pool;

#[cfg(test)]
mod tests;

pub use arena::LogBuf;
pub use pool::Handle;

use crate::constants::{DESCRIPTOR_WORDS, RECORD_WORDS};
use crate::core::config::Config;
use crate::core::error::{ObjectClass, Result};
use crate::mmio::{LogRecord, RecordState};
use crate::radix::{Granule, NodeKind, RadixNode};
use arena::{Backing, LogArena};
use pool::SlotPool;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use tracing::info;

/// Occupancy of one catalogue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    /// Catalogue
    pub class: ObjectClass,
    /// Objects the catalogue owns in total
    pub capacity: usize,
    /// Objects currently in the global free list
    pub available: usize,
    /// Entries in the global skip directory
    pub skip_entries: usize,
}

/// Owner of all object catalogues.
pub struct Allocator {
    descriptors: SlotPool,
    descriptor_store: Backing,
    nodes: Box<[RadixNode]>,
    node_pool: SlotPool,
    records: Box<[LogRecord]>,
    record_store: Backing,
    record_pool: SlotPool,
    logs: Vec<LogArena>,
    sync_on_flush: bool,
    scratch: TempDir, // dropped last so the mappings go first
}

impl Allocator {
    /// Create the scratch directory and every catalogue.
    pub fn new(config: &Config) -> Result<Arc<Self>> {
        let cfg = &config.allocator;
        std::fs::create_dir_all(&config.storage.pmem_path)?;
        let scratch = tempfile::Builder::new()
            .prefix(&format!(".pmem-mmio-{}-", std::process::id()))
            .tempdir_in(&config.storage.pmem_path)?;
        let dir = scratch.path();

        let region_count = cfg.region_count - cfg.region_count % cfg.region_skip_unit;
        let node_count = cfg.node_count - cfg.node_count % cfg.skip_unit;
        let record_count = cfg.record_count - cfg.record_count % cfg.skip_unit;

        let descriptor_store = Backing::create(dir, "mmio-0.log", (region_count * DESCRIPTOR_WORDS * 8) as u64)?;
        let record_store = Backing::create(dir, "index-0.log", (record_count * RECORD_WORDS * 8) as u64)?;
        let logs = Granule::ALL
            .into_iter()
            .map(|g| LogArena::new(dir, g, cfg.log_pool_bytes, cfg.skip_unit, cfg.retained_batches))
            .collect::<Result<Vec<_>>>()?;

        info!(
            dir = %dir.display(),
            regions = region_count,
            nodes = node_count,
            records = record_count,
            log_bytes_per_class = cfg.log_pool_bytes,
            "allocator initialised"
        );

        Ok(Arc::new(Self {
            descriptors: SlotPool::new(ObjectClass::Descriptor, region_count, cfg.region_skip_unit, cfg.retained_batches),
            descriptor_store,
            nodes: (0..node_count).map(|_| RadixNode::new()).collect(),
            node_pool: SlotPool::new(ObjectClass::Node, node_count, cfg.skip_unit, cfg.retained_batches),
            records: (0..record_count).map(|_| LogRecord::new()).collect(),
            record_store,
            record_pool: SlotPool::new(ObjectClass::Record, record_count, cfg.skip_unit, cfg.retained_batches),
            logs,
            sync_on_flush: config.storage.sync_on_flush,
            scratch,
        }))
    }

    /// Directory holding the backing files.
    pub fn scratch_dir(&self) -> &std::path::Path {
        self.scratch.path()
    }

    /// Whether persistence barriers also msync.
    pub fn sync_on_flush(&self) -> bool {
        self.sync_on_flush
    }

    // ---- radix nodes ----

    /// Node behind a raw handle.
    #[inline]
    pub(crate) fn node(&self, raw: u32) -> &RadixNode {
        &self.nodes[raw as usize]
    }

    /// A node of `kind` with no children and no granule.
    pub(crate) fn acquire_node(&self, kind: NodeKind) -> Result<Handle> {
        let handle = self.node_pool.acquire()?;
        self.nodes[handle.index()].reset(kind);
        Ok(handle)
    }

    pub(crate) fn release_node(&self, handle: Handle) {
        self.nodes[handle.index()].reset(NodeKind::Leaf);
        self.node_pool.release(handle);
    }

    // ---- log records ----

    /// Record behind a raw handle.
    #[inline]
    pub(crate) fn record(&self, raw: u32) -> &LogRecord {
        &self.records[raw as usize]
    }

    pub(crate) fn acquire_record(&self) -> Result<Handle> {
        self.record_pool.acquire()
    }

    /// Return a record whose state was already cleared by the caller.
    pub(crate) fn release_record(&self, handle: Handle) {
        self.record_pool.release(handle);
    }

    /// Clear a record that no one else can reach and return it with its buffer.
    pub(crate) fn reclaim_record(&self, handle: Handle) {
        let log = {
            let mut state = self.records[handle.index()].lock().write();
            state.clear()
        };
        self.clear_record_meta(handle.index() as u32);
        if let Some(buf) = log {
            self.release_log(buf);
        }
        self.release_record(handle);
    }

    /// Mirror a record's metadata into its persistent slot.
    pub(crate) fn persist_record(&self, raw: u32, state: &RecordState) -> Result<()> {
        let base = raw as usize * RECORD_WORDS;
        let words = self.record_store.words();
        words[base].store(state.packed(), Ordering::Relaxed);
        words[base + 1].store(state.dst, Ordering::Relaxed);
        self.record_store.persist(base * 8, RECORD_WORDS * 8, self.sync_on_flush)
    }

    pub(crate) fn clear_record_meta(&self, raw: u32) {
        let base = raw as usize * RECORD_WORDS;
        let words = self.record_store.words();
        words[base].store(0, Ordering::Relaxed);
        words[base + 1].store(0, Ordering::Relaxed);
    }

    /// Persistent metadata word of a record (packed epoch/offset/len/policy).
    pub fn record_meta(&self, raw: u32) -> u64 {
        self.record_store.words()[raw as usize * RECORD_WORDS].load(Ordering::Relaxed)
    }

    // ---- log buffers ----

    pub(crate) fn acquire_log(&self, granule: Granule) -> Result<LogBuf> {
        self.logs[granule.index()].acquire()
    }

    pub(crate) fn release_log(&self, buf: LogBuf) {
        self.logs[buf.granule().index()].release(buf);
    }

    /// Persistence barrier over part of a log buffer.
    pub(crate) fn persist_log(&self, buf: &LogBuf, offset: usize, len: usize) -> Result<()> {
        self.logs[buf.granule().index()].persist(buf, offset, len, self.sync_on_flush)
    }

    // ---- mapping descriptors ----

    pub(crate) fn acquire_descriptor(&self) -> Result<Handle> {
        let handle = self.descriptors.acquire()?;
        for word in self.descriptor_words(&handle) {
            word.store(0, Ordering::Relaxed);
        }
        Ok(handle)
    }

    pub(crate) fn release_descriptor(&self, handle: Handle) {
        self.descriptors.release(handle);
    }

    /// Persistent words of a descriptor: epoch, inode, file size, policy.
    pub(crate) fn descriptor_words(&self, handle: &Handle) -> &[AtomicU64] {
        let base = handle.index() * DESCRIPTOR_WORDS;
        &self.descriptor_store.words()[base..base + DESCRIPTOR_WORDS]
    }

    pub(crate) fn persist_descriptor(&self, handle: &Handle) -> Result<()> {
        self.descriptor_store.persist(
            handle.index() * DESCRIPTOR_WORDS * 8,
            DESCRIPTOR_WORDS * 8,
            self.sync_on_flush,
        )
    }

    // ---- census ----

    fn pools(&self) -> impl Iterator<Item = (ObjectClass, &SlotPool)> {
        [
            (ObjectClass::Descriptor, &self.descriptors),
            (ObjectClass::Node, &self.node_pool),
            (ObjectClass::Record, &self.record_pool),
        ]
        .into_iter()
        .chain(self.logs.iter().zip(Granule::ALL).map(|(a, g)| (ObjectClass::Log(g), a.pool())))
    }

    /// Occupancy of every catalogue.
    pub fn stats(&self) -> Vec<PoolStats> {
        self.pools()
            .map(|(class, pool)| PoolStats {
                class,
                capacity: pool.capacity(),
                available: pool.available(),
                skip_entries: pool.skip_len(),
            })
            .collect()
    }

    /// Objects of `class` parked in the calling thread's caches.
    pub fn cached_here(&self, class: ObjectClass) -> usize {
        self.pools()
            .find(|(c, _)| *c == class)
            .map_or(0, |(_, pool)| pool.cached_here())
    }

    /// Hand every object cached by the calling thread back to the global pools.
    pub fn flush_thread_caches(&self) {
        for (_, pool) in self.pools() {
            pool.flush_local();
        }
    }
}
