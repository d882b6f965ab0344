//! Mapped-region engine
//!
//! One [`MappedRegion`] per open inode. Writes are logged per granule before
//! (undo) or instead of (redo) touching the mapped image; reads either copy
//! straight from the image or splice log and image bytes; checkpoint
//! reconciles stale-epoch records with the image and hands them back to the
//! allocator; commit advances the epoch and may switch the logging policy.
//!
//! Locks are taken outside-in: region lock, then record locks in ascending
//! offset order, then (inside the allocator) a pool mutex.

mod checkpoint;
mod mapping;
mod overlap;
mod record;


pub use checkpoint::CheckpointStats;
pub use mapping::Access;
pub use overlap::{Overlap, Piece};
pub use record::{pack_meta, unpack_meta, LogRecord, Policy, RecordState};

use crate::allocator::{Allocator, Handle};
use crate::constants::LEAF_SPAN;
use crate::core::config::EngineConfig;
use crate::core::error::{Error, Result};
use crate::core::lock::RecordRwLock;
use crate::radix::{Granule, Leaf, RadixLog};
use crate::system::metrics::Metrics;
use checkpoint::CheckpointTask;
use mapping::Mapping;
use parking_lot::{Mutex, RwLock};
use std::fs::File;
use std::ops::{Deref, Range};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// Region-wide state guarded by the region lock.
struct RegionState {
    mapping: Option<Mapping>, // None once closed
    epoch: u64,
    policy: Policy,
}

/// One locked record and the part of the request it covers.
struct Locked<G> {
    record: u32,
    file_off: u64,
    in_off: usize,   // start inside the granule
    len: usize,
    data_off: usize, // start inside the caller's buffer
    guard: G,
}

/// A file mapped into memory with crash-consistent logging of every write.
pub struct MappedRegion {
    ino: u64,
    alloc: Arc<Allocator>,
    settings: EngineConfig,
    state: RwLock<RegionState>,
    index: RadixLog,
    fsize: AtomicU64,
    reads: AtomicU64,
    writes: AtomicU64,
    refs: AtomicUsize,
    closed: AtomicBool,
    descriptor: Mutex<Option<Handle>>,
    checkpointer: Mutex<Option<CheckpointTask>>,
}

impl MappedRegion {
    /// Map `file` (currently `size` bytes long) and start its checkpoint task.
    pub fn open(
        alloc: Arc<Allocator>,
        settings: &EngineConfig,
        file: File,
        access: Access,
        ino: u64,
        size: u64,
    ) -> Result<Arc<Self>> {
        if size > settings.max_region_size {
            return Err(Error::RegionFull { requested: size, max: settings.max_region_size });
        }
        let map_len = if size == 0 { settings.default_map_size } else { size };
        let mapping = Mapping::new(file, map_len, access)?;
        let index = RadixLog::new(alloc.clone(), settings.max_region_size)?;
        let descriptor = alloc.acquire_descriptor()?;

        let epoch = 1;
        let words = alloc.descriptor_words(&descriptor);
        words[0].store(epoch, Ordering::Relaxed);
        words[1].store(ino, Ordering::Relaxed);
        words[2].store(size, Ordering::Relaxed);
        words[3].store(settings.default_policy as u64, Ordering::Relaxed);
        alloc.persist_descriptor(&descriptor)?;

        let region = Arc::new(Self {
            ino,
            alloc,
            settings: settings.clone(),
            state: RwLock::new(RegionState {
                mapping: Some(mapping),
                epoch,
                policy: settings.default_policy,
            }),
            index,
            fsize: AtomicU64::new(size),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            refs: AtomicUsize::new(1),
            closed: AtomicBool::new(false),
            descriptor: Mutex::new(Some(descriptor)),
            checkpointer: Mutex::new(None),
        });

        if !settings.checkpoint_period.is_zero() {
            let task = CheckpointTask::spawn(Arc::downgrade(&region), ino, settings.checkpoint_period)?;
            *region.checkpointer.lock() = Some(task);
        }

        info!(
            ino,
            size,
            map_len,
            ?access,
            policy = %settings.default_policy,
            root = ?region.index.root_kind(),
            "region opened"
        );
        Ok(region)
    }

    // ---- accessors ----

    /// Inode this region maps.
    pub fn ino(&self) -> u64 {
        self.ino
    }

    /// Logical file size.
    pub fn file_size(&self) -> u64 {
        self.fsize.load(Ordering::Acquire)
    }

    /// Current length of the mapping.
    pub fn mapped_len(&self) -> u64 {
        self.state.read().mapping.as_ref().map_or(0, Mapping::len)
    }

    /// Current epoch.
    pub fn epoch(&self) -> u64 {
        self.state.read().epoch
    }

    /// Active logging policy.
    pub fn policy(&self) -> Policy {
        self.state.read().policy
    }

    /// The region's radix log index.
    pub fn index(&self) -> &RadixLog {
        &self.index
    }

    /// Open references held through the region table.
    pub fn ref_count(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }

    pub(crate) fn retain(&self) {
        self.refs.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop one reference; true when it was the last.
    pub(crate) fn release(&self) -> bool {
        self.refs.fetch_sub(1, Ordering::AcqRel) == 1
    }

    /// Whether [`MappedRegion::close`] has run.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Absolute byte range logged by the record governing `offset`, if any.
    pub fn record_span(&self, offset: u64) -> Option<Range<u64>> {
        let leaf = self.index.find(offset)?;
        let granule = leaf.node().granule()?;
        let raw = leaf.node().child(granule.slot(offset))?;
        let state = self.alloc.record(raw).lock().read();
        (state.live && state.len > 0).then(|| {
            let start = state.dst + state.offset as u64;
            start..start + state.len as u64
        })
    }

    /// Number of records currently installed in the index.
    pub fn live_records(&self) -> usize {
        let end = self.mapped_len();
        let mut count = 0;
        let mut off = 0;
        while off < end {
            if let Some(leaf) = self.index.find(off) {
                if let Some(granule) = leaf.node().granule() {
                    count += (0..granule.entries()).filter(|&i| leaf.node().child(i).is_some()).count();
                }
            }
            off += LEAF_SPAN;
        }
        count
    }

    // ---- write path ----

    /// Write `buf` at `offset`, growing the mapping when needed.
    pub fn write(&self, offset: u64, buf: &[u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let end = offset
            .checked_add(buf.len() as u64)
            .filter(|&end| end <= self.settings.max_region_size)
            .ok_or(Error::RegionFull { requested: offset.saturating_add(buf.len() as u64), max: self.settings.max_region_size })?;

        let state = {
            let state = self.state.read();
            let mapping = state.mapping.as_ref().ok_or(Error::Closed)?;
            if !mapping.access().writable() {
                return Err(Error::ReadOnly);
            }
            if end > mapping.len() {
                drop(state);
                self.grow_to(end)?;
                self.state.read()
            } else {
                state
            }
        };
        let mapping = state.mapping.as_ref().ok_or(Error::Closed)?;

        let mut segments = self.lock_segments(&state, offset, buf.len(), |lock| lock.try_write())?;
        for seg in segments.iter_mut() {
            let data = &buf[seg.data_off..seg.data_off + seg.len];
            self.log_segment(mapping, &state, seg, data)?;
        }

        self.writes.fetch_add(1, Ordering::Relaxed);
        if state.policy == Policy::Undo {
            mapping.write_from(offset, buf);
            mapping.persist(offset..end, self.alloc.sync_on_flush())?;
        }
        self.fsize.fetch_max(end, Ordering::AcqRel);
        drop(segments);

        let metrics = Metrics::global();
        metrics.writes.inc();
        metrics.bytes_written.inc_by(buf.len() as u64);
        Ok(buf.len())
    }

    /// Log one granule's share of a write into its locked record.
    fn log_segment<G>(&self, mapping: &Mapping, region: &RegionState, seg: &mut Locked<G>, data: &[u8]) -> Result<()>
    where
        G: std::ops::DerefMut<Target = RecordState>,
    {
        let st = &mut *seg.guard;
        if st.epoch < region.epoch {
            // never mix data from two epochs in one record
            self.apply_redo(mapping, st)?;
            st.reset(region.epoch, region.policy);
        }
        st.policy = region.policy;

        let req = seg.in_off..seg.in_off + seg.len;
        let (span, gap, capture) = if st.len == 0 {
            (req.clone(), None, [Some(req.clone()), None])
        } else {
            let logged = st.span();
            let case = Overlap::classify(&req, &logged);
            trace!(ino = self.ino, case = case.case(), ?req, ?logged, "merging into record");
            let (span, gap) = case.merge(&req, &logged);
            (span, gap, case.uncovered(&req, &logged))
        };

        match region.policy {
            Policy::Undo => {
                // keep the epoch's first value of every byte
                for r in capture.into_iter().flatten() {
                    mapping.read_into(st.dst + r.start as u64, &mut st.log_mut()[r]);
                }
            }
            Policy::Redo => st.log_mut()[req].copy_from_slice(data),
        }
        if let Some(gap) = gap {
            mapping.read_into(st.dst + gap.start as u64, &mut st.log_mut()[gap]);
        }
        st.offset = span.start;
        st.len = span.len();

        if let Some(log) = st.log.as_ref() {
            self.alloc.persist_log(log, span.start, span.len())?;
        }
        self.alloc.persist_record(seg.record, st)
    }

    /// Grow the mapping until it covers `end`. Rechecks under the exclusive
    /// lock since another writer may have grown it meanwhile.
    fn grow_to(&self, end: u64) -> Result<()> {
        let max = self.settings.max_region_size;
        if end > max {
            return Err(Error::RegionFull { requested: end, max });
        }
        let mut state = self.state.write();
        let mapping = state.mapping.as_mut().ok_or(Error::Closed)?;
        while mapping.len() < end {
            let cur = mapping.len();
            let next = if cur >= self.settings.growth_base { cur * 2 } else { self.settings.growth_base };
            let next = next.min(max);
            mapping.grow(next)?;
            Metrics::global().region_growths.inc();
            debug!(ino = self.ino, from = cur, to = next, "region grown");
        }
        Ok(())
    }

    // ---- read path ----

    /// Read up to `buf.len()` bytes at `offset`; short at end of file.
    pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let state = self.state.read();
        let mapping = state.mapping.as_ref().ok_or(Error::Closed)?;
        // empty and past-EOF reads still weigh in the write ratio
        self.reads.fetch_add(1, Ordering::Relaxed);
        let metrics = Metrics::global();
        metrics.reads.inc();

        let fsize = self.fsize.load(Ordering::Acquire);
        if buf.is_empty() || offset >= fsize {
            return Ok(0);
        }
        let len = buf.len().min((fsize - offset) as usize);
        let out = &mut buf[..len];

        let segments = self.lock_segments(&state, offset, len, |lock| lock.try_read())?;
        match state.policy {
            Policy::Undo => mapping.read_into(offset, out),
            Policy::Redo => {
                for seg in &segments {
                    self.splice_segment(mapping, seg, &mut out[seg.data_off..seg.data_off + seg.len]);
                }
            }
        }
        drop(segments);
        metrics.bytes_read.inc_by(len as u64);
        Ok(len)
    }

    /// Fill `out` for one segment from the record's log where it holds the
    /// newest bytes, and from the image elsewhere.
    fn splice_segment<G>(&self, mapping: &Mapping, seg: &Locked<G>, out: &mut [u8])
    where
        G: Deref<Target = RecordState>,
    {
        let st = &*seg.guard;
        if st.policy != Policy::Redo || st.len == 0 {
            mapping.read_into(seg.file_off, out);
            return;
        }
        let req = seg.in_off..seg.in_off + seg.len;
        let logged = st.span();
        for piece in Overlap::classify(&req, &logged).splice(&req, &logged) {
            match piece {
                Piece::Image(r) => {
                    let dst = &mut out[r.start - req.start..r.end - req.start];
                    mapping.read_into(st.dst + r.start as u64, dst);
                }
                Piece::Log(r) => {
                    out[r.start - req.start..r.end - req.start].copy_from_slice(&st.log()[r]);
                }
            }
        }
    }

    // ---- record resolution ----

    /// Split `[offset, offset + len)` at granule boundaries and lock the
    /// record of every piece, in ascending offset order.
    fn lock_segments<'a, G, F>(&'a self, region: &RegionState, offset: u64, len: usize, try_lock: F) -> Result<Vec<Locked<G>>>
    where
        F: Fn(&'a RecordRwLock<RecordState>) -> Option<G>,
        G: Deref<Target = RecordState>,
    {
        let mut segments = Vec::new();
        let (mut off, mut done) = (offset, 0usize);
        while done < len {
            let remaining = len - done;
            let leaf = self.index.locate_or_create(off)?;
            let granule = self.index.granule_size_for(&leaf, off, remaining);
            let in_off = granule.offset_in(off);
            let n = remaining.min(granule.size() - in_off);
            let (record, guard) = self.lock_record(leaf, granule, off, region, &try_lock)?;
            segments.push(Locked { record, file_off: off, in_off, len: n, data_off: done, guard });
            off += n as u64;
            done += n;
        }
        Ok(segments)
    }

    /// Resolve (creating if needed) and lock the record of `offset`'s granule.
    /// Spins on the try-lock; a record recycled while we spun is detected by
    /// rechecking that the slot still points at it.
    fn lock_record<'a, G, F>(&'a self, leaf: Leaf<'a>, granule: Granule, offset: u64, region: &RegionState, try_lock: &F) -> Result<(u32, G)>
    where
        F: Fn(&'a RecordRwLock<RecordState>) -> Option<G>,
        G: Deref<Target = RecordState>,
    {
        let slot = granule.slot(offset);
        loop {
            let raw = match leaf.node().child(slot) {
                Some(raw) => raw,
                None => self.install_record(leaf, slot, granule, granule.base(offset), region)?,
            };
            if let Some(guard) = try_lock(self.alloc.record(raw).lock()) {
                if guard.live && leaf.node().child(slot) == Some(raw) {
                    return Ok((raw, guard));
                }
            }
            std::hint::spin_loop();
        }
    }

    /// Install a fresh record at `slot`; returns whichever record won the slot.
    fn install_record(&self, leaf: Leaf<'_>, slot: usize, granule: Granule, base: u64, region: &RegionState) -> Result<u32> {
        let handle = self.alloc.acquire_record()?;
        let log = match self.alloc.acquire_log(granule) {
            Ok(log) => log,
            Err(e) => {
                self.alloc.release_record(handle);
                return Err(e);
            }
        };
        let raw = handle.index() as u32;
        self.alloc
            .record(raw)
            .lock()
            .write()
            .init(region.epoch, region.policy, base, log);

        match leaf.node().install(slot, handle) {
            Ok(raw) => {
                let state = self.alloc.record(raw).lock().read();
                self.alloc.persist_record(raw, &state)?;
                Ok(raw)
            }
            Err((loser, winner)) => {
                self.alloc.reclaim_record(loser);
                Ok(winner)
            }
        }
    }

    // ---- checkpoint ----

    /// Write back redo bytes of a record to the image.
    fn apply_redo(&self, mapping: &Mapping, st: &RecordState) -> Result<usize> {
        if st.policy != Policy::Redo || st.len == 0 {
            return Ok(0);
        }
        let span = st.span();
        let start = st.dst + span.start as u64;
        mapping.write_from(start, &st.log()[span.clone()]);
        mapping.persist(start..start + span.len() as u64, self.alloc.sync_on_flush())?;
        Ok(span.len())
    }

    /// Reconcile every record from an earlier epoch with the image and return
    /// it to the allocator. Busy records are skipped.
    pub fn checkpoint(&self) -> Result<CheckpointStats> {
        let state = self.state.read();
        self.checkpoint_locked(&state, None)
    }

    /// Checkpoint pass of the background task; gives way to exclusive holders.
    pub(crate) fn checkpoint_background(&self, cancel: &AtomicBool) -> Result<CheckpointStats> {
        let stats = match self.state.try_read() {
            Some(state) => self.checkpoint_locked(&state, Some(cancel)),
            None => Ok(CheckpointStats::default()),
        };
        // the task thread never allocates, so its returns go straight back
        self.alloc.flush_thread_caches();
        stats
    }

    fn checkpoint_locked(&self, region: &RegionState, cancel: Option<&AtomicBool>) -> Result<CheckpointStats> {
        let mut stats = CheckpointStats::default();
        let Some(mapping) = region.mapping.as_ref() else {
            return Ok(stats);
        };

        let mut off = 0;
        while off < mapping.len() {
            if cancel.is_some_and(|c| c.load(Ordering::Acquire)) {
                stats.interrupted = true;
                break;
            }
            if let Some(leaf) = self.index.find(off) {
                if let Some(granule) = leaf.node().granule() {
                    for slot in 0..granule.entries() {
                        self.checkpoint_slot(mapping, region.epoch, leaf, slot, &mut stats)?;
                    }
                }
            }
            off += LEAF_SPAN;
        }

        let metrics = Metrics::global();
        metrics.checkpoints.inc();
        metrics.records_reclaimed.inc_by(stats.reclaimed as u64);
        if stats.reclaimed > 0 {
            debug!(ino = self.ino, epoch = region.epoch, ?stats, "checkpoint pass");
        }
        Ok(stats)
    }

    fn checkpoint_slot(&self, mapping: &Mapping, epoch: u64, leaf: Leaf<'_>, slot: usize, stats: &mut CheckpointStats) -> Result<()> {
        let Some(raw) = leaf.node().child(slot) else {
            return Ok(());
        };
        let Some(mut st) = self.alloc.record(raw).lock().try_write() else {
            stats.busy += 1;
            return Ok(());
        };
        if !st.live || leaf.node().child(slot) != Some(raw) {
            return Ok(());
        }
        // current-epoch records stay unless they never logged anything
        if st.epoch >= epoch && st.len > 0 {
            return Ok(());
        }
        stats.flushed_bytes += self.apply_redo(mapping, &st)?;

        let Some(handle) = leaf.node().remove(slot, raw) else {
            return Ok(());
        };
        let log = st.clear();
        drop(st);
        self.alloc.clear_record_meta(raw);
        if let Some(log) = log {
            self.alloc.release_log(log);
        }
        self.alloc.release_record(handle);
        stats.reclaimed += 1;
        Ok(())
    }

    // ---- commit ----

    /// Advance the epoch and, with hybrid logging, pick the policy for the
    /// next epoch from the read/write mix since the last commit.
    pub fn commit(&self) -> Result<()> {
        let mut state = self.state.write();
        if state.mapping.is_none() {
            return Err(Error::Closed);
        }
        state.epoch += 1;
        self.persist_descriptor(&state)?;

        if self.settings.hybrid_logging {
            let reads = self.reads.swap(0, Ordering::Relaxed);
            let writes = self.writes.swap(0, Ordering::Relaxed);
            let total = reads + writes;
            if total > 0 {
                let ratio = writes * 100 / total;
                let next = if ratio > self.settings.write_ratio_threshold { Policy::Redo } else { Policy::Undo };
                if next != state.policy {
                    info!(ino = self.ino, from = %state.policy, to = %next, ratio, "logging policy switched");
                    state.policy = next;
                    self.persist_descriptor(&state)?;
                    Metrics::global().policy_switches.inc();
                    self.checkpoint_locked(&state, None)?;
                }
            }
        }

        Metrics::global().commits.inc();
        trace!(ino = self.ino, epoch = state.epoch, "committed");
        Ok(())
    }

    fn persist_descriptor(&self, state: &RegionState) -> Result<()> {
        let guard = self.descriptor.lock();
        let Some(descriptor) = guard.as_ref() else {
            return Ok(());
        };
        let words = self.alloc.descriptor_words(descriptor);
        words[0].store(state.epoch, Ordering::Relaxed);
        words[2].store(self.file_size(), Ordering::Relaxed);
        words[3].store(state.policy as u64, Ordering::Relaxed);
        self.alloc.persist_descriptor(descriptor)
    }

    // ---- teardown ----

    /// Stop the checkpoint task, reconcile every record, unmap, and cut the
    /// file back to its logical size. Later calls are no-ops.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(task) = self.checkpointer.lock().take() {
            task.stop();
        }

        let mut state = self.state.write();
        // seal the open epoch so uncommitted redo data reaches the image
        state.epoch += 1;
        let stats = self.checkpoint_locked(&state, None)?;
        self.persist_descriptor(&state)?;

        let fsize = self.file_size();
        if let Some(mapping) = state.mapping.take() {
            mapping.flush()?;
            mapping.finish(fsize)?;
        }
        if let Some(descriptor) = self.descriptor.lock().take() {
            self.alloc.release_descriptor(descriptor);
        }
        info!(ino = self.ino, size = fsize, reclaimed = stats.reclaimed, "region closed");
        Ok(())
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(ino = self.ino, error = %e, "region teardown failed");
        }
    }
}
