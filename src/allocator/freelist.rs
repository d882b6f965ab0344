//! Global free list of one object class.
//!
//! Free handles are kept as a stack of batches of exactly `skip_unit` handles
//! plus one partial batch. The batch directory plays the role of a skip list
//! over the free chain: it marks every `skip_unit`-th handle, so a whole batch
//! moves between the pool and a thread cache in O(1) without walking the chain.

/// Run of free handles moved as a unit between the global list and a thread cache.
#[derive(Debug, Default)]
pub(crate) struct Batch(pub(crate) Vec<u32>);

impl Batch {
    pub(crate) fn with_capacity(cap: usize) -> Self {
        Batch(Vec::with_capacity(cap))
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Mutex-protected free structure of one pool.
#[derive(Debug)]
pub(crate) struct FreeList {
    full: Vec<Batch>,   // skip directory: one entry per complete batch
    loose: Batch,       // fewer than skip_unit handles
    skip_unit: usize,
}

impl FreeList {
    /// List holding handles `0..capacity`.
    pub(crate) fn filled(capacity: usize, skip_unit: usize) -> Self {
        let mut full = Vec::with_capacity(capacity / skip_unit + 1);
        let mut start = capacity;
        while start >= skip_unit {
            let end = start;
            start -= skip_unit;
            full.push(Batch((start as u32..end as u32).rev().collect()));
        }
        Self {
            full,
            loose: Batch((0..start as u32).rev().collect()),
            skip_unit,
        }
    }

    /// Free handles held.
    pub(crate) fn len(&self) -> usize {
        self.full.len() * self.skip_unit + self.loose.len()
    }

    /// Entries in the skip directory; always `len() / skip_unit`.
    pub(crate) fn skip_len(&self) -> usize {
        self.full.len()
    }

    /// Detach one batch: a complete one when available, else whatever is loose.
    pub(crate) fn detach(&mut self) -> Option<Batch> {
        if let Some(batch) = self.full.pop() {
            return Some(batch);
        }
        if self.loose.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.loose))
        }
    }

    /// Splice a batch back. Complete batches are linked in O(1); partial ones
    /// are folded into the loose run.
    pub(crate) fn splice(&mut self, batch: Batch) {
        if batch.len() == self.skip_unit {
            self.full.push(batch);
            return;
        }
        for h in batch.0 {
            self.push(h);
        }
    }

    /// Return a single handle.
    pub(crate) fn push(&mut self, handle: u32) {
        if self.loose.0.capacity() == 0 {
            self.loose = Batch::with_capacity(self.skip_unit);
        }
        self.loose.0.push(handle);
        if self.loose.len() == self.skip_unit {
            let batch = std::mem::replace(&mut self.loose, Batch::with_capacity(self.skip_unit));
            self.full.push(batch);
        }
    }

    /// Take a single handle.
    pub(crate) fn pop(&mut self) -> Option<u32> {
        if let Some(h) = self.loose.0.pop() {
            return Some(h);
        }
        let mut batch = self.full.pop()?;
        let h = batch.0.pop();
        self.loose = batch;
        h
    }
}
