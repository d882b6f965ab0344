//! Radix log index
//!
//! A trie over a region's byte offsets with fan-out 512 per level. Interior
//! levels slice fixed bit-fields out of the offset; a leaf covers 2 MiB and
//! holds one slot per granule, each pointing at the log record governing that
//! granule. The granule size is fixed per leaf by the first access that
//! reaches it. Nodes and records are installed with a single compare-and-swap;
//! the loser of a race hands its speculative object back to the allocator.
//!
//! ```text
//!  bits  47..39    38..30    29..21    20..shift
//!        Global -> Upper  -> Middle -> Leaf -> record slot
//! ```

mod granule;

#[cfg(test)]
mod tests;

pub use granule::Granule;

use crate::allocator::{Allocator, Handle};
use crate::constants::{
    GLOBAL_SHIFT, GRANULE_UNSET, LEAF_KEY_MASK, LEAF_SHIFT, MIDDLE_SHIFT, PTRS_PER_NODE,
    UPPER_SHIFT,
};
use crate::core::error::{Error, Result};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

/// Trie level, finest first.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum NodeKind {
    /// Holds record slots; covers 2 MiB
    Leaf = 1,
    /// Covers 1 GiB
    Middle = 2,
    /// Covers 512 GiB
    Upper = 3,
    /// Covers 256 TiB
    Global = 4,
}

impl NodeKind {
    fn from_u8(v: u8) -> NodeKind {
        match v {
            1 => NodeKind::Leaf,
            2 => NodeKind::Middle,
            3 => NodeKind::Upper,
            4 => NodeKind::Global,
            other => unreachable!("unknown radix node kind {}", other),
        }
    }

    /// Address bits covered by a node of this kind.
    pub fn span_shift(self) -> u32 {
        match self {
            NodeKind::Leaf => LEAF_SHIFT,
            NodeKind::Middle => MIDDLE_SHIFT,
            NodeKind::Upper => UPPER_SHIFT,
            NodeKind::Global => GLOBAL_SHIFT,
        }
    }

    /// Shallowest kind whose span holds every offset below `size`.
    pub fn for_size(size: u64) -> NodeKind {
        let last = size.saturating_sub(1);
        if last >> UPPER_SHIFT != 0 {
            NodeKind::Global
        } else if last >> MIDDLE_SHIFT != 0 {
            NodeKind::Upper
        } else if last >> LEAF_SHIFT != 0 {
            NodeKind::Middle
        } else {
            NodeKind::Leaf
        }
    }

    fn child(self) -> NodeKind {
        match self {
            NodeKind::Global => NodeKind::Upper,
            NodeKind::Upper => NodeKind::Middle,
            NodeKind::Middle => NodeKind::Leaf,
            NodeKind::Leaf => unreachable!("leaf nodes have no child level"),
        }
    }

    #[inline]
    fn child_index(self, offset: u64) -> usize {
        (offset >> self.child().span_shift()) as usize & (PTRS_PER_NODE - 1)
    }
}

/// One trie node. Children hold `raw handle + 1`, zero meaning empty.
pub struct RadixNode {
    kind: AtomicU8,
    granule: AtomicU8,
    children: [AtomicU32; PTRS_PER_NODE],
}

impl RadixNode {
    pub(crate) fn new() -> Self {
        Self {
            kind: AtomicU8::new(NodeKind::Leaf as u8),
            granule: AtomicU8::new(GRANULE_UNSET),
            children: std::array::from_fn(|_| AtomicU32::new(0)),
        }
    }

    /// Reinitialise a pooled node. The caller owns it exclusively.
    pub(crate) fn reset(&self, kind: NodeKind) {
        self.kind.store(kind as u8, Ordering::Relaxed);
        self.granule.store(GRANULE_UNSET, Ordering::Relaxed);
        for child in &self.children {
            child.store(0, Ordering::Relaxed);
        }
    }

    /// Level of this node.
    pub fn kind(&self) -> NodeKind {
        NodeKind::from_u8(self.kind.load(Ordering::Relaxed))
    }

    /// Granule fixed on this node, if any access has reached it yet.
    pub fn granule(&self) -> Option<Granule> {
        Granule::from_index(self.granule.load(Ordering::Acquire))
    }

    /// Raw handle stored at `index`.
    #[inline]
    pub fn child(&self, index: usize) -> Option<u32> {
        match self.children[index].load(Ordering::Acquire) {
            0 => None,
            v => Some(v - 1),
        }
    }

    /// Publish `handle` at an empty `index`. On a lost race the handle comes
    /// back together with the winner's raw handle.
    pub(crate) fn install(&self, index: usize, handle: Handle) -> std::result::Result<u32, (Handle, u32)> {
        let raw = handle.into_raw();
        match self.children[index].compare_exchange(0, raw + 1, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => Ok(raw),
            Err(winner) => Err((Handle::from_raw(raw), winner - 1)),
        }
    }

    /// Empty `index` if it still holds `raw`; hands back the claim on success.
    pub(crate) fn remove(&self, index: usize, raw: u32) -> Option<Handle> {
        self.children[index]
            .compare_exchange(raw + 1, 0, Ordering::AcqRel, Ordering::Relaxed)
            .ok()
            .map(|_| Handle::from_raw(raw))
    }
}

/// A resolved leaf.
#[derive(Clone, Copy)]
pub struct Leaf<'a> {
    handle: u32,
    node: &'a RadixNode,
}

impl<'a> Leaf<'a> {
    /// Raw node handle; stable for the life of the region.
    pub fn handle(&self) -> u32 {
        self.handle
    }

    /// The leaf node.
    pub fn node(&self) -> &'a RadixNode {
        self.node
    }
}

impl std::fmt::Debug for Leaf<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Leaf")
            .field("handle", &self.handle)
            .field("granule", &self.node.granule())
            .finish()
    }
}

/// Radix log index of one region.
pub struct RadixLog {
    alloc: Arc<Allocator>,
    root: u32,
    root_kind: NodeKind,
    prev_leaf: AtomicU64, // (leaf key + 1) << 32 | leaf handle, 0 when empty
}

impl RadixLog {
    /// Index able to address every offset below `max_size`.
    pub fn new(alloc: Arc<Allocator>, max_size: u64) -> Result<Self> {
        let root_kind = NodeKind::for_size(max_size);
        let root = alloc.acquire_node(root_kind)?.into_raw();
        Ok(Self {
            alloc,
            root,
            root_kind,
            prev_leaf: AtomicU64::new(0),
        })
    }

    /// Level of the root node.
    pub fn root_kind(&self) -> NodeKind {
        self.root_kind
    }

    /// Exclusive upper bound on addressable offsets.
    pub fn span(&self) -> u64 {
        1 << self.root_kind.span_shift()
    }

    #[inline]
    fn leaf_at(&self, raw: u32) -> Leaf<'_> {
        Leaf { handle: raw, node: self.alloc.node(raw) }
    }

    /// Leaf covering `offset`, creating missing levels on the way down.
    pub fn locate_or_create(&self, offset: u64) -> Result<Leaf<'_>> {
        if offset >= self.span() {
            return Err(Error::RegionFull { requested: offset, max: self.span() });
        }
        let key = ((offset >> LEAF_SHIFT) & LEAF_KEY_MASK) + 1;
        let cached = self.prev_leaf.load(Ordering::Acquire);
        if cached >> 32 == key {
            return Ok(self.leaf_at(cached as u32));
        }

        let mut raw = self.root;
        let mut kind = self.root_kind;
        while kind != NodeKind::Leaf {
            let node = self.alloc.node(raw);
            let index = kind.child_index(offset);
            raw = match node.child(index) {
                Some(child) => child,
                None => {
                    let fresh = self.alloc.acquire_node(kind.child())?;
                    match node.install(index, fresh) {
                        Ok(child) => child,
                        Err((loser, winner)) => {
                            self.alloc.release_node(loser);
                            winner
                        }
                    }
                }
            };
            kind = kind.child();
        }

        self.prev_leaf.store((key << 32) | raw as u64, Ordering::Release);
        Ok(self.leaf_at(raw))
    }

    /// Leaf covering `offset` if every level on the way already exists.
    pub fn find(&self, offset: u64) -> Option<Leaf<'_>> {
        if offset >= self.span() {
            return None;
        }
        let mut raw = self.root;
        let mut kind = self.root_kind;
        while kind != NodeKind::Leaf {
            raw = self.alloc.node(raw).child(kind.child_index(offset))?;
            kind = kind.child();
        }
        Some(self.leaf_at(raw))
    }

    /// Granule of `leaf`, fixing it from `[offset, offset + len)` on first use.
    pub fn granule_size_for(&self, leaf: &Leaf<'_>, offset: u64, len: usize) -> Granule {
        if let Some(granule) = leaf.node.granule() {
            return granule;
        }
        let wanted = Granule::for_span(offset, len);
        match leaf.node.granule.compare_exchange(
            GRANULE_UNSET,
            wanted as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => wanted,
            Err(current) => Granule::from_index(current)
                .unwrap_or_else(|| unreachable!("granule byte {} out of range", current)),
        }
    }

    /// Return every node, and any record still hanging off a leaf, to the allocator.
    fn release_subtree(&self, raw: u32) {
        let node = self.alloc.node(raw);
        let kind = node.kind();
        for index in 0..PTRS_PER_NODE {
            let Some(child) = node.child(index) else { continue };
            let Some(handle) = node.remove(index, child) else { continue };
            if kind == NodeKind::Leaf {
                self.alloc.reclaim_record(handle);
            } else {
                self.release_subtree(handle.into_raw());
            }
        }
        self.alloc.release_node(Handle::from_raw(raw));
    }
}

impl Drop for RadixLog {
    fn drop(&mut self) {
        self.release_subtree(self.root);
    }
}
