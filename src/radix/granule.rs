//! Log granule size catalogue (4 KiB through 2 MiB).

use crate::constants::{GRANULE_CLASSES, LEAF_SHIFT, PAGE_SHIFT};
use std::fmt;

/// Size class of the byte span governed by one log record.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Granule {
    /// 4 KiB
    K4 = 0,
    /// 8 KiB
    K8,
    /// 16 KiB
    K16,
    /// 32 KiB
    K32,
    /// 64 KiB
    K64,
    /// 128 KiB
    K128,
    /// 256 KiB
    K256,
    /// 512 KiB
    K512,
    /// 1 MiB
    M1,
    /// 2 MiB
    M2,
}

impl Granule {
    /// Every class, smallest first.
    pub const ALL: [Granule; GRANULE_CLASSES] = [
        Granule::K4,
        Granule::K8,
        Granule::K16,
        Granule::K32,
        Granule::K64,
        Granule::K128,
        Granule::K256,
        Granule::K512,
        Granule::M1,
        Granule::M2,
    ];

    /// Class from its catalogue index.
    pub fn from_index(index: u8) -> Option<Granule> {
        Self::ALL.get(index as usize).copied()
    }

    /// Catalogue index.
    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    /// log2 of the size in bytes.
    #[inline]
    pub fn shift(self) -> u32 {
        PAGE_SHIFT + self as u32
    }

    /// Size in bytes.
    #[inline]
    pub fn size(self) -> usize {
        1 << self.shift()
    }

    /// Number of record slots a leaf holds at this granule.
    #[inline]
    pub fn entries(self) -> usize {
        1 << (LEAF_SHIFT - self.shift())
    }

    /// Leaf slot governing `offset`.
    #[inline]
    pub fn slot(self, offset: u64) -> usize {
        (offset >> self.shift()) as usize & (self.entries() - 1)
    }

    /// Offset of the granule containing `offset`.
    #[inline]
    pub fn base(self, offset: u64) -> u64 {
        offset & !(self.size() as u64 - 1)
    }

    /// Position of `offset` inside its granule.
    #[inline]
    pub fn offset_in(self, offset: u64) -> usize {
        (offset & (self.size() as u64 - 1)) as usize
    }

    /// Smallest class whose aligned granule holds all of `[offset, offset + len)`,
    /// capped at 2 MiB. A zero `len` is treated as one byte.
    pub fn for_span(offset: u64, len: usize) -> Granule {
        let last = offset + len.max(1) as u64 - 1;
        Self::ALL
            .into_iter()
            .find(|g| offset >> g.shift() == last >> g.shift())
            .unwrap_or(Granule::M2)
    }
}

impl fmt::Display for Granule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let size = self.size();
        if size >= 1 << 20 {
            write!(f, "{}M", size >> 20)
        } else {
            write!(f, "{}K", size >> 10)
        }
    }
}
