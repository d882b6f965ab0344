//! Shared constants for the engine, the radix log index and the pool allocator.
//!
//! Values here are fixed by the on-media layout or the trie geometry. Tunables
//! that an operator may want to change live in [`crate::core::config`] and only
//! take these as their defaults.

/// Fan-out of every radix node.
pub const PTRS_PER_NODE: usize = 1 << 9;

/// Shift of the smallest log granule (4 KiB).
pub const PAGE_SHIFT: u32 = 12;

/// Address bits covered by one leaf node (2 MiB).
pub const LEAF_SHIFT: u32 = 21;

/// Address bits covered by one middle node (1 GiB).
pub const MIDDLE_SHIFT: u32 = 30;

/// Address bits covered by one upper node (512 GiB).
pub const UPPER_SHIFT: u32 = 39;

/// Address bits covered by the global level (256 TiB).
pub const GLOBAL_SHIFT: u32 = 48;

/// Bytes covered by one leaf node.
pub const LEAF_SPAN: u64 = 1 << LEAF_SHIFT;

/// Mask applied to `offset >> LEAF_SHIFT` before it is used as the leaf cache key.
pub const LEAF_KEY_MASK: u64 = (1 << 27) - 1;

/// Number of granule size classes (4 KiB through 2 MiB).
pub const GRANULE_CLASSES: usize = 10;

/// Sentinel stored in a node's granule byte before the first access fixes it.
pub const GRANULE_UNSET: u8 = GRANULE_CLASSES as u8;

/// Default backing directory for the pool files.
pub const DEFAULT_PMEM_PATH: &str = "/mnt/pmem";

/// Mapping size used when an empty file is opened.
pub const DEFAULT_MAP_SIZE: u64 = 1 << 20;

/// Minimum growth step of a mapping.
pub const GROWTH_BASE: u64 = 64 << 20;

/// Default upper bound on a single region's size.
pub const MAX_REGION_SIZE: u64 = 64 << 30;

/// Bytes reserved per granule class for log buffers.
pub const LOG_POOL_BYTES: u64 = 4 << 30;

/// Objects moved between a thread cache and a global pool in one batch.
pub const SKIP_UNIT: usize = 1024;

/// Batch size for mapping descriptors.
pub const REGION_SKIP_UNIT: usize = 50;

/// Full batches a thread's collector keeps before spilling one back.
pub const RETAINED_BATCHES: usize = 2;

/// Default radix node catalogue size.
pub const NODE_COUNT: usize = 1 << 14;

/// Default log record catalogue size.
pub const RECORD_COUNT: usize = 1 << 18;

/// Default mapping descriptor catalogue size.
pub const REGION_COUNT: usize = 2048;

/// Write share (percent) above which commit switches a region to redo logging.
pub const WRITE_RATIO_THRESHOLD: u64 = 40;

/// Default period of the background checkpoint task, in microseconds.
pub const CHECKPOINT_PERIOD_US: u64 = 100;

/// Words persisted per log record: packed metadata and destination base.
pub const RECORD_WORDS: usize = 2;

/// Words persisted per mapping descriptor: epoch, inode, file size, policy.
pub const DESCRIPTOR_WORDS: usize = 4;

/// Name of the optional configuration file picked up by `Config::load`.
pub const CONFIG_FILE: &str = "pmem-mmio.toml";
