//! pmem-mmio - user-space persistent-memory I/O over memory-mapped files
//!
//! Files are mapped into memory and every write is logged per granule in a
//! pre-allocated persistent pool before or instead of touching the image.
//! Undo and redo logging are switched per epoch from the observed write ratio,
//! and a background task reconciles committed logs with the image.
#![warn(missing_docs)]

// Configure global allocator for maximum performance
#[global_allocator]
static GLOBAL: jemallocator::Jemalloc = jemallocator::Jemalloc;

// Core foundational modules
pub mod constants;
pub mod core;

// Engine layers, bottom up
pub mod allocator;
pub mod radix;
pub mod mmio;
pub mod file;
pub mod system;

// Re-export commonly used items for convenience
pub use allocator::Allocator;
pub use core::{Config, Error, Result};
pub use file::{Engine, OpenOptions, PmemFile, RegionTable};
pub use mmio::{Access, CheckpointStats, MappedRegion, Policy};

/// Crate version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
/// Crate name
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Install logging from `config` and register the metrics.
pub fn init(config: &Config) -> Result<()> {
    if !core::logging::init(&config.logging) {
        tracing::debug!("global subscriber already installed");
    }
    tracing::info!("Initializing {} v{}", NAME, VERSION);
    system::metrics::init_registry();
    Ok(())
}
