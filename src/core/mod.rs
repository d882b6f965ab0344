//! Core system types and foundations
//!
//! Error handling, configuration, logging setup and the lock primitives
//! shared by the allocator, the radix index and the engine.

pub mod error;
pub mod config;
pub mod logging;
pub mod lock;

// Re-export commonly used items
pub use error::{Error, ObjectClass, Result};
pub use config::Config;
pub use lock::{BiasedRawRwLock, RawRecordLock};
