//! Error types and handling for the persistent-memory engine
//!
//! Infrastructure failures (pool exhaustion, mapping failure, I/O) are
//! reported as [`Error`] values; callers that cannot continue treat them as
//! fatal. Broken internal invariants are bugs and panic instead.

use crate::radix::Granule;
use std::fmt;
use thiserror::Error;

/// Main result type used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the engine
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A pre-sized object catalogue ran dry
    #[error("Pool exhausted: {0}")]
    PoolExhausted(ObjectClass),

    /// Growth would exceed the region's address space
    #[error("Region full: requested end {requested} exceeds maximum region size {max}")]
    RegionFull {
        /// End offset the caller asked for
        requested: u64,
        /// Largest size the region may reach
        max: u64,
    },

    /// Write against a region opened without write access
    #[error("Region is mapped read-only")]
    ReadOnly,

    /// Seek target outside the file
    #[error("Invalid seek: {0}")]
    InvalidSeek(String),

    /// Operation on a handle that was already closed
    #[error("Handle already closed")]
    Closed,

    /// I/O errors from std
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Prometheus metrics errors
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an invalid seek error
    pub fn invalid_seek(msg: impl Into<String>) -> Self {
        Self::InvalidSeek(msg.into())
    }
}

impl From<Error> for std::io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Io(e) => e,
            Error::InvalidSeek(msg) => std::io::Error::new(std::io::ErrorKind::InvalidInput, msg),
            Error::ReadOnly => std::io::Error::new(std::io::ErrorKind::PermissionDenied, err.to_string()),
            other => std::io::Error::new(std::io::ErrorKind::Other, other.to_string()),
        }
    }
}

/// Object catalogues served by the pool allocator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectClass {
    /// Mapping descriptors
    Descriptor,
    /// Radix index nodes
    Node,
    /// Log records
    Record,
    /// Log data buffers of one granule size
    Log(Granule),
}

impl fmt::Display for ObjectClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectClass::Descriptor => f.write_str("mapping descriptors"),
            ObjectClass::Node => f.write_str("radix nodes"),
            ObjectClass::Record => f.write_str("log records"),
            ObjectClass::Log(g) => write!(f, "{} log buffers", g),
        }
    }
}
