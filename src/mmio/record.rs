//! Log records and logging policy.

use crate::allocator::LogBuf;
use crate::core::error::{Error, Result};
use crate::core::lock::RecordRwLock;
use crate::radix::Granule;
use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::str::FromStr;

/// What a log record holds for its granule.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Policy {
    /// The log keeps the pre-write bytes; the image is updated in place.
    Undo = 0,
    /// The log keeps the new bytes; the image catches up at checkpoint.
    Redo = 1,
}

impl Policy {
    pub(crate) fn from_u8(v: u8) -> Policy {
        match v {
            0 => Policy::Undo,
            1 => Policy::Redo,
            other => unreachable!("unknown logging policy {}", other),
        }
    }
}

impl FromStr for Policy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "undo" => Ok(Policy::Undo),
            "redo" => Ok(Policy::Redo),
            other => Err(Error::config(format!("Unknown logging policy: {}", other))),
        }
    }
}

impl std::fmt::Display for Policy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Policy::Undo => "undo",
            Policy::Redo => "redo",
        })
    }
}

const EPOCH_BITS: u32 = 20;
const OFFSET_BITS: u32 = 21;
const LEN_BITS: u32 = 22;

/// Pack record metadata into its persistent word:
/// `epoch:20 | offset:21 | len:22 | policy:1`, epoch truncated to 20 bits.
pub fn pack_meta(epoch: u64, offset: usize, len: usize, policy: Policy) -> u64 {
    (epoch & ((1 << EPOCH_BITS) - 1))
        | ((offset as u64 & ((1 << OFFSET_BITS) - 1)) << EPOCH_BITS)
        | ((len as u64 & ((1 << LEN_BITS) - 1)) << (EPOCH_BITS + OFFSET_BITS))
        | ((policy as u64) << (EPOCH_BITS + OFFSET_BITS + LEN_BITS))
}

/// Inverse of [`pack_meta`].
pub fn unpack_meta(word: u64) -> (u64, usize, usize, Policy) {
    let epoch = word & ((1 << EPOCH_BITS) - 1);
    let offset = (word >> EPOCH_BITS) & ((1 << OFFSET_BITS) - 1);
    let len = (word >> (EPOCH_BITS + OFFSET_BITS)) & ((1 << LEN_BITS) - 1);
    let policy = Policy::from_u8((word >> (EPOCH_BITS + OFFSET_BITS + LEN_BITS)) as u8);
    (epoch, offset as usize, len as usize, policy)
}

/// Mutable part of a log record, guarded by the record lock.
#[derive(Debug)]
pub struct RecordState {
    pub(crate) live: bool,     // installed in a leaf slot
    pub(crate) epoch: u64,
    pub(crate) offset: usize,  // logged span, relative to the granule base
    pub(crate) len: usize,
    pub(crate) policy: Policy,
    pub(crate) dst: u64,       // file offset of the granule base
    pub(crate) log: Option<LogBuf>,
}

impl RecordState {
    const fn empty() -> Self {
        Self {
            live: false,
            epoch: 0,
            offset: 0,
            len: 0,
            policy: Policy::Undo,
            dst: 0,
            log: None,
        }
    }

    /// Prepare a freshly acquired record for the granule at `dst`.
    pub(crate) fn init(&mut self, epoch: u64, policy: Policy, dst: u64, log: LogBuf) {
        *self = Self {
            live: true,
            epoch,
            offset: 0,
            len: 0,
            policy,
            dst,
            log: Some(log),
        };
    }

    /// Forget everything; returns the log buffer to recycle.
    pub(crate) fn clear(&mut self) -> Option<LogBuf> {
        let log = self.log.take();
        *self = Self::empty();
        log
    }

    /// Start over in `epoch` with nothing logged.
    pub(crate) fn reset(&mut self, epoch: u64, policy: Policy) {
        self.epoch = epoch;
        self.policy = policy;
        self.offset = 0;
        self.len = 0;
    }

    /// Logged span relative to the granule base.
    pub fn span(&self) -> Range<usize> {
        self.offset..self.offset + self.len
    }

    /// Epoch the record belongs to.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Policy the record was logged under.
    pub fn policy(&self) -> Policy {
        self.policy
    }

    /// Granule class of the record's buffer.
    pub fn granule(&self) -> Option<Granule> {
        self.log.as_ref().map(LogBuf::granule)
    }

    pub(crate) fn packed(&self) -> u64 {
        pack_meta(self.epoch, self.offset, self.len, self.policy)
    }

    pub(crate) fn log(&self) -> &[u8] {
        self.log
            .as_ref()
            .map(LogBuf::as_slice)
            .unwrap_or_else(|| unreachable!("live record without a log buffer"))
    }

    pub(crate) fn log_mut(&mut self) -> &mut [u8] {
        self.log
            .as_mut()
            .map(LogBuf::as_mut_slice)
            .unwrap_or_else(|| unreachable!("live record without a log buffer"))
    }
}

/// One granule's log record: state plus the per-record reader/writer lock.
pub struct LogRecord {
    state: RecordRwLock<RecordState>,
}

impl LogRecord {
    pub(crate) fn new() -> Self {
        Self { state: RecordRwLock::new(RecordState::empty()) }
    }

    /// The record lock.
    #[inline]
    pub(crate) fn lock(&self) -> &RecordRwLock<RecordState> {
        &self.state
    }
}
