//! Per-region background checkpoint task.

use super::MappedRegion;
use crate::core::error::Result;
use crossbeam::channel::{bounded, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

/// Totals of one checkpoint pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointStats {
    /// Records cleared from the index and returned to the allocator
    pub reclaimed: usize,
    /// Redo bytes written back to the image
    pub flushed_bytes: usize,
    /// Records skipped because someone held their lock
    pub busy: usize,
    /// The pass stopped early on cancellation
    pub interrupted: bool,
}

/// Thread that checkpoints one region every `period` until stopped.
pub(crate) struct CheckpointTask {
    stop_tx: Option<Sender<()>>,
    cancel: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl CheckpointTask {
    pub(crate) fn spawn(region: Weak<MappedRegion>, ino: u64, period: Duration) -> Result<Self> {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let cancel = Arc::new(AtomicBool::new(false));
        let flag = cancel.clone();

        let handle = thread::Builder::new()
            .name(format!("pmem-ckpt-{}", ino))
            .spawn(move || {
                loop {
                    match stop_rx.recv_timeout(period) {
                        Err(RecvTimeoutError::Timeout) => {}
                        // stop message or sender dropped
                        _ => break,
                    }
                    let Some(region) = region.upgrade() else { break };
                    if let Err(e) = region.checkpoint_background(&flag) {
                        warn!(ino, error = %e, "background checkpoint failed");
                    }
                }
                debug!(ino, "checkpoint task stopped");
            })?;

        Ok(Self {
            stop_tx: Some(stop_tx),
            cancel,
            handle: Some(handle),
        })
    }

    /// Interrupt any pass in flight and wait for the thread to exit.
    pub(crate) fn stop(mut self) {
        self.cancel.store(true, Ordering::Release);
        drop(self.stop_tx.take());
        if let Some(handle) = self.handle.take() {
            // the last region reference may be dropped by the task itself
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}
