//! Background reclaim.
//!
//! Writers kick the reclaimer after every operation that leaves work for
//! it; the reclaimer also polls on a fixed interval. Each round erases one
//! pending block and runs one collector pass if the allocator still wants
//! space back.

use crate::Volume;
use crate::gc::GcOutcome;
use ffl_error::{FflError, Result};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

#[derive(Debug, Default)]
struct Flags {
    kicked: bool,
    stop: bool,
}

/// Wakeup channel between writers and the reclaim thread.
#[derive(Debug, Default)]
pub(crate) struct ReclaimSignal {
    flags: Mutex<Flags>,
    cv: Condvar,
}

impl ReclaimSignal {
    fn kick(&self) {
        self.flags.lock().kicked = true;
        self.cv.notify_all();
    }

    fn start(&self) {
        let mut flags = self.flags.lock();
        flags.stop = false;
        flags.kicked = false;
    }

    fn request_stop(&self) {
        self.flags.lock().stop = true;
        self.cv.notify_all();
    }

    /// Sleep until kicked, stopped or `poll` passes. Returns false once a
    /// stop was requested.
    fn wait(&self, poll: Duration) -> bool {
        let mut flags = self.flags.lock();
        if !flags.kicked && !flags.stop {
            let _ = self.cv.wait_for(&mut flags, poll);
        }
        flags.kicked = false;
        !flags.stop
    }
}

impl Volume {
    /// True when the reclaimer has work: blocks to erase, nodes to check,
    /// or too little free space with enough dirty space to win back.
    #[must_use]
    pub fn should_wake(&self) -> bool {
        if self.is_read_only() {
            return false;
        }
        let space = self.space.lock();
        space.alloc.should_wake(&space.ledger)
    }

    pub(crate) fn trigger_reclaim(&self) {
        if self.should_wake() {
            self.reclaim.kick();
        }
    }

    /// One round of background reclaim. Returns true if anything moved.
    pub fn reclaim_step(&self) -> Result<bool> {
        let erased = self.erase_pending_blocks(1)?;
        if !self.should_wake() {
            return Ok(erased > 0);
        }
        let result = self.txn().and_then(|mut txn| txn.gc_pass());
        self.note_result(&result);
        Ok(erased > 0 || result? == GcOutcome::Progress)
    }
}

/// Handle to a running reclaim thread. Dropping it stops the thread.
#[derive(Debug)]
pub struct ReclaimThread {
    volume: Arc<Volume>,
    handle: Option<JoinHandle<()>>,
}

impl ReclaimThread {
    pub fn spawn(volume: Arc<Volume>) -> Result<Self> {
        volume.reclaim.start();
        let poll = Duration::from_millis(volume.config.reclaim_poll_interval_ms);
        let worker = Arc::clone(&volume);
        let handle = std::thread::Builder::new()
            .name("ffl-reclaim".to_owned())
            .spawn(move || reclaim_loop(&worker, poll))?;
        tracing::info!(target: "ffl::reclaim", poll_ms = poll.as_millis() as u64, "reclaim_started");
        Ok(Self {
            volume,
            handle: Some(handle),
        })
    }

    /// Stop the thread and wait for it to exit.
    pub fn stop(mut self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        self.volume.reclaim.request_stop();
        handle
            .join()
            .map_err(|_| FflError::Inconsistent("reclaim thread panicked".to_owned()))?;
        tracing::info!(target: "ffl::reclaim", "reclaim_stopped");
        Ok(())
    }
}

impl Drop for ReclaimThread {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            tracing::error!(target: "ffl::reclaim", error = %err, "reclaim_shutdown_failed");
        }
    }
}

fn reclaim_loop(volume: &Volume, poll: Duration) {
    while volume.reclaim.wait(poll) {
        // Keep going while there is progress; go back to sleep otherwise.
        loop {
            if volume.is_read_only() || !volume.should_wake() {
                break;
            }
            match volume.reclaim_step() {
                Ok(true) => {}
                Ok(false) => break,
                Err(FflError::NoSpace) => {
                    tracing::debug!(target: "ffl::reclaim", "reclaim_no_space");
                    break;
                }
                Err(err) => {
                    tracing::warn!(target: "ffl::reclaim", error = %err, "reclaim_step_failed");
                    break;
                }
            }
            if volume.reclaim.flags.lock().stop {
                return;
            }
        }
    }
}
