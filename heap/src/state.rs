//! GC epoch state machine and the suspend/resume gate.

use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// Resume epoch while collections are suspended.
pub const GC_SUSPENDED: i64 = -1;

/// Longest a collection waits for a suspended gate to reopen.
pub const MAX_SUSPEND_TIME: Duration = Duration::from_secs(10);

#[derive(Debug, Default)]
struct Epochs {
    scheduled: i64,
    started: i64,
    finished: i64,
    finalized: i64,
    resume: i64,
    shutdown: bool,
}

/// Tracks `finalized <= finished <= started <= scheduled` and lets threads
/// wait on each counter.
#[derive(Debug, Default)]
pub struct GcStateHolder {
    epochs: Mutex<Epochs>,
    scheduled_cv: Condvar,
    finished_cv: Condvar,
    finalized_cv: Condvar,
    resume_cv: Condvar,
}

impl GcStateHolder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests a collection and returns the epoch that will satisfy it.
    /// Asking again before that epoch starts returns the same epoch.
    pub fn schedule(&self) -> i64 {
        let mut epochs = self.epochs.lock();
        if epochs.scheduled <= epochs.started {
            epochs.scheduled = epochs.started + 1;
            self.scheduled_cv.notify_all();
        }
        epochs.scheduled
    }

    pub fn start(&self, epoch: i64) {
        let mut epochs = self.epochs.lock();
        debug_assert!(epoch <= epochs.scheduled);
        epochs.started = epoch;
        if epochs.resume != GC_SUSPENDED {
            epochs.resume = epoch;
            self.resume_cv.notify_all();
        }
    }

    pub fn finish(&self, epoch: i64) {
        let mut epochs = self.epochs.lock();
        debug_assert!(epoch <= epochs.started);
        epochs.finished = epoch;
        self.finished_cv.notify_all();
    }

    pub fn finalized(&self, epoch: i64) {
        let mut epochs = self.epochs.lock();
        debug_assert!(epoch <= epochs.finished);
        epochs.finalized = epoch;
        self.finalized_cv.notify_all();
    }

    /// Blocks until `epoch` has finished or the state shut down.
    pub fn wait_epoch_finished(&self, epoch: i64) {
        let mut epochs = self.epochs.lock();
        self.finished_cv
            .wait_while(&mut epochs, |e| e.finished < epoch && !e.shutdown);
    }

    /// Blocks until finalizers of `epoch` have run or the state shut down.
    pub fn wait_epoch_finalized(&self, epoch: i64) {
        let mut epochs = self.epochs.lock();
        self.finalized_cv
            .wait_while(&mut epochs, |e| e.finalized < epoch && !e.shutdown);
    }

    /// Blocks until a collection is pending. `None` after shutdown.
    pub fn wait_scheduled(&self) -> Option<i64> {
        let mut epochs = self.epochs.lock();
        self.scheduled_cv
            .wait_while(&mut epochs, |e| e.scheduled <= e.finished && !e.shutdown);
        if epochs.shutdown {
            None
        } else {
            Some(epochs.scheduled)
        }
    }

    /// Terminal; wakes every waiter.
    pub fn shutdown(&self) {
        let mut epochs = self.epochs.lock();
        epochs.shutdown = true;
        self.scheduled_cv.notify_all();
        self.finished_cv.notify_all();
        self.finalized_cv.notify_all();
        self.resume_cv.notify_all();
    }

    /// Holds back the next collection until [`GcStateHolder::resume`].
    pub fn suspend(&self) {
        let mut epochs = self.epochs.lock();
        epochs.resume = GC_SUSPENDED;
        log::debug!("collections suspended");
    }

    pub fn resume(&self) {
        let mut epochs = self.epochs.lock();
        epochs.resume = epochs.started;
        self.resume_cv.notify_all();
        log::debug!("collections resumed");
    }

    /// Waits at most [`MAX_SUSPEND_TIME`] for the gate to open.
    pub fn wait_resumed(&self) -> bool {
        self.wait_resumed_for(MAX_SUSPEND_TIME)
    }

    /// Returns `false` if `timeout` elapsed with collections still suspended.
    pub fn wait_resumed_for(&self, timeout: Duration) -> bool {
        let mut epochs = self.epochs.lock();
        let result = self.resume_cv.wait_while_for(
            &mut epochs,
            |e| e.resume == GC_SUSPENDED && !e.shutdown,
            timeout,
        );
        if result.timed_out() && epochs.resume == GC_SUSPENDED {
            log::warn!("collections still suspended after {timeout:?}, continuing");
            return false;
        }
        true
    }

    pub fn scheduled(&self) -> i64 {
        self.epochs.lock().scheduled
    }

    pub fn started(&self) -> i64 {
        self.epochs.lock().started
    }

    pub fn finished(&self) -> i64 {
        self.epochs.lock().finished
    }

    pub fn finalized_epoch(&self) -> i64 {
        self.epochs.lock().finalized
    }

    pub fn is_suspended(&self) -> bool {
        self.epochs.lock().resume == GC_SUSPENDED
    }

    pub fn is_shutdown(&self) -> bool {
        self.epochs.lock().shutdown
    }
}
