//! Cooperative stop-the-world over registered mutator threads.
//!
//! A thread is safe for the collector when it is parked at a safepoint or
//! running in `Native` state, where it promises not to touch the heap. A
//! `Native` thread that switches back to `Runnable` while a suspension is
//! pending parks before returning.
//!
//! The suspension flag and every thread's state are accessed `SeqCst`: the
//! collector stores the flag and then reads states, a mutator stores its state
//! and then reads the flag, so at least one of them sees the other.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU8, AtomicU64, AtomicUsize, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};

/// Poll interval of the collector while it waits for threads to park.
const SUSPENSION_POLL: Duration = Duration::from_millis(1);

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StopReason {
    GarbageCollection,
    Snapshot,
    Debug,
}

#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ThreadState {
    Runnable = 0,
    Native = 1,
}

impl ThreadState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Runnable,
            _ => Self::Native,
        }
    }
}

/// Registry entry of one mutator thread.
#[derive(Debug)]
pub struct ThreadNode {
    id: u64,
    state: AtomicU8,
    suspended: AtomicBool,
}

impl ThreadNode {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> ThreadState {
        ThreadState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::SeqCst)
    }

    fn is_safe(&self) -> bool {
        self.is_suspended() || self.state() == ThreadState::Native
    }
}

#[derive(Debug, Default)]
pub struct SafepointStats {
    pauses: AtomicUsize,
    total_pause_us: AtomicU64,
    max_pause_us: AtomicU64,
}

impl SafepointStats {
    fn record(&self, pause: Duration) {
        let us = pause.as_micros() as u64;
        self.pauses.fetch_add(1, Ordering::Relaxed);
        self.total_pause_us.fetch_add(us, Ordering::Relaxed);
        let mut max = self.max_pause_us.load(Ordering::Relaxed);
        while us > max {
            match self.max_pause_us.compare_exchange_weak(
                max,
                us,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(current) => max = current,
            }
        }
    }

    pub fn pauses(&self) -> usize {
        self.pauses.load(Ordering::Relaxed)
    }

    pub fn total_pause(&self) -> Duration {
        Duration::from_micros(self.total_pause_us.load(Ordering::Relaxed))
    }

    pub fn max_pause(&self) -> Duration {
        Duration::from_micros(self.max_pause_us.load(Ordering::Relaxed))
    }
}

#[derive(Debug, Default)]
struct Suspension {
    reason: Option<StopReason>,
    since: Option<Instant>,
}

#[derive(Debug, Default)]
pub struct ThreadRegistry {
    threads: Mutex<Vec<Arc<ThreadNode>>>,
    next_id: AtomicU64,
    requested: AtomicBool,
    suspension: Mutex<Suspension>,
    park_lock: Mutex<()>,
    parked: Condvar,
    resumed: Condvar,
    stats: SafepointStats,
}

impl ThreadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a thread in `Native` state.
    pub fn register(&self) -> Arc<ThreadNode> {
        let node = Arc::new(ThreadNode {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            state: AtomicU8::new(ThreadState::Native as u8),
            suspended: AtomicBool::new(false),
        });
        self.threads.lock().push(Arc::clone(&node));
        log::trace!("thread {} registered", node.id);
        node
    }

    pub fn unregister(&self, node: &Arc<ThreadNode>) {
        self.threads.lock().retain(|n| !Arc::ptr_eq(n, node));
        let _guard = self.park_lock.lock();
        self.parked.notify_all();
        log::trace!("thread {} unregistered", node.id);
    }

    pub fn thread_count(&self) -> usize {
        self.threads.lock().len()
    }

    #[inline]
    pub fn is_suspension_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Raises the suspension flag. Returns `false` if another suspension is
    /// already in flight.
    pub fn request_threads_suspension(&self, reason: StopReason) -> bool {
        let mut suspension = self.suspension.lock();
        if suspension.reason.is_some() {
            return false;
        }
        suspension.reason = Some(reason);
        suspension.since = Some(Instant::now());
        self.requested.store(true, Ordering::SeqCst);
        log::debug!("requesting thread suspension for {reason:?}");
        true
    }

    /// Blocks until every registered thread is parked or in `Native`.
    pub fn wait_for_threads_suspension(&self) {
        let mut guard = self.park_lock.lock();
        while !self.all_threads_safe() {
            self.parked.wait_for(&mut guard, SUSPENSION_POLL);
        }
        log::trace!("all threads suspended");
    }

    fn all_threads_safe(&self) -> bool {
        self.threads.lock().iter().all(|node| node.is_safe())
    }

    pub fn resume_threads(&self) {
        {
            let _guard = self.park_lock.lock();
            self.requested.store(false, Ordering::SeqCst);
            self.resumed.notify_all();
        }
        let mut suspension = self.suspension.lock();
        let reason = suspension.reason.take();
        if let Some(since) = suspension.since.take() {
            let pause = since.elapsed();
            self.stats.record(pause);
            log::debug!("threads resumed after {reason:?}, paused {pause:?}");
        }
    }

    /// Suspends every mutator and returns a guard that resumes them on drop.
    pub fn stop_the_world(&self, reason: StopReason) -> WorldStopped<'_> {
        while !self.request_threads_suspension(reason) {
            thread::yield_now();
        }
        self.wait_for_threads_suspension();
        WorldStopped {
            registry: self,
            resumed: false,
        }
    }

    /// Safepoint poll; parks while a suspension is pending.
    #[inline]
    pub fn safepoint(&self, node: &ThreadNode) {
        if self.is_suspension_requested() {
            self.park(node);
        }
    }

    #[cold]
    #[inline(never)]
    fn park(&self, node: &ThreadNode) {
        let mut guard = self.park_lock.lock();
        node.suspended.store(true, Ordering::SeqCst);
        self.parked.notify_all();
        while self.requested.load(Ordering::SeqCst) {
            self.resumed.wait(&mut guard);
        }
        node.suspended.store(false, Ordering::SeqCst);
    }

    /// Switches `node` to `state` and returns the previous state.
    pub fn switch_state(&self, node: &ThreadNode, state: ThreadState) -> ThreadState {
        let old = ThreadState::from_u8(node.state.swap(state as u8, Ordering::SeqCst));
        match state {
            ThreadState::Runnable => self.safepoint(node),
            ThreadState::Native => {
                let _guard = self.park_lock.lock();
                self.parked.notify_all();
            }
        }
        old
    }

    pub fn stats(&self) -> &SafepointStats {
        &self.stats
    }
}

/// Proof that the world is stopped. Resumes mutators when dropped.
#[must_use = "dropping the guard resumes the world immediately"]
pub struct WorldStopped<'a> {
    registry: &'a ThreadRegistry,
    resumed: bool,
}

impl WorldStopped<'_> {
    pub fn resume(mut self) {
        self.resume_the_world();
    }

    fn resume_the_world(&mut self) {
        if !self.resumed {
            self.resumed = true;
            self.registry.resume_threads();
        }
    }
}

impl Drop for WorldStopped<'_> {
    fn drop(&mut self) {
        self.resume_the_world();
    }
}
