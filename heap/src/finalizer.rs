//! Finalizer handoff from sweeps to the finalizer thread.

use std::{
    sync::Arc,
    thread::{self, JoinHandle},
};

use parking_lot::{Condvar, Mutex};

use crate::{GcStateHolder, Heap, RuntimeError, page::BlockRef};

/// Blocks found unreachable that still need their finalizer run.
#[derive(Debug, Default)]
pub struct FinalizerQueue {
    blocks: Vec<BlockRef>,
}

impl FinalizerQueue {
    #[inline]
    pub fn push(&mut self, block: BlockRef) {
        self.blocks.push(block);
    }

    /// Moves every entry of `other` to the end of this queue.
    pub fn merge(&mut self, mut other: FinalizerQueue) {
        if self.blocks.is_empty() {
            self.blocks = other.blocks;
        } else {
            self.blocks.append(&mut other.blocks);
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, BlockRef> {
        self.blocks.iter()
    }
}

impl IntoIterator for FinalizerQueue {
    type Item = BlockRef;
    type IntoIter = std::vec::IntoIter<BlockRef>;

    fn into_iter(self) -> Self::IntoIter {
        self.blocks.into_iter()
    }
}

/// User hook run once for every queued block, on the finalizer thread.
pub type FinalizerCallback = Box<dyn FnMut(BlockRef) + Send>;

#[derive(Debug, Default)]
struct Tasks {
    epoch: Option<i64>,
    stop: bool,
}

#[derive(Debug, Default)]
struct Shared {
    tasks: Mutex<Tasks>,
    wake: Condvar,
}

/// Owns the finalizer thread.
pub struct FinalizerProcessor {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl FinalizerProcessor {
    pub fn spawn(
        heap: Heap,
        state: Arc<GcStateHolder>,
        mut callback: FinalizerCallback,
    ) -> Result<Self, RuntimeError> {
        let shared = Arc::new(Shared::default());
        let worker = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name("gc-finalizer".into())
            .spawn(move || {
                while let Some(epoch) = worker.next_epoch() {
                    let queue = heap.extract_finalizer_queue();
                    let count = queue.len();
                    for block in queue {
                        callback(block);
                        heap.policy().on_finalized(block);
                    }
                    log::debug!("epoch {epoch}: ran {count} finalizers");
                    state.finalized(epoch);
                }
            })
            .map_err(|source| RuntimeError::Spawn {
                thread: "finalizer",
                source,
            })?;
        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    /// Asks the thread to drain the heap's pending queue for `epoch`.
    pub fn schedule(&self, epoch: i64) {
        let mut tasks = self.shared.tasks.lock();
        tasks.epoch = Some(tasks.epoch.map_or(epoch, |e| e.max(epoch)));
        self.shared.wake.notify_one();
    }

    /// Finishes any scheduled epoch, then joins the thread.
    pub fn stop(&mut self) {
        {
            let mut tasks = self.shared.tasks.lock();
            tasks.stop = true;
            self.shared.wake.notify_one();
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("finalizer thread panicked");
            }
        }
    }
}

impl Drop for FinalizerProcessor {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Shared {
    fn next_epoch(&self) -> Option<i64> {
        let mut tasks = self.tasks.lock();
        self.wake
            .wait_while(&mut tasks, |tasks| tasks.epoch.is_none() && !tasks.stop);
        tasks.epoch.take()
    }
}
