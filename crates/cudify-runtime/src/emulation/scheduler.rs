//! Cooperative execution of one block.
//!
//! Every thread of the block gets its own fiber and runs until its first
//! barrier or completion, in x-fastest order. After that the scheduler
//! releases barrier generations one at a time: once every thread is either
//! waiting or finished, each waiting thread is resumed in ascending linear
//! order until it reaches the next barrier or finishes. No thread passes a
//! barrier before all threads of its block have arrived there.

use tracing::{error, warn};

use crate::emulation::fiber::{Event, Fiber, FiberPool, Job, KernelRef};
use crate::error::{BackendError, Result};
use crate::launch::{ExecutionContext, LaunchConfig};

/// Barrier traffic of one block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct BlockReport {
    /// Barrier generations released.
    pub barriers: u64,
    /// Fiber resumptions past a barrier.
    pub resumes: u64,
}

enum Slot {
    Waiting(Fiber),
    Done,
}

/// Fibers currently lent to a block. Any fiber still suspended when this is
/// dropped is aborted; it returns to the pool only once its body has
/// finished, so no pooled fiber can still hold the kernel reference.
struct BlockRun<'p> {
    pool: &'p mut FiberPool,
    block: u64,
    slots: Vec<Slot>,
}

impl BlockRun<'_> {
    /// Record the event a thread yielded with.
    fn settle(&mut self, thread: usize, fiber: Fiber, event: Event) -> Result<()> {
        match event {
            Event::Barrier => {
                self.slots[thread] = Slot::Waiting(fiber);
                Ok(())
            }
            Event::Completed | Event::Aborted => {
                self.pool.release(fiber);
                self.slots[thread] = Slot::Done;
                Ok(())
            }
            Event::Panicked(message) => {
                self.pool.release(fiber);
                self.slots[thread] = Slot::Done;
                error!(block = self.block, thread, %message, "kernel panicked");
                Err(BackendError::KernelPanicked {
                    block: self.block,
                    thread: thread as u64,
                    message,
                })
            }
        }
    }

    fn waiting(&self) -> Vec<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| matches!(slot, Slot::Waiting(_)).then_some(i))
            .collect()
    }

    fn take_waiting(&mut self, thread: usize) -> Option<Fiber> {
        match std::mem::replace(&mut self.slots[thread], Slot::Done) {
            Slot::Waiting(fiber) => Some(fiber),
            Slot::Done => None,
        }
    }
}

impl Drop for BlockRun<'_> {
    fn drop(&mut self) {
        for thread in 0..self.slots.len() {
            if let Some(fiber) = self.take_waiting(thread) {
                match fiber.abort() {
                    Event::Aborted | Event::Completed => self.pool.release(fiber),
                    Event::Panicked(message) => {
                        warn!(block = self.block, thread, %message, "kernel panicked while being aborted");
                        self.pool.release(fiber);
                    }
                    Event::Barrier => {
                        warn!(block = self.block, thread, "fiber still suspended after abort, discarding it");
                        drop(fiber);
                    }
                }
            }
        }
    }
}

/// Run every thread of block `block` to completion.
pub(crate) fn run_block(
    pool: &mut FiberPool,
    kernel: KernelRef,
    config: &LaunchConfig,
    block: u64,
) -> Result<BlockReport> {
    let threads = config.threads_per_block() as usize;
    let block_idx = config.block_coords(block);
    let mut run = BlockRun {
        pool,
        block,
        slots: (0..threads).map(|_| Slot::Done).collect(),
    };
    let mut report = BlockReport::default();

    for thread in 0..threads {
        let exec = ExecutionContext::new(block_idx, config.thread_coords(thread as u64), config.grid, config.block);
        let fiber = run.pool.acquire()?;
        let event = fiber.start(Job { kernel, exec });
        run.settle(thread, fiber, event)?;
    }

    let mut warned = false;
    loop {
        let waiting = run.waiting();
        if waiting.is_empty() {
            break;
        }
        if waiting.len() < threads && !warned {
            warn!(
                block,
                waiting = waiting.len(),
                threads,
                "divergent barrier: some threads finished while others wait"
            );
            warned = true;
        }

        report.barriers += 1;
        for thread in waiting {
            if let Some(fiber) = run.take_waiting(thread) {
                let event = fiber.resume();
                report.resumes += 1;
                run.settle(thread, fiber, event)?;
            }
        }
    }

    cudify_tracing::performance::record_barriers(block, report.barriers, report.resumes);
    Ok(report)
}
