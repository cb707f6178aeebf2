//! Multi-worker launcher.
//!
//! Blocks are split into contiguous ranges, one per worker; each worker runs
//! its range sequentially with its own fiber pool. Parallelism is across
//! blocks only, never across the threads of one block.
//!
//! Fibers are OS threads, so their number is bounded by
//! [`RuntimeConfig::max_fibers`]: half of it is the most all running blocks
//! may hold at once (large blocks run on fewer workers), the other half is
//! what the pools may keep idle between launches.

use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::{debug, info};

use crate::config::RuntimeConfig;
use crate::emulation::coords::{self, ThreadCtx};
use crate::emulation::fiber::{FiberBudget, FiberPool, KernelRef};
use crate::emulation::scheduler::{self, BlockReport};
use crate::error::{BackendError, Result};
use crate::launch::LaunchConfig;

/// Cumulative counters of one [`Emulator`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EmulatorStats {
    pub launches: u64,
    pub blocks: u64,
    pub threads: u64,
    /// Barrier generations released, summed over blocks.
    pub barriers: u64,
    /// Fiber resumptions past a barrier.
    pub resumes: u64,
    pub fibers_spawned: u64,
    /// Fibers alive right now.
    pub fibers_live: u64,
    /// Most fibers ever alive at once.
    pub fibers_peak: u64,
}

#[derive(Debug, Default)]
struct Counters {
    launches: AtomicU64,
    blocks: AtomicU64,
    threads: AtomicU64,
    barriers: AtomicU64,
    resumes: AtomicU64,
}

impl Counters {
    fn record_block(&self, threads: u64, report: BlockReport) {
        self.blocks.fetch_add(1, Ordering::Relaxed);
        self.threads.fetch_add(threads, Ordering::Relaxed);
        self.barriers.fetch_add(report.barriers, Ordering::Relaxed);
        self.resumes.fetch_add(report.resumes, Ordering::Relaxed);
    }

    fn snapshot(&self, budget: &FiberBudget) -> EmulatorStats {
        EmulatorStats {
            launches: self.launches.load(Ordering::Relaxed),
            blocks: self.blocks.load(Ordering::Relaxed),
            threads: self.threads.load(Ordering::Relaxed),
            barriers: self.barriers.load(Ordering::Relaxed),
            resumes: self.resumes.load(Ordering::Relaxed),
            fibers_spawned: budget.spawned(),
            fibers_live: budget.live() as u64,
            fibers_peak: budget.peak() as u64,
        }
    }
}

/// Split `0..total` into `min(workers, total)` contiguous ranges whose sizes
/// differ by at most one.
pub fn partition_blocks(total: u64, workers: usize) -> Vec<Range<u64>> {
    let parts = (workers as u64).min(total);
    if parts == 0 {
        return Vec::new();
    }
    let base = total / parts;
    let extra = total % parts;
    let mut start = 0;
    (0..parts)
        .map(|i| {
            let len = base + u64::from(i < extra);
            let range = start..start + len;
            start += len;
            range
        })
        .collect()
}

#[cfg(feature = "cpu-sequential")]
fn effective_workers(_requested: usize) -> usize {
    1
}

#[cfg(not(feature = "cpu-sequential"))]
fn effective_workers(requested: usize) -> usize {
    requested
}

/// CPU emulation of grid launches.
#[derive(Debug)]
pub struct Emulator {
    config: RuntimeConfig,
    workers: usize,
    pool: Option<ThreadPool>,
    fibers: Vec<Mutex<FiberPool>>,
    budget: Arc<FiberBudget>,
    /// Idle fibers a pool keeps once its range is done.
    idle_per_worker: usize,
    counters: Counters,
}

impl Emulator {
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        config.validate()?;
        let workers = effective_workers(config.workers);
        let budget = Arc::new(FiberBudget::new(config.max_fibers));
        let idle_per_worker = config.max_fibers / 2 / workers;

        let pool = if workers > 1 {
            let pool = ThreadPoolBuilder::new()
                .num_threads(workers)
                .thread_name(|i| format!("cudify-worker-{i}"))
                .build()
                .map_err(|e| BackendError::WorkerPool(e.to_string()))?;
            Some(pool)
        } else {
            None
        };

        let fibers = (0..workers)
            .map(|worker| -> Result<Mutex<FiberPool>> {
                let mut fibers =
                    FiberPool::new(worker, config.fiber_stack_size, Arc::clone(&budget));
                fibers.reserve(config.prespawn_fibers)?;
                Ok(Mutex::new(fibers))
            })
            .collect::<Result<Vec<_>>>()?;

        info!(
            workers,
            fiber_stack_size = config.fiber_stack_size,
            prespawn_fibers = config.prespawn_fibers,
            max_fibers = config.max_fibers,
            "emulator ready"
        );

        Ok(Self {
            config,
            workers,
            pool,
            fibers,
            budget,
            idle_per_worker,
            counters: Counters::default(),
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Workers blocks are spread across.
    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn stats(&self) -> EmulatorStats {
        self.counters.snapshot(&self.budget)
    }

    /// Workers a launch with `threads_per_block` may occupy so that its
    /// blocks fit in half the fiber budget.
    pub fn active_workers(&self, threads_per_block: u64) -> usize {
        let fit = (self.budget.limit() as u64 / 2) / threads_per_block.max(1);
        self.workers.min(fit.max(1) as usize)
    }

    /// Run `kernel` once per thread of the grid and wait for all of them.
    ///
    /// The kernel may borrow from the caller. Launching from inside a kernel
    /// body is rejected.
    pub fn launch<F>(&self, config: &LaunchConfig, kernel: F) -> Result<()>
    where
        F: Fn(&ThreadCtx) + Sync,
    {
        config.validate()?;
        if coords::in_kernel() {
            return Err(BackendError::invalid_launch("cannot launch from inside a kernel body"));
        }

        let kernel: &(dyn Fn(&ThreadCtx) + Sync) = &kernel;
        // SAFETY: fibers only use the kernel between `Fiber::start` and the
        // terminal event it reports. `run_block` collects that event from
        // every fiber it started (aborting suspended ones on early return),
        // and this function returns only after every `run_block` call has.
        let kernel: KernelRef = unsafe { std::mem::transmute::<&(dyn Fn(&ThreadCtx) + Sync), KernelRef>(kernel) };

        let active = self.active_workers(config.threads_per_block());
        if active < self.workers {
            debug!(
                active,
                workers = self.workers,
                threads_per_block = config.threads_per_block(),
                "fiber budget limits the workers of this launch"
            );
        }
        let ranges = partition_blocks(config.total_blocks(), active);
        let threshold = cudify_tracing::performance::default_threshold_us();
        let span = cudify_tracing::perf_span_threshold!(
            "emulator_launch",
            threshold,
            blocks = config.total_blocks(),
            threads_per_block = config.threads_per_block(),
            workers = ranges.len()
        );
        debug!(grid = %config.grid, block = %config.block, workers = ranges.len(), "launch");
        self.counters.launches.fetch_add(1, Ordering::Relaxed);

        let failed = AtomicBool::new(false);
        let first_error: Mutex<Option<BackendError>> = Mutex::new(None);
        let run_range = |worker: usize, range: Range<u64>| {
            if let Err(err) = self.run_range(worker, range, kernel, config, &failed) {
                failed.store(true, Ordering::Relaxed);
                first_error.lock().get_or_insert(err);
            }
        };

        match &self.pool {
            Some(pool) if ranges.len() > 1 => pool.scope(|scope| {
                for (worker, range) in ranges.into_iter().enumerate() {
                    let run_range = &run_range;
                    scope.spawn(move |_| run_range(worker, range));
                }
            }),
            _ => {
                for (worker, range) in ranges.into_iter().enumerate() {
                    run_range(worker, range);
                }
            }
        }

        cudify_tracing::performance::record_launch(
            config.total_blocks(),
            config.threads_per_block(),
            span.elapsed_us(),
        );

        match first_error.into_inner() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn run_range(
        &self,
        worker: usize,
        range: Range<u64>,
        kernel: KernelRef,
        config: &LaunchConfig,
        failed: &AtomicBool,
    ) -> Result<()> {
        let mut fibers = self.fibers[worker].lock();
        let threads = config.threads_per_block();
        let mut outcome = Ok(());
        for block in range {
            if failed.load(Ordering::Relaxed) {
                break;
            }
            match scheduler::run_block(&mut fibers, kernel, config, block) {
                Ok(report) => self.counters.record_block(threads, report),
                Err(err) => {
                    outcome = Err(err);
                    break;
                }
            }
        }
        fibers.trim(self.idle_per_worker);
        outcome
    }
}

static GLOBAL: OnceLock<Emulator> = OnceLock::new();

/// Initialise the process-wide emulator.
///
/// Calling again with the same configuration returns the existing instance;
/// a different configuration fails with [`BackendError::AlreadyInitialized`].
pub fn init(config: RuntimeConfig) -> Result<&'static Emulator> {
    if GLOBAL.get().is_none() {
        let candidate = Emulator::new(config.clone())?;
        // Losing a race drops the candidate and its fibers.
        let _ = GLOBAL.set(candidate);
    }
    GLOBAL
        .get()
        .filter(|emulator| emulator.config == config)
        .ok_or(BackendError::AlreadyInitialized)
}

/// The process-wide emulator, initialised from the environment on first use.
pub fn global() -> Result<&'static Emulator> {
    if let Some(emulator) = GLOBAL.get() {
        return Ok(emulator);
    }
    match init(RuntimeConfig::from_env()) {
        Err(BackendError::AlreadyInitialized) => GLOBAL.get().ok_or(BackendError::AlreadyInitialized),
        other => other,
    }
}

pub fn is_initialized() -> bool {
    GLOBAL.get().is_some()
}

/// Launch on the process-wide emulator.
pub fn launch<F>(config: &LaunchConfig, kernel: F) -> Result<()>
where
    F: Fn(&ThreadCtx) + Sync,
{
    global()?.launch(config, kernel)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emulation::memory::DeviceBuffer;
    use crate::launch::Dim3;

    #[test]
    fn large_blocks_run_on_fewer_workers() {
        let emu = Emulator::new(
            RuntimeConfig::default()
                .with_workers(32)
                .with_fiber_stack_size(64 * 1024)
                .with_max_fibers(4096),
        )
        .unwrap();
        assert_eq!(emu.active_workers(1024), 2);
        assert_eq!(emu.active_workers(64), 32);
        assert_eq!(emu.active_workers(0), 32);
    }

    fn emulator(workers: usize) -> Emulator {
        Emulator::new(RuntimeConfig::default().with_workers(workers).with_fiber_stack_size(64 * 1024)).unwrap()
    }

    #[test]
    fn partition_is_balanced_and_contiguous() {
        assert_eq!(partition_blocks(10, 3), vec![0..4, 4..7, 7..10]);
        assert_eq!(partition_blocks(2, 8), vec![0..1, 1..2]);
        assert!(partition_blocks(0, 4).is_empty());
        assert_eq!(partition_blocks(5, 1), vec![0..5]);
    }

    #[test]
    fn every_thread_runs_once() {
        let emu = emulator(3);
        let config = LaunchConfig::new((3, 2, 1), (4, 2, 1));
        let hits = DeviceBuffer::<u32>::zeroed(config.total_threads() as usize);
        emu.launch(&config, |ctx| {
            let i = ctx.global_index() as usize;
            hits.set(i, hits.get(i) + 1);
        })
        .unwrap();
        assert!(hits.to_vec().iter().all(|&h| h == 1));

        let stats = emu.stats();
        assert_eq!(stats.launches, 1);
        assert_eq!(stats.blocks, 6);
        assert_eq!(stats.threads, 48);
    }

    #[test]
    fn invalid_config_is_rejected_before_running() {
        let emu = emulator(1);
        let err = emu.launch(&LaunchConfig::new(Dim3::ZERO, Dim3::ONE), |_| {}).unwrap_err();
        assert!(matches!(err, BackendError::InvalidLaunchConfig(_)));
        assert_eq!(emu.stats().launches, 0);
    }

    #[test]
    fn nested_launch_is_rejected() {
        let emu = emulator(1);
        let nested = DeviceBuffer::<u32>::zeroed(1);
        emu.launch(&LaunchConfig::default(), |_| {
            let inner = emu.launch(&LaunchConfig::default(), |_| {});
            nested.set(0, u32::from(matches!(inner, Err(BackendError::InvalidLaunchConfig(_)))));
        })
        .unwrap();
        assert_eq!(nested.get(0), 1);
    }

    #[test]
    fn panic_stops_the_launch() {
        let emu = emulator(2);
        let config = LaunchConfig::linear(64, 8);
        let err = emu
            .launch(&config, |ctx| {
                if ctx.block_idx().x == 5 && ctx.thread_idx().x == 3 {
                    panic!("block five");
                }
            })
            .unwrap_err();
        assert!(matches!(err, BackendError::KernelPanicked { block: 5, thread: 3, .. }));

        // The emulator stays usable.
        emu.launch(&config, |_| {}).unwrap();
    }

    #[test]
    fn fibers_are_reused_across_launches() {
        let emu = emulator(1);
        let config = LaunchConfig::linear(32, 16);
        emu.launch(&config, |ctx| ctx.sync_threads()).unwrap();
        emu.launch(&config, |ctx| ctx.sync_threads()).unwrap();
        let stats = emu.stats();
        assert_eq!(stats.fibers_spawned, 16);
        assert_eq!(stats.barriers, 4);
        assert_eq!(stats.resumes, 64);
    }

    #[test]
    fn an_aborted_launch_does_not_leak_into_the_next_one() {
        let emu = emulator(1);
        let config = LaunchConfig::linear(2, 2);
        let err = emu
            .launch(&config, |ctx| {
                ctx.sync_threads();
                if ctx.thread_idx().x == 1 {
                    panic!("second thread failed");
                }
                let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| ctx.sync_threads()));
                ctx.sync_threads();
            })
            .unwrap_err();
        assert!(matches!(err, BackendError::KernelPanicked { thread: 1, .. }));

        let out = DeviceBuffer::<u32>::zeroed(2);
        emu.launch(&config, |ctx| out.set(ctx.thread_idx().x as usize, 7)).unwrap();
        assert_eq!(out.to_vec(), vec![7, 7]);
    }
}
