//! Stack-bearing execution contexts for simulated threads.
//!
//! A fiber is a parked OS thread with its own stack. Control moves between
//! the worker (the scheduler's main continuation) and a fiber only by
//! blocking hand-off: the worker posts a command and waits for the fiber's
//! event, the fiber posts an event and waits for the next command. At any
//! moment either the worker or exactly one of its fibers is runnable.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use crate::emulation::coords::{self, ThreadCtx};
use crate::error::{BackendError, Result};
use crate::launch::ExecutionContext;

/// Kernel reference handed to fibers. The scheduler guarantees no fiber
/// still holds it once the launch that created it returns.
pub(crate) type KernelRef = &'static (dyn Fn(&ThreadCtx) + Sync);

pub(crate) struct Job {
    pub kernel: KernelRef,
    pub exec: ExecutionContext,
}

enum Command {
    Run(Job),
    Resume,
    Abort,
    Shutdown,
}

/// What a fiber reports when it hands control back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Event {
    Barrier,
    Completed,
    Panicked(String),
    Aborted,
}

/// Unwind payload used to tear down a suspended kernel body.
struct AbortSignal;

/// Single-slot blocking hand-off.
struct Mailbox<T> {
    slot: Mutex<Option<T>>,
    ready: Condvar,
}

impl<T> Mailbox<T> {
    fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            ready: Condvar::new(),
        }
    }

    fn put(&self, value: T) {
        let mut slot = self.slot.lock();
        *slot = Some(value);
        self.ready.notify_one();
    }

    fn take(&self) -> T {
        let mut slot = self.slot.lock();
        loop {
            if let Some(value) = slot.take() {
                return value;
            }
            self.ready.wait(&mut slot);
        }
    }
}

/// Channel pair shared by a fiber and its worker.
pub(crate) struct FiberLink {
    commands: Mailbox<Command>,
    events: Mailbox<Event>,
    /// Set once the current job was told to abort; cleared by the next `Run`.
    aborting: AtomicBool,
    shutting_down: AtomicBool,
}

impl FiberLink {
    fn new() -> Self {
        Self {
            commands: Mailbox::new(),
            events: Mailbox::new(),
            aborting: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Called on the fiber at a barrier: yield to the worker and wait.
    ///
    /// Once the job has been aborted every later barrier unwinds straight
    /// away, so a body that catches the unwind still runs to its end before
    /// the worker gets control back.
    pub(crate) fn suspend(&self) {
        if self.aborting.load(Ordering::Acquire) || self.shutting_down.load(Ordering::Acquire) {
            panic::resume_unwind(Box::new(AbortSignal));
        }
        self.events.put(Event::Barrier);
        match self.commands.take() {
            Command::Resume => {}
            Command::Abort => {
                self.aborting.store(true, Ordering::Release);
                panic::resume_unwind(Box::new(AbortSignal));
            }
            Command::Shutdown => {
                self.shutting_down.store(true, Ordering::Release);
                panic::resume_unwind(Box::new(AbortSignal));
            }
            Command::Run(_) => unreachable!("fiber received a job while suspended at a barrier"),
        }
    }
}

impl fmt::Debug for FiberLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FiberLink").finish_non_exhaustive()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

fn run_job(link: &Arc<FiberLink>, job: Job) -> Event {
    let ctx = Rc::new(ThreadCtx::on_fiber(job.exec, Arc::clone(link)));
    let _current = coords::install(Rc::clone(&ctx));
    let kernel = job.kernel;

    match panic::catch_unwind(AssertUnwindSafe(|| kernel(&ctx))) {
        Ok(()) => Event::Completed,
        Err(payload) if payload.is::<AbortSignal>() => Event::Aborted,
        Err(payload) => Event::Panicked(panic_message(payload.as_ref())),
    }
}

fn fiber_main(link: Arc<FiberLink>) {
    loop {
        match link.commands.take() {
            Command::Run(job) => {
                link.aborting.store(false, Ordering::Release);
                let event = run_job(&link, job);
                if link.shutting_down.load(Ordering::Acquire) {
                    break;
                }
                link.events.put(event);
            }
            Command::Resume => link.events.put(Event::Completed),
            Command::Abort => link.events.put(Event::Aborted),
            Command::Shutdown => break,
        }
    }
}

/// Fiber accounting shared by every pool of one emulator.
///
/// Each fiber is an OS thread, so the number alive at once is capped.
#[derive(Debug)]
pub(crate) struct FiberBudget {
    limit: usize,
    live: AtomicUsize,
    peak: AtomicUsize,
    spawned: AtomicU64,
}

impl FiberBudget {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            limit,
            live: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            spawned: AtomicU64::new(0),
        }
    }

    fn claim(&self) -> Result<()> {
        let live = self.live.fetch_add(1, Ordering::AcqRel) + 1;
        if live > self.limit {
            self.live.fetch_sub(1, Ordering::AcqRel);
            return Err(BackendError::FiberLimit { limit: self.limit });
        }
        self.peak.fetch_max(live, Ordering::Relaxed);
        Ok(())
    }

    fn give_back(&self) {
        self.live.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn limit(&self) -> usize {
        self.limit
    }

    /// Fibers alive right now, idle or lent to a block.
    pub(crate) fn live(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// Highest `live` value ever observed.
    pub(crate) fn peak(&self) -> usize {
        self.peak.load(Ordering::Relaxed)
    }

    pub(crate) fn spawned(&self) -> u64 {
        self.spawned.load(Ordering::Relaxed)
    }
}

/// Worker-side handle to one fiber.
pub(crate) struct Fiber {
    id: usize,
    link: Arc<FiberLink>,
    handle: Option<JoinHandle<()>>,
    budget: Arc<FiberBudget>,
}

impl Fiber {
    pub(crate) fn spawn(worker: usize, id: usize, stack_size: usize, budget: &Arc<FiberBudget>) -> Result<Self> {
        budget.claim()?;
        let link = Arc::new(FiberLink::new());
        let fiber_link = Arc::clone(&link);
        let spawned = thread::Builder::new()
            .name(format!("cudify-w{worker}-f{id}"))
            .stack_size(stack_size)
            .spawn(move || fiber_main(fiber_link));
        let handle = match spawned {
            Ok(handle) => handle,
            Err(err) => {
                budget.give_back();
                return Err(BackendError::FiberSpawn(err));
            }
        };
        budget.spawned.fetch_add(1, Ordering::Relaxed);
        debug!(worker, fiber = id, stack_size, "fiber spawned");
        Ok(Self {
            id,
            link,
            handle: Some(handle),
            budget: Arc::clone(budget),
        })
    }

    fn exchange(&self, command: Command) -> Event {
        self.link.commands.put(command);
        self.link.events.take()
    }

    /// Start a simulated thread; returns at its first barrier or at completion.
    pub(crate) fn start(&self, job: Job) -> Event {
        self.exchange(Command::Run(job))
    }

    /// Continue past a barrier.
    pub(crate) fn resume(&self) -> Event {
        trace!(fiber = self.id, "resume");
        self.exchange(Command::Resume)
    }

    /// Unwind a suspended kernel body. Returns once the body has finished,
    /// so the event is never [`Event::Barrier`].
    pub(crate) fn abort(&self) -> Event {
        self.exchange(Command::Abort)
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        self.link.commands.put(Command::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        self.budget.give_back();
    }
}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber").field("id", &self.id).finish()
    }
}

/// Fibers owned by one worker.
#[derive(Debug)]
pub(crate) struct FiberPool {
    worker: usize,
    stack_size: usize,
    idle: Vec<Fiber>,
    next_id: usize,
    budget: Arc<FiberBudget>,
}

impl FiberPool {
    pub(crate) fn new(worker: usize, stack_size: usize, budget: Arc<FiberBudget>) -> Self {
        Self {
            worker,
            stack_size,
            idle: Vec::new(),
            next_id: 0,
            budget,
        }
    }

    fn spawn(&mut self) -> Result<Fiber> {
        let fiber = Fiber::spawn(self.worker, self.next_id, self.stack_size, &self.budget)?;
        self.next_id += 1;
        Ok(fiber)
    }

    /// Make sure at least `count` fibers are idle.
    pub fn reserve(&mut self, count: usize) -> Result<()> {
        while self.idle.len() < count {
            let fiber = self.spawn()?;
            self.idle.push(fiber);
        }
        Ok(())
    }

    /// An idle fiber, spawning one when the pool is exhausted.
    pub fn acquire(&mut self) -> Result<Fiber> {
        match self.idle.pop() {
            Some(fiber) => Ok(fiber),
            None => self.spawn(),
        }
    }

    /// Return a fiber that is parked waiting for a command.
    pub fn release(&mut self, fiber: Fiber) {
        self.idle.push(fiber);
    }

    /// Shut down idle fibers until at most `keep` remain.
    pub fn trim(&mut self, keep: usize) {
        if self.idle.len() > keep {
            trace!(worker = self.worker, from = self.idle.len(), to = keep, "trimming fiber pool");
            self.idle.truncate(keep);
        }
    }

    #[cfg(test)]
    pub fn idle(&self) -> usize {
        self.idle.len()
    }

    /// Fibers this pool has created over its lifetime.
    #[cfg(test)]
    pub fn created(&self) -> usize {
        self.next_id
    }
}
