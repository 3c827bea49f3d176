//! Supervisor that drives VM threads on the worker pool.
//!
//! [`VmExec`] owns the main VM thread (the only one with globals) and every thread spawned for an
//! async call. Workers report each finished slice back over a channel; the supervisor reacts by
//! resubmitting yielded threads, spawning threads for async calls to threadable functions,
//! starting native async work, parking threads on pipes, and delivering child results to the
//! parent that awaited them.

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread,
    time::Duration,
};

use ahash::AHashMap;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use tracing::{debug, trace, warn};

use crate::{
    exception::ScriptError,
    intern::FuncId,
    object::Object,
    program::Program,
    resource::{LimitedTracker, NoLimitTracker, ResourceLimits, ResourceTracker},
    tracer::{NoopTracer, VmTracer},
    vm::{JobCompletion, ResumeInfo, SuspendRequest, SuspendState, ThreadExit, ThreadId, VmThread, Waker},
    worker::{SupervisorEvent, ThreadSlot, WorkerPool},
};

/// How long the supervisor waits for an event before re-checking the stop flag.
const EVENT_POLL: Duration = Duration::from_millis(20);

/// Scheduler settings.
#[derive(Debug, Clone, Default)]
pub struct ExecConfig {
    /// Worker threads. 0 = one per available CPU.
    pub workers: usize,
    /// Instructions a VM thread runs before yielding at the next call boundary. 0 = never yield.
    pub slice_budget: usize,
    /// Limits for [`VmExec::limited`]; each VM thread gets its own tracker.
    pub limits: ResourceLimits,
}

impl ExecConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    #[must_use]
    pub fn slice_budget(mut self, budget: usize) -> Self {
        self.slice_budget = budget;
        self
    }

    #[must_use]
    pub fn limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    fn worker_count(&self) -> usize {
        if self.workers > 0 {
            self.workers
        } else {
            thread::available_parallelism().map_or(1, std::num::NonZero::get)
        }
    }
}

/// Scheduling counters shared by the supervisor and its VM threads.
#[derive(Debug, Default)]
pub(crate) struct ExecCounters {
    pub threads_spawned: AtomicU64,
    pub async_dispatches: AtomicU64,
    pub inline_async_calls: AtomicU64,
    pub native_suspensions: AtomicU64,
    pub yields: AtomicU64,
}

/// Snapshot of the scheduling counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExecStats {
    /// VM threads created for async calls.
    pub threads_spawned: u64,
    /// Async calls handed to the pool.
    pub async_dispatches: u64,
    /// Async calls to non-threadable functions that ran on the calling thread instead.
    pub inline_async_calls: u64,
    /// Natives that suspended on async work.
    pub native_suspensions: u64,
    /// Slices that ended on the instruction budget.
    pub yields: u64,
    /// VM threads currently registered, the main thread included.
    pub live_threads: usize,
    pub workers: usize,
}

/// Result of a top-level call.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecOutcome {
    Returned(Object),
    UncaughtError(ScriptError),
}

impl ExecOutcome {
    /// The returned object, or the uncaught error.
    pub fn into_result(self) -> Result<Object, ScriptError> {
        match self {
            Self::Returned(obj) => Ok(obj),
            Self::UncaughtError(err) => Err(err),
        }
    }
}

/// Failures of the scheduler itself, as opposed to script errors.
#[derive(Debug)]
pub enum ExecError {
    /// The stop handle was triggered. The executor cannot run further calls.
    Stopped,
    /// The event channel closed while threads were still running.
    Disconnected,
    /// The program has no `main` function.
    NoEntryPoint,
    WorkerSpawn(std::io::Error),
}

impl fmt::Display for ExecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => f.write_str("execution was stopped"),
            Self::Disconnected => f.write_str("worker pool disconnected"),
            Self::NoEntryPoint => f.write_str("program has no main function"),
            Self::WorkerSpawn(err) => write!(f, "failed to spawn worker thread: {err}"),
        }
    }
}

impl std::error::Error for ExecError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::WorkerSpawn(err) => Some(err),
            _ => None,
        }
    }
}

/// Cloneable handle that makes a running [`VmExec`] stop at the next call boundary.
#[derive(Debug, Clone)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

struct ThreadRecord<T: ResourceTracker, Tr: VmTracer> {
    slot: Arc<ThreadSlot<T, Tr>>,
    /// The thread suspended on this one's result.
    awaited_by: Option<ThreadId>,
}

/// Runs a program's functions on a pool of worker threads.
pub struct VmExec<T: ResourceTracker = NoLimitTracker, Tr: VmTracer + Default = NoopTracer> {
    program: Arc<Program>,
    tracker: T,
    config: ExecConfig,
    main: ThreadId,
    threads: AHashMap<ThreadId, ThreadRecord<T, Tr>>,
    pool: WorkerPool<T, Tr>,
    events_tx: Sender<SupervisorEvent>,
    events: Receiver<SupervisorEvent>,
    stop: Arc<AtomicBool>,
    counters: Arc<ExecCounters>,
}

impl<Tr: VmTracer + Default> VmExec<LimitedTracker, Tr> {
    /// An executor whose threads each enforce `config.limits`.
    pub fn limited(program: Arc<Program>, config: ExecConfig) -> Result<Self, ExecError> {
        let tracker = LimitedTracker::new(config.limits.clone());
        Self::new(program, tracker, config)
    }
}

impl<T: ResourceTracker, Tr: VmTracer + Default> VmExec<T, Tr> {
    /// Creates the main thread and starts the workers. Every VM thread gets a clone of `tracker`.
    pub fn new(program: Arc<Program>, tracker: T, config: ExecConfig) -> Result<Self, ExecError> {
        let (events_tx, events) = unbounded();
        let pool = WorkerPool::new(config.worker_count(), &events_tx)?;
        let stop = Arc::new(AtomicBool::new(false));
        let counters = Arc::new(ExecCounters::default());
        let main = VmThread::new_main(Arc::clone(&program), tracker.clone(), Tr::default())
            .with_slice_budget(config.slice_budget)
            .with_stop_flag(Arc::clone(&stop))
            .with_counters(Arc::clone(&counters));
        let main_id = main.id();
        let mut threads = AHashMap::new();
        threads.insert(
            main_id,
            ThreadRecord {
                slot: Arc::new(ThreadSlot::new(main)),
                awaited_by: None,
            },
        );
        Ok(Self {
            program,
            tracker,
            config,
            main: main_id,
            threads,
            pool,
            events_tx,
            events,
            stop,
            counters,
        })
    }

    #[must_use]
    pub fn program(&self) -> &Arc<Program> {
        &self.program
    }

    #[must_use]
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(Arc::clone(&self.stop))
    }

    /// Runs the global initializers, then `main`.
    pub fn run_main(&mut self) -> Result<ExecOutcome, ExecError> {
        let well_known = *self.program.well_known();
        for init in [well_known.global_init_simple, well_known.global_init].into_iter().flatten() {
            if let ExecOutcome::UncaughtError(err) = self.run_function(init, Vec::new())? {
                return Ok(ExecOutcome::UncaughtError(err));
            }
        }
        let main = well_known.main.ok_or(ExecError::NoEntryPoint)?;
        self.run_function(main, Vec::new())
    }

    /// Calls `func` on the main thread and drives every thread it spawns until the call finishes.
    pub fn run_function(&mut self, func: FuncId, args: Vec<Object>) -> Result<ExecOutcome, ExecError> {
        if self.stop.load(Ordering::Acquire) {
            return Err(ExecError::Stopped);
        }
        let slot = self.slot(self.main).ok_or(ExecError::Disconnected)?;
        if let Err(err) = slot.lock().start_call(func, args) {
            return Ok(ExecOutcome::UncaughtError(err));
        }
        debug!(function = %func, "running function on the main thread");
        self.submit(slot)?;
        self.drive(self.main)
    }

    /// Gives access to the main thread between calls, e.g. to read globals or its tracer.
    pub fn with_main_thread<R>(&self, f: impl FnOnce(&VmThread<T, Tr>) -> R) -> Option<R> {
        let slot = self.slot(self.main)?;
        let thread = slot.lock();
        Some(f(&thread))
    }

    #[must_use]
    pub fn stats(&self) -> ExecStats {
        ExecStats {
            threads_spawned: self.counters.threads_spawned.load(Ordering::Relaxed),
            async_dispatches: self.counters.async_dispatches.load(Ordering::Relaxed),
            inline_async_calls: self.counters.inline_async_calls.load(Ordering::Relaxed),
            native_suspensions: self.counters.native_suspensions.load(Ordering::Relaxed),
            yields: self.counters.yields.load(Ordering::Relaxed),
            live_threads: self.threads.len(),
            workers: self.pool.worker_count(),
        }
    }

    /// Stops the workers and aborts async work still pending on any thread.
    pub fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        self.pool.shutdown();
        for record in self.threads.values() {
            record.slot.lock().abort_async_foreground_work();
        }
    }

    fn slot(&self, thread: ThreadId) -> Option<Arc<ThreadSlot<T, Tr>>> {
        self.threads.get(&thread).map(|record| Arc::clone(&record.slot))
    }

    fn submit(&self, slot: Arc<ThreadSlot<T, Tr>>) -> Result<(), ExecError> {
        if self.pool.submit(slot) {
            Ok(())
        } else {
            Err(ExecError::Disconnected)
        }
    }

    fn drive(&mut self, root: ThreadId) -> Result<ExecOutcome, ExecError> {
        loop {
            if self.stop.load(Ordering::Acquire) {
                warn!("execution stopped, aborting pending async work");
                self.shutdown();
                return Err(ExecError::Stopped);
            }
            let event = match self.events.recv_timeout(EVENT_POLL) {
                Ok(event) => event,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return Err(ExecError::Disconnected),
            };
            match event {
                SupervisorEvent::Exited { thread, exit } => {
                    if let Some(outcome) = self.on_exit(thread, exit, root)? {
                        return Ok(outcome);
                    }
                }
                SupervisorEvent::JobFinished { thread, result } => {
                    trace!(thread = %thread, "async work finished");
                    self.resume(thread, ResumeInfo::JobDone(result))?;
                }
                SupervisorEvent::Wake { thread } => {
                    let Some(slot) = self.slot(thread) else {
                        continue;
                    };
                    let woken = {
                        let mut vm = slot.lock();
                        vm.suspend_state() == SuspendState::AwaitingItem && vm.resume_with(ResumeInfo::ItemReady)
                    };
                    if woken {
                        self.submit(slot)?;
                    }
                }
            }
        }
    }

    fn on_exit(&mut self, thread: ThreadId, exit: ThreadExit, root: ThreadId) -> Result<Option<ExecOutcome>, ExecError> {
        match exit {
            ThreadExit::Returned(obj) => self.finish(thread, Ok(obj), root),
            ThreadExit::Errored(err) => self.finish(thread, Err(err), root),
            ThreadExit::Yielded => {
                let slot = self.slot(thread).ok_or(ExecError::Disconnected)?;
                self.submit(slot)?;
                Ok(None)
            }
            ThreadExit::Suspended(request) => {
                self.on_suspend(thread, request)?;
                Ok(None)
            }
        }
    }

    fn on_suspend(&mut self, thread: ThreadId, request: SuspendRequest) -> Result<(), ExecError> {
        match request {
            SuspendRequest::AsyncCall { func, args } => {
                let mut child = VmThread::new(Arc::clone(&self.program), self.tracker.clone(), Tr::default())
                    .with_slice_budget(self.config.slice_budget)
                    .with_stop_flag(Arc::clone(&self.stop))
                    .with_counters(Arc::clone(&self.counters));
                if let Err(err) = child.start_call(func, args) {
                    return self.resume(thread, ResumeInfo::JobDone(Err(err)));
                }
                let child_id = child.id();
                let slot = Arc::new(ThreadSlot::new(child));
                self.threads.insert(
                    child_id,
                    ThreadRecord {
                        slot: Arc::clone(&slot),
                        awaited_by: Some(thread),
                    },
                );
                self.counters.threads_spawned.fetch_add(1, Ordering::Relaxed);
                self.counters.async_dispatches.fetch_add(1, Ordering::Relaxed);
                debug!(parent = %thread, child = %child_id, function = %func, "async call dispatched to a new thread");
                self.submit(slot)
            }
            SuspendRequest::AsyncWork => {
                let slot = self.slot(thread).ok_or(ExecError::Disconnected)?;
                self.counters.native_suspensions.fetch_add(1, Ordering::Relaxed);
                let events = self.events_tx.clone();
                let done = JobCompletion::new(move |result| {
                    let _ = events.send(SupervisorEvent::JobFinished {
                        thread,
                        result: result.map_err(ScriptError::from),
                    });
                });
                if !slot.lock().start_foreground_work(done) {
                    warn!(thread = %thread, "suspended on async work but has none pending");
                }
                Ok(())
            }
            SuspendRequest::AwaitItem(pipe) => {
                let events = self.events_tx.clone();
                let waker: Waker = Box::new(move || {
                    let _ = events.send(SupervisorEvent::Wake { thread });
                });
                if !pipe.park(waker) {
                    // an item arrived between the await and the park
                    let slot = self.slot(thread).ok_or(ExecError::Disconnected)?;
                    if slot.lock().resume_with(ResumeInfo::ItemReady) {
                        self.submit(slot)?;
                    }
                }
                Ok(())
            }
        }
    }

    /// Handles a thread's final exit: the root's result ends the drive loop, a child's result goes
    /// to the parent waiting on it.
    fn finish(
        &mut self,
        thread: ThreadId,
        result: Result<Object, ScriptError>,
        root: ThreadId,
    ) -> Result<Option<ExecOutcome>, ExecError> {
        if thread == root {
            return Ok(Some(match result {
                Ok(obj) => ExecOutcome::Returned(obj),
                Err(err) => ExecOutcome::UncaughtError(err),
            }));
        }
        let Some(record) = self.threads.remove(&thread) else {
            warn!(thread = %thread, "exit of an unknown thread");
            return Ok(None);
        };
        trace!(thread = %thread, ok = result.is_ok(), "child thread finished");
        match record.awaited_by {
            Some(parent) => self.resume(parent, ResumeInfo::JobDone(result)).map(|()| None),
            None => Ok(None),
        }
    }

    fn resume(&mut self, thread: ThreadId, info: ResumeInfo) -> Result<(), ExecError> {
        let Some(slot) = self.slot(thread) else {
            warn!(thread = %thread, "resume for an unknown thread");
            return Ok(());
        };
        let accepted = slot.lock().resume_with(info);
        if accepted {
            self.submit(slot)
        } else {
            warn!(thread = %thread, "thread refused resume information");
            Ok(())
        }
    }
}

impl<T: ResourceTracker, Tr: VmTracer + Default> Drop for VmExec<T, Tr> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl<T: ResourceTracker, Tr: VmTracer + Default> fmt::Debug for VmExec<T, Tr> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VmExec")
            .field("main", &self.main)
            .field("threads", &self.threads.len())
            .field("pool", &self.pool)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
