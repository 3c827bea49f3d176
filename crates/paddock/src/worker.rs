//! OS-thread worker pool that runs VM threads.
//!
//! The supervisor submits runnable [`ThreadSlot`]s; any idle worker picks one up, claims it, runs
//! one slice and reports the [`ThreadExit`] back as a [`SupervisorEvent`]. The claim is an atomic
//! compare-exchange on the slot, so a VM thread is never executed by two workers at once even if
//! it were submitted twice.

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, trace, warn};

use crate::{
    exception::ScriptError,
    exec::ExecError,
    object::Object,
    resource::ResourceTracker,
    tracer::VmTracer,
    vm::{ThreadExit, ThreadId, VmThread},
};

const NO_WORKER: usize = usize::MAX;

/// Poll interval of an idle worker checking whether the pool is shutting down.
const IDLE_POLL: Duration = Duration::from_millis(50);

/// A VM thread shared between the supervisor and the workers.
pub(crate) struct ThreadSlot<T: ResourceTracker, Tr: VmTracer> {
    id: ThreadId,
    /// Index of the worker currently running the thread, or `NO_WORKER`.
    run_by_worker: AtomicUsize,
    thread: Mutex<VmThread<T, Tr>>,
}

impl<T: ResourceTracker, Tr: VmTracer> ThreadSlot<T, Tr> {
    pub fn new(thread: VmThread<T, Tr>) -> Self {
        Self {
            id: thread.id(),
            run_by_worker: AtomicUsize::new(NO_WORKER),
            thread: Mutex::new(thread),
        }
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    /// Claims the thread for `worker`. Fails if another worker holds it.
    pub fn claim(&self, worker: usize) -> bool {
        self.run_by_worker
            .compare_exchange(NO_WORKER, worker, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn release(&self, worker: usize) {
        let released = self
            .run_by_worker
            .compare_exchange(worker, NO_WORKER, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        debug_assert!(released, "ThreadSlot::release: worker {worker} did not hold thread {}", self.id);
    }

    #[must_use]
    pub fn is_claimed(&self) -> bool {
        self.run_by_worker.load(Ordering::Acquire) != NO_WORKER
    }

    /// Locks the VM thread for inspection or resumption outside a worker.
    pub fn lock(&self) -> MutexGuard<'_, VmThread<T, Tr>> {
        self.thread.lock()
    }
}

impl<T: ResourceTracker, Tr: VmTracer> fmt::Debug for ThreadSlot<T, Tr> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadSlot")
            .field("id", &self.id)
            .field("run_by_worker", &self.run_by_worker.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Everything the workers and async work report to the supervisor.
#[derive(Debug)]
pub(crate) enum SupervisorEvent {
    /// A slice ended.
    Exited { thread: ThreadId, exit: ThreadExit },
    /// Async work started by a native finished.
    JobFinished {
        thread: ThreadId,
        result: Result<Object, ScriptError>,
    },
    /// A pipe the thread was parked on received an item.
    Wake { thread: ThreadId },
}

enum WorkerMessage<T: ResourceTracker, Tr: VmTracer> {
    Run(Arc<ThreadSlot<T, Tr>>),
    Shutdown,
}

/// Fixed set of named OS threads pulling VM threads from a shared queue.
pub(crate) struct WorkerPool<T: ResourceTracker, Tr: VmTracer> {
    sender: Sender<WorkerMessage<T, Tr>>,
    running: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
}

impl<T: ResourceTracker, Tr: VmTracer> WorkerPool<T, Tr> {
    /// Starts `count` workers (at least one). Slice results are sent to `events`.
    pub fn new(count: usize, events: &Sender<SupervisorEvent>) -> Result<Self, ExecError> {
        let (sender, receiver) = unbounded();
        let running = Arc::new(AtomicBool::new(true));
        let mut pool = Self {
            sender,
            running,
            workers: Vec::with_capacity(count.max(1)),
        };
        for index in 0..count.max(1) {
            let receiver = receiver.clone();
            let events = events.clone();
            let running = Arc::clone(&pool.running);
            let handle = thread::Builder::new()
                .name(format!("paddock-worker-{index}"))
                .spawn(move || Self::worker_loop(index, &receiver, &events, &running))
                .map_err(ExecError::WorkerSpawn)?;
            pool.workers.push(handle);
        }
        debug!(workers = pool.workers.len(), "worker pool started");
        Ok(pool)
    }

    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Queues a runnable thread. Returns `false` once the pool is shut down.
    pub fn submit(&self, slot: Arc<ThreadSlot<T, Tr>>) -> bool {
        trace!(thread = %slot.id(), "thread submitted");
        self.running.load(Ordering::Acquire) && self.sender.send(WorkerMessage::Run(slot)).is_ok()
    }

    /// Stops every worker after its current slice and waits for them.
    pub fn shutdown(&mut self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        for _ in 0..self.workers.len() {
            let _ = self.sender.send(WorkerMessage::Shutdown);
        }
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        debug!("worker pool stopped");
    }

    fn worker_loop(
        index: usize,
        receiver: &Receiver<WorkerMessage<T, Tr>>,
        events: &Sender<SupervisorEvent>,
        running: &AtomicBool,
    ) {
        debug!(worker = index, "worker started");
        while running.load(Ordering::Acquire) {
            match receiver.recv_timeout(IDLE_POLL) {
                Ok(WorkerMessage::Run(slot)) => {
                    if !slot.claim(index) {
                        warn!(worker = index, thread = %slot.id(), "thread is already claimed by another worker");
                        continue;
                    }
                    let exit = slot.lock().run();
                    slot.release(index);
                    trace!(worker = index, thread = %slot.id(), exit = exit_kind(&exit), "slice finished");
                    if events
                        .send(SupervisorEvent::Exited {
                            thread: slot.id(),
                            exit,
                        })
                        .is_err()
                    {
                        debug!(worker = index, "supervisor gone");
                        break;
                    }
                }
                Ok(WorkerMessage::Shutdown) => {
                    debug!(worker = index, "worker received shutdown signal");
                    break;
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    debug!(worker = index, "work queue disconnected");
                    break;
                }
            }
        }
        debug!(worker = index, "worker stopped");
    }
}

fn exit_kind(exit: &ThreadExit) -> &'static str {
    match exit {
        ThreadExit::Returned(_) => "returned",
        ThreadExit::Errored(_) => "errored",
        ThreadExit::Suspended(_) => "suspended",
        ThreadExit::Yielded => "yielded",
    }
}

impl<T: ResourceTracker, Tr: VmTracer> Drop for WorkerPool<T, Tr> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl<T: ResourceTracker, Tr: VmTracer> fmt::Debug for WorkerPool<T, Tr> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.workers.len())
            .field("running", &self.running.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{program::Program, resource::NoLimitTracker, tracer::NoopTracer};

    fn slot() -> ThreadSlot<NoLimitTracker, NoopTracer> {
        let thread = VmThread::new(Arc::new(Program::new()), NoLimitTracker, NoopTracer);
        ThreadSlot::new(thread)
    }

    #[test]
    fn claim_is_exclusive() {
        let slot = slot();
        assert!(slot.claim(0));
        assert!(!slot.claim(1));
        assert!(slot.is_claimed());
        slot.release(0);
        assert!(!slot.is_claimed());
        assert!(slot.claim(1));
    }

    #[test]
    fn pool_reports_slices_and_shuts_down() {
        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        let mut pool = WorkerPool::<NoLimitTracker, NoopTracer>::new(2, &events_tx).unwrap();
        assert_eq!(pool.worker_count(), 2);

        // a thread with nothing to run errors out immediately
        let slot = Arc::new(slot());
        let id = slot.id();
        assert!(pool.submit(slot));
        match events_rx.recv_timeout(Duration::from_secs(5)).unwrap() {
            SupervisorEvent::Exited { thread, exit } => {
                assert_eq!(thread, id);
                assert!(matches!(exit, ThreadExit::Errored(_)));
            }
            other => panic!("unexpected event {other:?}"),
        }

        pool.shutdown();
        assert_eq!(pool.worker_count(), 0);
        assert!(!pool.submit(Arc::new(self::slot())));
    }
}
