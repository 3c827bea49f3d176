//! Suspension and resume descriptors, async work handles and pipes.

use std::{
    collections::VecDeque,
    fmt, mem,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use parking_lot::Mutex;

use super::frame::ReturnTarget;
use crate::{exception::ScriptError, intern::FuncId, native::NativeError, object::Object};

/// Callback that makes a parked thread runnable again.
pub type Waker = Box<dyn FnOnce() + Send>;

/// What a suspended thread is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, strum::IntoStaticStr)]
pub enum SuspendState {
    #[default]
    None,
    AwaitingItem,
    AwaitingJob,
}

/// Outstanding suspension of a thread, with everything needed to resume it.
#[derive(Debug, Default)]
pub(crate) enum SuspendInfo {
    #[default]
    None,
    /// Parked on an `AwaitItem`; the instruction re-executes on resume.
    AwaitingItem { pipe: PipeHandle },
    /// Waiting for a child thread or native async work to finish.
    AwaitingJob { target: ReturnTarget, resume: JobResume },
}

impl SuspendInfo {
    pub(crate) fn state(&self) -> SuspendState {
        match self {
            Self::None => SuspendState::None,
            Self::AwaitingItem { .. } => SuspendState::AwaitingItem,
            Self::AwaitingJob { .. } => SuspendState::AwaitingJob,
        }
    }
}

/// How a finished job is folded back into the waiting thread.
#[derive(Debug)]
pub(crate) enum JobResume {
    /// Store the job result into the return target.
    StoreResult,
    /// Call the native again with the same arguments and progress buffer, passing the job result.
    ReenterNative {
        func: FuncId,
        args: Vec<Object>,
        progress: Vec<u8>,
    },
}

/// Information handed to a suspended thread when it becomes runnable again.
#[derive(Debug, Clone, PartialEq)]
pub enum ResumeInfo {
    /// The awaited pipe has an item (or may have one; the await re-checks).
    ItemReady,
    /// The awaited job finished.
    JobDone(Result<Object, ScriptError>),
}

/// Why a thread suspended; returned to the supervisor in [`ThreadExit::Suspended`].
#[derive(Debug)]
pub enum SuspendRequest {
    /// Run `func` on a new thread and deliver its result back.
    AsyncCall { func: FuncId, args: Vec<Object> },
    /// A native returned async work; start it with [`VmThread::start_foreground_work`](super::VmThread::start_foreground_work).
    AsyncWork,
    /// Wake the thread once the pipe has an item.
    AwaitItem(PipeHandle),
}

/// Outcome of one [`VmThread::run`](super::VmThread::run) slice.
#[derive(Debug)]
pub enum ThreadExit {
    /// The top-level call returned.
    Returned(Object),
    /// The top-level call raised an error nothing caught.
    Errored(ScriptError),
    Suspended(SuspendRequest),
    /// The slice budget ran out at a call boundary; the thread can be run again as is.
    Yielded,
}

/// A unit of work a native hands off instead of blocking its thread.
pub trait AsyncWork: Send {
    /// Starts the work. `done` must be completed at most once, and not after [`abort`](Self::abort).
    fn start(&mut self, done: JobCompletion);

    /// Cancels the work. The owning thread resumes with an `AbortedError`.
    fn abort(&mut self);
}

/// One-shot completion callback for [`AsyncWork`].
pub struct JobCompletion(Box<dyn FnOnce(Result<Object, NativeError>) + Send>);

impl JobCompletion {
    pub fn new(f: impl FnOnce(Result<Object, NativeError>) + Send + 'static) -> Self {
        Self(Box::new(f))
    }

    pub fn complete(self, result: Result<Object, NativeError>) {
        (self.0)(result);
    }
}

impl fmt::Debug for JobCompletion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("JobCompletion")
    }
}

type Task = Box<dyn FnOnce(&AtomicBool) -> Result<Object, NativeError> + Send>;

/// [`AsyncWork`] that runs a closure on its own OS thread.
///
/// The closure receives the cancel flag and may poll it; a result produced after cancellation is dropped.
pub struct SpawnedJob {
    task: Option<Task>,
    cancelled: Arc<AtomicBool>,
}

impl SpawnedJob {
    pub fn new(task: impl FnOnce(&AtomicBool) -> Result<Object, NativeError> + Send + 'static) -> Self {
        Self {
            task: Some(Box::new(task)),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Shared flag that flips when the job is aborted.
    #[must_use]
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }
}

impl AsyncWork for SpawnedJob {
    fn start(&mut self, done: JobCompletion) {
        let Some(task) = self.task.take() else {
            return;
        };
        let cancelled = Arc::clone(&self.cancelled);
        std::thread::spawn(move || {
            let result = task(&cancelled);
            if !cancelled.load(Ordering::Acquire) {
                done.complete(result);
            }
        });
    }

    fn abort(&mut self) {
        self.task = None;
        self.cancelled.store(true, Ordering::Release);
    }
}

#[derive(Default)]
struct PipeState {
    items: VecDeque<Object>,
    waiters: Vec<Waker>,
}

/// Shared handle to a FIFO of objects that VM threads and the host can send into and await on.
#[derive(Clone, Default)]
pub struct PipeHandle(Arc<Mutex<PipeState>>);

impl PipeHandle {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues an item and wakes every thread parked on the pipe.
    pub fn send(&self, item: Object) {
        let waiters = {
            let mut state = self.0.lock();
            state.items.push_back(item);
            mem::take(&mut state.waiters)
        };
        for wake in waiters {
            wake();
        }
    }

    #[must_use]
    pub fn try_recv(&self) -> Option<Object> {
        self.0.lock().items.pop_front()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.lock().items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Parks `wake` until the next send. Returns `false` without parking if an item is already queued.
    pub(crate) fn park(&self, wake: Waker) -> bool {
        let mut state = self.0.lock();
        if state.items.is_empty() {
            state.waiters.push(wake);
            true
        } else {
            false
        }
    }
}

impl PartialEq for PipeHandle {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl fmt::Debug for PipeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.0.lock();
        f.debug_struct("PipeHandle")
            .field("items", &state.items.len())
            .field("waiters", &state.waiters.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[test]
    fn send_wakes_parked_waiters_once() {
        let pipe = PipeHandle::new();
        let woken = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&woken);
        assert!(pipe.park(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })));
        pipe.send(Object::Int(1));
        pipe.send(Object::Int(2));
        assert_eq!(woken.load(Ordering::SeqCst), 1);
        assert_eq!(pipe.try_recv(), Some(Object::Int(1)));
        assert_eq!(pipe.len(), 1);
    }

    #[test]
    fn park_refuses_when_items_are_queued() {
        let pipe = PipeHandle::new();
        pipe.send(Object::None);
        assert!(!pipe.park(Box::new(|| {})));
    }

    #[test]
    fn aborted_job_never_completes() {
        let mut job = SpawnedJob::new(|_| Ok(Object::Int(1)));
        job.abort();
        let (tx, rx) = crossbeam_channel::bounded(1);
        job.start(JobCompletion::new(move |result| {
            let _ = tx.send(result);
        }));
        assert!(rx.recv_timeout(std::time::Duration::from_millis(50)).is_err());
    }
}
