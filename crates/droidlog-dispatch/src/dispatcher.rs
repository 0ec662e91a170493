use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle, ThreadId};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, trace, warn};

use crate::error::{DispatchError, Result, TaskOutcome, WorkFailure};

/// Identifier assigned to every scheduled task, used in diagnostics
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Dispatcher settings
#[derive(Clone, Debug)]
pub struct DispatcherConfig {
    /// Number of background worker threads (at least one is started)
    pub worker_threads: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self { worker_threads: 1 }
    }
}

/// Integration step: the user callback bound to the work result
type Integration = Box<dyn FnOnce() + Send>;

/// Work step: runs the user work and returns the bound integration step
type Job = Box<dyn FnOnce() -> Integration + Send>;

struct QueuedJob {
    id: TaskId,
    job: Job,
}

struct WorkQueue {
    jobs: VecDeque<QueuedJob>,
    running: bool,
}

/// State shared with the worker threads
struct Shared {
    /// Pending work, guarded together with the running flag
    work: Mutex<WorkQueue>,

    /// Signalled when work is queued or the dispatcher stops
    work_ready: Condvar,

    /// Finished work waiting for the owning thread
    completed: Mutex<VecDeque<(TaskId, Integration)>>,

    /// Scheduled asynchronously but not yet integrated
    outstanding: AtomicUsize,
}

/// Runs work off the owning thread and integrates results back on it
///
/// The thread that calls [`Dispatcher::new`] is the main thread. Results of
/// asynchronous work are only handed to their integration callbacks from
/// [`Dispatcher::drain`], which the main thread calls once per tick.
pub struct Dispatcher {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    main_thread: ThreadId,
    next_id: AtomicU64,
}

impl Dispatcher {
    /// Create a dispatcher owned by the calling thread and start its workers
    pub fn new(config: DispatcherConfig) -> Result<Self> {
        let shared = Arc::new(Shared {
            work: Mutex::new(WorkQueue {
                jobs: VecDeque::new(),
                running: true,
            }),
            work_ready: Condvar::new(),
            completed: Mutex::new(VecDeque::new()),
            outstanding: AtomicUsize::new(0),
        });

        let dispatcher = Self {
            shared,
            workers: Mutex::new(Vec::new()),
            main_thread: thread::current().id(),
            next_id: AtomicU64::new(0),
        };

        let worker_count = config.worker_threads.max(1);
        for index in 0..worker_count {
            let shared = Arc::clone(&dispatcher.shared);
            let handle = thread::Builder::new()
                .name(format!("dispatch-worker-{index}"))
                .spawn(move || worker_loop(shared))
                .map_err(|e| DispatchError::Spawn(e.to_string()))?;
            dispatcher.workers.lock().push(handle);
        }

        info!(workers = worker_count, "Dispatcher started");
        Ok(dispatcher)
    }

    /// Schedule `work(input)` and hand its outcome to `integrate`
    ///
    /// With `synchronous` set both steps run right away on the calling thread.
    /// Otherwise `work` runs on a worker and `integrate` runs during the next
    /// [`Dispatcher::drain`] after the work finished.
    pub fn schedule<I, R, W, F>(
        &self,
        input: I,
        work: W,
        integrate: F,
        synchronous: bool,
    ) -> Result<TaskId>
    where
        I: Send + 'static,
        R: Send + 'static,
        W: FnOnce(I) -> R + Send + 'static,
        F: FnOnce(TaskOutcome<R>) + Send + 'static,
    {
        let id = TaskId(self.next_id.fetch_add(1, Ordering::Relaxed));

        if synchronous {
            if !self.is_running() {
                return Err(DispatchError::ShutDown);
            }
            trace!(task = %id, main_thread = self.is_main_thread(), "Running task inline");
            integrate(run_work(id, work, input));
            return Ok(id);
        }

        let job: Job = Box::new(move || {
            let outcome = run_work(id, work, input);
            Box::new(move || integrate(outcome))
        });

        {
            let mut queue = self.shared.work.lock();
            if !queue.running {
                return Err(DispatchError::ShutDown);
            }
            queue.jobs.push_back(QueuedJob { id, job });
            self.shared.outstanding.fetch_add(1, Ordering::Relaxed);
        }
        self.shared.work_ready.notify_one();

        trace!(task = %id, "Task queued");
        Ok(id)
    }

    /// Run the integration callbacks of every task that finished so far
    ///
    /// Returns how many callbacks ran. A panic inside a callback propagates to
    /// the caller; callbacks that had not run yet stay queued.
    pub fn drain(&self) -> Result<usize> {
        if !self.is_main_thread() {
            return Err(DispatchError::NotMainThread);
        }

        let ready = self.shared.completed.lock().len();
        let mut integrated = 0;
        for _ in 0..ready {
            let next = self.shared.completed.lock().pop_front();
            let Some((id, integration)) = next else {
                break;
            };
            self.shared.outstanding.fetch_sub(1, Ordering::Relaxed);
            trace!(task = %id, "Integrating task");
            integrated += 1;
            integration();
        }

        Ok(integrated)
    }

    /// Stop accepting work, let workers finish what is queued, and join them
    ///
    /// Results finished before or during shutdown can still be drained.
    pub fn shutdown(&self) -> Result<()> {
        {
            let mut queue = self.shared.work.lock();
            if !queue.running {
                return Err(DispatchError::AlreadyShutdown);
            }
            queue.running = false;
            debug!(queued = queue.jobs.len(), "Dispatcher shutting down");
        }
        self.shared.work_ready.notify_all();
        self.join_workers();

        info!("Dispatcher shut down");
        Ok(())
    }

    /// Whether the calling thread is the one that created the dispatcher
    pub fn is_main_thread(&self) -> bool {
        thread::current().id() == self.main_thread
    }

    pub fn is_running(&self) -> bool {
        self.shared.work.lock().running
    }

    /// Tasks scheduled asynchronously whose integration has not run yet
    pub fn pending(&self) -> usize {
        self.shared.outstanding.load(Ordering::Relaxed)
    }

    fn join_workers(&self) {
        let handles = std::mem::take(&mut *self.workers.lock());
        let current = thread::current().id();
        for handle in handles {
            // A worker cannot join itself
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                error!("Dispatcher worker terminated abnormally");
            }
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        let abandoned = {
            let mut queue = self.shared.work.lock();
            queue.running = false;
            std::mem::take(&mut queue.jobs)
        };
        if !abandoned.is_empty() {
            warn!(abandoned = abandoned.len(), "Dispatcher dropped with queued tasks");
        }
        drop(abandoned);

        self.shared.work_ready.notify_all();
        self.join_workers();
    }
}

fn worker_loop(shared: Arc<Shared>) {
    debug!("Dispatcher worker started");

    loop {
        let next = {
            let mut queue = shared.work.lock();
            loop {
                if let Some(job) = queue.jobs.pop_front() {
                    break Some(job);
                }
                if !queue.running {
                    break None;
                }
                shared.work_ready.wait(&mut queue);
            }
        };

        let Some(QueuedJob { id, job }) = next else {
            break;
        };

        trace!(task = %id, "Running task");
        let integration = job();
        shared.completed.lock().push_back((id, integration));
    }

    debug!("Dispatcher worker exited");
}

/// Run one work function, turning a panic into a failure outcome
fn run_work<I, R, W>(id: TaskId, work: W, input: I) -> TaskOutcome<R>
where
    W: FnOnce(I) -> R,
{
    panic::catch_unwind(AssertUnwindSafe(move || work(input))).map_err(|payload| {
        let message = panic_message(payload.as_ref());
        error!(task = %id, %message, "Task work panicked");
        WorkFailure { task: id, message }
    })
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
