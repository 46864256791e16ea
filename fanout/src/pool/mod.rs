//! Worker pools: the execution substrate behind a dispatch.
//!
//! A [`WorkerPool`] owns a fixed number of OS threads fed from one shared job
//! queue (a `crossbeam` channel). Submitting a job returns a [`TaskHandle`]
//! that resolves once a worker has run it.
//!
//! Thread pools run jobs directly on their worker threads. Process pools keep
//! the same threads, but each one drives a child process (see [`process`]) and
//! forwards the job's payload to it; this keeps CPU-heavy work out of the
//! parent's address space at the cost of serialising items and results.
//!
//! # Lifecycle
//! 1. [`WorkerPool::spawn`] starts every worker thread up front. Child
//!    processes are started lazily, on a worker's first remote job.
//! 2. [`WorkerPool::prewarm`] runs one warm-up job per worker. The jobs meet
//!    at a barrier, so each worker runs exactly one of them; process workers
//!    also launch and handshake their child.
//! 3. [`WorkerPool::shutdown`] closes the queue. Workers finish what is already
//!    queued, stop their children and exit; the pool joins them.
//!
//! Panics inside a job are caught on the worker and reported through the
//! job's handle. The worker keeps serving.

mod handle;
pub mod process;

pub use handle::TaskHandle;
pub use process::{ProcessCommand, WorkerRequest, WorkerResponse};

use crossbeam_channel::{Receiver, Sender, unbounded};
use std::{
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc, Barrier, Mutex, PoisonError,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crate::{
    error::{Error, Result, TaskError},
    settings::ExecutorKind,
};
use handle::task_channel;
use process::ChildWorker;

type Job = Box<dyn FnOnce(&mut WorkerContext) + Send + 'static>;

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a shareable pool: two dispatches with the same key use the
/// same pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub executor: ExecutorKind,
    pub workers: usize,
}

impl PoolKey {
    pub fn new(executor: ExecutorKind, workers: usize) -> Self {
        Self { executor, workers }
    }
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.executor, self.workers)
    }
}

/// Per-thread state handed to every job.
pub struct WorkerContext {
    index: usize,
    remote: Option<RemoteSlot>,
}

struct RemoteSlot {
    command: ProcessCommand,
    child: Option<ChildWorker>,
}

impl WorkerContext {
    /// Position of this worker inside its pool.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn is_process(&self) -> bool {
        self.remote.is_some()
    }

    /// Pid of the child process, if this worker has one running.
    pub fn child_pid(&self) -> Option<u32> {
        self.remote
            .as_ref()
            .and_then(|slot| slot.child.as_ref())
            .map(ChildWorker::pid)
    }

    /// Runs a named task in this worker's child process, launching the child
    /// first if needed.
    pub fn run_remote(
        &mut self,
        task: &str,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value, TaskError> {
        let request = WorkerRequest::Run {
            task: task.to_string(),
            payload,
        };
        match self.call(&request)? {
            WorkerResponse::Done { payload } => Ok(payload),
            WorkerResponse::Failed { message } => Err(TaskError::failed(message)),
            WorkerResponse::Panicked { message } => Err(TaskError::Panicked(message)),
            other => Err(TaskError::Remote(format!("unexpected response {other:?}"))),
        }
    }

    /// Makes sure the worker is ready to take real work.
    fn warm_up(&mut self) -> Result<(), TaskError> {
        if self.remote.is_none() {
            return Ok(());
        }
        match self.call(&WorkerRequest::Ping)? {
            WorkerResponse::Ready { .. } => Ok(()),
            other => Err(TaskError::Remote(format!("unexpected response {other:?}"))),
        }
    }

    fn call(&mut self, request: &WorkerRequest) -> Result<WorkerResponse, TaskError> {
        let slot = self
            .remote
            .as_mut()
            .ok_or_else(|| TaskError::Remote("not a process worker".into()))?;
        if slot.child.is_none() {
            slot.child = Some(ChildWorker::spawn(&slot.command)?);
        }
        let Some(child) = slot.child.as_mut() else {
            return Err(TaskError::Lost);
        };
        let response = child.call(request);
        if matches!(response, Err(TaskError::Lost | TaskError::Remote(_))) {
            // The next job gets a fresh child.
            tracing::warn!(worker = self.index, "Worker process went away");
            slot.child = None;
        }
        response
    }
}

/// A fixed-size set of workers sharing one job queue.
pub struct WorkerPool {
    id: u64,
    key: PoolKey,
    jobs: Mutex<Option<Sender<Job>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
    warmed: AtomicUsize,
    prewarming: Mutex<()>,
    last_used: Mutex<Instant>,
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl WorkerPool {
    /// Starts `key.workers` worker threads.
    ///
    /// `command` is only used by process pools.
    pub fn spawn(key: PoolKey, command: &ProcessCommand) -> Result<Self> {
        if key.workers == 0 {
            return Err(Error::config("a pool needs at least one worker"));
        }
        let id = NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = unbounded::<Job>();
        let pool = Self {
            id,
            key,
            jobs: Mutex::new(Some(tx)),
            threads: Mutex::new(Vec::with_capacity(key.workers)),
            closed: AtomicBool::new(false),
            warmed: AtomicUsize::new(0),
            prewarming: Mutex::new(()),
            last_used: Mutex::new(Instant::now()),
        };

        tracing::info!(pool = id, %key, "Spawning worker pool");
        for index in 0..key.workers {
            let ctx = WorkerContext {
                index,
                remote: match key.executor {
                    ExecutorKind::Thread => None,
                    ExecutorKind::Process => Some(RemoteSlot {
                        command: command.clone(),
                        child: None,
                    }),
                },
            };
            let handle = thread::Builder::new()
                .name(format!("fanout-{id}-{index}"))
                .spawn({
                    let rx = rx.clone();
                    move || worker_loop(id, ctx, rx)
                })
                // Dropping `pool` on error stops the workers started so far.
                .map_err(Error::PoolSpawn)?;
            lock(&pool.threads).push(handle);
        }
        Ok(pool)
    }

    /// Process-unique id, handy for telling pools apart.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn key(&self) -> PoolKey {
        self.key
    }

    pub fn workers(&self) -> usize {
        self.key.workers
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of workers confirmed live by [`prewarm`](Self::prewarm).
    pub fn warmed_workers(&self) -> usize {
        self.warmed.load(Ordering::Acquire)
    }

    /// Queues `task` and returns a handle to its outcome.
    ///
    /// The task is skipped (and resolves to [`TaskError::Cancelled`]) if its
    /// handle is cancelled before a worker picks it up.
    pub fn submit<R, F>(&self, task: F) -> Result<TaskHandle<R>>
    where
        R: Send + 'static,
        F: FnOnce(&mut WorkerContext) -> Result<R, TaskError> + Send + 'static,
    {
        let (done, handle) = task_channel();
        let job: Job = Box::new(move |ctx| {
            if done.is_cancelled() {
                done.complete(Err(TaskError::Cancelled));
                return;
            }
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| task(ctx)))
                .unwrap_or_else(|payload| Err(TaskError::from_panic(payload)));
            done.complete(outcome);
        });

        let jobs = lock(&self.jobs);
        let sender = jobs.as_ref().ok_or(Error::PoolClosed(self.key))?;
        sender
            .send(job)
            .map_err(|_| Error::PoolClosed(self.key))?;
        drop(jobs);
        self.touch();
        Ok(handle)
    }

    /// Runs one warm-up job on every worker and waits for all of them.
    pub fn prewarm(&self) -> Result<()> {
        let workers = self.key.workers;
        let barrier = Arc::new(Barrier::new(workers));
        let started = Instant::now();
        // Two interleaved rounds would each hold part of the workers at their
        // barrier and never complete.
        let _round = lock(&self.prewarming);
        let handles = (0..workers)
            .map(|_| {
                let barrier = Arc::clone(&barrier);
                self.submit(move |ctx| {
                    let ready = ctx.warm_up();
                    // Everyone reaches the barrier, even on failure, or the
                    // other warm-up jobs would wait forever.
                    barrier.wait();
                    ready
                })
            })
            .collect::<Result<Vec<_>>>()?;

        for handle in handles {
            handle.wait().map_err(|source| Error::Prewarm {
                key: self.key,
                source,
            })?;
        }
        self.warmed.store(workers, Ordering::Release);
        tracing::debug!(
            pool = self.id,
            workers,
            elapsed = ?started.elapsed(),
            "Worker pool prewarmed"
        );
        Ok(())
    }

    /// Closes the queue and joins the workers once they have drained it.
    ///
    /// Idempotent. Called from one of the pool's own workers it does not wait
    /// for that worker.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!(pool = self.id, key = %self.key, "Shutting down worker pool");
        lock(&self.jobs).take();

        let current = thread::current().id();
        let threads = std::mem::take(&mut *lock(&self.threads));
        for handle in threads {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                tracing::error!(pool = self.id, "Worker thread panicked");
            }
        }
    }

    pub(crate) fn touch(&self) {
        *lock(&self.last_used) = Instant::now();
    }

    /// Time since the pool last accepted a job or was handed out.
    pub fn idle_for(&self) -> Duration {
        lock(&self.last_used).elapsed()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(pool: u64, mut ctx: WorkerContext, jobs: Receiver<Job>) {
    tracing::debug!(pool, worker = ctx.index, "Worker started");
    while let Ok(job) = jobs.recv() {
        job(&mut ctx);
    }
    tracing::debug!(pool, worker = ctx.index, "Worker stopped");
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{collections::HashSet, sync::mpsc};

    fn thread_pool(workers: usize) -> WorkerPool {
        WorkerPool::spawn(
            PoolKey::new(ExecutorKind::Thread, workers),
            &ProcessCommand::new("unused"),
        )
        .unwrap()
    }

    #[test]
    fn runs_submitted_tasks() {
        let pool = thread_pool(2);
        let handles: Vec<_> = (0..8)
            .map(|i| pool.submit(move |_| Ok(i * 10)).unwrap())
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.wait().unwrap()).collect();
        assert_eq!(results, vec![0, 10, 20, 30, 40, 50, 60, 70]);
    }

    #[test]
    fn tasks_run_concurrently_up_to_the_worker_count() {
        let pool = thread_pool(3);
        let barrier = Arc::new(Barrier::new(3));
        // Would deadlock unless three workers run at the same time.
        let handles: Vec<_> = (0..3)
            .map(|_| {
                let barrier = Arc::clone(&barrier);
                pool.submit(move |ctx| {
                    barrier.wait();
                    Ok(ctx.index())
                })
                .unwrap()
            })
            .collect();
        let workers: HashSet<_> = handles.into_iter().map(|h| h.wait().unwrap()).collect();
        assert_eq!(workers.len(), 3);
    }

    #[test]
    fn panics_are_reported_and_the_worker_survives() {
        let pool = thread_pool(1);
        let boom = pool
            .submit(|_| -> Result<(), TaskError> { panic!("kaboom") })
            .unwrap();
        assert!(matches!(boom.wait(), Err(TaskError::Panicked(msg)) if msg == "kaboom"));
        assert_eq!(pool.submit(|_| Ok(1)).unwrap().wait().unwrap(), 1);
    }

    #[test]
    fn cancelled_tasks_are_skipped() {
        let pool = thread_pool(1);
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let blocker = pool
            .submit(move |_| {
                let _ = release_rx.recv();
                Ok(())
            })
            .unwrap();
        let ran = Arc::new(AtomicBool::new(false));
        let queued = pool
            .submit({
                let ran = Arc::clone(&ran);
                move |_| {
                    ran.store(true, Ordering::SeqCst);
                    Ok(())
                }
            })
            .unwrap();
        queued.cancel();
        release_tx.send(()).unwrap();

        blocker.wait().unwrap();
        assert!(matches!(queued.wait(), Err(TaskError::Cancelled)));
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[test]
    fn prewarm_touches_every_worker() {
        let pool = thread_pool(4);
        assert_eq!(pool.warmed_workers(), 0);
        pool.prewarm().unwrap();
        assert_eq!(pool.warmed_workers(), 4);
        pool.prewarm().unwrap();
        assert_eq!(pool.warmed_workers(), 4);
    }

    #[test]
    fn shutdown_drains_queue_and_rejects_new_work() {
        let pool = thread_pool(1);
        let handles: Vec<_> = (0..5)
            .map(|i| {
                pool.submit(move |_| {
                    thread::sleep(Duration::from_millis(5));
                    Ok(i)
                })
                .unwrap()
            })
            .collect();
        pool.shutdown();
        assert!(pool.is_closed());
        for (i, handle) in handles.into_iter().enumerate() {
            assert_eq!(handle.wait().unwrap(), i);
        }
        assert!(matches!(
            pool.submit(|_| Ok(())),
            Err(Error::PoolClosed(key)) if key == pool.key()
        ));
    }

    #[test]
    fn thread_workers_have_no_child_process() {
        let pool = thread_pool(1);
        let err = pool
            .submit(|ctx| {
                assert!(!ctx.is_process());
                ctx.run_remote("anything", serde_json::Value::Null)
            })
            .unwrap()
            .wait()
            .unwrap_err();
        assert!(matches!(err, TaskError::Remote(_)));
    }

    #[test]
    fn zero_workers_is_a_config_error() {
        let err = WorkerPool::spawn(
            PoolKey::new(ExecutorKind::Thread, 0),
            &ProcessCommand::new("unused"),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn pool_ids_are_unique() {
        assert_ne!(thread_pool(1).id(), thread_pool(1).id());
    }

    #[test]
    fn key_display() {
        assert_eq!(PoolKey::new(ExecutorKind::Process, 8).to_string(), "process:8");
    }
}
