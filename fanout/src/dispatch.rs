//! Dispatch: run one function over many items.
//!
//! A [`Dispatcher`] owns resolved [`ExecutionSettings`] and, if they carry a
//! rate limit, one [`RateLimiter`] shared by every call made through it. A call
//! takes a [`Batch`]:
//!
//! - `Batch::One(item)` calls the function directly on the caller's thread and
//!   wraps the result in a one-element vector. No pool, no rate limit.
//! - `Batch::Many(items)` acquires the shared pool for the settings, then
//!   submits one task per item in input order. Each submission first waits for
//!   a permit when a rate limit is set, so it is admission that is paced, not
//!   completion. Results are collected in submission order, so `out[i]` always
//!   belongs to `items[i]` however the tasks interleave.
//!
//! # Failures
//!
//! The first failing item fails the whole call with [`Error::Task`], carrying
//! the item's index. Tasks that have not started yet are cancelled, and the
//! submission loop stops early once any task has failed. Partial results are
//! dropped. Nothing is retried.
//!
//! [`Parallel`] is the same machinery bound to one function, which is what
//! [`Engine::parallel`](crate::Engine::parallel) and `#[parallel]` hand out.

use std::{
    convert::Infallible,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use crate::{
    error::{BoxError, Error, Result, TaskError},
    pool::{TaskHandle, WorkerContext, WorkerPool},
    rate::RateLimiter,
    registry::PoolRegistry,
    remote::{self, RemoteTask},
    settings::{ExecutionSettings, ExecutorKind},
};

/// Input of a dispatch: one item or a batch of them.
///
/// The shape is fixed by the item type. For a `Dispatcher` over `String`
/// items a `String` is one item and a `Vec<String>` is a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Batch<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> Batch<T> {
    pub fn len(&self) -> usize {
        match self {
            Self::One(_) => 1,
            Self::Many(items) => items.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn into_vec(self) -> Vec<T> {
        match self {
            Self::One(item) => vec![item],
            Self::Many(items) => items,
        }
    }
}

impl<T> From<T> for Batch<T> {
    fn from(item: T) -> Self {
        Self::One(item)
    }
}

impl<T> From<Vec<T>> for Batch<T> {
    fn from(items: Vec<T>) -> Self {
        Self::Many(items)
    }
}

impl<T, const N: usize> From<[T; N]> for Batch<T> {
    fn from(items: [T; N]) -> Self {
        Self::Many(Vec::from(items))
    }
}

impl<T: Clone> From<&[T]> for Batch<T> {
    fn from(items: &[T]) -> Self {
        Self::Many(items.to_vec())
    }
}

/// Runs functions over batches with fixed settings.
#[derive(Debug)]
pub struct Dispatcher {
    settings: ExecutionSettings,
    registry: Arc<PoolRegistry>,
    limiter: Option<Arc<RateLimiter>>,
}

impl Dispatcher {
    pub fn new(settings: ExecutionSettings, registry: Arc<PoolRegistry>) -> Result<Self> {
        settings.validate()?;
        let limiter = settings
            .rate_limit
            .map(|limit| Arc::new(RateLimiter::new(limit)));
        Ok(Self {
            settings,
            registry,
            limiter,
        })
    }

    pub fn settings(&self) -> &ExecutionSettings {
        &self.settings
    }

    pub fn limiter(&self) -> Option<&RateLimiter> {
        self.limiter.as_deref()
    }

    pub fn registry(&self) -> &Arc<PoolRegistry> {
        &self.registry
    }

    /// Applies `f` to every item of `input`.
    pub fn run<T, R, F>(&self, input: impl Into<Batch<T>>, f: F) -> Result<Vec<R>>
    where
        T: Send + 'static,
        R: Send + 'static,
        F: Fn(T) -> R + Send + Sync + 'static,
    {
        self.try_run(input, move |item| Ok::<_, Infallible>(f(item)))
    }

    /// Applies a fallible `f` to every item of `input`, failing on the first
    /// error.
    pub fn try_run<T, R, E, F>(&self, input: impl Into<Batch<T>>, f: F) -> Result<Vec<R>>
    where
        T: Send + 'static,
        R: Send + 'static,
        E: Into<BoxError>,
        F: Fn(T) -> std::result::Result<R, E> + Send + Sync + 'static,
    {
        self.ensure_in_process()?;
        match input.into() {
            Batch::One(item) => call_one(item, &f),
            Batch::Many(items) => self.scatter(items, in_thread(f)),
        }
    }

    /// Runs the remote task `K` over `input`. On a process pool every item is
    /// executed by a worker process.
    pub fn run_remote<K: RemoteTask>(
        &self,
        input: impl Into<Batch<K::Item>>,
    ) -> Result<Vec<K::Output>> {
        match input.into() {
            Batch::One(item) => call_one(item, &K::run),
            Batch::Many(items) => match self.settings.executor {
                ExecutorKind::Thread => self.scatter(items, in_thread(K::run)),
                ExecutorKind::Process => self.scatter(items, in_child::<K>()),
            },
        }
    }

    /// Async twin of [`run`](Self::run). Waits for permits and results
    /// without blocking the runtime.
    pub async fn run_async<T, R, F>(&self, input: impl Into<Batch<T>>, f: F) -> Result<Vec<R>>
    where
        T: Send + 'static,
        R: Send + 'static,
        F: Fn(T) -> R + Send + Sync + 'static,
    {
        self.try_run_async(input, move |item| Ok::<_, Infallible>(f(item)))
            .await
    }

    /// Async twin of [`try_run`](Self::try_run).
    pub async fn try_run_async<T, R, E, F>(
        &self,
        input: impl Into<Batch<T>>,
        f: F,
    ) -> Result<Vec<R>>
    where
        T: Send + 'static,
        R: Send + 'static,
        E: Into<BoxError>,
        F: Fn(T) -> std::result::Result<R, E> + Send + Sync + 'static,
    {
        self.ensure_in_process()?;
        match input.into() {
            Batch::One(item) => call_one(item, &f),
            Batch::Many(items) => self.scatter_async(items, in_thread(f)).await,
        }
    }

    pub(crate) fn ensure_in_process(&self) -> Result<()> {
        if self.settings.executor == ExecutorKind::Process {
            return Err(Error::config(
                "closures cannot run in worker processes, use a RemoteTask or the thread executor",
            ));
        }
        Ok(())
    }

    fn pool(&self) -> Result<Arc<WorkerPool>> {
        self.registry.acquire(
            self.settings.executor,
            self.settings.workers,
            self.settings.prewarm,
        )
    }

    fn scatter<T, R, F>(&self, items: Vec<T>, task: F) -> Result<Vec<R>>
    where
        T: Send + 'static,
        R: Send + 'static,
        F: Fn(T, &mut WorkerContext) -> std::result::Result<R, TaskError> + Send + Sync + 'static,
    {
        if items.is_empty() {
            return Ok(Vec::new());
        }
        let pool = self.pool()?;
        let mut batch = Scatter::new(pool, task, items.len());
        for item in items {
            if batch.aborted() {
                break;
            }
            if let Some(limiter) = &self.limiter {
                limiter.acquire();
            }
            batch.submit(item)?;
        }
        batch.collect()
    }

    async fn scatter_async<T, R, F>(&self, items: Vec<T>, task: F) -> Result<Vec<R>>
    where
        T: Send + 'static,
        R: Send + 'static,
        F: Fn(T, &mut WorkerContext) -> std::result::Result<R, TaskError> + Send + Sync + 'static,
    {
        if items.is_empty() {
            return Ok(Vec::new());
        }
        let pool = self.pool()?;
        let mut batch = Scatter::new(pool, task, items.len());
        for item in items {
            if batch.aborted() {
                break;
            }
            if let Some(limiter) = &self.limiter {
                limiter.acquire_async().await;
            }
            batch.submit(item)?;
        }
        batch.collect_async().await
    }
}

/// One in-flight batch: the shared task, its handles and the abort flag.
struct Scatter<T, R, F> {
    pool: Arc<WorkerPool>,
    task: Arc<F>,
    abort: Arc<AtomicBool>,
    handles: Vec<TaskHandle<R>>,
    _item: std::marker::PhantomData<fn(T)>,
}

impl<T, R, F> Scatter<T, R, F>
where
    T: Send + 'static,
    R: Send + 'static,
    F: Fn(T, &mut WorkerContext) -> std::result::Result<R, TaskError> + Send + Sync + 'static,
{
    fn new(pool: Arc<WorkerPool>, task: F, len: usize) -> Self {
        tracing::debug!(pool = pool.id(), items = len, "Dispatching batch");
        Self {
            pool,
            task: Arc::new(task),
            abort: Arc::new(AtomicBool::new(false)),
            handles: Vec::with_capacity(len),
            _item: std::marker::PhantomData,
        }
    }

    fn aborted(&self) -> bool {
        self.abort.load(Ordering::Acquire)
    }

    fn submit(&mut self, item: T) -> Result<()> {
        let index = self.handles.len();
        let task = Arc::clone(&self.task);
        let abort = Arc::clone(&self.abort);
        let submitted = self.pool.submit(move |ctx| {
            if abort.load(Ordering::Acquire) {
                return Err(TaskError::Cancelled);
            }
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| task(item, ctx)))
                .unwrap_or_else(|payload| Err(TaskError::from_panic(payload)));
            if let Err(e) = &outcome {
                tracing::debug!(index, "Task failed: {e}");
                abort.store(true, Ordering::Release);
            }
            outcome
        });
        match submitted {
            Ok(handle) => {
                tracing::trace!(index, "Task submitted");
                self.handles.push(handle);
                Ok(())
            }
            Err(e) => {
                self.handles.iter().for_each(TaskHandle::cancel);
                Err(e)
            }
        }
    }

    fn collect(self) -> Result<Vec<R>> {
        let mut results = Vec::with_capacity(self.handles.len());
        let mut pending = self.handles.into_iter().enumerate();
        while let Some((index, handle)) = pending.next() {
            match handle.wait() {
                Ok(value) => results.push(value),
                Err(source) => {
                    let rest: Vec<_> = pending.collect();
                    rest.iter().for_each(|(_, h)| h.cancel());
                    let mut failure = (index, source);
                    if matches!(failure.1, TaskError::Cancelled) {
                        // Skipped because a later task failed first; report
                        // that one instead.
                        failure = rest
                            .into_iter()
                            .find_map(|(i, h)| match h.wait() {
                                Err(e) if !matches!(e, TaskError::Cancelled) => Some((i, e)),
                                _ => None,
                            })
                            .unwrap_or(failure);
                    }
                    return Err(task_failure(failure));
                }
            }
        }
        Ok(results)
    }

    async fn collect_async(self) -> Result<Vec<R>> {
        let mut results = Vec::with_capacity(self.handles.len());
        let mut pending = self.handles.into_iter().enumerate();
        while let Some((index, handle)) = pending.next() {
            match handle.await {
                Ok(value) => results.push(value),
                Err(source) => {
                    let rest: Vec<_> = pending.collect();
                    rest.iter().for_each(|(_, h)| h.cancel());
                    let mut failure = (index, source);
                    if matches!(failure.1, TaskError::Cancelled) {
                        for (i, h) in rest {
                            if let Err(e) = h.await {
                                if !matches!(e, TaskError::Cancelled) {
                                    failure = (i, e);
                                    break;
                                }
                            }
                        }
                    }
                    return Err(task_failure(failure));
                }
            }
        }
        Ok(results)
    }
}

fn task_failure((index, source): (usize, TaskError)) -> Error {
    tracing::error!(index, "Batch failed: {source}");
    Error::Task { index, source }
}

fn call_one<T, R, E, F>(item: T, f: &F) -> Result<Vec<R>>
where
    E: Into<BoxError>,
    F: Fn(T) -> std::result::Result<R, E>,
{
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| f(item)))
        .map_err(TaskError::from_panic)
        .and_then(|result| result.map_err(TaskError::failed));
    match outcome {
        Ok(value) => Ok(vec![value]),
        Err(source) => Err(task_failure((0, source))),
    }
}

fn in_thread<T, R, E, F>(
    f: F,
) -> impl Fn(T, &mut WorkerContext) -> std::result::Result<R, TaskError> + Send + Sync + 'static
where
    E: Into<BoxError>,
    F: Fn(T) -> std::result::Result<R, E> + Send + Sync + 'static,
{
    move |item: T, _ctx: &mut WorkerContext| f(item).map_err(TaskError::failed)
}

fn in_child<K: RemoteTask>()
-> impl Fn(K::Item, &mut WorkerContext) -> std::result::Result<K::Output, TaskError>
+ Send
+ Sync
+ 'static {
    |item: K::Item, ctx: &mut WorkerContext| -> std::result::Result<K::Output, TaskError> {
        let payload = remote::encode(&item)?;
        let output = ctx.run_remote(K::NAME, payload)?;
        remote::decode(output)
    }
}

/// A function bound to a [`Dispatcher`].
///
/// Built by [`Engine::parallel`](crate::Engine::parallel) and
/// [`Engine::method`](crate::Engine::method).
pub struct Parallel<F> {
    dispatcher: Dispatcher,
    f: Arc<F>,
}

impl<F> std::fmt::Debug for Parallel<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Parallel")
            .field("settings", self.dispatcher.settings())
            .finish_non_exhaustive()
    }
}

impl<F> Parallel<F> {
    pub(crate) fn new(dispatcher: Dispatcher, f: F) -> Self {
        Self {
            dispatcher,
            f: Arc::new(f),
        }
    }

    pub fn settings(&self) -> &ExecutionSettings {
        self.dispatcher.settings()
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn call<T, R>(&self, input: impl Into<Batch<T>>) -> Result<Vec<R>>
    where
        T: Send + 'static,
        R: Send + 'static,
        F: Fn(T) -> R + Send + Sync + 'static,
    {
        let f = Arc::clone(&self.f);
        self.dispatcher.run(input, move |item| f(item))
    }

    pub fn try_call<T, R, E>(&self, input: impl Into<Batch<T>>) -> Result<Vec<R>>
    where
        T: Send + 'static,
        R: Send + 'static,
        E: Into<BoxError>,
        F: Fn(T) -> std::result::Result<R, E> + Send + Sync + 'static,
    {
        let f = Arc::clone(&self.f);
        self.dispatcher.try_run(input, move |item| f(item))
    }

    pub async fn call_async<T, R>(&self, input: impl Into<Batch<T>>) -> Result<Vec<R>>
    where
        T: Send + 'static,
        R: Send + 'static,
        F: Fn(T) -> R + Send + Sync + 'static,
    {
        let f = Arc::clone(&self.f);
        self.dispatcher.run_async(input, move |item| f(item)).await
    }

    pub async fn try_call_async<T, R, E>(&self, input: impl Into<Batch<T>>) -> Result<Vec<R>>
    where
        T: Send + 'static,
        R: Send + 'static,
        E: Into<BoxError>,
        F: Fn(T) -> std::result::Result<R, E> + Send + Sync + 'static,
    {
        let f = Arc::clone(&self.f);
        self.dispatcher.try_run_async(input, move |item| f(item)).await
    }
}
