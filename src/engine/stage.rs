//! Stage runtime: a pool of workers applying one function in a loop.
//!
//! The loop a worker runs is picked by the stage's channel shape:
//!
//! | Shape | Input | Output | Loop |
//! |-------|-------|--------|------|
//! | Source | - | yes | call `f()` while the upstream is live, stop early on `finished` |
//! | Transform | yes | yes | pop, apply, push while the upstream is live, then drain |
//! | Sink | yes | - | pop, apply while the upstream is live, then drain |
//!
//! Consumers never block forever on an empty input: every read has a
//! timeout after which the upstream is re-checked. Once the upstream is no
//! longer live the worker pops without waiting until the input is empty, so
//! items buffered before the upstream shut down are still processed.
//!
//! Every worker owns a guard that decrements the stage's [`Liveness`] when
//! the worker finishes, whichever way it finishes.

use super::backoff::Backoff;
use super::channel::BoundedChannel;
use super::error::{BoxError, ChannelError, StageError};
use super::liveness::{Liveness, Upstream, WorkerGuard};
use super::policy::{ErrorPolicy, LogAndDrop};
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{Instrument, debug, error, info, info_span, warn};

/// Default wait on an empty input before re-checking the upstream.
pub const DEFAULT_QUEUE_TIMEOUT: Duration = Duration::from_secs(5);

/// How a stage's workers are executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Tasks on the shared async runtime. For I/O-bound functions.
    Cooperative,
    /// Thread isolation: one dedicated OS thread per worker, off the async
    /// executor. Workers still share the process address space. For
    /// CPU-bound functions that would otherwise starve the runtime.
    Isolated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StageShape {
    Source,
    Transform,
    Sink,
}

/// What one source invocation yields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Produced<T> {
    pub items: Vec<T>,
    /// The source has nothing more to give; the worker exits after pushing
    /// `items`.
    pub finished: bool,
}

impl<T> Produced<T> {
    pub fn many(items: Vec<T>) -> Self {
        Self {
            items,
            finished: false,
        }
    }

    pub fn finished(mut self, finished: bool) -> Self {
        self.finished = finished;
        self
    }
}

/// Construction-time parameters shared by every stage shape.
#[derive(Debug, Clone)]
pub struct StageOptions {
    name: String,
    workers: usize,
    mode: ExecutionMode,
    policy: Arc<dyn ErrorPolicy>,
    queue_timeout: Duration,
    error_backoff: Backoff,
    liveness: Option<Liveness>,
}

impl StageOptions {
    pub fn new(name: impl Into<String>, workers: usize) -> Self {
        Self {
            name: name.into(),
            workers,
            mode: ExecutionMode::Cooperative,
            policy: Arc::new(LogAndDrop),
            queue_timeout: DEFAULT_QUEUE_TIMEOUT,
            error_backoff: Backoff::none(),
            liveness: None,
        }
    }

    pub fn mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn policy(mut self, policy: Arc<dyn ErrorPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn queue_timeout(mut self, timeout: Duration) -> Self {
        self.queue_timeout = timeout;
        self
    }

    /// Delay applied after failed source invocations. Ignored by consumers.
    pub fn error_backoff(mut self, backoff: Backoff) -> Self {
        self.error_backoff = backoff;
        self
    }

    /// Use a counter owned elsewhere instead of a fresh one.
    pub fn liveness(mut self, liveness: Liveness) -> Self {
        self.liveness = Some(liveness);
        self
    }
}

#[derive(Debug, Default)]
struct Counters {
    processed: AtomicU64,
    failed: AtomicU64,
    emitted: AtomicU64,
}

/// Point-in-time counters for one stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageStats {
    pub name: String,
    pub shape: StageShape,
    pub mode: ExecutionMode,
    pub workers: usize,
    /// Successful function applications.
    pub processed: u64,
    /// Applications that errored or panicked.
    pub failed: u64,
    /// Items pushed to the output channel.
    pub emitted: u64,
}

/// Per-worker view of the stage it belongs to.
struct WorkerContext {
    stage: String,
    policy: Arc<dyn ErrorPolicy>,
    queue_timeout: Duration,
    error_backoff: Backoff,
    counters: Arc<Counters>,
}

impl WorkerContext {
    /// Run one function application, routing errors and panics to the policy.
    async fn apply<T, Fut>(&self, call: Fut) -> Option<T>
    where
        Fut: Future<Output = Result<T, BoxError>>,
    {
        match AssertUnwindSafe(call).catch_unwind().await {
            Ok(Ok(value)) => {
                self.counters.processed.fetch_add(1, Ordering::Relaxed);
                Some(value)
            }
            Ok(Err(source)) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                self.policy.on_item_error(StageError::ItemFailed {
                    stage: self.stage.clone(),
                    source,
                });
                None
            }
            Err(payload) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                self.policy
                    .on_item_error(StageError::from_panic(&self.stage, payload));
                None
            }
        }
    }

    async fn emit<T>(&self, output: &BoundedChannel<T>, item: T) -> Result<(), ChannelError>
    where
        T: fmt::Debug + Send + 'static,
    {
        output.put(item, &self.stage).await?;
        self.counters.emitted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn emit_all<T>(
        &self,
        output: &BoundedChannel<T>,
        items: Vec<T>,
    ) -> Result<(), ChannelError>
    where
        T: fmt::Debug + Send + 'static,
    {
        let count = output.put_all(items, &self.stage).await?;
        self.counters.emitted.fetch_add(count as u64, Ordering::Relaxed);
        Ok(())
    }
}

/// Input side of a consumer worker: blocking reads while the upstream is
/// live, non-blocking reads afterwards until empty.
struct Consumer<'a, I> {
    input: &'a BoundedChannel<I>,
    upstream: &'a dyn Upstream,
    draining: bool,
}

impl<'a, I: Send + 'static> Consumer<'a, I> {
    fn new(input: &'a BoundedChannel<I>, upstream: &'a dyn Upstream) -> Self {
        Self {
            input,
            upstream,
            draining: false,
        }
    }

    async fn next(&mut self, ctx: &WorkerContext) -> Option<I> {
        loop {
            if self.draining {
                return self.input.get_nowait().await.ok();
            }
            if !self.upstream.is_live() {
                debug!(pending = self.input.len(), "Upstream finished; draining input");
                self.draining = true;
                continue;
            }
            match self.input.get(ctx.queue_timeout).await {
                Ok(item) => return Some(item),
                Err(ChannelError::Empty) => debug!("Input queue is empty"),
                Err(e) => {
                    warn!(error = %e, "Input channel unusable; draining");
                    self.draining = true;
                }
            }
        }
    }
}

async fn run_source<O, F, Fut>(
    ctx: &WorkerContext,
    function: &F,
    output: &BoundedChannel<O>,
    upstream: &dyn Upstream,
) where
    O: fmt::Debug + Send + 'static,
    F: Fn() -> Fut,
    Fut: Future<Output = Result<Produced<O>, BoxError>>,
{
    let mut failures = 0u32;
    while upstream.is_live() {
        let Some(produced) = ctx.apply(async { function().await }).await else {
            failures = failures.saturating_add(1);
            let delay = ctx.error_backoff.delay(failures);
            if !delay.is_zero() {
                debug!(failures, ?delay, "Source call failed; backing off");
                tokio::time::sleep(delay).await;
            }
            continue;
        };
        failures = 0;

        if let Err(e) = ctx.emit_all(output, produced.items).await {
            error!(error = %e, "Cannot write to output channel; stopping worker");
            return;
        }
        if produced.finished {
            info!("Source reported finished");
            return;
        }
    }
    debug!("Stop requested; source worker exiting");
}

async fn run_transform<I, O, F, Fut>(
    ctx: &WorkerContext,
    function: &F,
    input: &BoundedChannel<I>,
    output: &BoundedChannel<O>,
    upstream: &dyn Upstream,
) where
    I: Send + 'static,
    O: fmt::Debug + Send + 'static,
    F: Fn(I) -> Fut,
    Fut: Future<Output = Result<O, BoxError>>,
{
    let mut consumer = Consumer::new(input, upstream);
    while let Some(item) = consumer.next(ctx).await {
        let Some(value) = ctx.apply(async move { function(item).await }).await else {
            continue;
        };
        if let Err(e) = ctx.emit(output, value).await {
            error!(error = %e, "Cannot write to output channel; stopping worker");
            return;
        }
    }
}

async fn run_sink<I, F, Fut>(
    ctx: &WorkerContext,
    function: &F,
    input: &BoundedChannel<I>,
    upstream: &dyn Upstream,
) where
    I: Send + 'static,
    F: Fn(I) -> Fut,
    Fut: Future<Output = Result<(), BoxError>>,
{
    let mut consumer = Consumer::new(input, upstream);
    while let Some(item) = consumer.next(ctx).await {
        ctx.apply(async move { function(item).await }).await;
    }
}

type WorkerFactory = Arc<dyn Fn(WorkerContext) -> BoxFuture<'static, ()> + Send + Sync>;

enum WorkerHandle {
    Cooperative(tokio::task::JoinHandle<()>),
    Isolated(std::thread::JoinHandle<()>),
}

/// A named pool of workers running one function.
///
/// Created once when the pipeline is wired; [`Stage::start`] spawns the
/// workers and [`Stage::join`] waits for all of them to exit.
pub struct Stage {
    name: String,
    shape: StageShape,
    workers: usize,
    mode: ExecutionMode,
    policy: Arc<dyn ErrorPolicy>,
    queue_timeout: Duration,
    error_backoff: Backoff,
    liveness: Liveness,
    counters: Arc<Counters>,
    factory: WorkerFactory,
    handles: Vec<WorkerHandle>,
    started: bool,
}

impl fmt::Debug for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage")
            .field("name", &self.name)
            .field("shape", &self.shape)
            .field("workers", &self.workers)
            .field("mode", &self.mode)
            .field("liveness", &self.liveness)
            .field("started", &self.started)
            .finish()
    }
}

impl Stage {
    fn new(options: StageOptions, shape: StageShape, factory: WorkerFactory) -> Self {
        let liveness = match options.liveness {
            Some(shared) => {
                shared.set(options.workers);
                shared
            }
            None => Liveness::new(options.workers),
        };
        Self {
            name: options.name,
            shape,
            workers: options.workers,
            mode: options.mode,
            policy: options.policy,
            queue_timeout: options.queue_timeout,
            error_backoff: options.error_backoff,
            liveness,
            counters: Arc::new(Counters::default()),
            factory,
            handles: Vec::new(),
            started: false,
        }
    }

    /// A stage with no input that repeatedly calls `function` and pushes what
    /// it produces, for as long as `upstream` stays live.
    pub fn source<O, F, Fut, U>(
        options: StageOptions,
        function: F,
        output: BoundedChannel<O>,
        upstream: U,
    ) -> Self
    where
        O: fmt::Debug + Send + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Produced<O>, BoxError>> + Send + 'static,
        U: Upstream + 'static,
    {
        let function = Arc::new(function);
        let upstream: Arc<dyn Upstream> = Arc::new(upstream);
        let factory: WorkerFactory = Arc::new(move |ctx| {
            let function = Arc::clone(&function);
            let output = output.clone();
            let upstream = Arc::clone(&upstream);
            async move { run_source(&ctx, function.as_ref(), &output, upstream.as_ref()).await }
                .boxed()
        });
        Self::new(options, StageShape::Source, factory)
    }

    /// A stage mapping each input item to one output item.
    pub fn transform<I, O, F, Fut, U>(
        options: StageOptions,
        function: F,
        input: BoundedChannel<I>,
        output: BoundedChannel<O>,
        upstream: U,
    ) -> Self
    where
        I: Send + 'static,
        O: fmt::Debug + Send + 'static,
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, BoxError>> + Send + 'static,
        U: Upstream + 'static,
    {
        let function = Arc::new(function);
        let upstream: Arc<dyn Upstream> = Arc::new(upstream);
        let factory: WorkerFactory = Arc::new(move |ctx| {
            let function = Arc::clone(&function);
            let input = input.clone();
            let output = output.clone();
            let upstream = Arc::clone(&upstream);
            async move {
                run_transform(&ctx, function.as_ref(), &input, &output, upstream.as_ref()).await
            }
            .boxed()
        });
        Self::new(options, StageShape::Transform, factory)
    }

    /// A stage consuming items for their side effects.
    pub fn sink<I, F, Fut, U>(
        options: StageOptions,
        function: F,
        input: BoundedChannel<I>,
        upstream: U,
    ) -> Self
    where
        I: Send + 'static,
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
        U: Upstream + 'static,
    {
        let function = Arc::new(function);
        let upstream: Arc<dyn Upstream> = Arc::new(upstream);
        let factory: WorkerFactory = Arc::new(move |ctx| {
            let function = Arc::clone(&function);
            let input = input.clone();
            let upstream = Arc::clone(&upstream);
            async move { run_sink(&ctx, function.as_ref(), &input, upstream.as_ref()).await }
                .boxed()
        });
        Self::new(options, StageShape::Sink, factory)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Handle on this stage's live-worker count, for downstream stages.
    pub fn liveness(&self) -> Liveness {
        self.liveness.clone()
    }

    pub fn stats(&self) -> StageStats {
        StageStats {
            name: self.name.clone(),
            shape: self.shape,
            mode: self.mode,
            workers: self.workers,
            processed: self.counters.processed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            emitted: self.counters.emitted.load(Ordering::Relaxed),
        }
    }

    /// Spawn every worker. Must be called from within a tokio runtime.
    pub fn start(&mut self) -> Result<(), StageError> {
        if self.started {
            return Err(StageError::AlreadyStarted(self.name.clone()));
        }
        let runtime = Handle::try_current().map_err(|e| StageError::Join {
            stage: self.name.clone(),
            message: e.to_string(),
        })?;
        self.started = true;

        info!(
            stage = %self.name,
            shape = ?self.shape,
            mode = ?self.mode,
            workers = self.workers,
            "Starting stage"
        );

        for i in 0..self.workers {
            let worker = format!("{} (worker {})", self.name, i);
            let guard = WorkerGuard::new(self.liveness.clone(), worker.clone());
            let ctx = WorkerContext {
                stage: self.name.clone(),
                policy: Arc::clone(&self.policy),
                queue_timeout: self.queue_timeout,
                error_backoff: self.error_backoff,
                counters: Arc::clone(&self.counters),
            };
            let body = (self.factory)(ctx);
            let span = info_span!("worker", name = %worker);
            let task = async move {
                let _guard = guard;
                body.await;
            }
            .instrument(span);

            match self.mode {
                ExecutionMode::Cooperative => {
                    self.handles
                        .push(WorkerHandle::Cooperative(runtime.spawn(task)));
                }
                ExecutionMode::Isolated => {
                    let runtime = runtime.clone();
                    // On failure the closure, and the guard inside it, is
                    // dropped, which accounts for worker `i` itself.
                    match std::thread::Builder::new()
                        .name(worker)
                        .spawn(move || runtime.block_on(task))
                    {
                        Ok(handle) => self.handles.push(WorkerHandle::Isolated(handle)),
                        Err(e) => {
                            error!(stage = %self.name, error = %e, "Failed to spawn worker thread");
                            self.release_unspawned(i + 1);
                            return Err(StageError::Join {
                                stage: self.name.clone(),
                                message: e.to_string(),
                            });
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Give up on a stage that was never started, so stages watching its
    /// liveness stop waiting for it. No-op once `start` has spawned workers.
    pub fn abandon(&mut self) {
        if !self.started {
            self.started = true;
            self.release_unspawned(0);
            debug!(stage = %self.name, "Stage abandoned before start");
        }
    }

    /// Decrement once for every worker from index `spawned` on.
    fn release_unspawned(&self, spawned: usize) {
        for _ in spawned..self.workers {
            self.liveness.decrement();
        }
    }

    /// Wait until every worker has exited.
    ///
    /// Returns the first join failure, after still waiting on the rest.
    pub async fn join(&mut self) -> Result<(), StageError> {
        let mut first_failure = None;
        for handle in self.handles.drain(..) {
            let outcome = match handle {
                WorkerHandle::Cooperative(task) => task.await.map_err(|e| e.to_string()),
                WorkerHandle::Isolated(thread) => {
                    match tokio::task::spawn_blocking(move || thread.join()).await {
                        Ok(Ok(())) => Ok(()),
                        Ok(Err(_)) => Err("worker thread panicked".to_string()),
                        Err(e) => Err(e.to_string()),
                    }
                }
            };
            if let Err(message) = outcome {
                error!(stage = %self.name, error = %message, "Worker did not exit cleanly");
                first_failure.get_or_insert(StageError::Join {
                    stage: self.name.clone(),
                    message,
                });
            }
        }
        info!(stage = %self.name, remaining = self.liveness.read(), "Stage joined");
        first_failure.map_or(Ok(()), Err)
    }
}
