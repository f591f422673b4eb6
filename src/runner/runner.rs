//! Task runner: bounded queue, fixed worker pool and stuck-task sweeper.

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::erased::{ErasedFactory, FactoryRegistry};
use super::queue::{PushError, TaskQueue};
use super::store::{StoreError, TaskRecord, TaskStore};
use crate::config::{ConfigError, TaskRunnerConfig};
use crate::factory::TaskFactory;
use crate::retry::{retry, RetryPolicy};
use crate::task::{panic_message, Task, TaskContext, TaskId, TaskStatus};

const STUCK_RESET_NOTE: &str = "reset after being stuck in processing state";
const RECOVERY_RESET_NOTE: &str = "reset after recovery";

/// Error returned by runner lifecycle operations.
#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("invalid runner configuration: {0}")]
    InvalidConfig(#[from] ConfigError),

    #[error("task runner already started")]
    AlreadyStarted,

    #[error("task runner has been stopped")]
    Stopped,
}

/// Error returned by [`TaskRunner::submit`].
#[derive(Error, Debug)]
pub enum SubmitError {
    /// The task was not persisted and is not submitted.
    #[error("failed to save task {id}: {source}")]
    Store {
        id: TaskId,
        #[source]
        source: StoreError,
    },

    /// The task is stored as `Pending` but was not queued in time.
    #[error("submission of task {id} cancelled before it was queued; it is stored as pending")]
    Cancelled { id: TaskId },

    #[error("task queue closed; task {id} is stored as pending")]
    QueueClosed { id: TaskId },
}

impl SubmitError {
    pub fn task_id(&self) -> TaskId {
        match self {
            Self::Store { id, .. } | Self::Cancelled { id } | Self::QueueClosed { id } => *id,
        }
    }

    /// True when the task made it into the store despite the error, so the
    /// sweeper will eventually pick it up.
    pub fn is_durable(&self) -> bool {
        !matches!(self, Self::Store { .. })
    }
}

/// Called with a task and its failure message whenever an execution fails
/// or panics, before the failure is recorded.
pub type ErrorHandler = Arc<dyn Fn(&dyn Task, &str) + Send + Sync>;

/// Anything tasks can be submitted to.
#[async_trait]
pub trait TaskSubmitter: Send + Sync {
    async fn submit_task(
        &self,
        task: Arc<dyn Task>,
        cancel: &CancellationToken,
    ) -> Result<TaskId, SubmitError>;
}

#[async_trait]
impl<T: TaskSubmitter + ?Sized> TaskSubmitter for Arc<T> {
    async fn submit_task(
        &self,
        task: Arc<dyn Task>,
        cancel: &CancellationToken,
    ) -> Result<TaskId, SubmitError> {
        (**self).submit_task(task, cancel).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Idle,
    Running,
    Stopped,
}

struct Inner<S: TaskStore> {
    store: Arc<S>,
    config: TaskRunnerConfig,
    queue: TaskQueue,
    factories: FactoryRegistry,
    on_error: Option<ErrorHandler>,
    /// Tasks submitted in this process, kept until they reach a terminal state.
    live: Mutex<HashMap<TaskId, Arc<dyn Task>>>,
    lifecycle: Mutex<Lifecycle>,
    /// Stops workers and the sweeper between tasks.
    shutdown: CancellationToken,
    /// Handed to running tasks; only fired by a forced shutdown.
    abort: CancellationToken,
    tracker: TaskTracker,
}

/// Executes submitted tasks on a fixed pool of workers.
///
/// Cheap to clone; clones share the same queue, pool and store.
pub struct TaskRunner<S: TaskStore> {
    inner: Arc<Inner<S>>,
}

impl<S: TaskStore> Clone for TaskRunner<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: TaskStore + 'static> TaskRunner<S> {
    /// Runner with `config` and no restoration factories.
    pub fn new(store: S, config: TaskRunnerConfig) -> Self {
        RunnerBuilder::new(store).config(config).build()
    }

    pub fn builder(store: S) -> RunnerBuilder<S> {
        RunnerBuilder::new(store)
    }

    pub fn store(&self) -> &S {
        &self.inner.store
    }

    pub fn config(&self) -> &TaskRunnerConfig {
        &self.inner.config
    }

    /// Number of ids waiting in the queue.
    pub fn queue_len(&self) -> usize {
        self.inner.queue.len()
    }

    /// Durable status of a task.
    pub async fn status(&self, id: TaskId) -> Result<Option<TaskStatus>, StoreError> {
        Ok(self.inner.store.get(id).await?.map(|r| r.status))
    }

    /// Spawn the workers, the sweeper and (if configured) the startup
    /// recovery pass.
    ///
    /// With `recover_on_start`, rows left in `Processing` are reset before any
    /// worker exists, so a task submitted right after `start` can only be
    /// claimed once. Submissions made meanwhile wait in the queue.
    ///
    /// Must be called from within a Tokio runtime. Calling it twice, or after
    /// [`stop`](Self::stop), is an error.
    pub fn start(&self) -> Result<(), RunnerError> {
        let inner = &self.inner;
        inner.config.validate()?;
        {
            let mut state = inner.lifecycle.lock();
            match *state {
                Lifecycle::Idle => *state = Lifecycle::Running,
                Lifecycle::Running => return Err(RunnerError::AlreadyStarted),
                Lifecycle::Stopped => return Err(RunnerError::Stopped),
            }
        }

        info!(
            worker_count = inner.config.worker_count,
            queue_size = inner.queue.capacity(),
            stuck_task_age_secs = inner.config.stuck_task_age.as_secs(),
            factories = ?inner.factories.task_types().collect::<Vec<_>>(),
            "starting task runner"
        );

        if inner.config.recover_on_start {
            let recovery = inner.clone();
            inner.tracker.spawn(async move {
                let reset = recovery.reset_interrupted().await;
                if recovery.shutdown.is_cancelled() {
                    return;
                }
                recovery.spawn_pool();
                recovery.requeue_pending(reset).await;
            });
        } else {
            inner.spawn_pool();
        }

        Ok(())
    }

    /// Persist `task` as `Pending` and queue it, waiting for queue space.
    pub async fn submit(&self, task: Arc<dyn Task>) -> Result<TaskId, SubmitError> {
        self.submit_with_cancel(task, &CancellationToken::new()).await
    }

    /// Like [`submit`](Self::submit), giving up on a full queue once `cancel` fires.
    ///
    /// `Ok` only means the task is durably `Pending`; its outcome has to be
    /// read from the store. A [`SubmitError::Cancelled`] task is stored too
    /// and will be picked up by a later sweep. After [`stop`](Self::stop) the
    /// task is still stored but [`SubmitError::QueueClosed`] is returned, and
    /// submitters waiting on a full queue are released the same way.
    pub async fn submit_with_cancel(
        &self,
        task: Arc<dyn Task>,
        cancel: &CancellationToken,
    ) -> Result<TaskId, SubmitError> {
        let inner = &self.inner;
        let record = TaskRecord::pending(task.as_ref());
        let id = record.id;

        inner
            .store
            .create(&record)
            .await
            .map_err(|source| SubmitError::Store { id, source })?;
        inner.live.lock().insert(id, task);

        match inner.queue.push(id, cancel).await {
            Ok(()) => {
                debug!(
                    task_id = %id,
                    task_type = %record.task_type,
                    queue_len = inner.queue.len(),
                    "task submitted"
                );
                Ok(id)
            }
            Err(PushError::Cancelled) => {
                warn!(
                    task_id = %id,
                    task_type = %record.task_type,
                    "submission cancelled while queue was full; task left pending"
                );
                Err(SubmitError::Cancelled { id })
            }
            Err(PushError::Closed) => {
                inner.live.lock().remove(&id);
                warn!(
                    task_id = %id,
                    task_type = %record.task_type,
                    "task runner stopped; task left pending for the next start"
                );
                Err(SubmitError::QueueClosed { id })
            }
        }
    }

    /// Run one reconciliation pass now. Returns how many tasks were requeued.
    pub async fn sweep(&self) -> Result<usize, StoreError> {
        self.inner.sweep().await
    }

    /// Stop taking work and wait for every worker to finish its current task.
    ///
    /// Safe to call more than once; a no-op on a runner that never started.
    pub async fn stop(&self) {
        if !self.inner.begin_stop() {
            return;
        }
        info!("stopping task runner, waiting for in-progress tasks to complete");
        self.inner.tracker.wait().await;
        info!("task runner stopped");
    }

    /// Like [`stop`](Self::stop), but once `grace` has elapsed the tasks still
    /// running see their [`TaskContext`] cancelled.
    ///
    /// Returns false when the grace period ran out.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        if !self.inner.begin_stop() {
            return true;
        }
        if tokio::time::timeout(grace, self.inner.tracker.wait())
            .await
            .is_ok()
        {
            info!("task runner stopped");
            return true;
        }
        warn!(
            grace_ms = grace.as_millis() as u64,
            "grace period elapsed, cancelling running tasks"
        );
        self.inner.abort.cancel();
        self.inner.tracker.wait().await;
        info!("task runner stopped after cancelling running tasks");
        false
    }
}

#[async_trait]
impl<S: TaskStore + 'static> TaskSubmitter for TaskRunner<S> {
    async fn submit_task(
        &self,
        task: Arc<dyn Task>,
        cancel: &CancellationToken,
    ) -> Result<TaskId, SubmitError> {
        self.submit_with_cancel(task, cancel).await
    }
}

impl<S: TaskStore + 'static> Inner<S> {
    fn spawn_pool(self: &Arc<Self>) {
        for worker_id in 0..self.config.worker_count {
            let worker = self.clone();
            self.tracker.spawn(async move { worker.run_worker(worker_id).await });
        }

        let sweeper = self.clone();
        self.tracker.spawn(async move { sweeper.run_sweeper().await });
    }

    /// Flip to `Stopped` and signal the background tasks. False if never started.
    fn begin_stop(&self) -> bool {
        {
            let mut state = self.lifecycle.lock();
            if *state == Lifecycle::Idle {
                return false;
            }
            *state = Lifecycle::Stopped;
        }
        self.shutdown.cancel();
        self.tracker.close();
        true
    }

    fn retry_policy(&self) -> &RetryPolicy {
        &self.config.store_retry
    }

    async fn transition(
        &self,
        id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
        error: Option<&str>,
    ) -> Result<bool, StoreError> {
        retry(self.retry_policy(), "update task status", || {
            self.store.update_status(id, from, to, error)
        })
        .await
    }

    async fn run_worker(&self, worker_id: usize) {
        debug!(worker_id, "worker started");
        while let Some(id) = self.queue.pop().await {
            self.process(worker_id, id).await;
        }
        debug!(worker_id, "worker stopped");
    }

    async fn process(&self, worker_id: usize, id: TaskId) {
        let record = match retry(self.retry_policy(), "load task", || self.store.get(id)).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                warn!(task_id = %id, worker_id, "queued task not found in store");
                self.live.lock().remove(&id);
                return;
            }
            Err(e) => {
                error!(task_id = %id, worker_id, error = %e, "failed to load task, leaving it for the sweeper");
                return;
            }
        };

        if record.status != TaskStatus::Pending {
            debug!(task_id = %id, worker_id, status = %record.status, "task no longer pending, skipping");
            return;
        }

        let task = match self.resolve(&record) {
            Ok(task) => task,
            Err(reason) => {
                error!(
                    task_id = %id,
                    task_type = %record.task_type,
                    worker_id,
                    error = %reason,
                    "cannot build task for execution"
                );
                self.finish(&record, TaskStatus::Pending, TaskStatus::Failed, Some(&reason))
                    .await;
                return;
            }
        };

        if self.shutdown.is_cancelled() {
            debug!(task_id = %id, worker_id, "runner stopping, leaving task pending");
            return;
        }

        match self
            .transition(id, TaskStatus::Pending, TaskStatus::Processing, None)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                debug!(task_id = %id, worker_id, "task claimed elsewhere, skipping");
                return;
            }
            Err(e) => {
                error!(
                    task_id = %id,
                    task_type = %record.task_type,
                    worker_id,
                    error = %e,
                    "failed to claim task"
                );
                return;
            }
        }

        info!(task_id = %id, task_type = %record.task_type, worker_id, "processing task");

        let ctx = TaskContext::new(worker_id, self.abort.child_token());
        let outcome = AssertUnwindSafe(task.execute(&ctx)).catch_unwind().await;
        let (status, failure) = match outcome {
            Ok(Ok(())) => (TaskStatus::Completed, None),
            Ok(Err(e)) => (TaskStatus::Failed, Some(format!("{e:#}"))),
            Err(panic) => (
                TaskStatus::Failed,
                Some(format!("task panicked: {}", panic_message(panic.as_ref()))),
            ),
        };

        match &failure {
            Some(message) => error!(
                task_id = %id,
                task_type = %record.task_type,
                worker_id,
                error = %message,
                "task execution failed"
            ),
            None => info!(
                task_id = %id,
                task_type = %record.task_type,
                worker_id,
                "task completed successfully"
            ),
        }

        if let (Some(message), Some(on_error)) = (&failure, &self.on_error) {
            let called = std::panic::catch_unwind(AssertUnwindSafe(|| {
                on_error(task.as_ref(), message)
            }));
            if let Err(panic) = called {
                error!(
                    task_id = %id,
                    worker_id,
                    error = %panic_message(panic.as_ref()),
                    "task error handler panicked"
                );
            }
        }

        self.finish(&record, TaskStatus::Processing, status, failure.as_deref())
            .await;
    }

    /// Record a terminal status and drop the live task once it is durable.
    async fn finish(
        &self,
        record: &TaskRecord,
        from: TaskStatus,
        to: TaskStatus,
        error: Option<&str>,
    ) {
        match self.transition(record.id, from, to, error).await {
            Ok(true) => {
                self.live.lock().remove(&record.id);
            }
            Ok(false) => warn!(
                task_id = %record.id,
                task_type = %record.task_type,
                status = %to,
                "task was reset before its outcome was recorded; result discarded"
            ),
            Err(e) => error!(
                task_id = %record.id,
                task_type = %record.task_type,
                status = %to,
                error = %e,
                "failed to record task outcome, leaving it for the sweeper"
            ),
        }
    }

    /// The executable task for `record`: the in-process instance if there is
    /// one, otherwise a rebuild through the factory for its type.
    fn resolve(&self, record: &TaskRecord) -> Result<Arc<dyn Task>, String> {
        if let Some(task) = self.live.lock().get(&record.id).cloned() {
            return Ok(task);
        }
        match self.factories.get(&record.task_type) {
            Some(factory) => factory.restore_erased(record).map_err(|e| e.to_string()),
            None => Err(format!(
                "no factory registered for task type {}",
                record.task_type
            )),
        }
    }

    async fn run_sweeper(&self) {
        let period = self.config.effective_sweep_interval();
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately.
        ticker.tick().await;

        debug!(interval_ms = period.as_millis() as u64, "stuck task sweeper started");
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep().await {
                        error!(error = %e, "failed to check for stuck tasks");
                    }
                }
            }
        }
        debug!("stuck task sweeper stopped");
    }

    async fn sweep(&self) -> Result<usize, StoreError> {
        let age = self.config.stuck_task_age;
        let stuck = retry(self.retry_policy(), "find stuck tasks", || {
            self.store.find_stuck(age)
        })
        .await?;

        if !stuck.is_empty() {
            info!(count = stuck.len(), "found stuck tasks");
        }

        let mut requeued = 0;
        for record in &stuck {
            match self
                .transition(
                    record.id,
                    TaskStatus::Processing,
                    TaskStatus::Pending,
                    Some(STUCK_RESET_NOTE),
                )
                .await
            {
                Ok(true) => {
                    if self.requeue(record).await {
                        requeued += 1;
                    }
                }
                Ok(false) => debug!(task_id = %record.id, "stuck task moved on before reset"),
                Err(e) => error!(
                    task_id = %record.id,
                    task_type = %record.task_type,
                    error = %e,
                    "failed to reset stuck task status"
                ),
            }
        }

        // Pending rows nobody queued, e.g. a submit cancelled on a full queue.
        let stale = retry(self.retry_policy(), "find stale pending tasks", || {
            self.store.find_by_status(TaskStatus::Pending, Some(age))
        })
        .await?;
        for record in &stale {
            if self.requeue(record).await {
                requeued += 1;
            }
        }

        Ok(requeued)
    }

    /// Move every `Processing` row back to `Pending`. Runs before any worker
    /// of this runner exists, so those rows belong to an earlier process.
    /// Returns how many were reset.
    async fn reset_interrupted(&self) -> usize {
        let processing = match retry(self.retry_policy(), "find processing tasks", || {
            self.store.find_by_status(TaskStatus::Processing, None)
        })
        .await
        {
            Ok(records) => records,
            Err(e) => {
                error!(error = %e, "failed to load processing tasks for recovery");
                return 0;
            }
        };

        let mut reset = 0;
        for record in &processing {
            match self
                .transition(
                    record.id,
                    TaskStatus::Processing,
                    TaskStatus::Pending,
                    Some(RECOVERY_RESET_NOTE),
                )
                .await
            {
                Ok(true) => reset += 1,
                Ok(false) => debug!(task_id = %record.id, "processing task moved on before reset"),
                Err(e) => error!(
                    task_id = %record.id,
                    task_type = %record.task_type,
                    error = %e,
                    "failed to reset processing task status"
                ),
            }
        }
        reset
    }

    async fn requeue_pending(&self, reset: usize) {
        let pending = match retry(self.retry_policy(), "find pending tasks", || {
            self.store.find_pending()
        })
        .await
        {
            Ok(records) => records,
            Err(e) => {
                error!(error = %e, "failed to load pending tasks for recovery");
                return;
            }
        };

        info!(
            pending_count = pending.len(),
            reset_count = reset,
            "recovering unfinished tasks"
        );

        for record in &pending {
            if !self.requeue(record).await && self.shutdown.is_cancelled() {
                break;
            }
        }
    }

    /// Queue a recovered task unless it is already waiting. False if it was
    /// not queued.
    async fn requeue(&self, record: &TaskRecord) -> bool {
        match self.queue.push_if_absent(record.id, &self.shutdown).await {
            Ok(true) => {
                info!(task_id = %record.id, task_type = %record.task_type, "requeued task");
                true
            }
            Ok(false) => false,
            Err(_) => {
                debug!(task_id = %record.id, "runner stopping, task left pending");
                false
            }
        }
    }
}

/// Builder for constructing a [`TaskRunner`].
pub struct RunnerBuilder<S: TaskStore> {
    store: S,
    config: TaskRunnerConfig,
    factories: FactoryRegistry,
    on_error: Option<ErrorHandler>,
}

impl<S: TaskStore + 'static> RunnerBuilder<S> {
    /// Create a new builder with the given store and default settings.
    pub fn new(store: S) -> Self {
        Self {
            store,
            config: TaskRunnerConfig::default(),
            factories: FactoryRegistry::default(),
            on_error: None,
        }
    }

    /// Replace all settings.
    pub fn config(mut self, config: TaskRunnerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn worker_count(mut self, n: usize) -> Self {
        self.config.worker_count = n;
        self
    }

    pub fn queue_size(mut self, n: usize) -> Self {
        self.config.queue_size = n;
        self
    }

    pub fn stuck_task_age(mut self, age: Duration) -> Self {
        self.config.stuck_task_age = age;
        self
    }

    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.config.sweep_interval = Some(interval);
        self
    }

    pub fn recover_on_start(mut self, recover: bool) -> Self {
        self.config.recover_on_start = recover;
        self
    }

    pub fn store_retry(mut self, policy: RetryPolicy) -> Self {
        self.config.store_retry = policy;
        self
    }

    /// Register a factory used to rebuild tasks of its type that were
    /// persisted by an earlier process.
    pub fn factory<F>(mut self, factory: Arc<F>) -> Self
    where
        F: TaskFactory + 'static,
    {
        self.factories.register(factory as Arc<dyn ErasedFactory>);
        self
    }

    /// Observe execution failures, e.g. for alerting or a resubmission policy.
    ///
    /// The handler runs on the worker and should return quickly; a panic in
    /// it is logged and otherwise ignored.
    pub fn on_error<F>(mut self, handler: F) -> Self
    where
        F: Fn(&dyn Task, &str) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(handler));
        self
    }

    /// Build the runner. Settings are validated by [`TaskRunner::start`].
    pub fn build(self) -> TaskRunner<S> {
        let shutdown = CancellationToken::new();
        let queue = TaskQueue::new(self.config.queue_size, shutdown.clone());
        TaskRunner {
            inner: Arc::new(Inner {
                store: Arc::new(self.store),
                config: self.config,
                queue,
                factories: self.factories,
                on_error: self.on_error,
                live: Mutex::new(HashMap::new()),
                lifecycle: Mutex::new(Lifecycle::Idle),
                shutdown,
                abort: CancellationToken::new(),
                tracker: TaskTracker::new(),
            }),
        }
    }
}
