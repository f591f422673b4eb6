//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

use scry_tasks::{
    FactoryError, RetryPolicy, Task, TaskContext, TaskFactory, TaskId, TaskRunner,
    TaskRunnerConfig, TaskStatus, TaskStore,
};

pub const TEST_TASK: &str = "test_task";

/// What a [`TestTask`] does when executed.
#[derive(Clone)]
pub enum Behavior {
    Succeed,
    Fail(&'static str),
    Panic(&'static str),
    /// Signal `started`, then wait for `release`.
    Block {
        started: Arc<Notify>,
        release: Arc<Notify>,
    },
    /// Signal `started`, then wait for the runner to abort the task.
    WaitForAbort { started: Arc<Notify> },
}

pub struct TestTask {
    id: TaskId,
    payload: Vec<u8>,
    behavior: Behavior,
    runs: Arc<AtomicUsize>,
}

impl TestTask {
    pub fn new(behavior: Behavior) -> Self {
        Self::with_counter(behavior, Arc::new(AtomicUsize::new(0)))
    }

    pub fn with_counter(behavior: Behavior, runs: Arc<AtomicUsize>) -> Self {
        Self::restored(TaskId::new(), "test", behavior, runs)
    }

    fn restored(id: TaskId, label: &str, behavior: Behavior, runs: Arc<AtomicUsize>) -> Self {
        let payload = serde_json::to_vec(&TestInput {
            label: label.to_string(),
        })
        .unwrap();
        Self {
            id,
            payload,
            behavior,
            runs,
        }
    }

    pub fn arc(self) -> Arc<dyn Task> {
        Arc::new(self)
    }
}

#[async_trait]
impl Task for TestTask {
    fn id(&self) -> TaskId {
        self.id
    }

    fn task_type(&self) -> &str {
        TEST_TASK
    }

    fn payload(&self) -> &[u8] {
        &self.payload
    }

    async fn execute(&self, ctx: &TaskContext) -> anyhow::Result<()> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        match &self.behavior {
            Behavior::Succeed => Ok(()),
            Behavior::Fail(message) => Err(anyhow::anyhow!(*message)),
            Behavior::Panic(message) => panic!("{}", message),
            Behavior::Block { started, release } => {
                started.notify_one();
                release.notified().await;
                Ok(())
            }
            Behavior::WaitForAbort { started } => {
                started.notify_one();
                ctx.cancelled().await;
                anyhow::bail!("aborted by runner")
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestInput {
    pub label: String,
}

/// Factory for [`TestTask`]s that always succeed. Counts what it builds.
#[derive(Default)]
pub struct TestFactory {
    pub built: AtomicUsize,
    pub runs: Arc<AtomicUsize>,
}

impl TestFactory {
    pub fn built(&self) -> usize {
        self.built.load(Ordering::SeqCst)
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

impl TaskFactory for TestFactory {
    type Input = TestInput;

    fn task_type(&self) -> &str {
        TEST_TASK
    }

    fn build(&self, id: TaskId, input: TestInput) -> Result<Arc<dyn Task>, FactoryError> {
        if input.label.is_empty() {
            return Err(FactoryError::InvalidInput("label cannot be empty".into()));
        }
        self.built.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(TestTask::restored(
            id,
            &input.label,
            Behavior::Succeed,
            self.runs.clone(),
        )))
    }
}

/// Small, fast settings; the periodic sweeper effectively never fires.
pub fn test_config() -> TaskRunnerConfig {
    TaskRunnerConfig {
        queue_size: 16,
        worker_count: 2,
        stuck_task_age: Duration::from_secs(3600),
        sweep_interval: Some(Duration::from_secs(3600)),
        recover_on_start: false,
        store_retry: RetryPolicy::fixed(3, Duration::from_millis(1)),
    }
}

/// Poll until `id` reaches `status`, failing the test after five seconds.
pub async fn wait_for_status<S: TaskStore + 'static>(
    runner: &TaskRunner<S>,
    id: TaskId,
    status: TaskStatus,
) {
    let reached = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if runner.status(id).await.unwrap() == Some(status) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    if reached.is_err() {
        panic!(
            "task {id} never reached {status}, last seen {:?}",
            runner.status(id).await.unwrap()
        );
    }
}
