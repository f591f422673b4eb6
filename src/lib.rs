//! # scry-tasks
//!
//! Durable background task execution for the Scry flashcard service.
//!
//! Domain actions emit [`TaskRequestEvent`]s. A [`TaskFactoryEventHandler`]
//! turns each matching event into a [`Task`] and submits it to a
//! [`TaskRunner`], which persists it as `pending`, queues it and runs it on
//! a fixed pool of workers. A sweeper periodically puts tasks stuck in
//! `processing` back in the queue, so work survives crashed workers and
//! restarts.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use scry_tasks::{
//!     EventEmitter, MemoGenerationRequest, MemoGenerationTaskFactory, SqliteTaskStore,
//!     TaskFactoryEventHandler, TaskRequestEvent, TaskRunner, MEMO_GENERATION,
//! };
//!
//! let store = SqliteTaskStore::new(pool);
//! store.run_migrations().await?;
//!
//! let factory = Arc::new(MemoGenerationTaskFactory::new(memos, generator, cards));
//! let runner = TaskRunner::builder(store)
//!     .worker_count(4)
//!     .factory(factory.clone())
//!     .build();
//! runner.start()?;
//!
//! let emitter = EventEmitter::new();
//! emitter.register_handler(Arc::new(TaskFactoryEventHandler::new(factory, runner.clone())));
//!
//! let event = TaskRequestEvent::new(MEMO_GENERATION, &MemoGenerationRequest { memo_id })?;
//! emitter.emit(&event, &CancellationToken::new()).await?;
//!
//! runner.stop().await;
//! ```
//!
//! ## Delivery
//!
//! Execution is at-least-once. A task whose worker outlives
//! `stuck_task_age` can be reset and run again, so tasks must tolerate
//! duplicate execution.
//!
//! ## Feature Flags
//!
//! - `sqlite` (default) - SQLite-backed [`TaskStore`]

pub mod config;
pub mod event;
pub mod factory;
pub mod handler;
pub mod memo;
pub mod retry;
pub mod runner;
pub mod task;
pub mod telemetry;

pub use config::{ConfigError, TaskRunnerConfig};
pub use event::{EventEmitter, EventError, EventHandler, TaskRequestEvent};
pub use factory::{FactoryError, TaskFactory};
pub use handler::TaskFactoryEventHandler;
pub use memo::{
    Card, CardGenerator, CardRepository, Memo, MemoGenerationRequest, MemoGenerationTask,
    MemoGenerationTaskFactory, MemoService, MemoStatus, MEMO_GENERATION,
};
pub use retry::RetryPolicy;
pub use runner::{
    ErrorHandler, MemoryTaskStore, RunnerBuilder, RunnerError, StoreError, SubmitError, TaskRecord,
    TaskRunner, TaskStore, TaskSubmitter,
};
pub use task::{Task, TaskContext, TaskId, TaskStatus};

#[cfg(feature = "sqlite")]
pub use runner::SqliteTaskStore;
