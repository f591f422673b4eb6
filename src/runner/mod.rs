//! Task runner module.

pub mod erased;
pub mod memory_store;
mod queue;
#[allow(clippy::module_inception)]
mod runner;
pub mod store;

#[cfg(feature = "sqlite")]
pub mod sqlite_store;

pub use erased::ErasedFactory;
pub use memory_store::MemoryTaskStore;
pub use runner::{
    ErrorHandler, RunnerBuilder, RunnerError, SubmitError, TaskRunner, TaskSubmitter,
};
pub use store::{StoreError, TaskRecord, TaskStore, MAX_ERROR_LEN};

#[cfg(feature = "sqlite")]
pub use sqlite_store::SqliteTaskStore;
