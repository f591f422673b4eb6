//! Building tasks from domain input.

use serde::de::DeserializeOwned;
use std::sync::Arc;
use thiserror::Error;

use crate::runner::TaskRecord;
use crate::task::{Task, TaskId};

/// Error returned when a task cannot be built.
#[derive(Error, Debug)]
pub enum FactoryError {
    /// The input names something that cannot be turned into a task.
    #[error("invalid task input: {0}")]
    InvalidInput(String),

    /// A persisted payload did not decode into the factory's input type.
    #[error("undecodable payload for {task_type} task {id}: {source}")]
    Payload {
        task_type: String,
        id: TaskId,
        #[source]
        source: serde_json::Error,
    },

    #[error("record of type {found} handed to {expected} factory")]
    WrongType { expected: String, found: String },
}

/// Builds tasks of one type.
///
/// A factory owns the dependencies its tasks need, so every task it returns
/// can run without the event that triggered it. Construction either yields a
/// complete task or an error, never a half-initialised one.
pub trait TaskFactory: Send + Sync {
    /// What the factory needs to build a task, decoded from event and task payloads.
    type Input: DeserializeOwned + Send;

    /// Type tag of the tasks this factory builds.
    fn task_type(&self) -> &str;

    /// Build the task with a given id.
    fn build(&self, id: TaskId, input: Self::Input) -> Result<Arc<dyn Task>, FactoryError>;

    /// Build a new task with a fresh id.
    fn create(&self, input: Self::Input) -> Result<Arc<dyn Task>, FactoryError> {
        self.build(TaskId::new(), input)
    }

    /// Rebuild a persisted task, keeping its id.
    fn restore(&self, record: &TaskRecord) -> Result<Arc<dyn Task>, FactoryError> {
        if record.task_type != self.task_type() {
            return Err(FactoryError::WrongType {
                expected: self.task_type().to_string(),
                found: record.task_type.clone(),
            });
        }
        let input = serde_json::from_slice(&record.payload).map_err(|source| {
            FactoryError::Payload {
                task_type: record.task_type.clone(),
                id: record.id,
                source,
            }
        })?;
        self.build(record.id, input)
    }
}
