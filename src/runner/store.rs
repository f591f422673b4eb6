//! Task storage trait and types.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::time::Duration;
use thiserror::Error;

use crate::task::{Task, TaskId, TaskStatus};

/// Longest error message persisted with a failed task.
pub const MAX_ERROR_LEN: usize = 2000;

/// A task as persisted by a [`TaskStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRecord {
    pub id: TaskId,
    pub task_type: String,
    pub payload: Vec<u8>,
    pub status: TaskStatus,
    /// Last failure (or reset) message.
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    /// Snapshot a task as a fresh `Pending` record.
    pub fn pending(task: &dyn Task) -> Self {
        let now = Utc::now();
        Self {
            id: task.id(),
            task_type: task.task_type().to_string(),
            payload: task.payload().to_vec(),
            status: TaskStatus::Pending,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Error type for task storage operations.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("storage error: {0}")]
    Storage(String),

    #[error("task already exists: {0}")]
    Duplicate(TaskId),

    #[error("corrupt task row {id}: {reason}")]
    Corrupt { id: String, reason: String },
}

/// Durable record of tasks and their status transitions.
///
/// Every transition goes through [`TaskStore::update_status`], which must be
/// a single atomic conditional write: it only succeeds while the row is still
/// in `from`. That is what keeps two workers (or a worker and the sweeper)
/// from both claiming the same task.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Persist a new record. Fails with [`StoreError::Duplicate`] if the id exists.
    async fn create(&self, record: &TaskRecord) -> Result<(), StoreError>;

    /// Load a single record.
    async fn get(&self, id: TaskId) -> Result<Option<TaskRecord>, StoreError>;

    /// Move `id` from `from` to `to`, replacing the stored error with `error`
    /// (`None` clears it).
    ///
    /// Returns `Ok(false)` without touching the row when it is missing or no
    /// longer in `from`. Implementations must advance `updated_at` on success.
    async fn update_status(
        &self,
        id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
        error: Option<&str>,
    ) -> Result<bool, StoreError>;

    /// Records in `status`, oldest first. With `older_than`, only records whose
    /// `updated_at` is further in the past than that.
    async fn find_by_status(
        &self,
        status: TaskStatus,
        older_than: Option<Duration>,
    ) -> Result<Vec<TaskRecord>, StoreError>;

    /// `Processing` records not touched for `older_than`.
    async fn find_stuck(&self, older_than: Duration) -> Result<Vec<TaskRecord>, StoreError> {
        self.find_by_status(TaskStatus::Processing, Some(older_than))
            .await
    }

    /// All `Pending` records.
    async fn find_pending(&self) -> Result<Vec<TaskRecord>, StoreError> {
        self.find_by_status(TaskStatus::Pending, None).await
    }
}

/// Cut an error message down to [`MAX_ERROR_LEN`] bytes on a char boundary.
pub fn truncate_error(error: &str) -> &str {
    if error.len() <= MAX_ERROR_LEN {
        return error;
    }
    let mut end = MAX_ERROR_LEN;
    while !error.is_char_boundary(end) {
        end -= 1;
    }
    &error[..end]
}

/// The next `updated_at` for a row last touched at `previous`.
///
/// Clocks can stall or step back; the stored value never does.
pub(crate) fn next_updated_at(previous: DateTime<Utc>) -> DateTime<Utc> {
    let now = Utc::now();
    let floor = previous + ChronoDuration::microseconds(1);
    now.max(floor)
}

/// The instant before which a record counts as older than `age`.
pub(crate) fn cutoff(age: Duration) -> DateTime<Utc> {
    let age = ChronoDuration::from_std(age).unwrap_or(ChronoDuration::MAX);
    Utc::now()
        .checked_sub_signed(age)
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
