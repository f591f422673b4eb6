//! In-process implementation of TaskStore.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use super::store::{cutoff, next_updated_at, truncate_error, StoreError, TaskRecord, TaskStore};
use crate::task::{TaskId, TaskStatus};

/// Task store that keeps records in memory.
///
/// Cloning shares the underlying records. Nothing survives the process, so
/// this is meant for tests and for embedding where durability is not needed.
#[derive(Clone, Default)]
pub struct MemoryTaskStore {
    records: Arc<Mutex<HashMap<TaskId, TaskRecord>>>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a record as-is, bypassing the transition rules.
    ///
    /// Used to seed fixtures such as a task left `Processing` by a crashed
    /// process.
    pub async fn insert_record(&self, record: TaskRecord) {
        self.records.lock().await.insert(record.id, record);
    }

    /// Every record, oldest first.
    pub async fn records(&self) -> Vec<TaskRecord> {
        let mut all: Vec<_> = self.records.lock().await.values().cloned().collect();
        all.sort_by_key(|r| r.created_at);
        all
    }

    /// Number of records in `status`.
    pub async fn count(&self, status: TaskStatus) -> usize {
        self.records
            .lock()
            .await
            .values()
            .filter(|r| r.status == status)
            .count()
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn create(&self, record: &TaskRecord) -> Result<(), StoreError> {
        let mut records = self.records.lock().await;
        if records.contains_key(&record.id) {
            return Err(StoreError::Duplicate(record.id));
        }
        records.insert(record.id, record.clone());
        Ok(())
    }

    async fn get(&self, id: TaskId) -> Result<Option<TaskRecord>, StoreError> {
        Ok(self.records.lock().await.get(&id).cloned())
    }

    async fn update_status(
        &self,
        id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
        error: Option<&str>,
    ) -> Result<bool, StoreError> {
        let mut records = self.records.lock().await;
        let Some(record) = records.get_mut(&id) else {
            return Ok(false);
        };
        if record.status != from {
            return Ok(false);
        }
        record.status = to;
        record.error = error.map(|e| truncate_error(e).to_string());
        record.updated_at = next_updated_at(record.updated_at);
        Ok(true)
    }

    async fn find_by_status(
        &self,
        status: TaskStatus,
        older_than: Option<Duration>,
    ) -> Result<Vec<TaskRecord>, StoreError> {
        let before = older_than.map(cutoff);
        let mut found: Vec<_> = self
            .records
            .lock()
            .await
            .values()
            .filter(|r| r.status == status)
            .filter(|r| before.map_or(true, |b| r.updated_at < b))
            .cloned()
            .collect();
        found.sort_by_key(|r| r.created_at);
        Ok(found)
    }
}
