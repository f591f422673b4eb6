//! SQLite implementation of TaskStore.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Executor, Sqlite, SqlitePool};
use std::time::Duration;

use super::store::{cutoff, truncate_error, StoreError, TaskRecord, TaskStore};
use crate::task::{TaskId, TaskStatus};
use crate::telemetry::{LogSink, TracingSink};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS scry_tasks (
    id TEXT PRIMARY KEY,
    task_type TEXT NOT NULL,
    payload BLOB NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    error_message TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_scry_tasks_status ON scry_tasks(status, updated_at);
CREATE INDEX IF NOT EXISTS idx_scry_tasks_created ON scry_tasks(created_at);
"#;

type TaskRow = (String, String, Vec<u8>, String, Option<String>, i64, i64);

/// SQLite-backed task store.
///
/// Timestamps are stored as microseconds since the Unix epoch so the
/// strictly-increasing `updated_at` can be enforced in SQL.
#[derive(Clone)]
pub struct SqliteTaskStore {
    pool: SqlitePool,
}

impl SqliteTaskStore {
    /// Create a new SqliteTaskStore.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create the tasks table and indexes.
    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        self.run_migrations_with(&TracingSink::new("task_store_migrations"))
            .await
    }

    /// Same as [`run_migrations`](Self::run_migrations), reporting progress to `log`.
    pub async fn run_migrations_with(&self, log: &dyn LogSink) -> Result<(), StoreError> {
        for statement in SCHEMA.split(';') {
            let trimmed = statement.trim();
            if trimmed.is_empty() {
                continue;
            }
            let summary = trimmed.lines().next().unwrap_or(trimmed);
            if let Err(e) = sqlx::query(trimmed).execute(&self.pool).await {
                log.fatal(&format!("migration failed at `{summary}`: {e}"));
                return Err(storage(e));
            }
            log.info(&format!("applied `{summary}`"));
        }
        Ok(())
    }
}

/// Insert `record` through any SQLite executor.
///
/// Lets a caller persist a task inside its own transaction, next to the
/// domain write that caused it:
///
/// ```rust,ignore
/// let mut tx = pool.begin().await?;
/// insert_memo(&mut *tx, &memo).await?;
/// scry_tasks::runner::sqlite_store::create_in(&mut *tx, &record).await?;
/// tx.commit().await?;
/// ```
pub async fn create_in<'e, E>(executor: E, record: &TaskRecord) -> Result<(), StoreError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query(
        r#"
        INSERT INTO scry_tasks (id, task_type, payload, status, error_message, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(record.id.to_string())
    .bind(&record.task_type)
    .bind(&record.payload)
    .bind(record.status.as_str())
    .bind(record.error.as_deref().map(truncate_error))
    .bind(record.created_at.timestamp_micros())
    .bind(record.updated_at.timestamp_micros())
    .execute(executor)
    .await;

    match result {
        Ok(_) => Ok(()),
        Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
            Err(StoreError::Duplicate(record.id))
        }
        Err(e) => Err(storage(e)),
    }
}

/// Conditionally move a task between statuses through any SQLite executor.
pub async fn update_status_in<'e, E>(
    executor: E,
    id: TaskId,
    from: TaskStatus,
    to: TaskStatus,
    error: Option<&str>,
) -> Result<bool, StoreError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query(
        r#"
        UPDATE scry_tasks
        SET status = ?,
            error_message = ?,
            updated_at = MAX(?, updated_at + 1)
        WHERE id = ? AND status = ?
        "#,
    )
    .bind(to.as_str())
    .bind(error.map(truncate_error))
    .bind(Utc::now().timestamp_micros())
    .bind(id.to_string())
    .bind(from.as_str())
    .execute(executor)
    .await
    .map_err(storage)?;

    Ok(result.rows_affected() == 1)
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn create(&self, record: &TaskRecord) -> Result<(), StoreError> {
        create_in(&self.pool, record).await
    }

    async fn get(&self, id: TaskId) -> Result<Option<TaskRecord>, StoreError> {
        let row = sqlx::query_as::<_, TaskRow>(
            r#"
            SELECT id, task_type, payload, status, error_message, created_at, updated_at
            FROM scry_tasks
            WHERE id = ?
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?;

        row.map(decode_row).transpose()
    }

    async fn update_status(
        &self,
        id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
        error: Option<&str>,
    ) -> Result<bool, StoreError> {
        update_status_in(&self.pool, id, from, to, error).await
    }

    async fn find_by_status(
        &self,
        status: TaskStatus,
        older_than: Option<Duration>,
    ) -> Result<Vec<TaskRecord>, StoreError> {
        // Without an age filter every row qualifies.
        let before = older_than.map_or(i64::MAX, |age| cutoff(age).timestamp_micros());

        let rows = sqlx::query_as::<_, TaskRow>(
            r#"
            SELECT id, task_type, payload, status, error_message, created_at, updated_at
            FROM scry_tasks
            WHERE status = ? AND updated_at < ?
            ORDER BY created_at ASC
            "#,
        )
        .bind(status.as_str())
        .bind(before)
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;

        rows.into_iter().map(decode_row).collect()
    }
}

fn decode_row(row: TaskRow) -> Result<TaskRecord, StoreError> {
    let (id, task_type, payload, status, error, created_at, updated_at) = row;
    let corrupt = |reason: String| StoreError::Corrupt {
        id: id.clone(),
        reason,
    };

    let parsed_id = id
        .parse::<TaskId>()
        .map_err(|e| corrupt(format!("bad id: {e}")))?;
    let status = status
        .parse::<TaskStatus>()
        .map_err(|e| corrupt(e.to_string()))?;
    let created_at = from_micros(created_at).ok_or_else(|| corrupt("bad created_at".into()))?;
    let updated_at = from_micros(updated_at).ok_or_else(|| corrupt("bad updated_at".into()))?;

    Ok(TaskRecord {
        id: parsed_id,
        task_type,
        payload,
        status,
        error,
        created_at,
        updated_at,
    })
}

fn from_micros(micros: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros)
}

fn storage(e: sqlx::Error) -> StoreError {
    StoreError::Storage(e.to_string())
}
