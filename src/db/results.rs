//! `task_results` table: one row per task, expiring after the configured TTL.

use crate::error::{Error, Result};
use crate::model::{TaskId, TaskResult};
use chrono::{DateTime, Utc};
use std::time::Duration;
use uuid::Uuid;

impl super::Db {
    /// Upsert a task's result; the row expires `ttl` after this write.
    pub async fn put_result(&self, result: &TaskResult, ttl: Duration) -> Result<()> {
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| Error::Config(format!("result ttl out of range: {e}")))?;
        let expires_at = result.updated_at + ttl;

        sqlx::query(
            "INSERT INTO task_results (task_id, kind, status, attempt, payload, error, updated_at, expires_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             ON CONFLICT (task_id) DO UPDATE SET
                kind = EXCLUDED.kind,
                status = EXCLUDED.status,
                attempt = EXCLUDED.attempt,
                payload = EXCLUDED.payload,
                error = EXCLUDED.error,
                updated_at = EXCLUDED.updated_at,
                expires_at = EXCLUDED.expires_at",
        )
        .bind(result.task_id.0)
        .bind(&result.kind)
        .bind(result.status.to_string())
        .bind(result.attempt as i32)
        .bind(&result.payload)
        .bind(&result.error)
        .bind(result.updated_at)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Fetch a live result. Expired rows read as not found even before the
    /// janitor deletes them.
    pub async fn get_result(&self, task_id: TaskId) -> Result<TaskResult> {
        let row: Option<TaskResultRow> = sqlx::query_as(
            "SELECT task_id, kind, status, attempt, payload, error, updated_at
             FROM task_results WHERE task_id = $1 AND expires_at > now()",
        )
        .bind(task_id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.ok_or_else(|| Error::NotFound(format!("task result {task_id}")))?
            .try_into_result()
    }

    /// Delete expired rows. Returns how many were removed.
    pub async fn purge_expired_results(&self) -> Result<u64> {
        let deleted = sqlx::query("DELETE FROM task_results WHERE expires_at <= now()")
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(deleted)
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct TaskResultRow {
    task_id: Uuid,
    kind: String,
    status: String,
    attempt: i32,
    payload: Option<serde_json::Value>,
    error: Option<String>,
    updated_at: DateTime<Utc>,
}

impl TaskResultRow {
    fn try_into_result(self) -> Result<TaskResult> {
        Ok(TaskResult {
            task_id: TaskId(self.task_id),
            kind: self.kind,
            status: self.status.parse()?,
            attempt: self.attempt.max(0) as u32,
            payload: self.payload,
            error: self.error,
            updated_at: self.updated_at,
        })
    }
}
