//! pgmq queue operations via direct SQLx.
//!
//! Calls pgmq's SQL functions (pgmq.create, pgmq.send, pgmq.read,
//! pgmq.archive, pgmq.delete) and, for the two operations pgmq has no
//! function for, queries the queue table `pgmq.q_<name>` directly. Queue
//! names come from [`Lane::queue_name`](crate::model::Lane::queue_name),
//! never from user input.

use crate::error::Result;
use crate::telemetry::metrics;
use opentelemetry::KeyValue;

/// A message read from a pgmq queue.
#[derive(Debug, Clone)]
pub struct PgmqMessage {
    pub msg_id: i64,
    pub read_ct: i32,
    pub enqueued_at: chrono::DateTime<chrono::Utc>,
    pub vt: chrono::DateTime<chrono::Utc>,
    pub message: serde_json::Value,
}

fn record_op(queue_name: &str, operation: &'static str) {
    metrics::queue_operations().add(
        1,
        &[
            KeyValue::new("queue", queue_name.to_string()),
            KeyValue::new("operation", operation),
        ],
    );
}

impl super::Db {
    /// Create a pgmq queue (idempotent).
    pub async fn create_queue(&self, queue_name: &str) -> Result<()> {
        sqlx::query("SELECT pgmq.create($1)")
            .bind(queue_name)
            .execute(&self.pool)
            .await?;
        record_op(queue_name, "create");
        Ok(())
    }

    /// Send a message to a pgmq queue. Returns the message ID.
    /// delay_seconds: 0 for immediate, >0 for delayed delivery.
    pub async fn send_to_queue(
        &self,
        queue_name: &str,
        payload: &serde_json::Value,
        delay_seconds: i32,
    ) -> Result<i64> {
        let row: (i64,) = sqlx::query_as("SELECT pgmq.send($1, $2, $3)")
            .bind(queue_name)
            .bind(payload)
            .bind(delay_seconds)
            .fetch_one(&self.pool)
            .await?;
        record_op(queue_name, "send");
        Ok(row.0)
    }

    /// Read the next message from a queue (visibility timeout in seconds).
    /// Returns None if no message is currently visible.
    pub async fn read_from_queue(
        &self,
        queue_name: &str,
        vt_seconds: i32,
    ) -> Result<Option<PgmqMessage>> {
        let row = sqlx::query_as::<
            _,
            (
                i64,
                i32,
                chrono::DateTime<chrono::Utc>,
                chrono::DateTime<chrono::Utc>,
                serde_json::Value,
            ),
        >("SELECT msg_id, read_ct, enqueued_at, vt, message FROM pgmq.read($1, $2, 1)")
        .bind(queue_name)
        .bind(vt_seconds)
        .fetch_optional(&self.pool)
        .await?;

        let msg = row.map(|(msg_id, read_ct, enqueued_at, vt, message)| PgmqMessage {
            msg_id,
            read_ct,
            enqueued_at,
            vt,
            message,
        });

        record_op(queue_name, if msg.is_some() { "read" } else { "read_empty" });
        Ok(msg)
    }

    /// Whether a queue holds any message that is visible right now.
    pub async fn queue_has_ready(&self, queue_name: &str) -> Result<bool> {
        let sql = format!(
            "SELECT EXISTS (SELECT 1 FROM pgmq.q_{queue_name} WHERE vt <= clock_timestamp())"
        );
        let row: (bool,) = sqlx::query_as(&sql).fetch_one(&self.pool).await?;
        Ok(row.0)
    }

    /// Archive a message (moves to archive table, preserves for audit).
    pub async fn archive_message(&self, queue_name: &str, msg_id: i64) -> Result<()> {
        sqlx::query("SELECT pgmq.archive($1, $2)")
            .bind(queue_name)
            .bind(msg_id)
            .execute(&self.pool)
            .await?;
        record_op(queue_name, "archive");
        Ok(())
    }

    /// Delete a message permanently. Returns false if it was already gone.
    pub async fn delete_message(&self, queue_name: &str, msg_id: i64) -> Result<bool> {
        let row: (bool,) = sqlx::query_as("SELECT pgmq.delete($1, $2)")
            .bind(queue_name)
            .bind(msg_id)
            .fetch_one(&self.pool)
            .await?;
        record_op(queue_name, "delete");
        Ok(row.0)
    }

    /// Enqueue `payload` after `delay_seconds` and delete `msg_id`, atomically.
    pub async fn requeue_message(
        &self,
        queue_name: &str,
        msg_id: i64,
        payload: &serde_json::Value,
        delay_seconds: i32,
    ) -> Result<i64> {
        let mut tx = self.pool.begin().await?;

        let new_id: (i64,) = sqlx::query_as("SELECT pgmq.send($1, $2, $3)")
            .bind(queue_name)
            .bind(payload)
            .bind(delay_seconds)
            .fetch_one(&mut *tx)
            .await?;

        sqlx::query("SELECT pgmq.delete($1, $2)")
            .bind(queue_name)
            .bind(msg_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        record_op(queue_name, "requeue");
        Ok(new_id.0)
    }

    /// Delete the message carrying `task_id` if no worker currently holds it.
    ///
    /// A message is held while its visibility timeout runs after a read;
    /// never-read messages (including delayed retries) are always free.
    pub async fn delete_unclaimed(&self, queue_name: &str, task_id: &str) -> Result<bool> {
        let sql = format!(
            "DELETE FROM pgmq.q_{queue_name}
             WHERE message->>'id' = $1 AND (read_ct = 0 OR vt <= clock_timestamp())
             RETURNING msg_id"
        );
        let deleted: Option<(i64,)> = sqlx::query_as(&sql)
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;
        record_op(queue_name, "cancel");
        Ok(deleted.is_some())
    }
}
