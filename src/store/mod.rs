//! Result store: task id to latest result, with expiry.
//!
//! Writes are last-writer-wins per task. Reads of an expired or unknown id
//! return [`Error::NotFound`](crate::error::Error::NotFound); the store never
//! hands back a stale value.

pub mod memory;

pub use memory::MemoryResultStore;

use crate::db::Db;
use crate::error::Result;
use crate::model::{TaskId, TaskResult};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Record `result`, replacing whatever the task had. Resets its expiry.
    async fn put(&self, result: &TaskResult) -> Result<()>;

    async fn get(&self, task_id: TaskId) -> Result<TaskResult>;

    /// Drop expired entries. Returns how many were removed.
    async fn purge_expired(&self) -> Result<u64>;
}

/// Postgres-backed store over the `task_results` table.
pub struct PgResultStore {
    db: Arc<Db>,
    ttl: Duration,
}

impl PgResultStore {
    pub fn new(db: Arc<Db>, ttl: Duration) -> Self {
        Self { db, ttl }
    }
}

#[async_trait]
impl ResultStore for PgResultStore {
    async fn put(&self, result: &TaskResult) -> Result<()> {
        self.db.put_result(result, self.ttl).await
    }

    async fn get(&self, task_id: TaskId) -> Result<TaskResult> {
        self.db.get_result(task_id).await
    }

    async fn purge_expired(&self) -> Result<u64> {
        self.db.purge_expired_results().await
    }
}

/// Purge expired results every `every` until the handle is aborted.
pub fn spawn_janitor(store: Arc<dyn ResultStore>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match store.purge_expired().await {
                Ok(0) => {}
                Ok(purged) => info!(purged, "expired results purged"),
                Err(e) => warn!("result purge failed: {e}"),
            }
        }
    })
}
