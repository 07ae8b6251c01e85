//! In-process result store on the tokio clock.

use super::ResultStore;
use crate::error::{Error, Result};
use crate::model::{TaskId, TaskResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

pub struct MemoryResultStore {
    ttl: Duration,
    entries: RwLock<HashMap<TaskId, (TaskResult, Instant)>>,
}

impl MemoryResultStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl ResultStore for MemoryResultStore {
    async fn put(&self, result: &TaskResult) -> Result<()> {
        let expires_at = Instant::now() + self.ttl;
        self.entries
            .write()
            .await
            .insert(result.task_id, (result.clone(), expires_at));
        Ok(())
    }

    async fn get(&self, task_id: TaskId) -> Result<TaskResult> {
        let entries = self.entries.read().await;
        match entries.get(&task_id) {
            Some((result, expires_at)) if *expires_at > Instant::now() => Ok(result.clone()),
            _ => Err(Error::NotFound(format!("task result {task_id}"))),
        }
    }

    async fn purge_expired(&self) -> Result<u64> {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, (_, expires_at)| *expires_at > now);
        Ok((before - entries.len()) as u64)
    }
}
