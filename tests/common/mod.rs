//! Backends that fail on demand, wrapping the in-process ones.
#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use taskcast::broker::{Broker, Delivery, MemoryBroker};
use taskcast::error::{Error, Result};
use taskcast::model::{Lane, TaskId, TaskResult, TaskStatus, WorkItem};
use taskcast::store::{MemoryResultStore, ResultStore};

/// [`MemoryBroker`] with an outage switch and a budget of failed requeues.
#[derive(Default)]
pub struct OutageBroker {
    inner: MemoryBroker,
    offline: AtomicBool,
    failed_requeues: AtomicUsize,
}

impl OutageBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every operation fails until set back.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// The next `n` requeues fail, leaving the claimed message untouched.
    pub fn fail_next_requeues(&self, n: usize) {
        self.failed_requeues.store(n, Ordering::SeqCst);
    }

    pub async fn len(&self, lane: Lane) -> usize {
        self.inner.len(lane).await
    }

    pub async fn total(&self) -> usize {
        self.inner.total().await
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(Error::Broker("broker unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Broker for OutageBroker {
    async fn send(&self, item: &WorkItem, delay: Duration) -> Result<i64> {
        self.check_online()?;
        self.inner.send(item, delay).await
    }

    async fn claim(&self, lane: Lane, visibility: Duration) -> Result<Option<Delivery>> {
        self.check_online()?;
        self.inner.claim(lane, visibility).await
    }

    async fn has_ready(&self, lane: Lane) -> Result<bool> {
        self.check_online()?;
        self.inner.has_ready(lane).await
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        self.check_online()?;
        self.inner.ack(delivery).await
    }

    async fn requeue(&self, delivery: &Delivery, next: &WorkItem, delay: Duration) -> Result<()> {
        self.check_online()?;
        let failing = self
            .failed_requeues
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(Error::Broker("requeue rejected".to_string()));
        }
        self.inner.requeue(delivery, next, delay).await
    }

    async fn cancel(&self, task_id: TaskId, lane: Lane) -> Result<bool> {
        self.check_online()?;
        self.inner.cancel(task_id, lane).await
    }
}

/// [`MemoryResultStore`] that rejects a set number of writes per status.
pub struct FlakyStore {
    inner: MemoryResultStore,
    failures: Mutex<HashMap<TaskStatus, usize>>,
}

impl FlakyStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: MemoryResultStore::new(ttl),
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Make the next `n` writes of a `status` result fail.
    pub fn fail_next_puts(&self, status: TaskStatus, n: usize) {
        self.failures.lock().unwrap().insert(status, n);
    }

    fn take_failure(&self, status: TaskStatus) -> bool {
        let mut failures = self.failures.lock().unwrap();
        match failures.get_mut(&status) {
            Some(n) if *n > 0 => {
                *n -= 1;
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl ResultStore for FlakyStore {
    async fn put(&self, result: &TaskResult) -> Result<()> {
        if self.take_failure(result.status) {
            return Err(Error::Store("result store unavailable".to_string()));
        }
        self.inner.put(result).await
    }

    async fn get(&self, task_id: TaskId) -> Result<TaskResult> {
        self.inner.get(task_id).await
    }

    async fn purge_expired(&self) -> Result<u64> {
        self.inner.purge_expired().await
    }
}
