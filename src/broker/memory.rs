//! In-process broker with the same visibility-timeout semantics as pgmq.
//!
//! Used by tests and single-process deployments. Timing runs on the tokio
//! clock, so paused-time tests see delays and visibility timeouts advance.

use super::{Broker, Delivery};
use crate::error::{Error, Result};
use crate::model::{Lane, TaskId, WorkItem};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Debug)]
struct StoredMessage {
    msg_id: i64,
    item: WorkItem,
    visible_at: Instant,
    read_ct: u32,
}

impl StoredMessage {
    fn is_visible(&self, now: Instant) -> bool {
        self.visible_at <= now
    }
}

#[derive(Debug, Default)]
pub struct MemoryBroker {
    /// Per-lane queues in msg_id (arrival) order.
    lanes: Mutex<HashMap<Lane, Vec<StoredMessage>>>,
    next_id: AtomicI64,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages on `lane`, visible or not.
    pub async fn len(&self, lane: Lane) -> usize {
        self.lanes.lock().await.get(&lane).map_or(0, Vec::len)
    }

    /// Messages across all lanes.
    pub async fn total(&self) -> usize {
        self.lanes.lock().await.values().map(Vec::len).sum()
    }

    fn push(&self, lanes: &mut HashMap<Lane, Vec<StoredMessage>>, item: &WorkItem, delay: Duration) -> i64 {
        let msg_id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        lanes.entry(item.lane).or_default().push(StoredMessage {
            msg_id,
            item: item.clone(),
            visible_at: Instant::now() + delay,
            read_ct: 0,
        });
        msg_id
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn send(&self, item: &WorkItem, delay: Duration) -> Result<i64> {
        let mut lanes = self.lanes.lock().await;
        Ok(self.push(&mut lanes, item, delay))
    }

    async fn claim(&self, lane: Lane, visibility: Duration) -> Result<Option<Delivery>> {
        let now = Instant::now();
        let mut lanes = self.lanes.lock().await;
        let Some(queue) = lanes.get_mut(&lane) else {
            return Ok(None);
        };

        let Some(msg) = queue.iter_mut().find(|m| m.is_visible(now)) else {
            return Ok(None);
        };
        msg.visible_at = now + visibility;
        msg.read_ct += 1;

        Ok(Some(Delivery {
            msg_id: msg.msg_id,
            lane,
            item: msg.item.clone(),
            read_ct: msg.read_ct,
        }))
    }

    async fn has_ready(&self, lane: Lane) -> Result<bool> {
        let now = Instant::now();
        let lanes = self.lanes.lock().await;
        Ok(lanes
            .get(&lane)
            .is_some_and(|q| q.iter().any(|m| m.is_visible(now))))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        let mut lanes = self.lanes.lock().await;
        if let Some(queue) = lanes.get_mut(&delivery.lane) {
            queue.retain(|m| m.msg_id != delivery.msg_id);
        }
        Ok(())
    }

    async fn requeue(&self, delivery: &Delivery, next: &WorkItem, delay: Duration) -> Result<()> {
        if next.lane != delivery.lane {
            return Err(Error::Broker(format!(
                "requeue across lanes: {} -> {}",
                delivery.lane, next.lane
            )));
        }
        let mut lanes = self.lanes.lock().await;
        if let Some(queue) = lanes.get_mut(&delivery.lane) {
            queue.retain(|m| m.msg_id != delivery.msg_id);
        }
        self.push(&mut lanes, next, delay);
        Ok(())
    }

    async fn cancel(&self, task_id: TaskId, lane: Lane) -> Result<bool> {
        let now = Instant::now();
        let mut lanes = self.lanes.lock().await;
        let Some(queue) = lanes.get_mut(&lane) else {
            return Ok(false);
        };
        let before = queue.len();
        queue.retain(|m| !(m.item.id == task_id && (m.read_ct == 0 || m.is_visible(now))));
        Ok(queue.len() < before)
    }
}
