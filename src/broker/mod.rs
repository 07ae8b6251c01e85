//! Message broker: durable per-lane queues with visibility timeouts.
//!
//! A claimed message stays in its queue, invisible, until it is acked or
//! its visibility timeout lapses. A worker that dies mid-task therefore never
//! loses the item; it is redelivered to the next claimant. Delivery is
//! at-least-once.

pub mod memory;

pub use memory::MemoryBroker;

use crate::db::Db;
use crate::error::{Error, Result};
use crate::model::{Lane, TaskId, WorkItem};
use async_trait::async_trait;
use std::time::Duration;

/// A claimed message.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub msg_id: i64,
    pub lane: Lane,
    pub item: WorkItem,
    /// How many times this message has been read, this claim included.
    pub read_ct: u32,
}

impl Delivery {
    /// A previous claimant held this message and never acked it.
    pub fn is_redelivery(&self) -> bool {
        self.read_ct > 1
    }
}

#[async_trait]
pub trait Broker: Send + Sync {
    /// Enqueue an item on its lane, visible after `delay`.
    async fn send(&self, item: &WorkItem, delay: Duration) -> Result<i64>;

    /// Claim the oldest visible message on `lane`, hiding it for `visibility`.
    async fn claim(&self, lane: Lane, visibility: Duration) -> Result<Option<Delivery>>;

    /// Whether `lane` has a message that could be claimed now.
    async fn has_ready(&self, lane: Lane) -> Result<bool>;

    /// Remove a delivered message for good.
    async fn ack(&self, delivery: &Delivery) -> Result<()>;

    /// Replace `delivery` with `next`, visible after `delay`. Both happen or
    /// neither does.
    async fn requeue(&self, delivery: &Delivery, next: &WorkItem, delay: Duration) -> Result<()>;

    /// Drop the pending message for `task_id` on `lane` unless a worker holds
    /// it. Returns whether a message was removed.
    async fn cancel(&self, task_id: TaskId, lane: Lane) -> Result<bool>;
}

/// pgmq takes whole seconds; round partial seconds up so nothing fires early.
fn whole_secs(d: Duration) -> i32 {
    let secs = d.as_secs() + u64::from(d.subsec_nanos() > 0);
    i32::try_from(secs).unwrap_or(i32::MAX)
}

#[async_trait]
impl Broker for Db {
    async fn send(&self, item: &WorkItem, delay: Duration) -> Result<i64> {
        let payload = serde_json::to_value(item)?;
        self.send_to_queue(item.lane.queue_name(), &payload, whole_secs(delay))
            .await
    }

    async fn claim(&self, lane: Lane, visibility: Duration) -> Result<Option<Delivery>> {
        let queue = lane.queue_name();
        loop {
            let Some(msg) = self.read_from_queue(queue, whole_secs(visibility)).await? else {
                return Ok(None);
            };

            match serde_json::from_value::<WorkItem>(msg.message) {
                Ok(item) => {
                    return Ok(Some(Delivery {
                        msg_id: msg.msg_id,
                        lane,
                        item,
                        read_ct: msg.read_ct.max(0) as u32,
                    }));
                }
                Err(e) => {
                    // Unreadable payloads would be redelivered forever.
                    tracing::error!(queue, msg_id = msg.msg_id, error = %e, "archiving malformed message");
                    self.archive_message(queue, msg.msg_id).await?;
                }
            }
        }
    }

    async fn has_ready(&self, lane: Lane) -> Result<bool> {
        self.queue_has_ready(lane.queue_name()).await
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        let deleted = self
            .delete_message(delivery.lane.queue_name(), delivery.msg_id)
            .await?;
        if !deleted {
            tracing::debug!(msg_id = delivery.msg_id, "ack for message already removed");
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
        let payload = serde_json::to_value(next)?;
        self.requeue_message(
            delivery.lane.queue_name(),
            delivery.msg_id,
            &payload,
            whole_secs(delay),
        )
        .await?;
        Ok(())
    }

    async fn cancel(&self, task_id: TaskId, lane: Lane) -> Result<bool> {
        self.delete_unclaimed(lane.queue_name(), &task_id.to_string())
            .await
    }
}

impl Db {
    /// Create the queue behind every lane (idempotent).
    pub async fn create_lane_queues(&self) -> Result<()> {
        for lane in Lane::ALL {
            self.create_queue(lane.queue_name()).await?;
        }
        Ok(())
    }
}
