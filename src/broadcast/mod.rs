//! Event broadcast: per-task fan-out of lifecycle events to live subscribers.
//!
//! Delivery is best-effort and ephemeral. An event published while a task has
//! no subscribers is dropped, and a late subscriber sees only what follows its
//! subscription. Per-subscriber channels are bounded; a subscriber that stops
//! draining loses events rather than stalling the publisher.

pub mod relay;

pub use relay::{PgNotifySink, spawn_pg_relay};

use crate::error::Result;
use crate::model::{Event, TaskId};
use crate::telemetry::metrics;
use async_trait::async_trait;
use opentelemetry::KeyValue;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, warn};

/// Default per-subscriber channel capacity.
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 256;

/// Where workers send lifecycle events.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: Event) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Handle returned by [`EventBus::subscribe`]; pass it back to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub task_id: TaskId,
}

struct Subscriber {
    id: SubscriptionId,
    tx: mpsc::Sender<Event>,
}

pub struct EventBus {
    subscribers: RwLock<HashMap<TaskId, Vec<Subscriber>>>,
    next_id: AtomicU64,
    capacity: usize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_SUBSCRIBER_CAPACITY)
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            capacity: capacity.max(1),
        }
    }

    /// Subscribe to one task on a fresh channel.
    pub async fn subscribe(&self, task_id: TaskId) -> (Subscription, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(self.capacity);
        let sub = self.subscribe_into(task_id, tx).await;
        (sub, rx)
    }

    /// Subscribe to one task, delivering into an existing channel. A single
    /// channel may carry several tasks; arrival order across them is kept.
    pub async fn subscribe_into(&self, task_id: TaskId, tx: mpsc::Sender<Event>) -> Subscription {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers
            .write()
            .await
            .entry(task_id)
            .or_default()
            .push(Subscriber { id, tx });
        debug!(%task_id, "subscriber attached");
        Subscription { id, task_id }
    }

    /// Remove a subscription. Returns false if it was already gone.
    pub async fn unsubscribe(&self, sub: &Subscription) -> bool {
        let mut subscribers = self.subscribers.write().await;
        let Some(list) = subscribers.get_mut(&sub.task_id) else {
            return false;
        };
        let before = list.len();
        list.retain(|s| s.id != sub.id);
        let removed = list.len() < before;
        if list.is_empty() {
            subscribers.remove(&sub.task_id);
        }
        removed
    }

    /// Deliver `event` to every current subscriber of its task. Returns how
    /// many received it.
    pub async fn publish(&self, event: &Event) -> usize {
        let mut delivered = 0;
        let mut closed = Vec::new();
        {
            let subscribers = self.subscribers.read().await;
            let Some(list) = subscribers.get(&event.task_id) else {
                return 0;
            };
            for sub in list {
                match sub.tx.try_send(event.clone()) {
                    Ok(()) => delivered += 1,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!(task_id = %event.task_id, status = %event.status, "subscriber lagging, event dropped");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => closed.push(sub.id),
                }
            }
        }

        if !closed.is_empty() {
            let mut subscribers = self.subscribers.write().await;
            if let Some(list) = subscribers.get_mut(&event.task_id) {
                list.retain(|s| !closed.contains(&s.id));
                if list.is_empty() {
                    subscribers.remove(&event.task_id);
                }
            }
        }

        metrics::events_published().add(
            1,
            &[KeyValue::new("status", event.status.to_string())],
        );
        delivered
    }

    pub async fn subscriber_count(&self, task_id: TaskId) -> usize {
        self.subscribers
            .read()
            .await
            .get(&task_id)
            .map_or(0, Vec::len)
    }
}

#[async_trait]
impl EventSink for EventBus {
    async fn emit(&self, event: Event) -> Result<()> {
        self.publish(&event).await;
        Ok(())
    }
}
