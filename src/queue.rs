//! Producer side: enqueue, status lookup, administrative cancel.

use crate::broadcast::EventSink;
use crate::broker::Broker;
use crate::error::Result;
use crate::model::{Event, TaskId, TaskResult, WorkItem};
use crate::routing::{KindPolicy, RoutingTable};
use crate::store::ResultStore;
use crate::telemetry::metrics;
use chrono::Utc;
use opentelemetry::KeyValue;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Error recorded for a task removed from its queue before any worker ran it.
pub const CANCELLED_ERROR: &str = "cancelled before execution";

#[derive(Clone)]
pub struct TaskQueue {
    broker: Arc<dyn Broker>,
    store: Arc<dyn ResultStore>,
    events: Arc<dyn EventSink>,
    routes: Arc<RoutingTable>,
}

impl TaskQueue {
    pub fn new(
        broker: Arc<dyn Broker>,
        store: Arc<dyn ResultStore>,
        events: Arc<dyn EventSink>,
        routes: Arc<RoutingTable>,
    ) -> Self {
        Self {
            broker,
            store,
            events,
            routes,
        }
    }

    pub fn routes(&self) -> &RoutingTable {
        &self.routes
    }

    /// Route `kind`, record the task as pending, and hand it to the broker.
    ///
    /// Fails with [`Error::UnknownKind`](crate::error::Error::UnknownKind) for unrouted kinds and propagates
    /// broker and store errors; nothing is dropped silently.
    pub async fn enqueue(&self, kind: &str, args: Value) -> Result<TaskId> {
        let policy = self.routes.policy(kind)?;
        self.enqueue_routed(policy, args).await
    }

    /// Enqueue one task per entry of `batch`, all of the same kind. Stops at
    /// the first failure; tasks enqueued before it stay enqueued.
    pub async fn enqueue_batch(&self, kind: &str, batch: Vec<Value>) -> Result<Vec<TaskId>> {
        let policy = self.routes.policy(kind)?;
        let mut ids = Vec::with_capacity(batch.len());
        for args in batch {
            ids.push(self.enqueue_routed(policy, args).await?);
        }
        info!(kind, count = ids.len(), "batch enqueued");
        Ok(ids)
    }

    async fn enqueue_routed(&self, policy: &KindPolicy, args: Value) -> Result<TaskId> {
        let item = WorkItem {
            id: TaskId::new(),
            kind: policy.kind.clone(),
            args,
            lane: policy.lane,
            attempt: 0,
            max_attempts: policy.max_attempts,
            enqueued_at: Utc::now(),
        };

        // Pending goes in first so a fast worker's `started` is never overwritten.
        let sent = match self.store.put(&TaskResult::pending(&item)).await {
            Ok(()) => self.broker.send(&item, Duration::ZERO).await,
            Err(e) => Err(e),
        };

        let attrs = |result: &'static str| {
            [
                KeyValue::new("kind", item.kind.clone()),
                KeyValue::new("lane", item.lane.as_str()),
                KeyValue::new("result", result),
            ]
        };

        match sent {
            Ok(msg_id) => {
                metrics::tasks_enqueued().add(1, &attrs("ok"));
                info!(task_id = %item.id, kind = %item.kind, lane = %item.lane, msg_id, "task enqueued");
                Ok(item.id)
            }
            Err(e) => {
                metrics::tasks_enqueued().add(1, &attrs("error"));
                warn!(task_id = %item.id, kind = %item.kind, "enqueue failed: {e}");
                let _ = self
                    .store
                    .put(&TaskResult::failed(&item, "enqueue failed"))
                    .await;
                Err(e)
            }
        }
    }

    pub async fn status(&self, task_id: TaskId) -> Result<TaskResult> {
        self.store.get(task_id).await
    }

    /// Best-effort cancel. Removes the task from its queue if no worker holds
    /// it, recording a terminal failure. A claimed or finished task is left
    /// alone and `false` is returned.
    pub async fn cancel(&self, task_id: TaskId) -> Result<bool> {
        let current = self.store.get(task_id).await?;
        if current.status.is_terminal() {
            return Ok(false);
        }
        let policy = self.routes.policy(&current.kind)?;
        if !self.broker.cancel(task_id, policy.lane).await? {
            return Ok(false);
        }

        let item = WorkItem {
            id: task_id,
            kind: current.kind.clone(),
            args: Value::Null,
            lane: policy.lane,
            attempt: current.attempt,
            max_attempts: policy.max_attempts,
            enqueued_at: Utc::now(),
        };
        self.store
            .put(&TaskResult::failed(&item, CANCELLED_ERROR))
            .await?;
        if let Err(e) = self.events.emit(Event::failed(&item, CANCELLED_ERROR)).await {
            warn!(%task_id, "cancel event publish failed: {e}");
        }
        info!(%task_id, kind = %item.kind, "task cancelled");
        Ok(true)
    }
}
