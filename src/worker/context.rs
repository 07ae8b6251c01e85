//! Per-attempt context handed to callbacks.

use super::handler::TaskFailure;
use crate::broadcast::EventSink;
use crate::model::{Event, TaskId, WorkItem};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::warn;

#[derive(Clone)]
pub struct TaskContext {
    item: Arc<WorkItem>,
    soft_deadline: Instant,
    events: Arc<dyn EventSink>,
}

impl TaskContext {
    pub fn new(item: WorkItem, soft_deadline: Instant, events: Arc<dyn EventSink>) -> Self {
        Self {
            item: Arc::new(item),
            soft_deadline,
            events,
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.item.id
    }

    pub fn kind(&self) -> &str {
        &self.item.kind
    }

    /// Zero-based attempt number of this invocation.
    pub fn attempt(&self) -> u32 {
        self.item.attempt
    }

    pub fn max_attempts(&self) -> u32 {
        self.item.max_attempts
    }

    pub fn is_last_attempt(&self) -> bool {
        self.item.is_last_attempt()
    }

    /// Past the soft time limit; the hard limit follows shortly.
    pub fn past_soft_deadline(&self) -> bool {
        Instant::now() >= self.soft_deadline
    }

    /// Early-exit point for long callbacks. Returns a retryable failure once
    /// the soft time limit has passed, so the callback can stop cleanly
    /// before it is abandoned.
    pub fn checkpoint(&self) -> Result<(), TaskFailure> {
        if self.past_soft_deadline() {
            return Err(TaskFailure::retryable("soft time limit exceeded"));
        }
        Ok(())
    }

    /// Publish a progress event. Best-effort; publish errors are logged.
    pub async fn progress(&self, percent: u8, message: Option<&str>) {
        let event = Event::progress(&self.item, percent, message.map(str::to_string));
        if let Err(e) = self.events.emit(event).await {
            warn!(task_id = %self.item.id, "progress publish failed: {e}");
        }
    }

    /// Progress for an item-by-item job: `current` of `total` done.
    pub async fn batch_progress(&self, current: u64, total: u64, message: Option<&str>) {
        let message = message
            .map(str::to_string)
            .unwrap_or_else(|| format!("Processing {current}/{total}"));
        self.progress(batch_percent(current, total), Some(&message))
            .await;
    }
}

fn batch_percent(current: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    (current.min(total) * 100 / total) as u8
}
