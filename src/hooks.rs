//! Record hooks: turn domain events from the record layer into tasks.
//!
//! The record writer calls these after its own write commits. A failed
//! enqueue is logged and swallowed; it never fails the record write.

use crate::model::TaskId;
use crate::queue::TaskQueue;
use serde_json::json;
use tracing::{error, info};

/// A domain event raised by the record layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordEvent {
    ApplicationCreated { application_id: i64 },
    ApplicationStatusChanged { application_id: i64, status: String },
    CandidateCreated { candidate_id: i64 },
    JobCreated { job_id: i64 },
}

impl RecordEvent {
    /// The task this event schedules: kind and arguments.
    pub fn task(&self) -> (&'static str, serde_json::Value) {
        match self {
            RecordEvent::ApplicationCreated { application_id } => {
                ("run-analysis", json!({ "application_id": application_id }))
            }
            RecordEvent::ApplicationStatusChanged {
                application_id,
                status,
            } => (
                "notify-status",
                json!({ "application_id": application_id, "status": status }),
            ),
            RecordEvent::CandidateCreated { candidate_id } => {
                ("generate-embedding", json!({ "candidate_id": candidate_id }))
            }
            RecordEvent::JobCreated { job_id } => {
                ("generate-embedding", json!({ "job_id": job_id }))
            }
        }
    }
}

#[derive(Clone)]
pub struct RecordHooks {
    queue: TaskQueue,
}

impl RecordHooks {
    pub fn new(queue: TaskQueue) -> Self {
        Self { queue }
    }

    /// Enqueue the task for `event`. Returns its id, or `None` if the
    /// enqueue failed.
    pub async fn on_record_created(&self, event: &RecordEvent) -> Option<TaskId> {
        let (kind, args) = event.task();
        match self.queue.enqueue(kind, args).await {
            Ok(task_id) => {
                info!(%task_id, kind, ?event, "queued task for record event");
                Some(task_id)
            }
            Err(e) => {
                error!(kind, ?event, "failed to queue task for record event: {e}");
                None
            }
        }
    }
}
