//! Lifecycle events fanned out to live subscribers.
//!
//! Events are ephemeral. Nothing here is persisted; a subscriber that is not
//! attached when an event is published never sees it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::work::{TaskId, WorkItem};

/// Longest progress message carried on an event, in characters.
pub const MAX_MESSAGE_LEN: usize = 500;

fn bounded_message(message: String) -> String {
    if message.chars().count() <= MAX_MESSAGE_LEN {
        return message;
    }
    let mut cut: String = message.chars().take(MAX_MESSAGE_LEN).collect();
    cut.push('…');
    cut
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Started,
    Progress,
    Completed,
    Failed,
}

impl std::fmt::Display for EventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventStatus::Started => "started",
            EventStatus::Progress => "progress",
            EventStatus::Completed => "completed",
            EventStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// A single lifecycle event for one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub task_id: TaskId,
    pub status: EventStatus,
    pub payload: Option<serde_json::Value>,
    pub error: Option<String>,
    /// 0–100, progress events only.
    pub progress: Option<u8>,
    /// Human-readable progress note.
    pub message: Option<String>,
    pub attempt: u32,
    /// Set on a `Failed` event when another attempt is scheduled.
    pub retrying: bool,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    fn new(item: &WorkItem, status: EventStatus) -> Self {
        Self {
            task_id: item.id,
            status,
            payload: None,
            error: None,
            progress: None,
            message: None,
            attempt: item.attempt,
            retrying: false,
            timestamp: Utc::now(),
        }
    }

    pub fn started(item: &WorkItem) -> Self {
        Self::new(item, EventStatus::Started)
    }

    pub fn progress(item: &WorkItem, percent: u8, message: Option<String>) -> Self {
        Self {
            progress: Some(percent.min(100)),
            message: message.map(bounded_message),
            ..Self::new(item, EventStatus::Progress)
        }
    }

    pub fn completed(item: &WorkItem, payload: serde_json::Value) -> Self {
        Self {
            payload: Some(payload),
            ..Self::new(item, EventStatus::Completed)
        }
    }

    /// Non-terminal failure: another attempt follows.
    pub fn retrying(item: &WorkItem, error: &str) -> Self {
        Self {
            error: Some(super::result::public_error(error)),
            retrying: true,
            ..Self::new(item, EventStatus::Failed)
        }
    }

    /// Terminal failure.
    pub fn failed(item: &WorkItem, error: &str) -> Self {
        Self {
            error: Some(super::result::public_error(error)),
            ..Self::new(item, EventStatus::Failed)
        }
    }

    pub fn is_terminal(&self) -> bool {
        match self.status {
            EventStatus::Completed => true,
            EventStatus::Failed => !self.retrying,
            EventStatus::Started | EventStatus::Progress => false,
        }
    }
}
