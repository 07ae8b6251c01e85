//! Task results: the durable record of where a task stands.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::work::{TaskId, WorkItem};

/// Longest error string exposed to clients.
const MAX_ERROR_LEN: usize = 500;

/// Lifecycle status as recorded in the result store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Queued, or waiting out a retry delay.
    Pending,
    Started,
    Succeeded,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Succeeded | TaskStatus::Failed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Started => "started",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "started" => Ok(TaskStatus::Started),
            "succeeded" => Ok(TaskStatus::Succeeded),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(crate::error::Error::Other(format!(
                "unknown task status: {other}"
            ))),
        }
    }
}

/// Outcome record for one task.
///
/// `payload` is only set when succeeded, `error` only when failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub kind: String,
    pub status: TaskStatus,
    /// Attempt this record describes (zero-based).
    pub attempt: u32,
    pub payload: Option<serde_json::Value>,
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl TaskResult {
    fn for_item(item: &WorkItem, status: TaskStatus) -> Self {
        Self {
            task_id: item.id,
            kind: item.kind.clone(),
            status,
            attempt: item.attempt,
            payload: None,
            error: None,
            updated_at: Utc::now(),
        }
    }

    pub fn pending(item: &WorkItem) -> Self {
        Self::for_item(item, TaskStatus::Pending)
    }

    pub fn started(item: &WorkItem) -> Self {
        Self::for_item(item, TaskStatus::Started)
    }

    pub fn succeeded(item: &WorkItem, payload: serde_json::Value) -> Self {
        Self {
            payload: Some(payload),
            ..Self::for_item(item, TaskStatus::Succeeded)
        }
    }

    pub fn failed(item: &WorkItem, error: &str) -> Self {
        Self {
            error: Some(public_error(error)),
            ..Self::for_item(item, TaskStatus::Failed)
        }
    }
}

/// Reduce an error message to something safe to show a user: the first
/// non-empty line, bounded in length.
pub fn public_error(raw: &str) -> String {
    let line = raw
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("task failed");

    if line.chars().count() <= MAX_ERROR_LEN {
        return line.to_string();
    }
    let mut cut: String = line.chars().take(MAX_ERROR_LEN).collect();
    cut.push('…');
    cut
}
