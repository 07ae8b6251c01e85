//! JSON messages exchanged over a live connection.

use crate::model::{Event, EventStatus, TaskId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Gateway to client.
///
/// `result`, `error` and `progress` on a `task_update` are always present,
/// as `null` when they do not apply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Connection {
        task_id: TaskId,
        message: String,
    },
    TaskUpdate {
        task_id: TaskId,
        status: EventStatus,
        result: Option<Value>,
        error: Option<String>,
        progress: Option<u8>,
        message: Option<String>,
        attempt: u32,
        retrying: bool,
        timestamp: DateTime<Utc>,
    },
    Subscribed {
        task_id: TaskId,
    },
    Unsubscribed {
        task_id: TaskId,
    },
    Pong {
        timestamp: Option<Value>,
    },
    Error {
        message: String,
    },
}

impl ServerMessage {
    pub fn connection(task_id: TaskId) -> Self {
        ServerMessage::Connection {
            task_id,
            message: format!("Connected to task {task_id}"),
        }
    }
}

impl From<Event> for ServerMessage {
    fn from(event: Event) -> Self {
        ServerMessage::TaskUpdate {
            task_id: event.task_id,
            status: event.status,
            result: event.payload,
            error: event.error,
            progress: event.progress,
            message: event.message,
            attempt: event.attempt,
            retrying: event.retrying,
            timestamp: event.timestamp,
        }
    }
}

/// Client to gateway.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Echoed back as `pong` with the same timestamp.
    Ping {
        #[serde(default)]
        timestamp: Option<Value>,
    },
    /// Bind another task to this connection.
    Subscribe { task_id: TaskId },
    Unsubscribe { task_id: TaskId },
}
