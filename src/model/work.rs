//! Work items and lanes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Task ID
// ---------------------------------------------------------------------------

/// Newtype for task IDs. Assigned at enqueue time, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

// ---------------------------------------------------------------------------
// Lane
// ---------------------------------------------------------------------------

/// Priority class of pending work.
///
/// Declaration order is priority order: `Urgent` sorts first and is always
/// drained before anything below it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Lane {
    Urgent,
    FastCompute,
    HeavyCompute,
    Background,
}

impl Lane {
    /// All lanes, highest priority first.
    pub const ALL: [Lane; 4] = [
        Lane::Urgent,
        Lane::FastCompute,
        Lane::HeavyCompute,
        Lane::Background,
    ];

    /// Name of the broker queue backing this lane.
    pub fn queue_name(self) -> &'static str {
        match self {
            Lane::Urgent => "tasks_urgent",
            Lane::FastCompute => "tasks_fast_compute",
            Lane::HeavyCompute => "tasks_heavy_compute",
            Lane::Background => "tasks_background",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Lane::Urgent => "urgent",
            Lane::FastCompute => "fast-compute",
            Lane::HeavyCompute => "heavy-compute",
            Lane::Background => "background",
        }
    }
}

impl std::fmt::Display for Lane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Lane {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Lane::ALL
            .into_iter()
            .find(|lane| lane.as_str() == s)
            .ok_or_else(|| crate::error::Error::Config(format!("unknown lane: {s}")))
    }
}

// ---------------------------------------------------------------------------
// Work Item
// ---------------------------------------------------------------------------

/// A unit of deferred work as it travels through the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: TaskId,

    /// Names the callback that executes this item.
    pub kind: String,

    /// Arguments for the callback. Owned by the producer; never interpreted here.
    pub args: serde_json::Value,

    pub lane: Lane,

    /// Zero-based attempt number. A retry is a fresh message with this bumped.
    pub attempt: u32,

    /// Total attempts allowed, including the first.
    pub max_attempts: u32,

    pub enqueued_at: DateTime<Utc>,
}

impl WorkItem {
    /// True when a failure of this attempt is terminal.
    pub fn is_last_attempt(&self) -> bool {
        self.attempt + 1 >= self.max_attempts
    }

    /// The item to re-enqueue after this attempt fails.
    pub fn next_attempt(&self) -> WorkItem {
        WorkItem {
            attempt: self.attempt + 1,
            enqueued_at: Utc::now(),
            ..self.clone()
        }
    }
}
