//! Task execution span helpers.
//!
//! One span per attempt; retries get a fresh span with the bumped attempt.

use crate::model::{Lane, TaskId};
use tracing::Span;

/// Start a span for one attempt of a task.
///
/// The `task.state` field is declared empty and can be updated via
/// [`record_state_transition`].
pub fn start_task_span(kind: &str, task_id: &TaskId, lane: Lane, attempt: u32) -> Span {
    tracing::info_span!(
        "task.execute",
        "task.kind" = kind,
        "task.id" = %task_id,
        "task.lane" = lane.as_str(),
        "task.attempt" = attempt,
        "task.state" = tracing::field::Empty,
    )
}

/// Record a state transition event on the given span.
pub fn record_state_transition(span: &Span, from: &str, to: &str) {
    span.record("task.state", to);
    span.in_scope(|| {
        tracing::info!(from = from, to = to, "state_transition");
    });
}
