//! Core data model.
//!
//! A work item is a deferred call: a kind, opaque arguments and a retry
//! budget, labelled with the lane it runs in. Results and events describe
//! what happened to it.

pub mod event;
pub mod result;
pub mod work;

pub use event::{Event, EventStatus};
pub use result::{TaskResult, TaskStatus};
pub use work::{Lane, TaskId, WorkItem};
