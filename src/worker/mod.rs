//! Worker pool and the callback interface it drives.

pub mod context;
pub mod handler;
pub mod pool;

pub use context::TaskContext;
pub use handler::{FnHandler, Handler, HandlerRegistry, TaskFailure, TaskOutcome};
pub use pool::{PoolExit, WorkerConfig, WorkerPool};
