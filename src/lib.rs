//! Dispatch queues: run closures on background workers, one at a time or
//! with bounded parallelism, with delayed execution, cancellation and
//! barrier-backed synchronous calls.
//!
//! [`SerialQueue`] owns a single lazily-started worker and preserves
//! submission order; [`PoolQueue`] fans work out over a fixed set of
//! workers. Both share one engine, [`TaskQueue`], which can also be driven
//! directly by callers that bring their own threads.

mod context;

pub mod listener;
pub use listener::QueueListener;

pub mod queue;
pub use queue::{main, set_main, Builder, DispatchQueue, PoolQueue, QosClass, SerialQueue};

pub mod task;
pub use task::{DispatchFn, Enqueued, TaskId, NULL_TASK_ID};

pub mod task_queue;
pub use task_queue::TaskQueue;

mod utils;
