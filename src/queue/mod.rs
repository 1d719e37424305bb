//! User-facing queue front-ends over the shared task store.

use crate::listener::QueueListener;
use crate::task::{DispatchFn, TaskId};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

// Public API
pub mod builder;
pub use builder::Builder;

mod serial;
pub use serial::SerialQueue;

mod pool;
pub use pool::PoolQueue;

#[cfg(test)]
mod tests;

/// Scheduling priority hint for a queue's worker threads.
///
/// Interpreted best-effort; platforms without support ignore it entirely.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum QosClass {
    /// Background work nobody is waiting on.
    Lowest,
    Low,
    #[default]
    Normal,
    /// Work a user is actively waiting on.
    High,
    Max,
}

/// Common surface of the serial and pooled queue front-ends.
///
/// The `_boxed` methods form the object-safe core used through
/// `Arc<dyn DispatchQueue>` handles; the generic methods are conveniences
/// for callers holding a concrete queue type. Equivalent conveniences for
/// trait-object handles live in an inherent `impl dyn DispatchQueue` block.
pub trait DispatchQueue: Send + Sync {
    /// Submit `func` for asynchronous execution.
    fn spawn_boxed(&self, func: DispatchFn);

    /// Submit `func` to run no earlier than `delay` from now. The returned
    /// id can cancel the task until it starts.
    fn spawn_after_boxed(&self, delay: Duration, func: DispatchFn) -> TaskId;

    /// Run `func` to completion before returning, excluding all other queue
    /// work for its duration.
    ///
    /// Calling this from the queue's own worker deadlocks. Use
    /// [`safe_sync`](DispatchQueue::safe_sync) when the calling thread is
    /// not known.
    fn sync_boxed(&self, func: DispatchFn);

    /// Best-effort cancellation of a not-yet-started task. Unknown and
    /// already-running ids are ignored.
    fn cancel(&self, id: TaskId);

    /// Whether the calling thread belongs to this queue, either as one of
    /// its workers or inside one of its sync callbacks.
    fn is_current(&self) -> bool;

    /// Whether a sync callback is executing right now.
    fn is_running_sync(&self) -> bool;

    /// Dispose the backing store and reclaim the workers. Pending tasks are
    /// dropped; the running one, if any, completes first.
    fn full_teardown(&self);

    /// Drain outstanding work, then tear the queue down. Safe to call from
    /// any thread, including the queue's own worker.
    fn flush_and_teardown(&self);

    /// Install or clear an emptiness observer on the backing store.
    fn set_listener(&self, listener: Option<Arc<dyn QueueListener>>);

    fn listener(&self) -> Option<Arc<dyn QueueListener>>;

    /// Update the worker priority hint. Advisory; the default does nothing.
    fn set_qos(&self, _qos: QosClass) {}

    fn spawn<F>(&self, func: F)
    where
        F: FnOnce() + Send + 'static,
        Self: Sized,
    {
        self.spawn_boxed(Box::new(func));
    }

    fn spawn_after<F>(&self, delay: Duration, func: F) -> TaskId
    where
        F: FnOnce() + Send + 'static,
        Self: Sized,
    {
        self.spawn_after_boxed(delay, Box::new(func))
    }

    fn sync<F>(&self, func: F)
    where
        F: FnOnce() + Send + 'static,
        Self: Sized,
    {
        self.sync_boxed(Box::new(func));
    }

    /// Run `func` through [`sync`](DispatchQueue::sync), or inline when the
    /// calling thread already belongs to this queue. This is the
    /// deadlock-free entry point.
    fn safe_sync<F>(&self, func: F) -> bool
    where
        F: FnOnce() + Send + 'static,
        Self: Sized,
    {
        if self.is_current() {
            func();
        } else {
            self.sync(func);
        }
        true
    }
}

impl dyn DispatchQueue {
    /// Closure-friendly form of [`spawn_boxed`](DispatchQueue::spawn_boxed)
    /// for trait-object handles.
    pub fn spawn<F: FnOnce() + Send + 'static>(&self, func: F) {
        self.spawn_boxed(Box::new(func));
    }

    pub fn spawn_after<F: FnOnce() + Send + 'static>(&self, delay: Duration, func: F) -> TaskId {
        self.spawn_after_boxed(delay, Box::new(func))
    }

    pub fn sync<F: FnOnce() + Send + 'static>(&self, func: F) {
        self.sync_boxed(Box::new(func));
    }

    pub fn safe_sync<F: FnOnce() + Send + 'static>(&self, func: F) -> bool {
        if self.is_current() {
            func();
        } else {
            self.sync_boxed(Box::new(func));
        }
        true
    }
}

/// Process-wide main queue handle. Publication only: no ordering is provided
/// between a set and concurrent gets.
static MAIN_QUEUE: Mutex<Option<Arc<dyn DispatchQueue>>> = Mutex::new(None);

/// Publish the process-wide main queue. Configure it during startup, before
/// readers exist; set and get must not race.
pub fn set_main(queue: Option<Arc<dyn DispatchQueue>>) {
    *MAIN_QUEUE.lock() = queue;
}

/// The process-wide main queue, if one was published.
pub fn main() -> Option<Arc<dyn DispatchQueue>> {
    MAIN_QUEUE.lock().clone()
}
