use std::fmt;
use std::time::Instant;

/// Identifier assigned to every queued work item.
///
/// Ids are allocated per queue from a monotonically increasing counter and
/// are unique for the lifetime of that queue. They are not unique across
/// queues. The value [`NULL_TASK_ID`] never identifies a real task.
pub type TaskId = i64;

/// Reserved id meaning "no task". Returned when submitting to a disposed
/// queue.
pub const NULL_TASK_ID: TaskId = 0;

/// A unit of work: a nullary closure run at most once on some queue thread.
pub type DispatchFn = Box<dyn FnOnce() + Send + 'static>;

/// Outcome of an enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Enqueued {
    /// Id usable with cancellation. [`NULL_TASK_ID`] if the queue was
    /// already disposed.
    pub id: TaskId,

    /// Whether this was the first task the queue has ever accepted. Serial
    /// front-ends use this edge to start their worker on demand.
    pub is_first: bool,
}

impl Enqueued {
    pub(crate) fn rejected() -> Self {
        Enqueued {
            id: NULL_TASK_ID,
            is_first: false,
        }
    }
}

/// Entry stored in the time-ordered task store.
pub(crate) struct Task {
    pub(crate) id: TaskId,

    /// `None` for barrier markers, which carry no work of their own.
    pub(crate) func: Option<DispatchFn>,

    pub(crate) execute_at: Instant,

    pub(crate) is_barrier: bool,
}

impl Task {
    pub(crate) fn new(
        id: TaskId,
        func: Option<DispatchFn>,
        execute_at: Instant,
        is_barrier: bool,
    ) -> Self {
        Task {
            id,
            func,
            execute_at,
            is_barrier,
        }
    }

    /// Ordering key. Ids only grow, so equal instants keep submission order.
    pub(crate) fn sort_key(&self) -> (Instant, TaskId) {
        (self.execute_at, self.id)
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The closure itself is not printable.
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("execute_at", &self.execute_at)
            .field("is_barrier", &self.is_barrier)
            .finish()
    }
}
