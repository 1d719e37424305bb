use std::cell::Cell;
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread_local;

/// Identity token distinguishing one queue from every other queue in the
/// process.
///
/// Workers publish the token of the queue that owns them in thread-local
/// storage, so "is the calling thread on this queue?" can be answered
/// without taking any lock and without holding a reference back into the
/// queue. A detached worker outliving its front-end only ever holds this
/// copyable token, never a dangling pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct QueueId(NonZeroU64);

impl QueueId {
    pub(crate) fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);

        let id = COUNTER.fetch_add(1, Ordering::Relaxed);

        // Safety margin: at one queue per nanosecond this takes centuries
        // to wrap.
        let Some(id) = NonZeroU64::new(id) else {
            Self::exhausted();
        };

        QueueId(id)
    }

    #[cold]
    fn exhausted() -> ! {
        panic!("failed to generate unique queue ID: bitspace exhausted")
    }
}

thread_local! {
    /// Queue owning the current thread, if any. Set by worker loops for
    /// their whole lifetime and transiently around barrier-backed sync
    /// callbacks.
    static CURRENT_QUEUE: Cell<Option<QueueId>> = const { Cell::new(None) };
}

pub(crate) fn current_queue() -> Option<QueueId> {
    CURRENT_QUEUE.with(|current| current.get())
}

pub(crate) fn set_current_queue(id: Option<QueueId>) -> Option<QueueId> {
    CURRENT_QUEUE.with(|current| current.replace(id))
}

/// Marks the current thread as belonging to a queue, restoring the previous
/// owner on drop. Restoration also runs during unwinding, so a panicking
/// sync callback cannot leave a stale owner behind.
pub(crate) struct CurrentQueueGuard {
    prev: Option<QueueId>,
}

impl CurrentQueueGuard {
    pub(crate) fn enter(id: QueueId) -> Self {
        CurrentQueueGuard {
            prev: set_current_queue(Some(id)),
        }
    }
}

impl Drop for CurrentQueueGuard {
    fn drop(&mut self) {
        set_current_queue(self.prev);
    }
}
