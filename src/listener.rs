/// Observer for queue emptiness transitions.
///
/// Transitions are signalled exactly on edges: `on_queue_non_empty` when an
/// enqueue makes an empty queue non-empty, `on_queue_empty` when a consumer
/// observes the last entry drained. The former runs on the submitting
/// thread, the latter on a consumer thread.
///
/// Both callbacks are invoked while the queue's internal lock is held. They
/// must be short, must not block, and must not call back into the queue; a
/// listener that re-enters the queue will self-deadlock.
pub trait QueueListener: Send + Sync {
    /// All work has drained and the queue is idle.
    fn on_queue_empty(&self);

    /// New work arrived on a previously idle queue.
    fn on_queue_non_empty(&self);
}
