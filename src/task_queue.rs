use crate::listener::QueueListener;
use crate::task::{DispatchFn, Enqueued, Task, TaskId};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Time-ordered task store shared by producers and consumer threads.
///
/// The store never creates threads of its own: consumers drive it by calling
/// [`run_next_task_until`](TaskQueue::run_next_task_until) in a loop, and the
/// store blocks them until a runnable entry exists or their deadline passes.
/// Entries are dispatched in `(execute_at, id)` order, so same-instant
/// submissions keep their submission order.
///
/// All state sits behind one mutex and one condition variable. Waiters are
/// woken with broadcasts and re-check their predicate in a loop, which
/// absorbs spurious wake-ups.
pub struct TaskQueue {
    /// Terminal flag, readable without the lock on the enqueue fast path.
    disposed: AtomicBool,

    state: Mutex<State>,

    work_changed: Condvar,
}

/// State behind the mutex. Every path releasing the lock leaves `tasks`
/// sorted ascending by `(execute_at, id)` with unique ids.
struct State {
    /// Pending entries, soonest first.
    tasks: VecDeque<Task>,

    next_id: TaskId,

    /// Entries claimed by a consumer but not yet finished.
    in_flight: usize,

    max_concurrent: usize,

    /// True until the first enqueue, reported back so lazy owners can start
    /// their consumer exactly once.
    first: bool,

    /// Last emptiness signalled to the listener; edges fire exactly once.
    empty: bool,

    listener: Option<Arc<dyn QueueListener>>,
}

impl State {
    fn insert_task(
        &mut self,
        func: Option<DispatchFn>,
        execute_at: Instant,
        is_barrier: bool,
    ) -> TaskId {
        self.next_id += 1;
        let task = Task::new(self.next_id, func, execute_at, is_barrier);

        let at = self
            .tasks
            .partition_point(|queued| queued.sort_key() <= task.sort_key());
        let id = task.id;
        self.tasks.insert(at, task);

        id
    }

    /// Removes an entry by id, handing its closure back so the caller can
    /// drop it after releasing the lock.
    fn remove_task(&mut self, id: TaskId) -> Option<DispatchFn> {
        let at = self.tasks.iter().position(|task| task.id == id)?;
        let task = self.tasks.remove(at)?;
        task.func
    }

    fn signal_empty_edge(&mut self) {
        if !self.empty {
            self.empty = true;
            if let Some(listener) = &self.listener {
                listener.on_queue_empty();
            }
        }
    }
}

impl TaskQueue {
    pub fn new() -> Self {
        TaskQueue {
            disposed: AtomicBool::new(false),
            state: Mutex::new(State {
                tasks: VecDeque::new(),
                next_id: 0,
                in_flight: 0,
                max_concurrent: 1,
                first: true,
                empty: true,
                listener: None,
            }),
            work_changed: Condvar::new(),
        }
    }

    /// Enqueue `func` for execution as soon as a consumer is free.
    pub fn enqueue(&self, func: DispatchFn) -> Enqueued {
        self.enqueue_at(func, Instant::now())
    }

    /// Enqueue `func` to run no earlier than `delay` from now.
    pub fn enqueue_after(&self, func: DispatchFn, delay: Duration) -> Enqueued {
        self.enqueue_at(func, Instant::now() + delay)
    }

    /// Enqueue `func` to run no earlier than `execute_at`.
    ///
    /// On a disposed queue this is a silent no-op returning the null id;
    /// late producers during shutdown are a normal race, not an error.
    pub fn enqueue_at(&self, func: DispatchFn, execute_at: Instant) -> Enqueued {
        if self.is_disposed() {
            return Enqueued::rejected();
        }

        let enqueued = {
            let mut state = self.state.lock();

            let id = state.insert_task(Some(func), execute_at, false);
            let is_first = state.first;
            state.first = false;

            if state.empty {
                state.empty = false;
                if let Some(listener) = &state.listener {
                    listener.on_queue_non_empty();
                }
            }

            Enqueued { id, is_first }
        };

        self.work_changed.notify_all();
        enqueued
    }

    /// Remove a pending task. Unknown, already-running, and already-finished
    /// ids are silently ignored; a running task cannot be aborted.
    ///
    /// The cancelled closure is dropped after the lock is released, so drop
    /// code that takes unrelated locks cannot deadlock against a consumer.
    pub fn cancel(&self, id: TaskId) {
        let removed = {
            let mut state = self.state.lock();
            state.remove_task(id)
        };
        drop(removed);

        self.work_changed.notify_all();
    }

    /// Run `func` on the calling thread with the queue to itself.
    ///
    /// A marker entry is planted at the current instant. The call then waits
    /// until the marker reaches the head of the queue and nothing is in
    /// flight, runs `func` while holding the only execution slot, and
    /// removes the marker. No consumer can start other work for the
    /// duration. If `func` panics the marker is still removed and the slot
    /// released before the panic continues into the caller.
    ///
    /// Returns without running `func` if the queue is drained out from under
    /// the marker, which happens when the queue is disposed mid-wait or the
    /// marker itself is cancelled.
    pub fn barrier<F: FnOnce()>(&self, func: F) {
        let execute_at = Instant::now();

        let mut state = self.state.lock();
        let id = state.insert_task(None, execute_at, true);

        while !state.tasks.is_empty() {
            let head_id = state.tasks.front().expect("checked non-empty").id;
            if state.in_flight != 0 || head_id != id {
                self.work_changed.wait(&mut state);
                continue;
            }

            state.in_flight += 1;
            drop(state);

            // The release guard runs whether `func` returns or unwinds.
            let _release = BarrierRelease { queue: self, id };
            func();
            return;
        }
    }

    /// Run the next runnable task, waiting for one until `deadline`.
    ///
    /// Returns whether a task ran. A panicking task is caught here and not
    /// propagated; the queue stays usable. Submitters that need failure
    /// signals should capture channels in their closures.
    pub fn run_next_task_until(&self, deadline: Instant) -> bool {
        let Some(func) = self.next_task(deadline) else {
            return false;
        };

        // The closure and everything it captured are consumed here, outside
        // the lock.
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(func)) {
            let msg = payload
                .downcast_ref::<&str>()
                .copied()
                .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
                .unwrap_or("non-string panic payload");
            tracing::warn!(panic = msg, "queued task panicked");
        }

        {
            let mut state = self.state.lock();
            state.in_flight -= 1;
        }
        self.work_changed.notify_all();

        true
    }

    /// [`run_next_task_until`](Self::run_next_task_until) with an already
    /// expired deadline: runs a due task if there is one, never sleeps.
    pub fn run_next_task(&self) -> bool {
        self.run_next_task_until(Instant::now())
    }

    /// Blocks until a runnable entry is claimed or `deadline` passes.
    fn next_task(&self, deadline: Instant) -> Option<DispatchFn> {
        let mut state = self.state.lock();

        loop {
            if self.is_disposed() {
                return None;
            }

            if state.tasks.is_empty() {
                state.signal_empty_edge();

                if self.work_changed.wait_until(&mut state, deadline).timed_out() {
                    return None;
                }
                continue;
            }

            if state.in_flight >= state.max_concurrent {
                if self.work_changed.wait_until(&mut state, deadline).timed_out() {
                    return None;
                }
                continue;
            }

            let (head_is_barrier, head_execute_at) = {
                let head = state.tasks.front().expect("checked non-empty");
                (head.is_barrier, head.execute_at)
            };

            // A barrier marker is claimed by the thread that planted it,
            // never by a consumer.
            if head_is_barrier {
                if self.work_changed.wait_until(&mut state, deadline).timed_out() {
                    return None;
                }
                continue;
            }

            if head_execute_at > Instant::now() {
                let wait_until = deadline.min(head_execute_at);
                let timed_out = self
                    .work_changed
                    .wait_until(&mut state, wait_until)
                    .timed_out();

                // Hitting the caller's deadline ends the wait; hitting the
                // head's fire time just re-checks it.
                if timed_out && wait_until == deadline {
                    return None;
                }
                continue;
            }

            let mut task = state.tasks.pop_front().expect("checked non-empty");
            state.in_flight += 1;
            return Some(task.func.take().expect("non-barrier entry carries a closure"));
        }
    }

    /// Run every currently-enqueued task to completion, in order, sleeping
    /// until delayed entries come due. Intended as a drain on queues without
    /// dedicated consumers, typically before teardown.
    ///
    /// Stops early if the head entry is a barrier marker, since only the
    /// thread that planted the marker can release it.
    pub fn flush(&self) -> usize {
        let mut ran = 0;
        while let Some(due_at) = self.next_pending_at() {
            let deadline = due_at.max(Instant::now());

            // Waking exactly at the deadline reports a timeout, so give the
            // now-due head one immediate retry before concluding it cannot
            // be claimed.
            if self.run_next_task_until(deadline) || self.run_next_task() {
                ran += 1;
            } else {
                break;
            }
        }
        ran
    }

    /// Run every task already due, never sleeping past the present moment.
    pub fn flush_up_to_now(&self) -> usize {
        let deadline = Instant::now();
        let mut ran = 0;
        while self.run_next_task_until(deadline) {
            ran += 1;
        }
        ran
    }

    fn next_pending_at(&self) -> Option<Instant> {
        let state = self.state.lock();
        state.tasks.front().map(|task| task.execute_at)
    }

    /// Terminal transition: pending entries are discarded and every later
    /// submission is rejected with the null id. Entries already claimed by a
    /// consumer run to completion. Idempotent.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        let backlog = {
            let mut state = self.state.lock();
            std::mem::take(&mut state.tasks)
        };
        // Pending closures are dropped outside the lock.
        drop(backlog);

        tracing::debug!("task queue disposed");
        self.work_changed.notify_all();
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Bound on concurrently executing tasks. Consumers beyond the bound
    /// wait even when due work is queued.
    pub fn set_max_concurrent(&self, max_concurrent: usize) {
        assert!(max_concurrent > 0, "max_concurrent must be greater than 0");

        {
            let mut state = self.state.lock();
            if state.max_concurrent == max_concurrent {
                return;
            }
            state.max_concurrent = max_concurrent;
        }

        // A larger bound may unblock waiting consumers.
        self.work_changed.notify_all();
    }

    /// Install or clear the emptiness observer. See [`QueueListener`] for
    /// the callback contract.
    pub fn set_listener(&self, listener: Option<Arc<dyn QueueListener>>) {
        self.state.lock().listener = listener;
    }

    pub fn listener(&self) -> Option<Arc<dyn QueueListener>> {
        self.state.lock().listener.clone()
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TaskQueue {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("TaskQueue")
            .field("disposed", &self.is_disposed())
            .field("pending", &state.tasks.len())
            .field("in_flight", &state.in_flight)
            .field("max_concurrent", &state.max_concurrent)
            .finish()
    }
}

/// Removes a barrier marker and releases its execution slot. Runs on normal
/// return and during unwinding out of the barrier closure.
struct BarrierRelease<'a> {
    queue: &'a TaskQueue,
    id: TaskId,
}

impl Drop for BarrierRelease<'_> {
    fn drop(&mut self) {
        let removed = {
            let mut state = self.queue.state.lock();
            let removed = state.remove_task(self.id);
            state.in_flight -= 1;
            removed
        };
        // Barrier markers carry no closure; dropped here for uniformity.
        drop(removed);

        self.queue.work_changed.notify_all();
    }
}
