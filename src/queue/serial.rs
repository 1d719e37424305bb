use crate::context::{self, CurrentQueueGuard, QueueId};
use crate::listener::QueueListener;
use crate::queue::{DispatchQueue, QosClass};
use crate::task::{DispatchFn, TaskId};
use crate::task_queue::TaskQueue;
use crate::utils::thread as thread_utils;
use parking_lot::Mutex;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

/// Effectively "wait forever": long enough that the periodic wake is noise,
/// short enough that a worker missing a wake-up still observes disposal
/// eventually.
const WORKER_WAKE_INTERVAL: Duration = Duration::from_secs(100_000);

/// A queue that runs tasks one at a time, in order, on its own worker
/// thread.
///
/// The worker starts lazily with the first submission and is named after the
/// queue. Submissions made from the same thread run in submission order;
/// delayed submissions run in fire-time order. Dropping the queue disposes
/// pending work and reclaims the worker.
pub struct SerialQueue {
    id: QueueId,

    name: String,

    /// Applied when the worker starts; live re-prioritization is not
    /// supported.
    qos: Mutex<QosClass>,

    engine: Arc<TaskQueue>,

    worker: Mutex<Option<thread::JoinHandle<()>>>,

    disable_sync_in_calling_thread: AtomicBool,

    /// Shared with the alternate sync path, which toggles it from the
    /// worker thread.
    running_sync: Arc<AtomicBool>,
}

impl SerialQueue {
    /// Create a queue with the given debug name and worker priority hint.
    /// No thread is spawned until the first submission.
    pub fn new(name: impl Into<String>, qos: QosClass) -> Self {
        SerialQueue {
            id: QueueId::next(),
            name: name.into(),
            qos: Mutex::new(qos),
            engine: Arc::new(TaskQueue::new()),
            worker: Mutex::new(None),
            disable_sync_in_calling_thread: AtomicBool::new(false),
            running_sync: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_disposed(&self) -> bool {
        self.engine.is_disposed()
    }

    /// Whether the worker thread has been started.
    pub fn has_worker(&self) -> bool {
        self.worker.lock().is_some()
    }

    /// When set, sync submissions always execute on the worker thread
    /// instead of the calling thread.
    pub fn disable_sync_in_calling_thread(&self, disable: bool) {
        self.disable_sync_in_calling_thread
            .store(disable, Ordering::Relaxed);
    }

    fn start_worker(&self) {
        let mut slot = self.worker.lock();
        debug_assert!(slot.is_none(), "worker already started");

        let engine = Arc::clone(&self.engine);
        let queue_id = self.id;
        let qos = *self.qos.lock();

        let handle = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || worker_main(engine, queue_id, qos))
            .expect("failed to spawn queue worker");

        *slot = Some(handle);
    }

    fn teardown_worker(&self) {
        let handle = self.worker.lock().take();
        let Some(handle) = handle else {
            return;
        };

        if self.is_current() {
            // Joining from inside the worker would deadlock. The thread
            // observes disposal and exits on its own once the handle is
            // dropped.
            tracing::debug!(queue = %self.name, "detaching worker during self-teardown");
            drop(handle);
        } else if handle.join().is_err() {
            tracing::warn!(queue = %self.name, "worker thread exited by panic");
        }
    }

    /// Barrier-backed sync. Runs `func` on the calling thread while the
    /// queue is exclusively ours, with the thread transiently marked as
    /// owned by this queue so `func` observes `is_current() == true`.
    fn sync_in_calling_thread<F: FnOnce()>(&self, func: F) {
        self.engine.barrier(|| {
            let _current = CurrentQueueGuard::enter(self.id);
            self.running_sync.store(true, Ordering::Relaxed);
            let _running = RunningSyncReset(&self.running_sync);
            func();
        });
    }

    /// Alternate sync: ship `func` to the worker as a normal task and block
    /// on its completion. A panic inside `func` is carried back and resumed
    /// on the calling thread.
    fn sync_on_worker(&self, func: DispatchFn) {
        let (done_tx, done_rx) = mpsc::sync_channel(1);
        let running_sync = Arc::clone(&self.running_sync);

        self.spawn_boxed(Box::new(move || {
            running_sync.store(true, Ordering::Relaxed);
            let result = panic::catch_unwind(AssertUnwindSafe(func));
            running_sync.store(false, Ordering::Relaxed);
            let _ = done_tx.send(result);
        }));

        match done_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(payload)) => panic::resume_unwind(payload),
            // The task was dropped unrun; the queue was disposed or the
            // backlog cleared. Nothing left to wait for.
            Err(mpsc::RecvError) => {}
        }
    }
}

impl DispatchQueue for SerialQueue {
    fn spawn_boxed(&self, func: DispatchFn) {
        let enqueued = self.engine.enqueue(func);
        if enqueued.is_first {
            self.start_worker();
        }
    }

    fn spawn_after_boxed(&self, delay: Duration, func: DispatchFn) -> TaskId {
        let enqueued = self.engine.enqueue_after(func, delay);
        if enqueued.is_first {
            self.start_worker();
        }
        enqueued.id
    }

    fn sync_boxed(&self, func: DispatchFn) {
        if self.disable_sync_in_calling_thread.load(Ordering::Relaxed) {
            self.sync_on_worker(func);
        } else {
            self.sync_in_calling_thread(func);
        }
    }

    fn cancel(&self, id: TaskId) {
        self.engine.cancel(id);
    }

    fn is_current(&self) -> bool {
        context::current_queue() == Some(self.id)
    }

    fn is_running_sync(&self) -> bool {
        self.running_sync.load(Ordering::Relaxed)
    }

    fn full_teardown(&self) {
        self.engine.dispose();
        self.teardown_worker();
    }

    fn flush_and_teardown(&self) {
        if self.is_current() {
            self.full_teardown();
        } else {
            // Plant a barrier so due work drains first, then tear down while
            // the queue is exclusively ours. The closure runs without
            // claiming queue ownership for this thread, so the worker is
            // joined rather than detached.
            self.engine.barrier(|| self.full_teardown());
        }
    }

    fn set_listener(&self, listener: Option<Arc<dyn QueueListener>>) {
        self.engine.set_listener(listener);
    }

    fn listener(&self) -> Option<Arc<dyn QueueListener>> {
        self.engine.listener()
    }

    fn set_qos(&self, qos: QosClass) {
        // Takes effect if the worker has not started yet.
        *self.qos.lock() = qos;
    }
}

impl Drop for SerialQueue {
    fn drop(&mut self) {
        self.full_teardown();
    }
}

impl fmt::Debug for SerialQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialQueue")
            .field("name", &self.name)
            .field("disposed", &self.is_disposed())
            .field("has_worker", &self.has_worker())
            .finish()
    }
}

/// Clears the running-sync flag on scope exit, including unwinds.
struct RunningSyncReset<'a>(&'a AtomicBool);

impl Drop for RunningSyncReset<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Relaxed);
    }
}

fn worker_main(engine: Arc<TaskQueue>, queue_id: QueueId, qos: QosClass) {
    let _guard = CurrentQueueGuard::enter(queue_id);
    thread_utils::set_current_thread_qos(qos);
    tracing::trace!("serial queue worker started");

    while !engine.is_disposed() {
        engine.run_next_task_until(Instant::now() + WORKER_WAKE_INTERVAL);
    }

    tracing::trace!("serial queue worker exiting");
}
