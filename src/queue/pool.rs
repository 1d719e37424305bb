use crate::context::{self, CurrentQueueGuard, QueueId};
use crate::listener::QueueListener;
use crate::queue::{DispatchQueue, QosClass};
use crate::task::{DispatchFn, TaskId};
use crate::task_queue::TaskQueue;
use crate::utils::thread as thread_utils;
use parking_lot::Mutex;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Fallback worker count when the machine's parallelism cannot be queried.
const DEFAULT_WORKER_THREADS: usize = 4;

/// Idle wake granularity. Bounds how long a worker that missed a shutdown
/// notification keeps sleeping.
const WORKER_WAKE_INTERVAL: Duration = Duration::from_secs(1);

pub(crate) fn default_worker_threads() -> usize {
    thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(DEFAULT_WORKER_THREADS)
}

/// A queue that runs tasks on a fixed pool of workers, bounding parallelism
/// at the pool size.
///
/// Tasks with equal fire times may run in any order relative to each other;
/// a sync submission still observes everything submitted before it as
/// complete. Workers are spawned eagerly at construction and named
/// `"{name}-{index}"`.
pub struct PoolQueue {
    id: QueueId,

    name: String,

    worker_threads: usize,

    engine: Arc<TaskQueue>,

    running: Arc<AtomicBool>,

    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl PoolQueue {
    /// Pool with one worker per available core, falling back to 4.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_config(name, default_worker_threads(), QosClass::Normal)
    }

    pub fn with_worker_threads(name: impl Into<String>, worker_threads: usize) -> Self {
        Self::with_config(name, worker_threads, QosClass::Normal)
    }

    pub(crate) fn with_config(
        name: impl Into<String>,
        worker_threads: usize,
        qos: QosClass,
    ) -> Self {
        assert!(worker_threads > 0, "worker_threads must be greater than 0");

        let engine = Arc::new(TaskQueue::new());
        engine.set_max_concurrent(worker_threads);

        let pool = PoolQueue {
            id: QueueId::next(),
            name: name.into(),
            worker_threads,
            engine,
            running: Arc::new(AtomicBool::new(true)),
            workers: Mutex::new(Vec::with_capacity(worker_threads)),
        };
        pool.start_workers(qos);
        pool
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn worker_threads(&self) -> usize {
        self.worker_threads
    }

    pub fn is_disposed(&self) -> bool {
        self.engine.is_disposed()
    }

    fn start_workers(&self, qos: QosClass) {
        let mut workers = self.workers.lock();

        for index in 0..self.worker_threads {
            let engine = Arc::clone(&self.engine);
            let running = Arc::clone(&self.running);
            let queue_id = self.id;

            let handle = thread::Builder::new()
                .name(format!("{}-{}", self.name, index))
                .spawn(move || worker_main(engine, running, queue_id, qos))
                .expect("failed to spawn pool worker");

            workers.push(handle);
        }
    }
}

impl DispatchQueue for PoolQueue {
    fn spawn_boxed(&self, func: DispatchFn) {
        // Workers already exist; the first-task edge is irrelevant here.
        self.engine.enqueue(func);
    }

    fn spawn_after_boxed(&self, delay: Duration, func: DispatchFn) -> TaskId {
        self.engine.enqueue_after(func, delay).id
    }

    fn sync_boxed(&self, func: DispatchFn) {
        if self.is_current() {
            // Already on the pool; a barrier here would wait on ourselves.
            func();
            return;
        }

        self.engine.barrier(func);
    }

    fn cancel(&self, id: TaskId) {
        self.engine.cancel(id);
    }

    fn is_current(&self) -> bool {
        context::current_queue() == Some(self.id)
    }

    fn is_running_sync(&self) -> bool {
        false
    }

    fn full_teardown(&self) {
        self.running.store(false, Ordering::Release);
        self.engine.dispose();

        let handles: Vec<_> = self.workers.lock().drain(..).collect();
        let current = thread::current().id();
        let mut panicked = 0;

        for handle in handles {
            if handle.thread().id() == current {
                // A worker tearing its own pool down cannot join itself; it
                // exits on its own once the loop observes disposal.
                drop(handle);
            } else if handle.join().is_err() {
                panicked += 1;
            }
        }

        if panicked > 0 {
            tracing::warn!(queue = %self.name, count = panicked, "pool workers exited by panic");
        }
    }

    fn flush_and_teardown(&self) {
        if self.is_current() {
            // Not supported from a pool worker; documented best effort only.
            self.full_teardown();
            return;
        }

        self.engine.barrier(|| self.full_teardown());
    }

    fn set_listener(&self, listener: Option<Arc<dyn QueueListener>>) {
        self.engine.set_listener(listener);
    }

    fn listener(&self) -> Option<Arc<dyn QueueListener>> {
        self.engine.listener()
    }
}

impl Drop for PoolQueue {
    fn drop(&mut self) {
        self.full_teardown();
    }
}

impl fmt::Debug for PoolQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolQueue")
            .field("name", &self.name)
            .field("worker_threads", &self.worker_threads)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

fn worker_main(
    engine: Arc<TaskQueue>,
    running: Arc<AtomicBool>,
    queue_id: QueueId,
    qos: QosClass,
) {
    let _guard = CurrentQueueGuard::enter(queue_id);
    thread_utils::set_current_thread_qos(qos);
    tracing::trace!("pool worker started");

    while running.load(Ordering::Acquire) && !engine.is_disposed() {
        engine.run_next_task_until(Instant::now() + WORKER_WAKE_INTERVAL);
    }

    tracing::trace!("pool worker exiting");
}
