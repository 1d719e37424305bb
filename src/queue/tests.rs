use super::*;
use crate::listener::QueueListener;
use crate::task::NULL_TASK_ID;
use parking_lot::Mutex;
use rstest::rstest;
use static_assertions::assert_impl_all;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

assert_impl_all!(SerialQueue: Send, Sync);
assert_impl_all!(PoolQueue: Send, Sync);

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// Polls `cond` until it holds or `timeout` passes.
fn wait_for(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Edge {
    Empty,
    NonEmpty,
}

#[derive(Default)]
struct RecordingListener {
    edges: Mutex<Vec<Edge>>,
}

impl RecordingListener {
    fn edges(&self) -> Vec<Edge> {
        self.edges.lock().clone()
    }
}

impl QueueListener for RecordingListener {
    fn on_queue_empty(&self) {
        self.edges.lock().push(Edge::Empty);
    }

    fn on_queue_non_empty(&self) {
        self.edges.lock().push(Edge::NonEmpty);
    }
}

#[test]
fn test_serial_queue_preserves_submission_order() {
    let queue = SerialQueue::new("order", QosClass::Normal);
    let buffer = Arc::new(Mutex::new(String::new()));

    for letter in ['A', 'B', 'C'] {
        let buffer = Arc::clone(&buffer);
        queue.spawn(move || buffer.lock().push(letter));
    }

    queue.flush_and_teardown();
    assert_eq!(*buffer.lock(), "ABC");
}

#[test]
fn test_serial_worker_starts_lazily() {
    let queue = SerialQueue::new("lazy", QosClass::Normal);
    assert!(!queue.has_worker());

    queue.spawn(|| {});
    assert!(queue.has_worker());

    queue.flush_and_teardown();
    assert!(!queue.has_worker());
    assert!(queue.is_disposed());
}

#[test]
fn test_delayed_tasks_fire_in_delay_order() {
    let queue = SerialQueue::new("delays", QosClass::Normal);
    let (tx, rx) = mpsc::channel();

    let submitted = Instant::now();
    let slow = tx.clone();
    queue.spawn_after(Duration::from_millis(50), move || {
        slow.send(("slow", Instant::now())).unwrap();
    });
    let fast = tx;
    queue.spawn_after(Duration::from_millis(10), move || {
        fast.send(("fast", Instant::now())).unwrap();
    });

    let (first, first_at) = rx.recv_timeout(RECV_TIMEOUT).unwrap();
    let (second, second_at) = rx.recv_timeout(RECV_TIMEOUT).unwrap();

    assert_eq!(first, "fast");
    assert_eq!(second, "slow");
    assert!(first_at < second_at);
    assert!(first_at - submitted >= Duration::from_millis(10));
    assert!(second_at - submitted >= Duration::from_millis(50));

    queue.flush_and_teardown();
}

#[test]
fn test_cancelled_task_never_runs_and_is_dropped() {
    struct DropProbe(Arc<AtomicBool>);

    impl Drop for DropProbe {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    let queue = SerialQueue::new("cancel", QosClass::Normal);
    let ran = Arc::new(AtomicBool::new(false));
    let dropped = Arc::new(AtomicBool::new(false));

    let flag = Arc::clone(&ran);
    let probe = DropProbe(Arc::clone(&dropped));
    let id = queue.spawn_after(Duration::from_millis(200), move || {
        let _keep = &probe;
        flag.store(true, Ordering::SeqCst);
    });

    thread::sleep(Duration::from_millis(50));
    queue.cancel(id);
    assert!(dropped.load(Ordering::SeqCst), "cancel must drop the closure");

    thread::sleep(Duration::from_millis(250));
    assert!(!ran.load(Ordering::SeqCst), "cancelled task must not run");

    queue.flush_and_teardown();
}

#[test]
fn test_cancelling_a_running_task_lets_it_finish() {
    let queue = Arc::new(SerialQueue::new("cancel-late", QosClass::Normal));
    let (started_tx, started_rx) = mpsc::channel();
    let (resume_tx, resume_rx) = mpsc::channel::<()>();
    let finished = Arc::new(AtomicBool::new(false));

    let flag = Arc::clone(&finished);
    queue.spawn(move || {
        started_tx.send(()).unwrap();
        resume_rx.recv().unwrap();
        flag.store(true, Ordering::SeqCst);
    });

    started_rx.recv_timeout(RECV_TIMEOUT).unwrap();
    // The first submission got id 1; it is already executing, so cancelling
    // it must not abort it.
    queue.cancel(1);
    resume_tx.send(()).unwrap();

    queue.flush_and_teardown();
    assert!(finished.load(Ordering::SeqCst));
}

#[rstest]
#[case::pair(2)]
#[case::quad(4)]
fn test_pool_barrier_observes_all_prior_work(#[case] workers: usize) {
    let queue = PoolQueue::with_worker_threads("barrier", workers);
    let counter = Arc::new(AtomicUsize::new(0));

    for _ in 0..10 {
        let counter = Arc::clone(&counter);
        queue.spawn(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
    }

    let observed = Arc::clone(&counter);
    queue.sync(move || {
        assert_eq!(observed.load(Ordering::SeqCst), 10);
    });

    queue.flush_and_teardown();
}

#[test]
fn test_pool_bounds_parallelism() {
    let queue = PoolQueue::with_worker_threads("bounded", 4);
    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let start = Instant::now();
    for _ in 0..8 {
        let current = Arc::clone(&current);
        let peak = Arc::clone(&peak);
        queue.spawn(move || {
            let now = current.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(300));
            current.fetch_sub(1, Ordering::SeqCst);
        });
    }

    // The barrier returns once every prior task has completed.
    queue.sync(|| {});
    let elapsed = start.elapsed();

    assert_eq!(peak.load(Ordering::SeqCst), 4);
    assert_eq!(current.load(Ordering::SeqCst), 0);
    assert!(
        elapsed >= Duration::from_millis(600),
        "8 tasks of 300ms on 4 workers need two waves, took {elapsed:?}"
    );
    assert!(
        elapsed < Duration::from_millis(1200),
        "4 workers should overlap the waves, took {elapsed:?}"
    );

    queue.flush_and_teardown();
}

#[test]
fn test_barrier_excludes_other_pool_work() {
    let queue = Arc::new(PoolQueue::with_worker_threads("exclusive", 4));
    let running = Arc::new(AtomicUsize::new(0));
    let overlap_seen = Arc::new(AtomicBool::new(false));

    for _ in 0..6 {
        let running = Arc::clone(&running);
        queue.spawn(move || {
            running.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(30));
            running.fetch_sub(1, Ordering::SeqCst);
        });
    }

    let running_in_barrier = Arc::clone(&running);
    let overlap = Arc::clone(&overlap_seen);
    queue.sync(move || {
        if running_in_barrier.load(Ordering::SeqCst) != 0 {
            overlap.store(true, Ordering::SeqCst);
        }
        thread::sleep(Duration::from_millis(50));
        if running_in_barrier.load(Ordering::SeqCst) != 0 {
            overlap.store(true, Ordering::SeqCst);
        }
    });

    assert!(!overlap_seen.load(Ordering::SeqCst));
    queue.flush_and_teardown();
}

#[test]
fn test_listener_edge_sequence() {
    let queue = SerialQueue::new("edges", QosClass::Normal);
    let listener = Arc::new(RecordingListener::default());
    queue.set_listener(Some(Arc::clone(&listener) as Arc<dyn QueueListener>));

    queue.spawn(|| {});
    assert!(
        wait_for(RECV_TIMEOUT, || listener.edges().len() == 2),
        "first drain not observed: {:?}",
        listener.edges()
    );

    queue.spawn(|| {});
    queue.spawn(|| {});
    assert!(
        wait_for(RECV_TIMEOUT, || listener.edges().len() == 4),
        "second drain not observed: {:?}",
        listener.edges()
    );

    queue.flush_and_teardown();
    assert_eq!(
        listener.edges(),
        vec![Edge::NonEmpty, Edge::Empty, Edge::NonEmpty, Edge::Empty]
    );
}

#[test]
fn test_sync_runs_on_calling_thread_and_reports_current() {
    let queue = Arc::new(SerialQueue::new("sync", QosClass::Normal));
    let caller = thread::current().id();

    assert!(!queue.is_current());
    assert!(!queue.is_running_sync());

    let inner = Arc::clone(&queue);
    queue.sync(move || {
        assert_eq!(thread::current().id(), caller);
        assert!(inner.is_current());
        assert!(inner.is_running_sync());
    });

    assert!(!queue.is_current());
    assert!(!queue.is_running_sync());
    queue.flush_and_teardown();
}

#[test]
fn test_alternate_sync_runs_on_worker() {
    let queue = Arc::new(SerialQueue::new("alt-sync", QosClass::Normal));
    queue.disable_sync_in_calling_thread(true);

    let caller = thread::current().id();
    let inner = Arc::clone(&queue);
    let ran_on = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&ran_on);

    queue.sync(move || {
        *slot.lock() = Some(thread::current().id());
        assert!(inner.is_current());
        assert!(inner.is_running_sync());
    });

    let ran_on = ran_on.lock().expect("sync callback did not run");
    assert_ne!(ran_on, caller);
    queue.flush_and_teardown();
}

#[test]
fn test_alternate_sync_propagates_panics() {
    let queue = Arc::new(SerialQueue::new("alt-panic", QosClass::Normal));
    queue.disable_sync_in_calling_thread(true);

    let panicked = panic::catch_unwind(AssertUnwindSafe(|| {
        queue.sync(|| panic!("sync callback blew up"));
    }));
    assert!(panicked.is_err());

    // The worker survives its callback's panic.
    let (tx, rx) = mpsc::channel();
    queue.spawn(move || tx.send(()).unwrap());
    rx.recv_timeout(RECV_TIMEOUT).unwrap();

    queue.flush_and_teardown();
}

#[test]
fn test_sync_panic_propagates_and_queue_survives() {
    let queue = Arc::new(SerialQueue::new("sync-panic", QosClass::Normal));

    let panicked = panic::catch_unwind(AssertUnwindSafe(|| {
        queue.sync(|| panic!("sync callback blew up"));
    }));
    assert!(panicked.is_err());
    assert!(!queue.is_running_sync());
    assert!(!queue.is_current());

    let (tx, rx) = mpsc::channel();
    queue.spawn(move || tx.send(()).unwrap());
    rx.recv_timeout(RECV_TIMEOUT).unwrap();

    queue.flush_and_teardown();
}

#[test]
fn test_safe_sync_from_worker_runs_inline() {
    let queue = Arc::new(SerialQueue::new("safe-sync", QosClass::Normal));
    let (tx, rx) = mpsc::channel();

    let inner = Arc::clone(&queue);
    queue.spawn(move || {
        assert!(inner.is_current());

        let observed = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&observed);
        let nested = Arc::clone(&inner);
        assert!(inner.safe_sync(move || {
            assert!(nested.is_current());
            flag.store(true, Ordering::SeqCst);
        }));

        tx.send(observed.load(Ordering::SeqCst)).unwrap();
    });

    assert!(rx.recv_timeout(RECV_TIMEOUT).unwrap());
    queue.flush_and_teardown();
}

#[test]
fn test_pool_sync_from_worker_runs_inline() {
    let queue = Arc::new(PoolQueue::with_worker_threads("pool-inline", 2));
    let (tx, rx) = mpsc::channel();

    let inner = Arc::clone(&queue);
    queue.spawn(move || {
        assert!(inner.is_current());

        let observed = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&observed);
        inner.sync(move || flag.store(true, Ordering::SeqCst));

        tx.send(observed.load(Ordering::SeqCst)).unwrap();
    });

    assert!(rx.recv_timeout(RECV_TIMEOUT).unwrap());
    queue.flush_and_teardown();
}

#[test]
fn test_teardown_from_own_task_detaches_worker() {
    let queue = Arc::new(SerialQueue::new("self-teardown", QosClass::Normal));
    let (tx, rx) = mpsc::channel();

    let inner = Arc::clone(&queue);
    queue.spawn(move || {
        inner.flush_and_teardown();
        tx.send(inner.is_disposed()).unwrap();
    });

    assert!(rx.recv_timeout(RECV_TIMEOUT).unwrap());
    assert!(!queue.has_worker());
    assert!(queue.is_disposed());

    // Submissions after disposal are silently rejected.
    let ran = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&ran);
    queue.spawn(move || flag.store(true, Ordering::SeqCst));
    assert_eq!(
        queue.spawn_after(Duration::from_millis(1), || {}),
        NULL_TASK_ID
    );

    thread::sleep(Duration::from_millis(50));
    assert!(!ran.load(Ordering::SeqCst));
}

#[test]
fn test_main_queue_handle_round_trips() {
    assert!(main().is_none());

    let queue: Arc<dyn DispatchQueue> = Builder::new_serial("main").try_build().unwrap();
    set_main(Some(Arc::clone(&queue)));

    let handle = main().expect("main queue was published");
    let (tx, rx) = mpsc::channel();
    handle.spawn_boxed(Box::new(move || tx.send(1).unwrap()));
    assert_eq!(rx.recv_timeout(RECV_TIMEOUT).unwrap(), 1);

    set_main(None);
    assert!(main().is_none());
    queue.flush_and_teardown();
}

#[test]
fn test_is_current_distinguishes_queues() {
    let a = Arc::new(SerialQueue::new("current-a", QosClass::Normal));
    let b = Arc::new(SerialQueue::new("current-b", QosClass::Normal));
    let (tx, rx) = mpsc::channel();

    let on_a = Arc::clone(&a);
    let other = Arc::clone(&b);
    a.spawn(move || {
        tx.send(on_a.is_current() && !other.is_current()).unwrap();
    });

    assert!(rx.recv_timeout(RECV_TIMEOUT).unwrap());
    a.flush_and_teardown();
    b.flush_and_teardown();
}
