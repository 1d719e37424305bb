use crate::queue::pool::{self, PoolQueue};
use crate::queue::{DispatchQueue, QosClass, SerialQueue};
use anyhow::{anyhow, Result};
use std::sync::Arc;

#[derive(Debug, Clone, Copy)]
enum Kind {
    Serial,
    Pool,
}

/// Configures and creates a dispatch queue.
///
/// ```
/// use dispatchq::{Builder, DispatchQueue, QosClass};
///
/// # fn main() -> anyhow::Result<()> {
/// let queue = Builder::new_serial("io").qos(QosClass::Low).try_build()?;
/// queue.spawn(|| println!("on the io queue"));
/// queue.flush_and_teardown();
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Builder {
    kind: Kind,

    /// Debug name; also names the worker threads.
    name: String,

    qos: QosClass,

    /// Only used by pool queues. Defaults to one worker per available core.
    worker_threads: Option<usize>,

    /// Only used by serial queues.
    disable_sync_in_calling_thread: bool,
}

impl Builder {
    fn new(kind: Kind, name: impl Into<String>) -> Self {
        Builder {
            kind,
            name: name.into(),
            qos: QosClass::default(),
            worker_threads: None,
            disable_sync_in_calling_thread: false,
        }
    }

    /// Returns a builder for a single-worker, strictly ordered queue.
    ///
    /// Configuration methods can be chained on the return value.
    pub fn new_serial(name: impl Into<String>) -> Builder {
        Builder::new(Kind::Serial, name)
    }

    /// Returns a builder for a bounded-parallelism pool queue.
    pub fn new_pool(name: impl Into<String>) -> Builder {
        Builder::new(Kind::Pool, name)
    }

    /// Worker priority hint. Advisory only.
    pub fn qos(mut self, qos: QosClass) -> Self {
        self.qos = qos;
        self
    }

    /// Number of pool workers. Serial queues ignore this.
    ///
    /// # Panics
    ///
    /// Panics if 0 is passed as an argument.
    pub fn worker_threads(mut self, val: usize) -> Self {
        assert!(val > 0, "worker_threads cannot be set to 0");
        self.worker_threads = Some(val);
        self
    }

    /// Force sync submissions onto the worker thread instead of the calling
    /// thread. Pool queues ignore this.
    pub fn disable_sync_in_calling_thread(mut self, disable: bool) -> Self {
        self.disable_sync_in_calling_thread = disable;
        self
    }

    /// Creates the configured queue behind a shared handle.
    pub fn try_build(self) -> Result<Arc<dyn DispatchQueue>> {
        if self.name.is_empty() {
            return Err(anyhow!("queue name must not be empty"));
        }

        match self.kind {
            Kind::Serial => {
                let queue = SerialQueue::new(self.name, self.qos);
                if self.disable_sync_in_calling_thread {
                    queue.disable_sync_in_calling_thread(true);
                }
                Ok(Arc::new(queue))
            }
            Kind::Pool => {
                let worker_threads = self
                    .worker_threads
                    .unwrap_or_else(pool::default_worker_threads);
                Ok(Arc::new(PoolQueue::with_config(
                    self.name,
                    worker_threads,
                    self.qos,
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_name_is_rejected() {
        assert!(Builder::new_serial("").try_build().is_err());
        assert!(Builder::new_pool("").try_build().is_err());
    }

    #[test]
    fn test_builds_working_queues() -> Result<()> {
        let serial = Builder::new_serial("builder-serial").try_build()?;
        let pool = Builder::new_pool("builder-pool").worker_threads(2).try_build()?;

        for queue in [&serial, &pool] {
            let (tx, rx) = std::sync::mpsc::channel();
            queue.spawn_boxed(Box::new(move || tx.send(7).unwrap()));
            assert_eq!(rx.recv()?, 7);
        }

        serial.flush_and_teardown();
        pool.flush_and_teardown();
        Ok(())
    }

    #[test]
    #[should_panic(expected = "worker_threads cannot be set to 0")]
    fn test_zero_workers_panics() {
        let _ = Builder::new_pool("zero").worker_threads(0);
    }
}
