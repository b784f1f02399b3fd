//! Serial task queue with a single coalescing slot.
//!
//! At most one task runs at a time per queue. While a task is running, newly
//! enqueued work goes into one pending slot, replacing whatever was waiting
//! there, so the slot always holds the most recent request. When the running
//! task finishes (however it finishes), the pending one starts.
//!
//! Each editing session owns its own queue; queues never share state.

use futures::future::{BoxFuture, FutureExt};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{oneshot, Notify};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("Task was dropped before completing")]
    Dropped,
}

pub type Result<T> = std::result::Result<T, QueueError>;

/// Deferred task. Not invoked until the queue is ready to run it.
pub type TaskFactory<T> = Box<dyn FnOnce() -> BoxFuture<'static, T> + Send>;

/// Outcome of [`SerialQueue::enqueue`].
pub enum Enqueued<T> {
    /// The queue was free and the task started right away.
    Started(Completion<T>),
    /// Another task is running; this one is parked in the pending slot and
    /// may still be superseded before it runs. Its output is not observable.
    Queued,
}

impl<T> Enqueued<T> {
    pub fn is_started(&self) -> bool {
        matches!(self, Enqueued::Started(_))
    }
}

/// Handle to the output of a task that started immediately.
pub struct Completion<T> {
    rx: oneshot::Receiver<T>,
}

impl<T> Completion<T> {
    /// Wait for the task to finish.
    ///
    /// Fails if the task panicked or the runtime went away first.
    pub async fn wait(self) -> Result<T> {
        self.rx.await.map_err(|_| QueueError::Dropped)
    }
}

/// The two slots: whether a task is running, and what runs next.
struct Slots<T> {
    running: bool,
    pending: Option<TaskFactory<T>>,
}

struct Inner<T> {
    slots: Mutex<Slots<T>>,
    /// Signalled each time the queue drains completely
    drained: Notify,
}

/// Per-owner serial queue. Requires a tokio runtime to run tasks.
pub struct SerialQueue<T> {
    inner: Arc<Inner<T>>,
}

impl<T: Send + 'static> SerialQueue<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                slots: Mutex::new(Slots {
                    running: false,
                    pending: None,
                }),
                drained: Notify::new(),
            }),
        }
    }

    /// Run `factory` now if the queue is free, otherwise park it in the
    /// pending slot (dropping any factory already parked there).
    ///
    /// Never waits.
    pub fn enqueue<F, Fut>(&self, factory: F) -> Enqueued<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        let factory: TaskFactory<T> = Box::new(move || factory().boxed());

        {
            let mut slots = self.inner.lock();
            if slots.running {
                if slots.pending.replace(factory).is_some() {
                    debug!("Superseded pending task");
                }
                return Enqueued::Queued;
            }
            slots.running = true;
        }

        let (tx, rx) = oneshot::channel();
        let inner = Arc::clone(&self.inner);
        tokio::spawn(inner.drive(factory, tx));
        Enqueued::Started(Completion { rx })
    }

    /// Whether a task is currently running.
    pub fn is_busy(&self) -> bool {
        self.inner.lock().running
    }

    /// Whether a task is parked in the pending slot.
    pub fn has_pending(&self) -> bool {
        self.inner.lock().pending.is_some()
    }

    /// Drop the parked task without running it. Returns whether one was parked.
    pub fn clear_pending(&self) -> bool {
        self.inner.lock().pending.take().is_some()
    }

    /// Wait until nothing is running and nothing is parked.
    pub async fn idle(&self) {
        loop {
            let notified = self.inner.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if !self.is_busy() {
                return;
            }
            notified.await;
        }
    }
}

impl<T: Send + 'static> Default for SerialQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> Inner<T> {
    fn lock(&self) -> std::sync::MutexGuard<'_, Slots<T>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run `first`, then keep draining the pending slot until it is empty.
    async fn drive(self: Arc<Self>, first: TaskFactory<T>, tx: oneshot::Sender<T>) {
        match AssertUnwindSafe(async move { first().await })
            .catch_unwind()
            .await
        {
            Ok(output) => {
                // Caller may have stopped listening; that's fine.
                let _ = tx.send(output);
            }
            Err(_) => warn!("Queued task panicked"),
        }

        loop {
            let next = {
                let mut slots = self.lock();
                match slots.pending.take() {
                    Some(next) => next,
                    None => {
                        slots.running = false;
                        break;
                    }
                }
            };

            debug!("Starting pending task");
            if AssertUnwindSafe(async move { next().await })
                .catch_unwind()
                .await
                .is_err()
            {
                warn!("Queued task panicked");
            }
        }

        self.drained.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::sleep;

    type Log = Arc<Mutex<Vec<&'static str>>>;

    fn slow(log: &Log, name: &'static str) -> impl FnOnce() -> BoxFuture<'static, &'static str> + use<> {
        let log = Arc::clone(log);
        move || {
            async move {
                log.lock().unwrap().push(name);
                sleep(Duration::from_millis(100)).await;
                name
            }
            .boxed()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_queue_starts_immediately() {
        let queue = SerialQueue::new();
        let log: Log = Arc::default();

        let Enqueued::Started(done) = queue.enqueue(slow(&log, "a")) else {
            panic!("expected task to start");
        };

        assert!(queue.is_busy());
        assert_eq!(done.wait().await, Ok("a"));
        queue.idle().await;
        assert!(!queue.is_busy());
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_runs_first_and_latest_only() {
        let queue = SerialQueue::new();
        let log: Log = Arc::default();

        assert!(queue.enqueue(slow(&log, "first")).is_started());
        for name in ["second", "third", "fourth"] {
            assert!(!queue.enqueue(slow(&log, name)).is_started());
        }
        assert!(queue.has_pending());

        queue.idle().await;

        assert_eq!(*log.lock().unwrap(), vec!["first", "fourth"]);
        assert!(!queue.has_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_runs_two_at_once() {
        let queue = SerialQueue::new();
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for _ in 0..5 {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            queue.enqueue(move || async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                sleep(Duration::from_millis(10)).await;
                running.fetch_sub(1, Ordering::SeqCst);
            });
            sleep(Duration::from_millis(3)).await;
        }
        queue.idle().await;

        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_still_runs_pending() {
        let queue: SerialQueue<std::result::Result<u32, String>> = SerialQueue::new();
        let ran = Arc::new(AtomicUsize::new(0));

        let Enqueued::Started(done) = queue.enqueue(|| async {
            sleep(Duration::from_millis(50)).await;
            Err("boom".to_string())
        }) else {
            panic!("expected task to start");
        };
        let ran_clone = Arc::clone(&ran);
        queue.enqueue(move || async move {
            ran_clone.fetch_add(1, Ordering::SeqCst);
            Ok(2)
        });

        assert_eq!(done.wait().await, Ok(Err("boom".to_string())));
        queue.idle().await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    fn store_is_broken() -> bool {
        true
    }

    #[tokio::test(start_paused = true)]
    async fn test_panic_reports_dropped_and_queue_recovers() {
        let queue: SerialQueue<u32> = SerialQueue::new();
        let ran = Arc::new(AtomicUsize::new(0));

        let Enqueued::Started(done) = queue.enqueue(|| async {
            sleep(Duration::from_millis(10)).await;
            if store_is_broken() {
                panic!("store exploded");
            }
            0
        }) else {
            panic!("expected task to start");
        };
        let ran_clone = Arc::clone(&ran);
        queue.enqueue(move || async move {
            ran_clone.fetch_add(1, Ordering::SeqCst);
            7
        });

        assert_eq!(done.wait().await, Err(QueueError::Dropped));
        queue.idle().await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);

        // Free again afterwards
        assert!(queue.enqueue(|| async { 1 }).is_started());
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_pending() {
        let queue = SerialQueue::new();
        let log: Log = Arc::default();

        queue.enqueue(slow(&log, "running"));
        queue.enqueue(slow(&log, "parked"));

        assert!(queue.clear_pending());
        assert!(!queue.clear_pending());
        queue.idle().await;

        assert_eq!(*log.lock().unwrap(), vec!["running"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_independent_queues_overlap() {
        let a = SerialQueue::new();
        let b = SerialQueue::new();
        let log: Log = Arc::default();

        assert!(a.enqueue(slow(&log, "a")).is_started());
        assert!(b.enqueue(slow(&log, "b")).is_started());

        a.idle().await;
        b.idle().await;
        assert_eq!(log.lock().unwrap().len(), 2);
    }
}
