use parking_lot::{Condvar, Mutex};
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

type Task = Box<dyn FnOnce() + Send>;

struct ScheduledTask {
    id: u64,
    run_at: Instant,
    task: Task,
}

impl PartialEq for ScheduledTask {
    fn eq(&self, other: &Self) -> bool {
        self.run_at == other.run_at && self.id == other.id
    }
}

impl Eq for ScheduledTask {}

impl PartialOrd for ScheduledTask {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledTask {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // earliest first
        other
            .run_at
            .cmp(&self.run_at)
            .then_with(|| other.id.cmp(&self.id))
    }
}

struct Inner {
    name: String,
    tasks: Mutex<BinaryHeap<ScheduledTask>>,
    wakeup: Condvar,
    running: AtomicBool,
    closed: AtomicBool,
    next_id: AtomicU64,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// Single background thread running tasks after a delay.
///
/// Used for releasing mapped segments after the cleanup delay and for
/// retrying file deletions off the write path.
#[derive(Clone)]
pub struct DelayedExecutor {
    inner: Arc<Inner>,
}

impl DelayedExecutor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                tasks: Mutex::new(BinaryHeap::new()),
                wakeup: Condvar::new(),
                running: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                next_id: AtomicU64::new(0),
                worker: Mutex::new(None),
            }),
        }
    }

    pub fn schedule(&self, delay: Duration, task: impl FnOnce() + Send + 'static) {
        if self.inner.closed.load(Ordering::Acquire) {
            debug!("{}: executor closed, dropping task", self.inner.name);
            return;
        }
        if !self.ensure_started() {
            task();
            return;
        }
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.tasks.lock().push(ScheduledTask {
            id,
            run_at: Instant::now() + delay,
            task: Box::new(task),
        });
        self.inner.wakeup.notify_one();
    }

    /// Tasks waiting to run.
    pub fn pending(&self) -> usize {
        self.inner.tasks.lock().len()
    }

    /// Stops the worker. Waiting tasks run immediately so no resource stays
    /// pinned; tasks scheduled afterwards are dropped.
    pub fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.running.store(false, Ordering::Release);
        self.inner.wakeup.notify_all();
        let handle = self.inner.worker.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                warn!("{}: executor thread panicked", self.inner.name);
            }
        }
        let remaining: Vec<ScheduledTask> = self.inner.tasks.lock().drain().collect();
        for scheduled in remaining {
            (scheduled.task)();
        }
    }

    fn ensure_started(&self) -> bool {
        let mut worker = self.inner.worker.lock();
        if worker.is_some() {
            return true;
        }
        self.inner.running.store(true, Ordering::Release);
        let inner = self.inner.clone();
        match thread::Builder::new()
            .name(self.inner.name.clone())
            .spawn(move || run(inner))
        {
            Ok(handle) => {
                *worker = Some(handle);
                true
            }
            Err(e) => {
                warn!("{}: failed to start executor: {}", self.inner.name, e);
                self.inner.running.store(false, Ordering::Release);
                false
            }
        }
    }
}

fn run(inner: Arc<Inner>) {
    debug!("{}: executor started", inner.name);
    while inner.running.load(Ordering::Acquire) {
        let due = {
            let mut tasks = inner.tasks.lock();
            match tasks.peek().map(|t| t.run_at) {
                Some(run_at) if run_at <= Instant::now() => tasks.pop(),
                Some(run_at) => {
                    inner.wakeup.wait_until(&mut tasks, run_at);
                    None
                }
                None => {
                    inner.wakeup.wait_for(&mut tasks, Duration::from_secs(1));
                    None
                }
            }
        };
        if let Some(scheduled) = due {
            (scheduled.task)();
        }
    }
    debug!("{}: executor stopped", inner.name);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_runs_after_delay() {
        let executor = DelayedExecutor::new("test-executor");
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        executor.schedule(Duration::from_millis(20), move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        let deadline = Instant::now() + Duration::from_secs(5);
        while counter.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        executor.shutdown();
    }

    #[test]
    fn test_shutdown_runs_remaining_tasks() {
        let executor = DelayedExecutor::new("test-executor");
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let c = counter.clone();
            executor.schedule(Duration::from_secs(60), move || {
                c.fetch_add(1, Ordering::SeqCst);
            });
        }
        executor.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert_eq!(executor.pending(), 0);
    }

    #[test]
    fn test_ordering_by_deadline() {
        let executor = DelayedExecutor::new("test-executor");
        let order = Arc::new(Mutex::new(Vec::new()));
        for (i, delay) in [30u64, 10, 20].into_iter().enumerate() {
            let order = order.clone();
            executor.schedule(Duration::from_millis(delay), move || order.lock().push(i));
        }
        let deadline = Instant::now() + Duration::from_secs(5);
        while order.lock().len() < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(*order.lock(), vec![1, 2, 0]);
        executor.shutdown();
    }
}
