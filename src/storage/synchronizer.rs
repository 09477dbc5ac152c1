use crate::error::{Error, Result};
use crate::metrics;
use crate::storage::write_position::WritePosition;
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

/// Completion callback of a stored transaction, receives the first token.
pub type StorageCallback = Box<dyn FnOnce(Result<i64>) + Send>;

/// Invoked from the background thread once all writes of a segment are confirmed.
pub type SegmentCompleteHandler = Arc<dyn Fn(WritePosition) + Send + Sync>;

struct PendingWrite {
    position: WritePosition,
    size: usize,
    count: i64,
    outcome: Option<Result<()>>,
    callback: StorageCallback,
}

#[derive(Default)]
struct State {
    next_sequence: i64,
    current: Option<WritePosition>,
    pending: BTreeMap<i64, PendingWrite>,
    completed_segments: VecDeque<WritePosition>,
    dirty: bool,
    /// First write that failed in order. Nothing at or after it is committed.
    failed: Option<WritePosition>,
}

struct Shared {
    state: Mutex<State>,
    wakeup: Condvar,
    running: AtomicBool,
}

/// Orders write completions by token.
///
/// Writers finish in any order; callbacks fire strictly in ascending token order,
/// and the committed limit of a segment only moves past a transaction after all
/// lower transactions are written. A background thread forces the mapping to disk
/// at a fixed interval and runs the segment completion handler.
pub struct Synchronizer {
    context: String,
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
    force_interval: Duration,
    on_segment_complete: SegmentCompleteHandler,
}

impl Synchronizer {
    pub fn new(
        context: impl Into<String>,
        force_interval: Duration,
        on_segment_complete: SegmentCompleteHandler,
    ) -> Self {
        Self {
            context: context.into(),
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                wakeup: Condvar::new(),
                running: AtomicBool::new(false),
            }),
            worker: Mutex::new(None),
            force_interval,
            on_segment_complete,
        }
    }

    /// Starts tracking from the first position that will be written.
    pub fn init(&self, position: WritePosition) -> Result<()> {
        {
            let mut state = self.shared.state.lock();
            state.next_sequence = position.sequence;
            state.current = Some(position);
            state.pending.clear();
            state.completed_segments.clear();
            state.dirty = false;
            state.failed = None;
        }

        let mut worker = self.worker.lock();
        if worker.is_none() {
            self.shared.running.store(true, Ordering::Release);
            let shared = self.shared.clone();
            let handler = self.on_segment_complete.clone();
            let context = self.context.clone();
            let interval = self.force_interval;
            let handle = thread::Builder::new()
                .name(format!("{}-synchronizer", self.context))
                .spawn(move || run(shared, context, interval, handler))?;
            *worker = Some(handle);
        }
        Ok(())
    }

    /// Registers a claimed write before its bytes are copied. Fails the write
    /// right away when an earlier write has failed.
    pub fn register(&self, position: WritePosition, size: usize, count: usize, callback: StorageCallback) {
        let mut state = self.shared.state.lock();
        if let Some(failed) = &state.failed {
            let error = after_failure(failed.sequence);
            drop(state);
            callback(Err(error));
            return;
        }
        state.pending.insert(
            position.sequence,
            PendingWrite {
                position,
                size,
                count: count as i64,
                outcome: None,
                callback,
            },
        );
    }

    /// Marks the write starting at `sequence` as finished and fires every callback
    /// that is now in order.
    ///
    /// A failed write stops the committed limit at its start. It and every write
    /// behind it are failed, see [`Synchronizer::failed_position`].
    pub fn notify_written(&self, sequence: i64, outcome: Result<()>) {
        let mut segment_completed = false;
        let mut failed_writes = Vec::new();
        let mut state = self.shared.state.lock();
        if let Some(write) = state.pending.get_mut(&sequence) {
            write.outcome = Some(outcome);
        }

        loop {
            let ready = matches!(
                state.pending.first_key_value(),
                Some((first, write)) if *first == state.next_sequence && write.outcome.is_some()
            );
            if !ready {
                break;
            }
            let Some((_, write)) = state.pending.pop_first() else {
                break;
            };
            if let Some(Err(e)) = write.outcome {
                warn!(
                    "{}: write at token {} failed, nothing after it is committed",
                    self.context, write.position.sequence
                );
                let failed_sequence = write.position.sequence;
                state.failed = Some(write.position);
                failed_writes.push((write.callback, e));
                for (_, later) in std::mem::take(&mut state.pending) {
                    failed_writes.push((later.callback, after_failure(failed_sequence)));
                }
                break;
            }

            if let Some(current) = state.current.take() {
                if current.segment != write.position.segment {
                    if let Some(buffer) = &current.buffer {
                        buffer.set_committed(usize::MAX);
                    }
                    state.completed_segments.push_back(current);
                    segment_completed = true;
                }
            }
            if let Some(buffer) = &write.position.buffer {
                buffer.set_committed(write.position.position + write.size);
            }
            state.next_sequence = write.position.sequence + write.count;
            state.current = Some(write.position.clone());
            state.dirty = true;

            (write.callback)(Ok(write.position.sequence));
        }
        drop(state);

        for (callback, error) in failed_writes {
            callback(Err(error));
        }

        if segment_completed {
            self.shared.wakeup.notify_one();
        }
    }

    /// Position of the first failed write, the end of the committed data until
    /// the next [`Synchronizer::init`].
    pub fn failed_position(&self) -> Option<WritePosition> {
        self.shared.state.lock().failed.clone()
    }

    /// Number of registered writes whose callback has not fired yet.
    pub fn pending(&self) -> usize {
        self.shared.state.lock().pending.len()
    }

    /// Stops the background thread after completing queued segments and a final flush.
    /// Pending callbacks are failed with [`Error::Shutdown`].
    pub fn shutdown(&self) {
        self.shared.running.store(false, Ordering::Release);
        self.shared.wakeup.notify_all();
        if let Some(handle) = self.worker.lock().take() {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                warn!("{}: synchronizer thread panicked", self.context);
            }
        }

        let pending: Vec<PendingWrite> = {
            let mut state = self.shared.state.lock();
            std::mem::take(&mut state.pending).into_values().collect()
        };
        for write in pending {
            (write.callback)(Err(Error::Shutdown));
        }
    }
}

impl Drop for Synchronizer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn after_failure(failed_sequence: i64) -> Error {
    Error::Io(std::io::Error::other(format!(
        "write at token {} failed, later writes are discarded",
        failed_sequence
    )))
}

fn run(shared: Arc<Shared>, context: String, interval: Duration, handler: SegmentCompleteHandler) {
    debug!("{}: synchronizer started", context);
    loop {
        let running = shared.running.load(Ordering::Acquire);
        let (segments, flush) = {
            let mut state = shared.state.lock();
            if running && state.completed_segments.is_empty() {
                shared.wakeup.wait_for(&mut state, interval);
            }
            let segments: Vec<WritePosition> = state.completed_segments.drain(..).collect();
            let flush = if std::mem::take(&mut state.dirty) {
                state.current.clone()
            } else {
                None
            };
            (segments, flush)
        };

        for position in segments {
            if let Some(buffer) = &position.buffer {
                if let Err(e) = buffer.flush() {
                    warn!("{}: failed to flush segment {}: {}", context, position.segment, e);
                }
            }
            debug!("{}: segment {} complete", context, position.segment);
            metrics::segment_transition(&context, "completed");
            handler(position);
        }

        if let Some(current) = flush {
            if let Some(buffer) = &current.buffer {
                if let Err(e) = buffer.flush() {
                    warn!("{}: failed to force segment {}: {}", context, current.segment, e);
                }
            }
        }

        if !running {
            break;
        }
    }
    debug!("{}: synchronizer stopped", context);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::segment::{WritableSegment, FILE_HEADER_SIZE};
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    fn position(buffer: &Arc<WritableSegment>, sequence: i64, offset: usize) -> WritePosition {
        WritePosition::new(sequence, offset, buffer.clone(), 0)
    }

    fn recording(order: &Arc<Mutex<Vec<i64>>>) -> StorageCallback {
        let order = order.clone();
        Box::new(move |result| order.lock().push(result.unwrap()))
    }

    #[test]
    fn test_callbacks_fire_in_token_order() {
        let dir = TempDir::new().unwrap();
        let buffer = Arc::new(
            WritableSegment::open(&dir.path().join("00000000000000.events"), 0, 4096, 0).unwrap(),
        );
        let synchronizer = Synchronizer::new("test", Duration::from_millis(50), Arc::new(|_| {}));
        synchronizer.init(position(&buffer, 0, FILE_HEADER_SIZE)).unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        synchronizer.register(position(&buffer, 0, 5), 20, 2, recording(&order));
        synchronizer.register(position(&buffer, 2, 25), 20, 1, recording(&order));
        synchronizer.register(position(&buffer, 3, 45), 20, 1, recording(&order));

        synchronizer.notify_written(3, Ok(()));
        synchronizer.notify_written(2, Ok(()));
        assert!(order.lock().is_empty());
        assert_eq!(crate::storage::segment::EventSource::readable_limit(&*buffer), FILE_HEADER_SIZE);

        synchronizer.notify_written(0, Ok(()));
        assert_eq!(*order.lock(), vec![0, 2, 3]);
        assert_eq!(crate::storage::segment::EventSource::readable_limit(&*buffer), 65);
        assert_eq!(synchronizer.pending(), 0);
        synchronizer.shutdown();
    }

    #[test]
    fn test_segment_completion_runs_in_background() {
        let dir = TempDir::new().unwrap();
        let first = Arc::new(
            WritableSegment::open(&dir.path().join("00000000000000.events"), 0, 4096, 0).unwrap(),
        );
        let second = Arc::new(
            WritableSegment::open(&dir.path().join("00000000000001.events"), 1, 4096, 0).unwrap(),
        );
        let completed = Arc::new(AtomicUsize::new(usize::MAX));
        let seen = completed.clone();
        let synchronizer = Synchronizer::new(
            "test",
            Duration::from_millis(10),
            Arc::new(move |p: WritePosition| seen.store(p.segment as usize, Ordering::SeqCst)),
        );
        synchronizer.init(position(&first, 0, FILE_HEADER_SIZE)).unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        synchronizer.register(position(&first, 0, 5), 20, 1, recording(&order));
        synchronizer.notify_written(0, Ok(()));
        synchronizer.register(
            WritePosition::new(1, FILE_HEADER_SIZE, second.clone(), 1),
            20,
            1,
            recording(&order),
        );
        synchronizer.notify_written(1, Ok(()));
        synchronizer.shutdown();

        assert_eq!(completed.load(Ordering::SeqCst), 0);
        assert_eq!(*order.lock(), vec![0, 1]);
    }

    #[test]
    fn test_shutdown_fails_pending_writes() {
        let dir = TempDir::new().unwrap();
        let buffer = Arc::new(
            WritableSegment::open(&dir.path().join("00000000000000.events"), 0, 4096, 0).unwrap(),
        );
        let synchronizer = Synchronizer::new("test", Duration::from_millis(50), Arc::new(|_| {}));
        synchronizer.init(position(&buffer, 0, FILE_HEADER_SIZE)).unwrap();

        let failed = Arc::new(AtomicBool::new(false));
        let flag = failed.clone();
        synchronizer.register(
            position(&buffer, 1, 25),
            20,
            1,
            Box::new(move |r| flag.store(matches!(r, Err(Error::Shutdown)), Ordering::SeqCst)),
        );
        synchronizer.shutdown();
        assert!(failed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_failed_write_stops_committed_limit() {
        let dir = TempDir::new().unwrap();
        let buffer = Arc::new(
            WritableSegment::open(&dir.path().join("00000000000000.events"), 0, 4096, 0).unwrap(),
        );
        let synchronizer = Synchronizer::new("test", Duration::from_millis(50), Arc::new(|_| {}));
        synchronizer.init(position(&buffer, 0, FILE_HEADER_SIZE)).unwrap();

        let results = Arc::new(Mutex::new(Vec::new()));
        let collect = |results: &Arc<Mutex<Vec<(i64, bool)>>>, token: i64| -> StorageCallback {
            let results = results.clone();
            Box::new(move |r: Result<i64>| results.lock().push((token, r.is_ok())))
        };
        synchronizer.register(position(&buffer, 0, 5), 20, 1, collect(&results, 0));
        synchronizer.register(position(&buffer, 1, 25), 20, 1, collect(&results, 1));
        synchronizer.register(position(&buffer, 2, 45), 20, 1, collect(&results, 2));

        synchronizer.notify_written(0, Ok(()));
        synchronizer.notify_written(2, Ok(()));
        synchronizer.notify_written(
            1,
            Err(Error::Io(std::io::Error::other("disk full"))),
        );

        assert_eq!(*results.lock(), vec![(0, true), (1, false), (2, false)]);
        assert_eq!(crate::storage::segment::EventSource::readable_limit(&*buffer), 25);
        let failed = synchronizer.failed_position().unwrap();
        assert_eq!((failed.sequence, failed.position), (1, 25));
        assert_eq!(synchronizer.pending(), 0);

        // writes claimed after the failure never become visible
        synchronizer.register(position(&buffer, 3, 65), 20, 1, collect(&results, 3));
        assert_eq!(results.lock().last(), Some(&(3, false)));
        assert_eq!(crate::storage::segment::EventSource::readable_limit(&*buffer), 25);

        synchronizer.init(position(&buffer, 1, 25)).unwrap();
        assert!(synchronizer.failed_position().is_none());
        synchronizer.shutdown();
    }
}
