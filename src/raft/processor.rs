use super::log_store::LogEntryStore;
use super::state_store::ProcessorStore;
use super::{LogEntry, TermIndex};
use crate::error::Result;
use crate::metrics;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, warn};

/// Receives committed log entries in log order.
pub trait LogEntryConsumer: Send + Sync {
    fn consume(&self, group_id: &str, entry: &LogEntry) -> Result<()>;

    /// Token of the last event this consumer has written, -1 when it has none.
    fn last_event_sequence(&self) -> i64 {
        -1
    }
}

/// Tracks commit and apply progress and feeds committed entries to consumers.
pub struct LogEntryProcessor {
    group_id: String,
    store: Arc<dyn ProcessorStore>,
    consumers: RwLock<Vec<Arc<dyn LogEntryConsumer>>>,
}

impl LogEntryProcessor {
    pub fn new(group_id: impl Into<String>, store: Arc<dyn ProcessorStore>) -> Self {
        Self {
            group_id: group_id.into(),
            store,
            consumers: RwLock::new(Vec::new()),
        }
    }

    pub fn register_consumer(&self, consumer: Arc<dyn LogEntryConsumer>) {
        self.consumers.write().push(consumer);
    }

    pub fn commit_index(&self) -> u64 {
        self.store.commit_index()
    }

    pub fn commit_term(&self) -> u64 {
        self.store.commit_term()
    }

    pub fn last_applied_index(&self) -> u64 {
        self.store.last_applied_index()
    }

    pub fn last_applied_term(&self) -> u64 {
        self.store.last_applied_term()
    }

    pub fn last_applied(&self) -> TermIndex {
        TermIndex::new(self.last_applied_term(), self.last_applied_index())
    }

    /// Highest event token written by any consumer.
    pub fn last_applied_event_sequence(&self) -> i64 {
        self.consumers
            .read()
            .iter()
            .map(|c| c.last_event_sequence())
            .max()
            .unwrap_or(-1)
    }

    /// Moves the commit index forward. Returns false when `position` is not
    /// beyond the current commit index.
    pub fn mark_committed(&self, position: TermIndex) -> Result<bool> {
        if position.index <= self.store.commit_index() {
            return Ok(false);
        }
        debug!("{}: committed up to {}", self.group_id, position);
        self.store.update_commit_index(position)?;
        Ok(true)
    }

    /// Applies committed entries not applied yet, stopping at the first entry a
    /// consumer fails on. `on_entry` runs for every applied entry before the
    /// consumers. Returns the number of entries applied.
    pub fn apply(
        &self,
        log: &dyn LogEntryStore,
        mut on_entry: impl FnMut(&LogEntry),
    ) -> Result<usize> {
        let commit_index = self.store.commit_index();
        let mut applied = 0usize;
        let mut next = self.store.last_applied_index() + 1;
        while next <= commit_index {
            let Some(entry) = log.entry(next)? else {
                break;
            };
            on_entry(&entry);
            let consumers = self.consumers.read().clone();
            for consumer in consumers {
                if let Err(e) = consumer.consume(&self.group_id, &entry) {
                    warn!(
                        "{}: failed to apply entry {}: {}",
                        self.group_id,
                        entry.term_index(),
                        e
                    );
                    metrics::log_entries(&self.group_id, "applied", applied as u64);
                    return Err(e);
                }
            }
            self.store.update_last_applied(entry.term_index())?;
            applied += 1;
            next += 1;
        }
        if applied > 0 {
            metrics::log_entries(&self.group_id, "applied", applied as u64);
        }
        Ok(applied)
    }

    /// Sets commit and apply progress to a snapshot position.
    pub fn reset(&self, position: TermIndex) -> Result<()> {
        self.store.update_commit_index(position)?;
        self.store.update_last_applied(position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::raft::log_store::InMemoryLogEntryStore;
    use crate::raft::state_store::InMemoryProcessorStore;
    use crate::raft::EntryPayload;
    use parking_lot::Mutex;

    struct Recorder {
        seen: Mutex<Vec<u64>>,
        fail_at: Option<u64>,
    }

    impl LogEntryConsumer for Recorder {
        fn consume(&self, _group_id: &str, entry: &LogEntry) -> Result<()> {
            if Some(entry.index) == self.fail_at {
                return Err(Error::Shutdown);
            }
            self.seen.lock().push(entry.index);
            Ok(())
        }

        fn last_event_sequence(&self) -> i64 {
            self.seen.lock().len() as i64 - 1
        }
    }

    fn log_with(count: u64) -> InMemoryLogEntryStore {
        let log = InMemoryLogEntryStore::new();
        for _ in 0..count {
            log.create_entry(1, EntryPayload::Noop).unwrap();
        }
        log
    }

    #[test]
    fn test_applies_up_to_commit_index() {
        let log = log_with(5);
        let processor = LogEntryProcessor::new("g", Arc::new(InMemoryProcessorStore::new()));
        let recorder = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
            fail_at: None,
        });
        processor.register_consumer(recorder.clone());

        assert!(processor.mark_committed(TermIndex::new(1, 3)).unwrap());
        assert!(!processor.mark_committed(TermIndex::new(1, 2)).unwrap());
        assert_eq!(processor.apply(&log, |_| {}).unwrap(), 3);
        assert_eq!(*recorder.seen.lock(), vec![1, 2, 3]);
        assert_eq!(processor.last_applied(), TermIndex::new(1, 3));
        assert_eq!(processor.last_applied_event_sequence(), 2);
        assert_eq!(processor.apply(&log, |_| {}).unwrap(), 0);
    }

    #[test]
    fn test_failed_consumer_stops_apply() {
        let log = log_with(5);
        let processor = LogEntryProcessor::new("g", Arc::new(InMemoryProcessorStore::new()));
        processor.register_consumer(Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
            fail_at: Some(2),
        }));
        processor.mark_committed(TermIndex::new(1, 5)).unwrap();
        assert!(processor.apply(&log, |_| {}).is_err());
        assert_eq!(processor.last_applied_index(), 1);
    }
}
