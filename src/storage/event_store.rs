use crate::error::{Error, Result};
use crate::storage::event::{Event, EventTypeContext};
use crate::storage::index::IndexManager;
use crate::storage::primary::PrimaryEventStore;
use crate::storage::properties::StorageProperties;
use crate::storage::secondary::SecondaryEventStore;
use crate::storage::synchronizer::StorageCallback;
use crate::storage::tier::{self, EventStream, SegmentTier, TransactionStream};
use crossbeam::channel;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// The event log of one context and event type: a writable primary tier in
/// front of a secondary tier of completed segments.
pub struct EventStore {
    context: EventTypeContext,
    primary: Arc<PrimaryEventStore>,
    secondary: Arc<SecondaryEventStore>,
}

impl EventStore {
    /// Opens the tiers and recovers the latest segment.
    pub fn open(context: EventTypeContext, properties: &StorageProperties) -> Result<Self> {
        let properties = properties.for_event_type(context.event_type);
        let index_manager = Arc::new(IndexManager::new(context.context.clone(), properties.clone()));
        let secondary = SecondaryEventStore::new(
            context.clone(),
            index_manager.clone(),
            properties.clone(),
            None,
        );
        let primary = PrimaryEventStore::new(
            context.clone(),
            index_manager,
            properties,
            Some(secondary.clone() as Arc<dyn SegmentTier>),
        );
        primary.init(u64::MAX)?;
        info!(
            "{}: opened event store, last token {}",
            context,
            primary.last_token()
        );
        Ok(Self {
            context,
            primary,
            secondary,
        })
    }

    pub fn context(&self) -> &EventTypeContext {
        &self.context
    }

    /// Appends the events as one transaction and waits until it is committed.
    /// Returns the token of the first event.
    pub fn append(&self, events: &[Event]) -> Result<i64> {
        let (tx, rx) = channel::bounded(1);
        self.append_with_callback(
            events,
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        )?;
        rx.recv().map_err(|_| Error::Shutdown)?
    }

    /// Appends without waiting. Validation and capacity errors are returned
    /// directly; the callback reports the outcome of the write.
    pub fn append_with_callback(&self, events: &[Event], callback: StorageCallback) -> Result<()> {
        let reservation = self.primary.reserve_sequence_numbers(events)?;
        let prepared = match self.primary.prepare_transaction(events) {
            Ok(prepared) => prepared,
            Err(e) => {
                self.primary.cancel_reservation(reservation);
                return Err(e);
            }
        };
        self.primary.store(prepared, callback);
        Ok(())
    }

    /// Committed events starting at `from_token`.
    pub fn events(&self, from_token: i64) -> EventStream {
        EventStream::new(self.root(), from_token)
    }

    /// Committed transactions, starting with the one containing `from_token`.
    pub fn transactions(&self, from_token: i64) -> TransactionStream {
        TransactionStream::new(self.root(), from_token)
    }

    pub fn aggregate_events(&self, aggregate_id: &str, from_sequence: u64) -> Result<Vec<Event>> {
        tier::aggregate_events(self.primary.as_ref(), aggregate_id, from_sequence)
    }

    pub fn last_sequence_number(&self, aggregate_id: &str) -> Result<Option<u64>> {
        tier::last_sequence_number(self.primary.as_ref(), aggregate_id, usize::MAX)
    }

    /// Removes all events after `token`. Tokens of a partially removed
    /// transaction are kept up to the end of that transaction.
    pub fn rollback(&self, token: i64) -> Result<()> {
        self.primary.rollback(token)
    }

    pub fn last_token(&self) -> i64 {
        self.primary.last_token()
    }

    /// First token of every segment, oldest first.
    pub fn segments(&self) -> Vec<u64> {
        tier::all_segments(self.primary.as_ref()).into_iter().collect()
    }

    pub fn backup_filenames(&self, last_segment_backed_up: i64) -> Vec<PathBuf> {
        self.primary.backup_filenames(last_segment_backed_up)
    }

    pub fn close(&self) {
        info!("{}: closing event store", self.context);
        self.primary.cleanup();
    }

    fn root(&self) -> Arc<dyn SegmentTier> {
        self.primary.clone()
    }

    /// Completed segments owned by the read tier, newest first.
    pub fn secondary_segments(&self) -> Vec<u64> {
        self.secondary.segments()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::event::SerializedObject;
    use tempfile::TempDir;

    fn event(aggregate: &str, seq: u64) -> Event {
        Event::domain(aggregate, seq, "Order", SerializedObject::new("Updated", vec![3; 64]))
    }

    #[test]
    fn test_append_and_read_back() {
        let dir = TempDir::new().unwrap();
        let store = EventStore::open(
            EventTypeContext::events("default"),
            &StorageProperties::new(dir.path()).with_segment_size(64 * 1024),
        )
        .unwrap();

        assert_eq!(store.append(&[event("a", 0), event("b", 0)]).unwrap(), 0);
        assert_eq!(store.append(&[event("a", 1)]).unwrap(), 2);
        assert_eq!(store.last_token(), 2);

        let tokens: Vec<i64> = store.events(1).map(|e| e.unwrap().token).collect();
        assert_eq!(tokens, vec![1, 2]);

        let transactions: Vec<usize> = store
            .transactions(0)
            .map(|t| t.unwrap().events.len())
            .collect();
        assert_eq!(transactions, vec![2, 1]);

        let aggregate = store.aggregate_events("a", 0).unwrap();
        assert_eq!(aggregate.len(), 2);
        assert_eq!(aggregate[1].aggregate_sequence_number, 1);
        assert_eq!(store.last_sequence_number("a").unwrap(), Some(1));
        assert_eq!(store.last_sequence_number("missing").unwrap(), None);
        store.close();
    }

    #[test]
    fn test_failed_prepare_releases_reservation() {
        let dir = TempDir::new().unwrap();
        let store = EventStore::open(
            EventTypeContext::events("default"),
            &StorageProperties::new(dir.path()).with_segment_size(1024),
        )
        .unwrap();
        let big = Event::domain("a", 0, "Order", SerializedObject::new("Big", vec![0; 4096]));
        assert!(matches!(store.append(&[big]), Err(Error::PayloadTooLarge { .. })));
        assert_eq!(store.append(&[event("a", 0)]).unwrap(), 0);
        store.close();
    }

    #[test]
    fn test_completed_segments_move_to_secondary() {
        let dir = TempDir::new().unwrap();
        let mut properties = StorageProperties::new(dir.path()).with_segment_size(4096);
        properties.force_interval_ms = 10;
        let store = EventStore::open(EventTypeContext::events("default"), &properties).unwrap();
        for seq in 0..200 {
            store.append(&[event("a", seq)]).unwrap();
        }

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while store.secondary_segments().is_empty() && std::time::Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert!(!store.secondary_segments().is_empty());
        assert_eq!(store.aggregate_events("a", 0).unwrap().len(), 200);
        assert_eq!(store.events(0).count(), 200);
        store.close();
    }
}
