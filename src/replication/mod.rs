//! Bridge between a replicated log and the event store of its context.
//!
//! Appended events travel through the log as `eventTransaction` entries and
//! are written to the [`EventStore`] once committed. Snapshots stream the
//! stored transactions themselves.

use crate::error::{Error, Result};
use crate::raft::node::{Completion, RaftNode};
use crate::raft::processor::LogEntryConsumer;
use crate::raft::snapshot::{SnapshotChunks, SnapshotManager};
use crate::raft::{EntryPayload, LogEntry};
use crate::storage::event::{Event, SerializedObject, TransactionWithToken};
use crate::storage::event_store::EventStore;
use crate::storage::segment::VERSION;
use bincode::config;
use std::sync::Arc;
use tracing::{debug, info};

/// Entry type of log entries and snapshot chunks holding a transaction.
pub const EVENT_TRANSACTION: &str = "eventTransaction";

/// Token of a transaction that has not been stored anywhere yet.
pub const UNASSIGNED_TOKEN: i64 = -1;

pub fn encode_transaction(token: i64, events: &[Event]) -> Result<Vec<u8>> {
    let transaction = TransactionWithToken {
        token,
        version: VERSION,
        events: events.to_vec(),
    };
    Ok(bincode::encode_to_vec(&transaction, config::standard())?)
}

pub fn decode_transaction(data: &[u8]) -> Result<TransactionWithToken> {
    let (transaction, _) = bincode::decode_from_slice(data, config::standard())?;
    Ok(transaction)
}

/// Proposes events to the group of `node`. Completes once they are stored
/// locally.
pub fn append_events(node: &RaftNode, events: &[Event]) -> Result<Completion> {
    if events.is_empty() {
        return Err(Error::InvalidTransaction("no events".to_string()));
    }
    node.append_entry(EVENT_TRANSACTION, encode_transaction(UNASSIGNED_TOKEN, events)?)
}

/// Stores a transaction unless it is already present. Transactions carrying a
/// token must continue the store exactly.
fn store_transaction(store: &EventStore, transaction: &TransactionWithToken) -> Result<()> {
    if transaction.token != UNASSIGNED_TOKEN {
        let expected = store.last_token() + 1;
        let end = transaction.token + transaction.events.len() as i64;
        if end <= expected {
            debug!(
                "{}: skipping transaction at {}, already stored up to {}",
                store.context(),
                transaction.token,
                expected - 1
            );
            return Ok(());
        }
        if transaction.token != expected {
            return Err(Error::InvalidTransaction(format!(
                "transaction at token {} does not continue the store at {}",
                transaction.token, expected
            )));
        }
    }
    store.append(&transaction.events)?;
    Ok(())
}

/// Writes committed event transactions into the event store.
pub struct EventStoreApplier {
    store: Arc<EventStore>,
}

impl EventStoreApplier {
    pub fn new(store: Arc<EventStore>) -> Self {
        Self { store }
    }
}

impl LogEntryConsumer for EventStoreApplier {
    fn consume(&self, _group_id: &str, entry: &LogEntry) -> Result<()> {
        match &entry.payload {
            EntryPayload::Serialized { entry_type, data } if entry_type == EVENT_TRANSACTION => {
                store_transaction(&self.store, &decode_transaction(data)?)
            }
            _ => Ok(()),
        }
    }

    fn last_event_sequence(&self) -> i64 {
        self.store.last_token()
    }
}

/// Snapshots of an event store, one chunk per stored transaction.
pub struct EventStoreSnapshotManager {
    store: Arc<EventStore>,
}

impl EventStoreSnapshotManager {
    pub fn new(store: Arc<EventStore>) -> Self {
        Self { store }
    }
}

impl SnapshotManager for EventStoreSnapshotManager {
    fn last_sequence(&self) -> i64 {
        self.store.last_token()
    }

    fn stream_snapshot_chunks(&self, from_sequence: i64, to_sequence: i64) -> SnapshotChunks {
        if from_sequence > to_sequence {
            return Box::new(std::iter::empty());
        }
        let chunks = self
            .store
            .transactions(from_sequence)
            .take_while(move |transaction| {
                transaction
                    .as_ref()
                    .map_or(true, |transaction| transaction.token <= to_sequence)
            })
            .map(|transaction| {
                let transaction = transaction?;
                let data = bincode::encode_to_vec(&transaction, config::standard())?;
                Ok(SerializedObject::new(EVENT_TRANSACTION, data))
            });
        Box::new(chunks)
    }

    fn apply_snapshot_data(&self, chunk: &SerializedObject) -> Result<()> {
        if chunk.type_name != EVENT_TRANSACTION {
            return Err(Error::InvalidTransaction(format!(
                "unexpected snapshot chunk type {}",
                chunk.type_name
            )));
        }
        store_transaction(&self.store, &decode_transaction(&chunk.data)?)
    }

    fn clear(&self) -> Result<()> {
        info!("{}: clearing event store for snapshot", self.store.context());
        self.store.rollback(-1)
    }
}
