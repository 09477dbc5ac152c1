use crate::error::{Error, Result};
use crate::metrics;
use crate::storage::event::{Event, EventInformation, EventTypeContext, ProcessedEvent};
use crate::storage::index::{AggregatePositions, IndexManager, PositionInfo};
use crate::storage::properties::StorageProperties;
use crate::storage::scheduler::DelayedExecutor;
use crate::storage::segment::{
    event_block_size, event_offsets, transaction_size, BlockRead, EventIterator, EventSource,
    SegmentView, WritableSegment, MAX_EVENTS_PER_TRANSACTION, SEGMENT_OVERHEAD,
};
use crate::storage::synchronizer::{StorageCallback, Synchronizer};
use crate::storage::tier::{self, HandoverCallback, SegmentTier};
use crate::storage::write_position::{WritePosition, WritePositionRef};
use crossbeam_skiplist::SkipMap;
use dashmap::DashMap;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, error, info, warn};

/// Number of recent segments searched for an aggregate's last sequence number
/// when it is not cached.
const SEQUENCE_LOOKUP_SEGMENTS: usize = 10;

/// Positions of the aggregates in one primary segment.
type SegmentPositions = DashMap<String, BTreeSet<PositionInfo>>;

/// A transaction with its byte range claimed, ready to be stored.
///
/// Every prepared transaction must be passed to [`PrimaryEventStore::store`],
/// otherwise later transactions never complete.
pub struct PreparedTransaction {
    position: WritePosition,
    size: usize,
    events: Vec<ProcessedEvent>,
}

impl PreparedTransaction {
    pub fn first_token(&self) -> i64 {
        self.position.sequence
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Sequence numbers reserved by [`PrimaryEventStore::reserve_sequence_numbers`].
#[derive(Debug, Default)]
pub struct SequenceReservation {
    reserved: Vec<(String, i64, i64)>,
}

impl SequenceReservation {
    pub fn is_empty(&self) -> bool {
        self.reserved.is_empty()
    }
}

#[derive(Debug)]
struct MinMax {
    min: u64,
    max: u64,
}

/// The write-hot tier: owns the writable segment and the in-memory aggregate
/// positions of the segments not yet handed over.
pub struct PrimaryEventStore {
    context: EventTypeContext,
    label: String,
    properties: StorageProperties,
    index_manager: Arc<IndexManager>,
    synchronizer: Synchronizer,
    write_position: WritePositionRef,
    last_token: Arc<AtomicI64>,
    positions: SkipMap<u64, Arc<SegmentPositions>>,
    sequence_numbers: DashMap<String, Arc<AtomicI64>>,
    read_buffers: DashMap<u64, Arc<WritableSegment>>,
    next: Option<Arc<dyn SegmentTier>>,
    executor: DelayedExecutor,
    initialized: AtomicBool,
    /// Claims not yet passed through `store`
    in_flight: AtomicUsize,
    recovering: AtomicBool,
    self_ref: Weak<PrimaryEventStore>,
}

impl PrimaryEventStore {
    pub fn new(
        context: EventTypeContext,
        index_manager: Arc<IndexManager>,
        properties: StorageProperties,
        next: Option<Arc<dyn SegmentTier>>,
    ) -> Arc<Self> {
        let label = context.to_string();
        Arc::new_cyclic(|weak: &Weak<PrimaryEventStore>| {
            let handler_ref = weak.clone();
            let synchronizer = Synchronizer::new(
                label.clone(),
                properties.force_interval(),
                Arc::new(move |position: WritePosition| {
                    if let Some(store) = handler_ref.upgrade() {
                        store.complete_segment(position);
                    }
                }),
            );
            Self {
                executor: DelayedExecutor::new(format!("{}-cleanup", label)),
                label,
                context,
                properties,
                index_manager,
                synchronizer,
                write_position: WritePositionRef::new(WritePosition::empty()),
                last_token: Arc::new(AtomicI64::new(-1)),
                positions: SkipMap::new(),
                sequence_numbers: DashMap::new(),
                read_buffers: DashMap::new(),
                next,
                initialized: AtomicBool::new(false),
                in_flight: AtomicUsize::new(0),
                recovering: AtomicBool::new(false),
                self_ref: weak.clone(),
            }
        })
    }

    pub fn type_context(&self) -> &EventTypeContext {
        &self.context
    }

    pub fn last_token(&self) -> i64 {
        self.last_token.load(Ordering::Acquire)
    }

    /// Serializes the events and claims space for them in the writable segment.
    pub fn prepare_transaction(&self, events: &[Event]) -> Result<PreparedTransaction> {
        if events.is_empty() {
            return Err(Error::InvalidTransaction("no events".to_string()));
        }
        let processed = events
            .iter()
            .map(ProcessedEvent::new)
            .collect::<Result<Vec<_>>>()?;
        let size = transaction_size(event_block_size(&processed));
        let position = self.claim(size, processed.len())?;
        Ok(PreparedTransaction {
            position,
            size,
            events: processed,
        })
    }

    /// Writes a prepared transaction. The callback fires with the first token once
    /// this and all earlier transactions are written.
    pub fn store(&self, prepared: PreparedTransaction, callback: StorageCallback) {
        let PreparedTransaction {
            position,
            size,
            events,
        } = prepared;
        let first = position.sequence;
        let count = events.len() as i64;
        let last_token = self.last_token.clone();
        let label = self.label.clone();

        self.synchronizer.register(
            position.clone(),
            size,
            events.len(),
            Box::new(move |result: Result<i64>| {
                if let Ok(first_token) = &result {
                    last_token.fetch_max(first_token + count - 1, Ordering::AcqRel);
                    metrics::events_stored(&label, count as u64);
                }
                callback(result)
            }),
        );
        let outcome = self.write(&position, &events);
        if let Err(e) = &outcome {
            warn!("{}: failed to write transaction at {}: {}", self.label, first, e);
        }
        self.synchronizer.notify_written(first, outcome);
        self.in_flight.fetch_sub(1, Ordering::AcqRel);

        if let Some(failed) = self.synchronizer.failed_position() {
            if let Err(e) = self.recover_failed_write(failed) {
                error!("{}: failed to recover from write failure: {}", self.label, e);
            }
        }
    }

    /// Drops everything from the first failed write on and reopens the writable
    /// segment there, so the next transaction gets the failed write's token.
    fn recover_failed_write(&self, failed: WritePosition) -> Result<()> {
        if self
            .recovering
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }
        let still_failed = self
            .synchronizer
            .failed_position()
            .is_some_and(|current| current.sequence == failed.sequence);
        if !still_failed {
            self.recovering.store(false, Ordering::Release);
            return Ok(());
        }
        self.initialized.store(false, Ordering::Release);
        while self.in_flight.load(Ordering::Acquire) > 0 {
            std::thread::yield_now();
        }
        info!(
            "{}: discarding writes from token {} in segment {}",
            self.label, failed.sequence, failed.segment
        );
        self.synchronizer.shutdown();

        for segment in self.segments() {
            if segment > failed.segment {
                self.remove_segment(segment);
            }
        }
        let result = match &failed.buffer {
            Some(buffer) => buffer
                .clear_range(failed.position, buffer.capacity())
                .and_then(|_| self.init_latest_segment(u64::MAX, failed.sequence)),
            None => self.init_latest_segment(u64::MAX, failed.sequence),
        };
        self.recovering.store(false, Ordering::Release);
        result
    }

    /// Checks that each aggregate's events in the batch are contiguous and continue
    /// the stored sequence, and reserves them. Nothing stays reserved on failure.
    pub fn reserve_sequence_numbers(&self, events: &[Event]) -> Result<SequenceReservation> {
        let mut min_max: BTreeMap<&str, MinMax> = BTreeMap::new();
        for event in events {
            let Some(aggregate_id) = event.aggregate_id() else {
                continue;
            };
            let seq = event.aggregate_sequence_number;
            match min_max.get_mut(aggregate_id) {
                None => {
                    min_max.insert(aggregate_id, MinMax { min: seq, max: seq });
                }
                Some(entry) if seq == entry.max + 1 => entry.max = seq,
                Some(entry) => {
                    return Err(Error::InvalidSequence {
                        aggregate: aggregate_id.to_string(),
                        reason: format!("sequence {} does not follow {}", seq, entry.max),
                    })
                }
            }
        }

        let mut reservation = SequenceReservation::default();
        for (aggregate_id, range) in min_max {
            let current = self.cached_sequence_number(aggregate_id)?;
            let expected = range.min as i64 - 1;
            if let Err(found) =
                current.compare_exchange(expected, range.max as i64, Ordering::AcqRel, Ordering::Acquire)
            {
                info!(
                    "{}: invalid sequence number for {}, expected {} found {}",
                    self.label, aggregate_id, expected, found
                );
                metrics::reservation_conflict(&self.label);
                self.cancel_reservation(reservation);
                return Err(Error::SequenceConflict {
                    aggregate: aggregate_id.to_string(),
                    expected,
                    found,
                });
            }
            reservation
                .reserved
                .push((aggregate_id.to_string(), expected, range.max as i64));
        }
        Ok(reservation)
    }

    /// Returns reserved sequence numbers of a batch that will not be stored.
    pub fn cancel_reservation(&self, reservation: SequenceReservation) {
        for (aggregate_id, previous, reserved) in reservation.reserved {
            if let Some(current) = self.sequence_numbers.get(&aggregate_id) {
                let _ = current.compare_exchange(reserved, previous, Ordering::AcqRel, Ordering::Acquire);
            }
        }
    }

    fn cached_sequence_number(&self, aggregate_id: &str) -> Result<Arc<AtomicI64>> {
        if let Some(current) = self.sequence_numbers.get(aggregate_id) {
            return Ok(current.clone());
        }
        let last = tier::last_sequence_number(self, aggregate_id, SEQUENCE_LOOKUP_SEGMENTS)?
            .map(|seq| seq as i64)
            .unwrap_or(-1);
        Ok(self
            .sequence_numbers
            .entry(aggregate_id.to_string())
            .or_insert_with(|| Arc::new(AtomicI64::new(last)))
            .clone())
    }

    fn claim(&self, size: usize, count: usize) -> Result<WritePosition> {
        let max = (self.properties.segment_size as usize).saturating_sub(SEGMENT_OVERHEAD);
        if size > max {
            return Err(Error::PayloadTooLarge { size, max });
        }
        if count > MAX_EVENTS_PER_TRANSACTION {
            return Err(Error::PayloadTooLarge {
                size: count,
                max: MAX_EVENTS_PER_TRANSACTION,
            });
        }

        self.in_flight.fetch_add(1, Ordering::AcqRel);
        let claimed = self.claim_position(size, count);
        if claimed.is_err() {
            self.in_flight.fetch_sub(1, Ordering::AcqRel);
        }
        claimed
    }

    fn claim_position(&self, size: usize, count: usize) -> Result<WritePosition> {
        loop {
            if !self.initialized.load(Ordering::Acquire) {
                return Err(Error::Shutdown);
            }
            let position = self.write_position.get_and_increment(count as i64, size);
            if position.is_overflow(size) {
                // only the claimant that hit the end of the segment gets here
                debug!("{}: creating new segment {}", self.label, position.sequence);
                if let Some(buffer) = &position.buffer {
                    buffer.mark_overflow(position.position)?;
                }
                match self.open_data_file(position.sequence as u64) {
                    Ok(buffer) => self.write_position.set(position.reset(buffer)),
                    Err(e) => {
                        self.write_position.set(position);
                        return Err(e);
                    }
                }
                continue;
            }
            if position.is_writable(size) {
                return Ok(position);
            }
            std::thread::yield_now();
        }
    }

    fn write(&self, position: &WritePosition, events: &[ProcessedEvent]) -> Result<()> {
        let buffer = position.buffer.as_ref().ok_or(Error::Shutdown)?;
        buffer.write_transaction(position.position, events)?;

        let Some(segment_positions) = self.positions.get(&position.segment) else {
            return Ok(());
        };
        let segment_positions = segment_positions.value();
        for (event, offset) in events.iter().zip(event_offsets(events)) {
            if let Some(aggregate_id) = event.aggregate_identifier() {
                segment_positions
                    .entry(aggregate_id.to_string())
                    .or_default()
                    .insert(PositionInfo::new(
                        position.position + offset,
                        event.aggregate_sequence_number(),
                    ));
            }
        }
        Ok(())
    }

    fn open_data_file(&self, segment: u64) -> Result<Arc<WritableSegment>> {
        if let Some(existing) = self.read_buffers.get(&segment) {
            return Ok(existing.clone());
        }
        let path = self.properties.data_file(&self.context.context, segment);
        let buffer = Arc::new(WritableSegment::open(
            &path,
            segment,
            self.properties.segment_size,
            self.properties.flags,
        )?);
        if !self.positions.contains_key(&segment) {
            self.positions.insert(segment, Arc::new(SegmentPositions::new()));
        }
        self.read_buffers.insert(segment, buffer.clone());
        metrics::segment_transition(&self.label, "created");
        Ok(buffer)
    }

    /// Latest data file below `last_initialized`, 0 when there is none.
    fn first_file(&self, last_initialized: u64) -> Result<u64> {
        Ok(self
            .properties
            .list_segments(&self.context.context)?
            .into_iter()
            .filter(|segment| *segment < last_initialized)
            .max()
            .unwrap_or(0))
    }

    /// Opens the latest segment for writing and rebuilds its positions by scanning
    /// it up to `next_token`, or to the end of the transaction containing it.
    fn init_latest_segment(&self, last_initialized: u64, next_token: i64) -> Result<()> {
        fs::create_dir_all(self.properties.storage_dir(&self.context.context))?;
        let first = self.first_file(last_initialized)?;
        if let Some(next) = &self.next {
            next.release(first);
        }
        let buffer = self.open_data_file(first)?;
        remove_file(&self.properties.index_file(&self.context.context, first));
        remove_file(&self.properties.bloom_file(&self.context.context, first));
        self.sequence_numbers.clear();

        let segment_positions = Arc::new(SegmentPositions::new());
        self.positions.insert(first, segment_positions.clone());

        let mut iterator = EventIterator::new(buffer.recovery_source(), first as i64)?;
        while iterator.next_token() < next_token {
            match iterator.next() {
                Some(Ok(info)) => self.record_recovered(&segment_positions, &info),
                Some(Err(e)) => {
                    warn!("{}: stopping recovery of segment {}: {}", self.label, first, e);
                    break;
                }
                None => break,
            }
        }
        if iterator.has_pending() {
            let pending = iterator.pending_events();
            warn!(
                "{}: failed to position to transaction {}, {} events left in transaction, moving to end of transaction",
                self.label,
                next_token,
                pending.len()
            );
            for info in &pending {
                self.record_recovered(&segment_positions, info);
            }
        }
        let sequence = iterator.next_token();
        let position = iterator.position();

        let end_of_data = self.end_of_data(&buffer, position);
        buffer.clear_range(position, end_of_data)?;
        if position + 4 <= buffer.capacity() {
            buffer.write_i32(position, 0)?;
        }
        buffer.reset_committed(position);
        self.last_token.store(sequence - 1, Ordering::Release);

        let write_position = WritePosition::new(sequence, position, buffer, first);
        self.write_position.set(write_position.clone());
        self.synchronizer.init(write_position)?;
        self.initialized.store(true, Ordering::Release);
        info!(
            "{}: writable segment {} opened at token {}",
            self.label, first, sequence
        );

        if let Some(next) = &self.next {
            next.init(first)?;
        }
        Ok(())
    }

    /// End of the bytes written in a previous run, starting the search at `position`.
    fn end_of_data(&self, buffer: &Arc<WritableSegment>, position: usize) -> usize {
        let mut view = SegmentView::new(buffer.recovery_source());
        view.set_position(position);
        loop {
            match view.read_block() {
                Ok(BlockRead::Transaction(_)) => continue,
                Ok(BlockRead::Overflow) => return view.position() + 4,
                Ok(BlockRead::End) | Err(_) => return view.position(),
            }
        }
    }

    fn record_recovered(&self, segment_positions: &SegmentPositions, info: &EventInformation) {
        if let Some(aggregate_id) = info.event.aggregate_id() {
            let seq = info.event.aggregate_sequence_number;
            segment_positions
                .entry(aggregate_id.to_string())
                .or_default()
                .insert(PositionInfo::new(info.position, seq));
            self.sequence_numbers
                .entry(aggregate_id.to_string())
                .or_insert_with(|| Arc::new(AtomicI64::new(-1)))
                .store(seq as i64, Ordering::Release);
        }
    }

    fn remove_segment(&self, segment: u64) {
        self.positions.remove(&segment);
        self.read_buffers.remove(&segment);
        let context = &self.context.context;
        remove_file(&self.properties.data_file(context, segment));
        remove_file(&self.properties.index_file(context, segment));
        remove_file(&self.properties.bloom_file(context, segment));
        metrics::segment_transition(&self.label, "removed");
    }

    /// Persists the index of a full segment and hands it to the next tier.
    fn complete_segment(&self, position: WritePosition) {
        let segment = position.segment;
        let Some(entry) = self.positions.get(&segment) else {
            debug!("{}: segment {} no longer present, skipping completion", self.label, segment);
            return;
        };
        let positions: AggregatePositions = entry
            .value()
            .iter()
            .map(|e| (e.key().clone(), e.value().iter().copied().collect()))
            .collect();
        if let Err(e) = self.index_manager.create_index(segment, positions, false) {
            warn!("{}: failed to create index for segment {}: {}", self.label, segment, e);
        }

        let Some(next) = &self.next else {
            return;
        };
        let store = self.self_ref.clone();
        let callback: HandoverCallback = Box::new(move || {
            let Some(store) = store.upgrade() else {
                return;
            };
            store.positions.remove(&segment);
            store.sequence_numbers.clear();
            if let Some((_, source)) = store.read_buffers.remove(&segment) {
                store
                    .executor
                    .schedule(store.properties.primary_cleanup_delay(), move || drop(source));
            }
            let remaining: Vec<u64> = store.positions.iter().map(|e| *e.key()).collect();
            debug!("{}: handed over {}, remaining segments: {:?}", store.label, segment, remaining);
            metrics::segment_transition(&store.label, "handed_over");
        });
        if let Err(e) = next.handover(segment, callback) {
            warn!("{}: handover of segment {} failed: {}", self.label, segment, e);
        }
    }
}

fn remove_file(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("failed to delete {}: {}", path.display(), e);
        }
    }
}

impl SegmentTier for PrimaryEventStore {
    fn context(&self) -> &str {
        &self.context.context
    }

    fn init(&self, last_initialized: u64) -> Result<()> {
        self.init_latest_segment(last_initialized, i64::MAX)
    }

    fn handover(&self, _segment: u64, callback: HandoverCallback) -> Result<()> {
        callback();
        Ok(())
    }

    fn rollback(&self, token: i64) -> Result<()> {
        if token >= self.last_token() {
            return Ok(());
        }
        info!("{}: rolling back to token {}", self.label, token);
        self.initialized.store(false, Ordering::Release);
        self.synchronizer.shutdown();

        for segment in self.segments() {
            if segment as i64 > token {
                self.remove_segment(segment);
            }
        }
        if self.positions.is_empty() {
            if let Some(next) = &self.next {
                next.rollback(token)?;
            }
        }
        self.init_latest_segment(u64::MAX, token + 1)
    }

    fn release(&self, segment: u64) {
        self.positions.remove(&segment);
        self.read_buffers.remove(&segment);
    }

    fn segments(&self) -> Vec<u64> {
        self.positions.iter().rev().map(|e| *e.key()).collect()
    }

    fn event_source(&self, segment: u64) -> Result<Option<Arc<dyn EventSource>>> {
        Ok(self
            .read_buffers
            .get(&segment)
            .map(|b| b.value().clone() as Arc<dyn EventSource>))
    }

    fn positions(&self, segment: u64, aggregate_id: &str) -> Result<Vec<PositionInfo>> {
        Ok(self
            .positions
            .get(&segment)
            .and_then(|entry| {
                entry
                    .value()
                    .get(aggregate_id)
                    .map(|set| set.iter().copied().collect())
            })
            .unwrap_or_default())
    }

    fn cleanup(&self) {
        self.initialized.store(false, Ordering::Release);
        self.synchronizer.shutdown();
        for entry in self.read_buffers.iter() {
            if let Err(e) = entry.value().flush() {
                warn!("{}: failed to flush segment {}: {}", self.label, entry.key(), e);
            }
        }
        self.executor.shutdown();
        if let Some(next) = &self.next {
            next.cleanup();
        }
    }

    fn backup_filenames(&self, last_segment_backed_up: i64) -> Vec<PathBuf> {
        self.next
            .as_ref()
            .map(|next| next.backup_filenames(last_segment_backed_up))
            .unwrap_or_default()
    }

    fn next(&self) -> Option<Arc<dyn SegmentTier>> {
        self.next.clone()
    }
}
