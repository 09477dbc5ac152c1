use crate::error::Result;
use crate::metrics;
use crate::storage::event::EventTypeContext;
use crate::storage::index::{AggregatePositions, IndexManager, PositionInfo};
use crate::storage::properties::StorageProperties;
use crate::storage::scheduler::DelayedExecutor;
use crate::storage::segment::{EventIterator, EventSource, ReadOnlySegment};
use crate::storage::tier::{HandoverCallback, SegmentTier};
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeSet;
use std::fs;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Segments remembered by the mapping cache.
const CACHED_SEGMENTS: usize = 32;

/// The read tier holding completed segments.
///
/// Segments are mapped on demand. The cache only holds weak references, so a
/// segment is unmapped as soon as the last reader drops its `Arc`, and readers
/// running at the same time share one mapping.
pub struct SecondaryEventStore {
    context: EventTypeContext,
    label: String,
    properties: StorageProperties,
    index_manager: Arc<IndexManager>,
    segments: RwLock<BTreeSet<u64>>,
    cache: Mutex<LruCache<u64, Weak<ReadOnlySegment>>>,
    executor: DelayedExecutor,
    next: Option<Arc<dyn SegmentTier>>,
    self_ref: Weak<SecondaryEventStore>,
}

impl SecondaryEventStore {
    pub fn new(
        context: EventTypeContext,
        index_manager: Arc<IndexManager>,
        properties: StorageProperties,
        next: Option<Arc<dyn SegmentTier>>,
    ) -> Arc<Self> {
        let label = context.to_string();
        Arc::new_cyclic(|weak| Self {
            executor: DelayedExecutor::new(format!("{}-secondary", label)),
            label,
            context,
            properties,
            index_manager,
            segments: RwLock::new(BTreeSet::new()),
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(CACHED_SEGMENTS).unwrap_or(NonZeroUsize::MIN),
            )),
            next,
            self_ref: weak.clone(),
        })
    }

    /// Scans a segment and writes a fresh index for it.
    fn recreate_index(&self, segment: u64) -> Result<()> {
        info!("{}: recreating index for segment {}", self.label, segment);
        let source: Arc<dyn EventSource> = self.open_segment(segment)?;
        let mut positions = AggregatePositions::new();
        for info in EventIterator::new(source, segment as i64)? {
            let info = info?;
            if let Some(aggregate_id) = info.event.aggregate_id() {
                positions
                    .entry(aggregate_id.to_string())
                    .or_default()
                    .push(PositionInfo::new(
                        info.position,
                        info.event.aggregate_sequence_number,
                    ));
            }
        }
        for list in positions.values_mut() {
            list.sort();
        }
        self.index_manager.create_index(segment, positions, true)
    }

    fn open_segment(&self, segment: u64) -> Result<Arc<ReadOnlySegment>> {
        if let Some(cached) = self.cache.lock().get(&segment).and_then(Weak::upgrade) {
            return Ok(cached);
        }
        let path = self.properties.data_file(&self.context.context, segment);
        let opened = Arc::new(ReadOnlySegment::open(&path, segment)?);
        self.cache.lock().put(segment, Arc::downgrade(&opened));
        Ok(opened)
    }

    /// Hands the oldest segments beyond the retention count to the next tier.
    fn hand_over_excess(&self, next: &Arc<dyn SegmentTier>) {
        let excess: Vec<u64> = {
            let segments = self.segments.read();
            let keep = self.properties.number_of_segments;
            if segments.len() <= keep {
                return;
            }
            segments
                .iter()
                .take(segments.len() - keep)
                .copied()
                .collect()
        };
        for segment in excess {
            let store = self.self_ref.clone();
            let callback: HandoverCallback = Box::new(move || {
                if let Some(store) = store.upgrade() {
                    store.retire(segment);
                }
            });
            if let Err(e) = next.handover(segment, callback) {
                warn!("{}: handover of segment {} failed: {}", self.label, segment, e);
            }
        }
    }

    /// Drops a segment the next tier now owns and schedules its files for deletion.
    fn retire(&self, segment: u64) {
        self.segments.write().remove(&segment);
        self.index_manager.remove(segment);
        self.cache.lock().pop(&segment);
        let executor = self.executor.clone();
        let files = self.segment_files(segment);
        let label = self.label.clone();
        let initial = Duration::from_millis(self.properties.delete_retry_initial_ms);
        let max = Duration::from_millis(self.properties.delete_retry_max_ms);
        self.executor
            .schedule(self.properties.secondary_cleanup_delay(), move || {
                delete_with_retry(executor, label, files, initial, max);
            });
        metrics::segment_transition(&self.label, "handed_over");
    }

    fn segment_files(&self, segment: u64) -> Vec<PathBuf> {
        let context = &self.context.context;
        vec![
            self.properties.data_file(context, segment),
            self.properties.index_file(context, segment),
            self.properties.bloom_file(context, segment),
        ]
    }
}

/// Deletes `files`, rescheduling itself with a doubled delay while any of them
/// cannot be removed yet.
fn delete_with_retry(
    executor: DelayedExecutor,
    label: String,
    files: Vec<PathBuf>,
    delay: Duration,
    max: Duration,
) {
    let remaining: Vec<PathBuf> = files.into_iter().filter(|f| !delete_file(f)).collect();
    if remaining.is_empty() {
        metrics::segment_transition(&label, "deleted");
        return;
    }
    warn!(
        "{}: {} files still in use, retrying in {:?}",
        label,
        remaining.len(),
        delay
    );
    let next_delay = (delay * 2).min(max);
    let retry_executor = executor.clone();
    executor.schedule(delay, move || {
        delete_with_retry(retry_executor, label, remaining, next_delay, max)
    });
}

/// True when the file is gone afterwards.
fn delete_file(path: &Path) -> bool {
    match fs::remove_file(path) {
        Ok(()) => true,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
        Err(e) => {
            debug!("failed to delete {}: {}", path.display(), e);
            false
        }
    }
}

impl SegmentTier for SecondaryEventStore {
    fn context(&self) -> &str {
        &self.context.context
    }

    fn init(&self, last_initialized: u64) -> Result<()> {
        let found: BTreeSet<u64> = self
            .properties
            .list_segments(&self.context.context)?
            .into_iter()
            .filter(|segment| *segment < last_initialized)
            .collect();
        let oldest = found.iter().next().copied();
        *self.segments.write() = found.clone();

        for segment in found.iter().rev().take(self.properties.validation_segments) {
            if self.index_manager.valid_index(*segment) {
                break;
            }
            self.recreate_index(*segment)?;
        }
        debug!("{}: secondary segments {:?}", self.label, found);

        if let Some(next) = &self.next {
            next.init(oldest.unwrap_or(last_initialized))?;
        }
        Ok(())
    }

    fn handover(&self, segment: u64, callback: HandoverCallback) -> Result<()> {
        self.segments.write().insert(segment);
        callback();
        if let Some(next) = &self.next {
            self.hand_over_excess(next);
        }
        Ok(())
    }

    fn rollback(&self, token: i64) -> Result<()> {
        let removed: Vec<u64> = {
            let mut segments = self.segments.write();
            let removed: Vec<u64> = segments
                .iter()
                .filter(|s| **s as i64 > token)
                .copied()
                .collect();
            for segment in &removed {
                segments.remove(segment);
            }
            removed
        };
        for segment in removed {
            info!("{}: rollback removes segment {}", self.label, segment);
            self.cache.lock().pop(&segment);
            self.index_manager.remove(segment);
            let files = self.segment_files(segment);
            let initial = Duration::from_millis(self.properties.delete_retry_initial_ms);
            let max = Duration::from_millis(self.properties.delete_retry_max_ms);
            delete_with_retry(self.executor.clone(), self.label.clone(), files, initial, max);
            metrics::segment_transition(&self.label, "removed");
        }

        if self.segments.read().is_empty() {
            if let Some(next) = &self.next {
                next.rollback(token)?;
            }
        }
        Ok(())
    }

    fn release(&self, segment: u64) {
        self.segments.write().remove(&segment);
        self.cache.lock().pop(&segment);
        self.index_manager.remove(segment);
    }

    fn segments(&self) -> Vec<u64> {
        self.segments.read().iter().rev().copied().collect()
    }

    fn event_source(&self, segment: u64) -> Result<Option<Arc<dyn EventSource>>> {
        if !self.segments.read().contains(&segment) {
            return Ok(None);
        }
        let source: Arc<dyn EventSource> = self.open_segment(segment)?;
        Ok(Some(source))
    }

    fn positions(&self, segment: u64, aggregate_id: &str) -> Result<Vec<PositionInfo>> {
        match self.index_manager.positions(segment, aggregate_id) {
            Ok(positions) => Ok(positions),
            Err(e) => {
                warn!("{}: index of segment {} unreadable: {}", self.label, segment, e);
                self.recreate_index(segment)?;
                self.index_manager.positions(segment, aggregate_id)
            }
        }
    }

    fn cleanup(&self) {
        self.cache.lock().clear();
        self.index_manager.cleanup();
        self.executor.shutdown();
        if let Some(next) = &self.next {
            next.cleanup();
        }
    }

    fn backup_filenames(&self, last_segment_backed_up: i64) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = self
            .segments
            .read()
            .iter()
            .filter(|s| **s as i64 > last_segment_backed_up)
            .flat_map(|s| self.segment_files(*s))
            .filter(|f| f.exists())
            .collect();
        if let Some(next) = &self.next {
            files.extend(next.backup_filenames(last_segment_backed_up));
        }
        files
    }

    fn next(&self) -> Option<Arc<dyn SegmentTier>> {
        self.next.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::event::{Event, ProcessedEvent, SerializedObject};
    use crate::storage::segment::{transaction_size, event_block_size, WritableSegment, FILE_HEADER_SIZE};
    use parking_lot::Mutex as PlMutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::TempDir;

    /// Tier that records handovers and accepts them immediately.
    struct RecordingTier {
        received: PlMutex<Vec<u64>>,
    }

    impl SegmentTier for RecordingTier {
        fn context(&self) -> &str {
            "default"
        }
        fn init(&self, _last_initialized: u64) -> Result<()> {
            Ok(())
        }
        fn handover(&self, segment: u64, callback: HandoverCallback) -> Result<()> {
            self.received.lock().push(segment);
            callback();
            Ok(())
        }
        fn rollback(&self, _token: i64) -> Result<()> {
            Ok(())
        }
        fn release(&self, _segment: u64) {}
        fn segments(&self) -> Vec<u64> {
            self.received.lock().iter().rev().copied().collect()
        }
        fn event_source(&self, _segment: u64) -> Result<Option<Arc<dyn EventSource>>> {
            Ok(None)
        }
        fn positions(&self, _segment: u64, _aggregate_id: &str) -> Result<Vec<PositionInfo>> {
            Ok(Vec::new())
        }
        fn cleanup(&self) {}
        fn backup_filenames(&self, _last: i64) -> Vec<PathBuf> {
            Vec::new()
        }
        fn next(&self) -> Option<Arc<dyn SegmentTier>> {
            None
        }
    }

    fn write_segment(properties: &StorageProperties, segment: u64, aggregate: &str, count: u64) {
        fs::create_dir_all(properties.storage_dir("default")).unwrap();
        let buffer = WritableSegment::open(
            &properties.data_file("default", segment),
            segment,
            properties.segment_size,
            0,
        )
        .unwrap();
        let mut position = FILE_HEADER_SIZE;
        for seq in 0..count {
            let event = Event::domain(aggregate, seq, "Order", SerializedObject::new("Created", vec![7; 16]));
            let processed = vec![ProcessedEvent::new(&event).unwrap()];
            buffer.write_transaction(position, &processed).unwrap();
            position += transaction_size(event_block_size(&processed));
        }
        buffer.flush().unwrap();
    }

    fn properties(dir: &TempDir) -> StorageProperties {
        let mut properties = StorageProperties::new(dir.path()).with_segment_size(4096);
        properties.secondary_cleanup_delay_ms = 0;
        properties.delete_retry_initial_ms = 10;
        properties.number_of_segments = 2;
        properties
    }

    #[test]
    fn test_init_recreates_missing_index() {
        let dir = TempDir::new().unwrap();
        let properties = properties(&dir);
        write_segment(&properties, 0, "a", 5);
        write_segment(&properties, 5, "b", 3);

        let index_manager = Arc::new(IndexManager::new("default", properties.clone()));
        let store = SecondaryEventStore::new(
            EventTypeContext::events("default"),
            index_manager.clone(),
            properties.clone(),
            None,
        );
        store.init(100).unwrap();

        assert_eq!(store.segments(), vec![5, 0]);
        assert!(index_manager.valid_index(5));
        assert!(index_manager.valid_index(0));
        let positions = store.positions(0, "a").unwrap();
        assert_eq!(positions.len(), 5);
        assert_eq!(positions[4].aggregate_sequence_number, 4);
        assert!(store.positions(5, "a").unwrap().is_empty());
        store.cleanup();
    }

    #[test]
    fn test_unused_mappings_are_released() {
        let dir = TempDir::new().unwrap();
        let properties = properties(&dir);
        write_segment(&properties, 0, "a", 3);

        let store = SecondaryEventStore::new(
            EventTypeContext::events("default"),
            Arc::new(IndexManager::new("default", properties.clone())),
            properties,
            None,
        );
        store.init(100).unwrap();

        let first = store.open_segment(0).unwrap();
        let shared = store.open_segment(0).unwrap();
        assert!(Arc::ptr_eq(&first, &shared));
        let weak = Arc::downgrade(&first);
        drop(first);
        drop(shared);
        assert!(weak.upgrade().is_none());

        let reopened = store.event_source(0).unwrap().unwrap();
        assert_eq!(reopened.segment(), 0);
        store.cleanup();
    }

    #[test]
    fn test_handover_passes_excess_down_the_chain() {
        let dir = TempDir::new().unwrap();
        let properties = properties(&dir);
        for segment in [0u64, 10, 20] {
            write_segment(&properties, segment, "a", 1);
        }
        let next = Arc::new(RecordingTier {
            received: PlMutex::new(Vec::new()),
        });
        let store = SecondaryEventStore::new(
            EventTypeContext::events("default"),
            Arc::new(IndexManager::new("default", properties.clone())),
            properties.clone(),
            Some(next.clone() as Arc<dyn SegmentTier>),
        );

        let called = Arc::new(AtomicBool::new(false));
        for segment in [0u64, 10, 20] {
            let flag = called.clone();
            store
                .handover(segment, Box::new(move || flag.store(true, Ordering::SeqCst)))
                .unwrap();
        }
        assert!(called.load(Ordering::SeqCst));
        assert_eq!(*next.received.lock(), vec![0]);
        assert_eq!(store.segments(), vec![20, 10]);

        store.cleanup();
        assert!(!properties.data_file("default", 0).exists());
        assert!(properties.data_file("default", 10).exists());
    }

    #[test]
    fn test_rollback_and_backup_filenames() {
        let dir = TempDir::new().unwrap();
        let properties = properties(&dir);
        for segment in [0u64, 10, 20] {
            write_segment(&properties, segment, "a", 1);
        }
        let store = SecondaryEventStore::new(
            EventTypeContext::events("default"),
            Arc::new(IndexManager::new("default", properties.clone())),
            properties.clone(),
            None,
        );
        store.init(u64::MAX).unwrap();

        let files = store.backup_filenames(0);
        assert!(files.contains(&properties.data_file("default", 10)));
        assert!(files.contains(&properties.index_file("default", 20)));
        assert!(!files.contains(&properties.data_file("default", 0)));

        store.rollback(15).unwrap();
        assert_eq!(store.segments(), vec![10, 0]);
        assert!(!properties.data_file("default", 20).exists());
        assert!(store.event_source(20).unwrap().is_none());
        assert!(store.event_source(10).unwrap().is_some());
        store.cleanup();
    }
}
