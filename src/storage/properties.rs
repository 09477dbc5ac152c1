use crate::storage::event::EventType;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Width of the zero-padded first-token part of a segment file name.
const SEGMENT_NAME_WIDTH: usize = 14;

/// Storage layout and retention settings for one event type.
///
/// Files for a segment live in `<storage>/<context>/` and are named after the
/// token of the first event in the segment, zero padded to 14 digits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageProperties {
    pub storage: PathBuf,
    pub events_suffix: String,
    pub index_suffix: String,
    pub bloom_index_suffix: String,
    pub segment_size: u64,
    pub bloom_index_fpp: f64,
    /// Interval between forced flushes of the writable segment, in milliseconds.
    pub force_interval_ms: u64,
    /// Number of most recent secondary segments whose index is validated on startup.
    pub validation_segments: usize,
    /// Number of segments the secondary tier keeps before handing them further down.
    pub number_of_segments: usize,
    pub primary_cleanup_delay_ms: u64,
    pub secondary_cleanup_delay_ms: u64,
    /// First retry delay when a segment file cannot be deleted yet.
    pub delete_retry_initial_ms: u64,
    /// Upper bound for the deletion retry delay.
    pub delete_retry_max_ms: u64,
    pub flags: i32,
}

impl Default for StorageProperties {
    fn default() -> Self {
        Self {
            storage: PathBuf::from("./data"),
            events_suffix: ".events".to_string(),
            index_suffix: ".index".to_string(),
            bloom_index_suffix: ".bloom".to_string(),
            segment_size: 256 * 1024 * 1024,
            bloom_index_fpp: 0.03,
            force_interval_ms: 1000,
            validation_segments: 10,
            number_of_segments: 5,
            primary_cleanup_delay_ms: 60_000,
            secondary_cleanup_delay_ms: 15_000,
            delete_retry_initial_ms: 1_000,
            delete_retry_max_ms: 60_000,
            flags: 0,
        }
    }
}

impl StorageProperties {
    pub fn new(storage: impl Into<PathBuf>) -> Self {
        Self {
            storage: storage.into(),
            ..Default::default()
        }
    }

    /// Properties for aggregate snapshots, stored next to the events with their own suffixes.
    pub fn for_event_type(&self, event_type: EventType) -> Self {
        match event_type {
            EventType::Event => self.clone(),
            EventType::Snapshot => Self {
                events_suffix: ".snapshots".to_string(),
                index_suffix: ".sindex".to_string(),
                bloom_index_suffix: ".sbloom".to_string(),
                ..self.clone()
            },
        }
    }

    pub fn with_segment_size(mut self, segment_size: u64) -> Self {
        self.segment_size = segment_size;
        self
    }

    pub fn storage_dir(&self, context: &str) -> PathBuf {
        self.storage.join(context)
    }

    pub fn data_file(&self, context: &str, segment: u64) -> PathBuf {
        self.segment_file(context, segment, &self.events_suffix)
    }

    pub fn index_file(&self, context: &str, segment: u64) -> PathBuf {
        self.segment_file(context, segment, &self.index_suffix)
    }

    pub fn index_temp_file(&self, context: &str, segment: u64) -> PathBuf {
        self.segment_file(context, segment, &format!("{}.temp", self.index_suffix))
    }

    pub fn bloom_file(&self, context: &str, segment: u64) -> PathBuf {
        self.segment_file(context, segment, &self.bloom_index_suffix)
    }

    pub fn force_interval(&self) -> Duration {
        Duration::from_millis(self.force_interval_ms)
    }

    pub fn primary_cleanup_delay(&self) -> Duration {
        Duration::from_millis(self.primary_cleanup_delay_ms)
    }

    pub fn secondary_cleanup_delay(&self) -> Duration {
        Duration::from_millis(self.secondary_cleanup_delay_ms)
    }

    /// Segment ids of all data files in the context directory, unordered.
    pub fn list_segments(&self, context: &str) -> std::io::Result<Vec<u64>> {
        let dir = self.storage_dir(context);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut segments = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            if let Some(segment) = self.segment_from_file_name(&entry.path()) {
                segments.push(segment);
            }
        }
        Ok(segments)
    }

    /// Parses the segment id from a data file name, `None` for other files.
    pub fn segment_from_file_name(&self, path: &Path) -> Option<u64> {
        let name = path.file_name()?.to_str()?;
        let stem = name.strip_suffix(self.events_suffix.as_str())?;
        if stem.is_empty() || !stem.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        stem.parse().ok()
    }

    fn segment_file(&self, context: &str, segment: u64, suffix: &str) -> PathBuf {
        self.storage_dir(context).join(format!(
            "{:0width$}{}",
            segment,
            suffix,
            width = SEGMENT_NAME_WIDTH
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_naming() {
        let props = StorageProperties::new("/var/events");
        assert_eq!(
            props.data_file("default", 42),
            PathBuf::from("/var/events/default/00000000000042.events")
        );
        assert_eq!(
            props.index_file("default", 0),
            PathBuf::from("/var/events/default/00000000000000.index")
        );
        assert_eq!(
            props.bloom_file("ctx", 1234),
            PathBuf::from("/var/events/ctx/00000000001234.bloom")
        );
        assert_eq!(
            props.index_temp_file("ctx", 7),
            PathBuf::from("/var/events/ctx/00000000000007.index.temp")
        );
    }

    #[test]
    fn test_segment_from_file_name() {
        let props = StorageProperties::new("/tmp");
        assert_eq!(
            props.segment_from_file_name(Path::new("00000000000100.events")),
            Some(100)
        );
        assert_eq!(props.segment_from_file_name(Path::new("00000000000100.index")), None);
        assert_eq!(props.segment_from_file_name(Path::new("abc.events")), None);
    }

    #[test]
    fn test_snapshot_suffixes() {
        let props = StorageProperties::new("/tmp").for_event_type(EventType::Snapshot);
        assert_eq!(
            props.data_file("c", 5),
            PathBuf::from("/tmp/c/00000000000005.snapshots")
        );
        assert_eq!(props.segment_size, StorageProperties::default().segment_size);
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let props: StorageProperties =
            serde_json::from_str(r#"{"storage": "/data", "segment_size": 1024}"#).unwrap();
        assert_eq!(props.segment_size, 1024);
        assert_eq!(props.events_suffix, ".events");
        assert_eq!(props.number_of_segments, 5);
    }
}
