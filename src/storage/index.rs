use crate::error::{Error, Result};
use crate::storage::properties::StorageProperties;
use bincode::{config, Decode, Encode};
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tracing::{debug, warn};

const INDEX_VERSION: u8 = 1;
const BLOOM_VERSION: u8 = 1;
const CACHED_INDEXES: usize = 64;

/// Location of one domain event inside a segment. Ordered by sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Encode, Decode)]
pub struct PositionInfo {
    pub aggregate_sequence_number: u64,
    pub position: usize,
}

impl PositionInfo {
    pub fn new(position: usize, aggregate_sequence_number: u64) -> Self {
        Self {
            aggregate_sequence_number,
            position,
        }
    }
}

/// Aggregate positions of one segment, keyed by aggregate identifier.
pub type AggregatePositions = BTreeMap<String, Vec<PositionInfo>>;

/// Bloom filter over the aggregate identifiers in a segment.
///
/// Uses double hashing over two crc32 variants so the bit layout can be
/// written to disk and read back.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct PersistedBloomFilter {
    bits: Vec<u64>,
    num_bits: u64,
    num_hashes: u32,
}

impl PersistedBloomFilter {
    pub fn with_rate(fpp: f64, expected: usize) -> Self {
        let expected = expected.max(1) as f64;
        let fpp = fpp.clamp(1e-9, 0.5);
        let ln2 = std::f64::consts::LN_2;
        let num_bits = ((-expected * fpp.ln()) / (ln2 * ln2)).ceil().max(64.0) as u64;
        let num_hashes = ((num_bits as f64 / expected) * ln2).round().clamp(1.0, 16.0) as u32;
        Self {
            bits: vec![0; num_bits.div_ceil(64) as usize],
            num_bits,
            num_hashes,
        }
    }

    fn hashes(key: &str) -> (u64, u64) {
        let h1 = crc32fast::hash(key.as_bytes()) as u64;
        let mut hasher = crc32fast::Hasher::new_with_initial(0x9e37_79b9);
        hasher.update(key.as_bytes());
        let h2 = (hasher.finalize() as u64) | 1;
        (h1, h2)
    }

    fn bit_indexes(&self, key: &str) -> impl Iterator<Item = u64> + '_ {
        let (h1, h2) = Self::hashes(key);
        (0..self.num_hashes as u64).map(move |i| h1.wrapping_add(i.wrapping_mul(h2)) % self.num_bits)
    }

    pub fn insert(&mut self, key: &str) {
        let indexes: Vec<u64> = self.bit_indexes(key).collect();
        for bit in indexes {
            self.bits[(bit / 64) as usize] |= 1 << (bit % 64);
        }
    }

    pub fn might_contain(&self, key: &str) -> bool {
        self.bit_indexes(key)
            .all(|bit| self.bits[(bit / 64) as usize] & (1 << (bit % 64)) != 0)
    }
}

#[derive(Debug, Encode, Decode)]
struct IndexFile {
    positions: AggregatePositions,
}

/// An index loaded from disk.
pub struct SegmentIndex {
    positions: AggregatePositions,
    bloom: Option<PersistedBloomFilter>,
}

impl SegmentIndex {
    pub fn positions(&self, aggregate_id: &str) -> Option<&Vec<PositionInfo>> {
        self.positions.get(aggregate_id)
    }

    pub fn might_contain(&self, aggregate_id: &str) -> bool {
        match &self.bloom {
            Some(bloom) => bloom.might_contain(aggregate_id),
            None => self.positions.contains_key(aggregate_id),
        }
    }
}

/// Writes, validates and caches the per-segment aggregate indexes of one context.
pub struct IndexManager {
    context: String,
    properties: StorageProperties,
    cache: Mutex<LruCache<u64, Arc<SegmentIndex>>>,
}

impl IndexManager {
    pub fn new(context: impl Into<String>, properties: StorageProperties) -> Self {
        Self {
            context: context.into(),
            properties,
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(CACHED_INDEXES).unwrap_or(NonZeroUsize::MIN),
            )),
        }
    }

    /// Persists the index and bloom filter of a completed segment.
    ///
    /// The index is written to a temporary file and renamed, so a crash leaves
    /// either no index or a complete one.
    pub fn create_index(&self, segment: u64, positions: AggregatePositions, force: bool) -> Result<()> {
        let index_file = self.properties.index_file(&self.context, segment);
        if index_file.exists() && !force {
            return Ok(());
        }

        let mut bloom =
            PersistedBloomFilter::with_rate(self.properties.bloom_index_fpp, positions.len());
        for aggregate_id in positions.keys() {
            bloom.insert(aggregate_id);
        }
        write_checked(
            &self.properties.bloom_file(&self.context, segment),
            &self.properties.index_temp_file(&self.context, segment),
            BLOOM_VERSION,
            &bincode::encode_to_vec(&bloom, config::standard())?,
        )?;

        let data = bincode::encode_to_vec(IndexFile { positions }, config::standard())?;
        write_checked(
            &index_file,
            &self.properties.index_temp_file(&self.context, segment),
            INDEX_VERSION,
            &data,
        )?;
        self.cache.lock().pop(&segment);
        debug!("{}: created index for segment {}", self.context, segment);
        Ok(())
    }

    /// True when the index file and bloom filter of the segment can be read back.
    pub fn valid_index(&self, segment: u64) -> bool {
        match self.load(segment) {
            Ok(index) => index.bloom.is_some(),
            Err(e) => {
                debug!("{}: index of segment {} invalid: {}", self.context, segment, e);
                false
            }
        }
    }

    pub fn positions(&self, segment: u64, aggregate_id: &str) -> Result<Vec<PositionInfo>> {
        let index = self.get(segment)?;
        if !index.might_contain(aggregate_id) {
            return Ok(Vec::new());
        }
        Ok(index.positions(aggregate_id).cloned().unwrap_or_default())
    }

    pub fn might_contain(&self, segment: u64, aggregate_id: &str) -> Result<bool> {
        Ok(self.get(segment)?.might_contain(aggregate_id))
    }

    /// Drops the cached index of a segment.
    pub fn remove(&self, segment: u64) {
        self.cache.lock().pop(&segment);
    }

    pub fn cleanup(&self) {
        self.cache.lock().clear();
    }

    fn get(&self, segment: u64) -> Result<Arc<SegmentIndex>> {
        if let Some(index) = self.cache.lock().get(&segment) {
            return Ok(index.clone());
        }
        let index = Arc::new(self.load(segment)?);
        self.cache.lock().put(segment, index.clone());
        Ok(index)
    }

    fn load(&self, segment: u64) -> Result<SegmentIndex> {
        let data = read_checked(
            &self.properties.index_file(&self.context, segment),
            INDEX_VERSION,
            segment,
        )?;
        let (file, _): (IndexFile, usize) = bincode::decode_from_slice(&data, config::standard())?;

        let bloom = match read_checked(
            &self.properties.bloom_file(&self.context, segment),
            BLOOM_VERSION,
            segment,
        ) {
            Ok(data) => Some(bincode::decode_from_slice(&data, config::standard())?.0),
            Err(e) => {
                warn!("{}: bloom filter of segment {} unusable: {}", self.context, segment, e);
                None
            }
        };

        Ok(SegmentIndex {
            positions: file.positions,
            bloom,
        })
    }
}

/// `{version: u8, length: u32, data, crc32: u32}`
fn write_checked(path: &std::path::Path, temp: &std::path::Path, version: u8, data: &[u8]) -> Result<()> {
    {
        let mut file = File::create(temp)?;
        file.write_all(&[version])?;
        file.write_all(&(data.len() as u32).to_be_bytes())?;
        file.write_all(data)?;
        file.write_all(&crc32fast::hash(data).to_be_bytes())?;
        file.sync_all()?;
    }
    fs::rename(temp, path)?;
    Ok(())
}

fn read_checked(path: &std::path::Path, version: u8, segment: u64) -> Result<Vec<u8>> {
    let bytes = fs::read(path)?;
    if bytes.len() < 9 || bytes[0] != version {
        return Err(Error::InvalidIndex { segment });
    }
    let mut len = [0u8; 4];
    len.copy_from_slice(&bytes[1..5]);
    let len = u32::from_be_bytes(len) as usize;
    if bytes.len() != 9 + len {
        return Err(Error::InvalidIndex { segment });
    }
    let data = &bytes[5..5 + len];
    let mut stored = [0u8; 4];
    stored.copy_from_slice(&bytes[5 + len..]);
    if crc32fast::hash(data) != u32::from_be_bytes(stored) {
        return Err(Error::InvalidIndex { segment });
    }
    Ok(data.to_vec())
}
