//! Binary layout of segment files and read/write access to mapped segments.
//!
//! A segment file starts with a 5 byte header `{version: u8, flags: i32}` followed by
//! transaction blocks:
//!
//! ```text
//! blockSize: i32 | version: u8 | eventCount: u16 | events[{length: i32, bytes}] | checksum: i32
//! ```
//!
//! `blockSize` is the size of the events region. A zero block size marks the end of
//! the written data, `-1` marks that the writer moved on to the next segment. All
//! integers are big-endian.

use crate::error::{Error, Result};
use crate::storage::event::{Event, EventInformation, ProcessedEvent, TransactionWithToken};
use memmap2::{Mmap, MmapMut, MmapOptions};
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

pub const VERSION: u8 = 1;
pub const FILE_HEADER_SIZE: usize = 5;
pub const TX_HEADER_SIZE: usize = 7;
pub const TX_CHECKSUM_SIZE: usize = 4;
pub const EVENT_LENGTH_SIZE: usize = 4;
pub const OVERFLOW_MARKER: i32 = -1;
/// File header plus the trailing end-of-data marker.
pub const SEGMENT_OVERHEAD: usize = FILE_HEADER_SIZE + 4;
pub const MAX_EVENTS_PER_TRANSACTION: usize = u16::MAX as usize;

/// Size of the events region for a list of events.
pub fn event_block_size(events: &[ProcessedEvent]) -> usize {
    events
        .iter()
        .map(|e| EVENT_LENGTH_SIZE + e.serialized_size())
        .sum()
}

/// Bytes claimed in a segment for a transaction with the given events region.
pub fn transaction_size(event_block_size: usize) -> usize {
    TX_HEADER_SIZE + event_block_size + TX_CHECKSUM_SIZE
}

/// Encodes everything after the block size field. The block size is written
/// last so that a torn write reads back as end of data.
pub fn encode_transaction_body(events: &[ProcessedEvent]) -> Vec<u8> {
    let block_size = event_block_size(events);
    let mut body = Vec::with_capacity(3 + block_size + TX_CHECKSUM_SIZE);
    body.push(VERSION);
    body.extend_from_slice(&(events.len() as u16).to_be_bytes());
    for event in events {
        body.extend_from_slice(&(event.serialized_size() as i32).to_be_bytes());
        body.extend_from_slice(event.bytes());
    }
    let checksum = crc32fast::hash(&body[3..]) as i32;
    body.extend_from_slice(&checksum.to_be_bytes());
    body
}

/// Offsets of each event's length field relative to the start of the block.
pub fn event_offsets(events: &[ProcessedEvent]) -> Vec<usize> {
    let mut offsets = Vec::with_capacity(events.len());
    let mut offset = TX_HEADER_SIZE;
    for event in events {
        offsets.push(offset);
        offset += EVENT_LENGTH_SIZE + event.serialized_size();
    }
    offsets
}

fn read_i32(bytes: &[u8]) -> i32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[..4]);
    i32::from_be_bytes(buf)
}

fn read_u16(bytes: &[u8]) -> u16 {
    let mut buf = [0u8; 2];
    buf.copy_from_slice(&bytes[..2]);
    u16::from_be_bytes(buf)
}

/// A mapped segment that can be read.
pub trait EventSource: Send + Sync {
    /// Token of the first event, also the segment id.
    fn segment(&self) -> u64;

    fn capacity(&self) -> usize;

    /// Upper bound of the bytes that readers may look at.
    fn readable_limit(&self) -> usize;

    /// Bytes in `[position, position + len)`, which must lie below the readable limit.
    fn bytes(&self, position: usize, len: usize) -> Result<&[u8]>;
}

fn check_range(segment: u64, position: usize, len: usize, limit: usize) -> Result<()> {
    match position.checked_add(len) {
        Some(end) if end <= limit => Ok(()),
        _ => Err(Error::InvalidSegment {
            segment,
            reason: format!("read of {} bytes at {} beyond limit {}", len, position, limit),
        }),
    }
}

/// The segment currently being written by the primary tier.
///
/// Writers copy into disjoint claimed ranges through a raw pointer into the
/// mapping; readers only see bytes below the committed limit published by the
/// synchronizer.
pub struct WritableSegment {
    segment: u64,
    mmap: MmapMut,
    ptr: *mut u8,
    len: usize,
    committed: AtomicUsize,
}

// SAFETY: concurrent writes only target ranges handed out once by the claim
// protocol, and reads are bounded by the committed limit which is only advanced
// after the writes below it have completed.
unsafe impl Send for WritableSegment {}
unsafe impl Sync for WritableSegment {}

impl WritableSegment {
    /// Opens or creates the data file. New files get `size` bytes, existing files
    /// keep their length.
    pub fn open(path: &Path, segment: u64, size: u64, flags: i32) -> Result<Self> {
        let exists = path.exists();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        if !exists || file.metadata()?.len() == 0 {
            file.set_len(size)?;
        }
        let len = file.metadata()?.len() as usize;
        if len < SEGMENT_OVERHEAD {
            return Err(Error::InvalidSegment {
                segment,
                reason: format!("file too small: {} bytes", len),
            });
        }

        let mut mmap = unsafe { MmapOptions::new().len(len).map_mut(&file)? };
        mmap[0] = VERSION;
        mmap[1..FILE_HEADER_SIZE].copy_from_slice(&flags.to_be_bytes());
        let ptr = mmap.as_mut_ptr();

        Ok(Self {
            segment,
            mmap,
            ptr,
            len,
            committed: AtomicUsize::new(FILE_HEADER_SIZE),
        })
    }

    /// Copies `data` into the mapping at `position`.
    ///
    /// The range must have been claimed by the caller and not be visible to readers yet.
    pub fn write_at(&self, position: usize, data: &[u8]) -> Result<()> {
        check_range(self.segment, position, data.len(), self.len)?;
        // SAFETY: bounds checked above, range owned by the caller's claim.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.add(position), data.len());
        }
        Ok(())
    }

    pub fn write_i32(&self, position: usize, value: i32) -> Result<()> {
        self.write_at(position, &value.to_be_bytes())
    }

    /// Writes a complete transaction block at a claimed position.
    pub fn write_transaction(&self, position: usize, events: &[ProcessedEvent]) -> Result<()> {
        let body = encode_transaction_body(events);
        self.write_at(position + 4, &body)?;
        self.write_i32(position, event_block_size(events) as i32)
    }

    /// Zeroes `[from, to)`, used to wipe data left behind a rollback.
    pub fn clear_range(&self, from: usize, to: usize) -> Result<()> {
        let to = to.min(self.len);
        if from >= to {
            return Ok(());
        }
        check_range(self.segment, from, to - from, self.len)?;
        // SAFETY: bounds checked above, no writer owns a claim past the end of data.
        unsafe {
            std::ptr::write_bytes(self.ptr.add(from), 0, to - from);
        }
        Ok(())
    }

    /// Makes bytes up to `limit` visible to readers. The limit never moves backwards.
    pub fn set_committed(&self, limit: usize) {
        self.committed.fetch_max(limit.min(self.len), Ordering::AcqRel);
    }

    /// Resets the committed limit, used when the segment is rescanned after a rollback.
    pub fn reset_committed(&self, limit: usize) {
        self.committed.store(limit.min(self.len), Ordering::Release);
    }

    pub fn flush(&self) -> Result<()> {
        self.mmap.flush()?;
        Ok(())
    }

    /// A source over the whole mapping, ignoring the committed limit. Only for
    /// recovery scans while no writer is active.
    pub fn recovery_source(self: &Arc<Self>) -> Arc<dyn EventSource> {
        Arc::new(RecoverySource(self.clone()))
    }

    /// Marks the rest of the segment as unused so readers move on to the next one.
    pub fn mark_overflow(&self, position: usize) -> Result<()> {
        if position + 4 <= self.len {
            self.write_i32(position, OVERFLOW_MARKER)?;
        }
        Ok(())
    }
}

impl EventSource for WritableSegment {
    fn segment(&self) -> u64 {
        self.segment
    }

    fn capacity(&self) -> usize {
        self.len
    }

    fn readable_limit(&self) -> usize {
        self.committed.load(Ordering::Acquire)
    }

    fn bytes(&self, position: usize, len: usize) -> Result<&[u8]> {
        check_range(self.segment, position, len, self.readable_limit())?;
        // SAFETY: bytes below the committed limit are no longer written to.
        Ok(unsafe { std::slice::from_raw_parts(self.ptr.add(position), len) })
    }
}

struct RecoverySource(Arc<WritableSegment>);

impl EventSource for RecoverySource {
    fn segment(&self) -> u64 {
        self.0.segment
    }

    fn capacity(&self) -> usize {
        self.0.len
    }

    fn readable_limit(&self) -> usize {
        self.0.len
    }

    fn bytes(&self, position: usize, len: usize) -> Result<&[u8]> {
        check_range(self.0.segment, position, len, self.0.len)?;
        // SAFETY: recovery runs before writers are admitted.
        Ok(unsafe { std::slice::from_raw_parts(self.0.ptr.add(position), len) })
    }
}

/// A completed segment mapped read-only.
pub struct ReadOnlySegment {
    segment: u64,
    mmap: Mmap,
}

impl ReadOnlySegment {
    pub fn open(path: &Path, segment: u64) -> Result<Self> {
        let file = File::open(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::SegmentNotFound(segment)
            } else {
                Error::Io(e)
            }
        })?;
        let mmap = unsafe { Mmap::map(&file)? };
        if mmap.len() < FILE_HEADER_SIZE {
            return Err(Error::InvalidSegment {
                segment,
                reason: "missing file header".to_string(),
            });
        }
        Ok(Self { segment, mmap })
    }

    pub fn version(&self) -> u8 {
        self.mmap[0]
    }

    pub fn flags(&self) -> i32 {
        read_i32(&self.mmap[1..FILE_HEADER_SIZE])
    }
}

impl EventSource for ReadOnlySegment {
    fn segment(&self) -> u64 {
        self.segment
    }

    fn capacity(&self) -> usize {
        self.mmap.len()
    }

    fn readable_limit(&self) -> usize {
        self.mmap.len()
    }

    fn bytes(&self, position: usize, len: usize) -> Result<&[u8]> {
        check_range(self.segment, position, len, self.mmap.len())?;
        Ok(&self.mmap[position..position + len])
    }
}

/// One event inside a block, still encoded.
#[derive(Debug, Clone)]
pub struct EncodedEvent {
    /// Offset of the event's length field in the segment.
    pub position: usize,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct TransactionBlock {
    pub position: usize,
    pub version: u8,
    pub events: Vec<EncodedEvent>,
    pub next_position: usize,
}

#[derive(Debug, Clone)]
pub enum BlockRead {
    End,
    Overflow,
    Transaction(TransactionBlock),
}

/// A private cursor over a shared segment mapping.
///
/// Cloning via [`SegmentView::duplicate`] gives an independent position, so
/// concurrent scans never share cursor state.
#[derive(Clone)]
pub struct SegmentView {
    source: Arc<dyn EventSource>,
    position: usize,
}

impl SegmentView {
    pub fn new(source: Arc<dyn EventSource>) -> Self {
        Self {
            source,
            position: FILE_HEADER_SIZE,
        }
    }

    pub fn duplicate(&self) -> Self {
        self.clone()
    }

    pub fn segment(&self) -> u64 {
        self.source.segment()
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn set_position(&mut self, position: usize) {
        self.position = position;
    }

    pub fn source(&self) -> &Arc<dyn EventSource> {
        &self.source
    }

    /// Reads the block at the current position and advances past it.
    pub fn read_block(&mut self) -> Result<BlockRead> {
        let block = self.peek_block(self.position)?;
        if let BlockRead::Transaction(tx) = &block {
            self.position = tx.next_position;
        }
        Ok(block)
    }

    /// Reads and validates the block at `position` without moving the cursor.
    pub fn peek_block(&self, position: usize) -> Result<BlockRead> {
        let limit = self.source.readable_limit();
        if position + 4 > limit {
            return Ok(BlockRead::End);
        }
        let block_size = read_i32(self.source.bytes(position, 4)?);
        if block_size == 0 {
            return Ok(BlockRead::End);
        }
        if block_size == OVERFLOW_MARKER {
            return Ok(BlockRead::Overflow);
        }
        if block_size < 0 {
            return Err(Error::InvalidSegment {
                segment: self.segment(),
                reason: format!("negative block size {} at {}", block_size, position),
            });
        }
        let block_size = block_size as usize;
        let total = transaction_size(block_size);
        if position + total > limit {
            return Ok(BlockRead::End);
        }

        let header = self.source.bytes(position + 4, 3)?;
        let version = header[0];
        let count = read_u16(&header[1..3]) as usize;
        let events_position = position + TX_HEADER_SIZE;
        let region = self.source.bytes(events_position, block_size)?;
        let stored = read_i32(self.source.bytes(events_position + block_size, TX_CHECKSUM_SIZE)?);
        if crc32fast::hash(region) as i32 != stored {
            return Err(Error::ChecksumMismatch {
                segment: self.segment(),
                position,
            });
        }

        let mut events = Vec::with_capacity(count);
        let mut offset = 0usize;
        for _ in 0..count {
            if offset + EVENT_LENGTH_SIZE > block_size {
                return Err(self.corrupt(position, "event length beyond block"));
            }
            let len = read_i32(&region[offset..]);
            if len < 0 || offset + EVENT_LENGTH_SIZE + len as usize > block_size {
                return Err(self.corrupt(position, "event bytes beyond block"));
            }
            let start = offset + EVENT_LENGTH_SIZE;
            events.push(EncodedEvent {
                position: events_position + offset,
                bytes: region[start..start + len as usize].to_vec(),
            });
            offset = start + len as usize;
        }

        Ok(BlockRead::Transaction(TransactionBlock {
            position,
            version,
            events,
            next_position: position + total,
        }))
    }

    /// Reads a single event given the position of its length field.
    pub fn read_event(&self, position: usize) -> Result<Event> {
        let len = read_i32(self.source.bytes(position, EVENT_LENGTH_SIZE)?);
        if len < 0 {
            return Err(self.corrupt(position, "negative event length"));
        }
        Event::from_bytes(self.source.bytes(position + EVENT_LENGTH_SIZE, len as usize)?)
    }

    fn corrupt(&self, position: usize, reason: &str) -> Error {
        Error::InvalidSegment {
            segment: self.segment(),
            reason: format!("{} at {}", reason, position),
        }
    }
}

/// Iterates events of one segment starting at a token.
///
/// When the start token falls inside a transaction, the events of that
/// transaction before the start token are skipped and the remaining ones are
/// returned first.
pub struct EventIterator {
    view: SegmentView,
    next_token: i64,
    pending: VecDeque<EventInformation>,
    done: bool,
}

impl EventIterator {
    pub fn new(source: Arc<dyn EventSource>, start_token: i64) -> Result<Self> {
        let segment = source.segment() as i64;
        let mut iterator = Self {
            view: SegmentView::new(source),
            next_token: segment,
            pending: VecDeque::new(),
            done: false,
        };
        iterator.skip_to(start_token)?;
        Ok(iterator)
    }

    fn skip_to(&mut self, start_token: i64) -> Result<()> {
        while self.next_token < start_token && !self.done {
            let position = self.view.position();
            match self.view.peek_block(position)? {
                BlockRead::Transaction(tx) => {
                    let count = tx.events.len() as i64;
                    if self.next_token + count <= start_token {
                        self.view.set_position(tx.next_position);
                        self.next_token += count;
                    } else {
                        self.fill()?;
                        while self.next_token < start_token {
                            if self.pending.pop_front().is_none() {
                                break;
                            }
                            self.next_token += 1;
                        }
                    }
                }
                BlockRead::End | BlockRead::Overflow => self.done = true,
            }
        }
        Ok(())
    }

    fn fill(&mut self) -> Result<()> {
        match self.view.read_block()? {
            BlockRead::Transaction(tx) => {
                let mut token = self.next_token + self.pending.len() as i64;
                for encoded in tx.events {
                    self.pending.push_back(EventInformation {
                        token,
                        position: encoded.position,
                        event: Event::from_bytes(&encoded.bytes)?,
                    });
                    token += 1;
                }
            }
            BlockRead::End | BlockRead::Overflow => self.done = true,
        }
        Ok(())
    }

    /// Token the next returned event will carry.
    pub fn next_token(&self) -> i64 {
        self.next_token
    }

    /// Position after the last transaction read.
    pub fn position(&self) -> usize {
        self.view.position()
    }

    /// Remaining events of the current transaction.
    pub fn pending_events(&mut self) -> Vec<EventInformation> {
        let pending: Vec<EventInformation> = self.pending.drain(..).collect();
        self.next_token += pending.len() as i64;
        pending
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}

impl Iterator for EventIterator {
    type Item = Result<EventInformation>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.pending.is_empty() {
            if self.done {
                return None;
            }
            if let Err(e) = self.fill() {
                self.done = true;
                return Some(Err(e));
            }
        }
        let event = self.pending.pop_front()?;
        self.next_token += 1;
        Some(Ok(event))
    }
}

/// Iterates complete transactions of one segment, starting with the transaction
/// that contains `start_token`.
pub struct TransactionIterator {
    view: SegmentView,
    next_token: i64,
    done: bool,
}

impl TransactionIterator {
    pub fn new(source: Arc<dyn EventSource>, start_token: i64) -> Result<Self> {
        let segment = source.segment() as i64;
        let mut view = SegmentView::new(source);
        let mut next_token = segment;
        let mut done = false;
        while next_token < start_token {
            match view.peek_block(view.position())? {
                BlockRead::Transaction(tx) => {
                    let count = tx.events.len() as i64;
                    if next_token + count > start_token {
                        break;
                    }
                    view.set_position(tx.next_position);
                    next_token += count;
                }
                BlockRead::End | BlockRead::Overflow => {
                    done = true;
                    break;
                }
            }
        }
        Ok(Self {
            view,
            next_token,
            done,
        })
    }

    pub fn next_token(&self) -> i64 {
        self.next_token
    }
}

impl Iterator for TransactionIterator {
    type Item = Result<TransactionWithToken>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let block = match self.view.read_block() {
            Ok(BlockRead::Transaction(tx)) => tx,
            Ok(_) => {
                self.done = true;
                return None;
            }
            Err(e) => {
                self.done = true;
                return Some(Err(e));
            }
        };
        let mut events = Vec::with_capacity(block.events.len());
        for encoded in &block.events {
            match Event::from_bytes(&encoded.bytes) {
                Ok(event) => events.push(event),
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
        let token = self.next_token;
        self.next_token += events.len() as i64;
        Some(Ok(TransactionWithToken {
            token,
            version: block.version,
            events,
        }))
    }
}
