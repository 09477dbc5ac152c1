use crate::storage::segment::{EventSource, WritableSegment, FILE_HEADER_SIZE};
use crossbeam_epoch::{self as epoch, Atomic, Owned};
use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Claim ticket for a pending write: the token of its first event, the byte
/// offset in the segment and the segment itself.
///
/// A position without a buffer means another writer is opening the next
/// segment; claimants retry until a writable position appears.
#[derive(Clone)]
pub struct WritePosition {
    pub sequence: i64,
    pub position: usize,
    pub segment: u64,
    pub buffer: Option<Arc<WritableSegment>>,
}

impl WritePosition {
    pub fn new(sequence: i64, position: usize, buffer: Arc<WritableSegment>, segment: u64) -> Self {
        Self {
            sequence,
            position,
            segment,
            buffer: Some(buffer),
        }
    }

    /// Placeholder before the store is initialized, never writable.
    pub fn empty() -> Self {
        Self {
            sequence: 0,
            position: 0,
            segment: 0,
            buffer: None,
        }
    }

    fn capacity(&self) -> Option<usize> {
        self.buffer.as_ref().map(|b| b.capacity())
    }

    /// The claimed range does not fit; only the first claimant sees this.
    pub fn is_overflow(&self, size: usize) -> bool {
        self.capacity()
            .is_some_and(|capacity| self.position + size + 4 > capacity)
    }

    /// Room for the transaction plus the trailing end-of-data marker.
    pub fn is_writable(&self, size: usize) -> bool {
        self.capacity()
            .is_some_and(|capacity| self.position + size + 4 <= capacity)
    }

    fn incremented_with(&self, count: i64, size: usize) -> Self {
        if self.is_overflow(size) {
            return Self {
                sequence: self.sequence,
                position: 0,
                segment: self.segment,
                buffer: None,
            };
        }
        Self {
            sequence: self.sequence + count,
            position: self.position + size,
            segment: self.segment,
            buffer: self.buffer.clone(),
        }
    }

    /// First position in a freshly opened segment starting at this sequence.
    pub fn reset(&self, buffer: Arc<WritableSegment>) -> Self {
        Self::new(self.sequence, FILE_HEADER_SIZE, buffer, self.sequence as u64)
    }
}

impl fmt::Debug for WritePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WritePosition")
            .field("sequence", &self.sequence)
            .field("position", &self.position)
            .field("segment", &self.segment)
            .field("writable", &self.buffer.is_some())
            .finish()
    }
}

/// Lock-free holder of the next write position.
pub struct WritePositionRef {
    current: Atomic<WritePosition>,
}

impl WritePositionRef {
    pub fn new(initial: WritePosition) -> Self {
        Self {
            current: Atomic::new(initial),
        }
    }

    pub fn current(&self) -> WritePosition {
        let guard = epoch::pin();
        let shared = self.current.load(Ordering::Acquire, &guard);
        // SAFETY: the pointer is never null and protected by the guard.
        unsafe { shared.deref() }.clone()
    }

    /// Atomically advances the position by `count` tokens and `size` bytes and
    /// returns the position before the update.
    pub fn get_and_increment(&self, count: i64, size: usize) -> WritePosition {
        let guard = epoch::pin();
        loop {
            let shared = self.current.load(Ordering::Acquire, &guard);
            // SAFETY: the pointer is never null and protected by the guard.
            let previous = unsafe { shared.deref() };
            let next = Owned::new(previous.incremented_with(count, size));
            if self
                .current
                .compare_exchange(shared, next, Ordering::AcqRel, Ordering::Acquire, &guard)
                .is_ok()
            {
                let result = previous.clone();
                // SAFETY: unlinked by the successful exchange.
                unsafe { guard.defer_destroy(shared) };
                return result;
            }
        }
    }

    pub fn set(&self, position: WritePosition) {
        let guard = epoch::pin();
        let old = self
            .current
            .swap(Owned::new(position), Ordering::AcqRel, &guard);
        // SAFETY: unlinked by the swap.
        unsafe { guard.defer_destroy(old) };
    }
}

impl Drop for WritePositionRef {
    fn drop(&mut self) {
        // SAFETY: no other thread can access the value during drop.
        unsafe {
            let guard = epoch::unprotected();
            let shared = self.current.load(Ordering::Relaxed, guard);
            if !shared.is_null() {
                drop(shared.into_owned());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Barrier;
    use std::thread;
    use tempfile::TempDir;

    fn open(dir: &TempDir, size: u64) -> Arc<WritableSegment> {
        Arc::new(
            WritableSegment::open(&dir.path().join("00000000000000.events"), 0, size, 0).unwrap(),
        )
    }

    #[test]
    fn test_claims_advance() {
        let dir = TempDir::new().unwrap();
        let buffer = open(&dir, 1024);
        let positions = WritePositionRef::new(WritePosition::new(0, FILE_HEADER_SIZE, buffer, 0));

        let first = positions.get_and_increment(2, 100);
        let second = positions.get_and_increment(1, 50);
        assert_eq!((first.sequence, first.position), (0, FILE_HEADER_SIZE));
        assert_eq!((second.sequence, second.position), (2, FILE_HEADER_SIZE + 100));
        assert_eq!(positions.current().sequence, 3);
    }

    #[test]
    fn test_overflow_seen_once() {
        let dir = TempDir::new().unwrap();
        let buffer = open(&dir, 64);
        let positions = WritePositionRef::new(WritePosition::new(0, FILE_HEADER_SIZE, buffer, 0));

        let first = positions.get_and_increment(1, 60);
        assert!(first.is_overflow(60));
        let second = positions.get_and_increment(1, 60);
        assert!(!second.is_overflow(60));
        assert!(!second.is_writable(60));
    }

    #[test]
    fn test_exact_fit_is_writable() {
        let dir = TempDir::new().unwrap();
        let buffer = open(&dir, 64);
        let position = WritePosition::new(0, FILE_HEADER_SIZE, buffer, 0);
        assert!(position.is_writable(64 - 9));
        assert!(!position.is_overflow(64 - 9));
        assert!(position.is_overflow(64 - 8));
    }

    #[test]
    fn test_concurrent_claims_are_disjoint() {
        let dir = TempDir::new().unwrap();
        let buffer = open(&dir, 1 << 20);
        let positions = Arc::new(WritePositionRef::new(WritePosition::new(
            0,
            FILE_HEADER_SIZE,
            buffer,
            0,
        )));
        let barrier = Arc::new(Barrier::new(4));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let positions = positions.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    (0..250)
                        .map(|_| positions.get_and_increment(1, 16).position)
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for position in handle.join().unwrap() {
                assert!(seen.insert(position));
            }
        }
        assert_eq!(seen.len(), 1000);
        assert_eq!(positions.current().sequence, 1000);
    }
}
