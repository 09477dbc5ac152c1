use super::{EntryPayload, LogEntry, TermIndex};
use crate::error::{Error, Result};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Storage of the replicated log of one group.
///
/// Indexes start at 1. Compaction removes a prefix of the log and remembers the
/// term and index of the last removed entry as the boundary, so the term of the
/// entry preceding the first stored one stays known.
pub trait LogEntryStore: Send + Sync {
    /// Last compacted position, `0@0` when nothing was compacted.
    fn boundary(&self) -> TermIndex;

    /// First index still stored.
    fn first_log_index(&self) -> u64 {
        self.boundary().index + 1
    }

    fn last_log_index(&self) -> u64;

    /// Term and index of the last entry, the boundary for an empty log.
    fn last_log(&self) -> TermIndex;

    fn entry(&self, index: u64) -> Result<Option<LogEntry>>;

    /// Term of the entry at `index`, known for stored entries, the boundary and
    /// index 0.
    fn term_at(&self, index: u64) -> Result<Option<u64>>;

    /// Appends entries that continue the log without gaps.
    fn append(&self, entries: &[LogEntry]) -> Result<()>;

    /// Creates an entry at the end of the log.
    fn create_entry(&self, term: u64, payload: EntryPayload) -> Result<LogEntry>;

    /// Removes the entry at `index` and everything after it.
    fn delete_from(&self, index: u64) -> Result<()>;

    /// Removes entries up to `index`. Stores may keep more than asked for.
    fn compact_to(&self, index: u64) -> Result<()>;

    /// Discards the whole log, continuing after `boundary`. Used after a snapshot
    /// was installed.
    fn reset(&self, boundary: TermIndex) -> Result<()>;
}

/// Lazily reads consecutive entries from a store.
pub struct EntryIterator {
    store: Arc<dyn LogEntryStore>,
    next_index: u64,
    previous: TermIndex,
}

impl EntryIterator {
    /// Fails with [`Error::LogCompacted`] when `from_index` is no longer stored.
    pub fn new(store: Arc<dyn LogEntryStore>, from_index: u64) -> Result<Self> {
        let first = store.first_log_index();
        if from_index < first {
            return Err(Error::LogCompacted {
                requested: from_index,
                first_available: first,
            });
        }
        let last = store.last_log_index();
        if from_index > last + 1 {
            return Err(Error::InvalidLogEntry {
                expected: last + 1,
                found: from_index,
            });
        }
        let previous_index = from_index - 1;
        let previous_term = store.term_at(previous_index)?.ok_or(Error::LogCompacted {
            requested: from_index,
            first_available: store.first_log_index(),
        })?;
        Ok(Self {
            store,
            next_index: from_index,
            previous: TermIndex::new(previous_term, previous_index),
        })
    }

    /// Position of the entry before the next one returned.
    pub fn previous(&self) -> TermIndex {
        self.previous
    }

    pub fn next_index(&self) -> u64 {
        self.next_index
    }

    pub fn has_next(&self) -> bool {
        self.next_index <= self.store.last_log_index()
    }
}

impl Iterator for EntryIterator {
    type Item = Result<LogEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.has_next() {
            return None;
        }
        match self.store.entry(self.next_index) {
            Ok(Some(entry)) => {
                self.previous = entry.term_index();
                self.next_index += 1;
                Some(Ok(entry))
            }
            Ok(None) => Some(Err(Error::LogCompacted {
                requested: self.next_index,
                first_available: self.store.first_log_index(),
            })),
            Err(e) => Some(Err(e)),
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    entries: BTreeMap<u64, LogEntry>,
    boundary: TermIndex,
}

impl Inner {
    fn last_log(&self) -> TermIndex {
        self.entries
            .values()
            .next_back()
            .map(|e| e.term_index())
            .unwrap_or(self.boundary)
    }

    fn term_at(&self, index: u64) -> Option<u64> {
        if index == self.boundary.index {
            return Some(self.boundary.term);
        }
        self.entries.get(&index).map(|e| e.term)
    }

    fn append(&mut self, entry: LogEntry) -> Result<()> {
        let expected = self.last_log().index + 1;
        if entry.index != expected {
            return Err(Error::InvalidLogEntry {
                expected,
                found: entry.index,
            });
        }
        self.entries.insert(entry.index, entry);
        Ok(())
    }
}

/// Log kept in memory only.
#[derive(Debug, Default)]
pub struct InMemoryLogEntryStore {
    inner: RwLock<Inner>,
}

impl InMemoryLogEntryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Entries from `from_index` to the end, used when rewriting files.
    pub(crate) fn entries_from(&self, from_index: u64) -> Vec<LogEntry> {
        self.inner
            .read()
            .entries
            .range(from_index..)
            .map(|(_, e)| e.clone())
            .collect()
    }
}

impl LogEntryStore for InMemoryLogEntryStore {
    fn boundary(&self) -> TermIndex {
        self.inner.read().boundary
    }

    fn last_log_index(&self) -> u64 {
        self.inner.read().last_log().index
    }

    fn last_log(&self) -> TermIndex {
        self.inner.read().last_log()
    }

    fn entry(&self, index: u64) -> Result<Option<LogEntry>> {
        Ok(self.inner.read().entries.get(&index).cloned())
    }

    fn term_at(&self, index: u64) -> Result<Option<u64>> {
        Ok(self.inner.read().term_at(index))
    }

    fn append(&self, entries: &[LogEntry]) -> Result<()> {
        let mut inner = self.inner.write();
        for entry in entries {
            inner.append(entry.clone())?;
        }
        Ok(())
    }

    fn create_entry(&self, term: u64, payload: EntryPayload) -> Result<LogEntry> {
        let mut inner = self.inner.write();
        let entry = LogEntry {
            term,
            index: inner.last_log().index + 1,
            payload,
        };
        inner.append(entry.clone())?;
        Ok(entry)
    }

    fn delete_from(&self, index: u64) -> Result<()> {
        let mut inner = self.inner.write();
        let _ = inner.entries.split_off(&index);
        Ok(())
    }

    fn compact_to(&self, index: u64) -> Result<()> {
        let mut inner = self.inner.write();
        let index = index.min(inner.last_log().index);
        if index <= inner.boundary.index {
            return Ok(());
        }
        let Some(term) = inner.term_at(index) else {
            return Ok(());
        };
        let remaining = inner.entries.split_off(&(index + 1));
        inner.entries = remaining;
        inner.boundary = TermIndex::new(term, index);
        Ok(())
    }

    fn reset(&self, boundary: TermIndex) -> Result<()> {
        let mut inner = self.inner.write();
        inner.entries.clear();
        inner.boundary = boundary;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fill(store: &InMemoryLogEntryStore, count: u64, term: u64) {
        for _ in 0..count {
            store.create_entry(term, EntryPayload::Noop).unwrap();
        }
    }

    #[test]
    fn test_create_and_read() {
        let store = InMemoryLogEntryStore::new();
        assert_eq!(store.last_log(), TermIndex::default());
        assert_eq!(store.term_at(0).unwrap(), Some(0));

        fill(&store, 3, 1);
        assert_eq!(store.last_log(), TermIndex::new(1, 3));
        assert_eq!(store.entry(2).unwrap().unwrap().index, 2);
        assert!(store.entry(4).unwrap().is_none());
    }

    #[test]
    fn test_append_rejects_gap() {
        let store = InMemoryLogEntryStore::new();
        let entry = LogEntry {
            term: 1,
            index: 5,
            payload: EntryPayload::Noop,
        };
        assert!(matches!(
            store.append(&[entry]),
            Err(Error::InvalidLogEntry { expected: 1, found: 5 })
        ));
    }

    #[test]
    fn test_compaction_keeps_boundary_term() {
        let store = Arc::new(InMemoryLogEntryStore::new());
        fill(&store, 5, 1);
        fill(&store, 5, 2);
        store.compact_to(6).unwrap();

        assert_eq!(store.first_log_index(), 7);
        assert_eq!(store.term_at(6).unwrap(), Some(2));
        assert_eq!(store.term_at(5).unwrap(), None);

        assert!(matches!(
            EntryIterator::new(store.clone(), 5),
            Err(Error::LogCompacted { requested: 5, first_available: 7 })
        ));
        let iterator = EntryIterator::new(store.clone(), 7).unwrap();
        assert_eq!(iterator.previous(), TermIndex::new(2, 6));
        let indexes: Vec<u64> = iterator.map(|e| e.unwrap().index).collect();
        assert_eq!(indexes, vec![7, 8, 9, 10]);
    }

    #[test]
    fn test_delete_from_and_reset() {
        let store = InMemoryLogEntryStore::new();
        fill(&store, 5, 1);
        store.delete_from(3).unwrap();
        assert_eq!(store.last_log_index(), 2);
        fill(&store, 1, 3);
        assert_eq!(store.last_log(), TermIndex::new(3, 3));

        store.reset(TermIndex::new(4, 100)).unwrap();
        assert_eq!(store.last_log(), TermIndex::new(4, 100));
        assert_eq!(store.first_log_index(), 101);
        assert_eq!(store.create_entry(4, EntryPayload::Noop).unwrap().index, 101);
    }
}
