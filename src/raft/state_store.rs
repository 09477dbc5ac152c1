use super::{NodeId, TermIndex};
use crate::error::Result;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

/// Persistent term and vote of the local node in one group.
pub trait ElectionStore: Send + Sync {
    fn voted_for(&self) -> Option<NodeId>;

    fn current_term(&self) -> u64;

    fn mark_voted_for(&self, candidate: Option<NodeId>) -> Result<()>;

    /// Stores a new term and clears the vote in one step.
    fn update_current_term(&self, term: u64) -> Result<()>;
}

/// Persistent commit and apply progress of one group.
pub trait ProcessorStore: Send + Sync {
    fn commit_index(&self) -> u64;

    fn commit_term(&self) -> u64;

    fn last_applied_index(&self) -> u64;

    fn last_applied_term(&self) -> u64;

    fn update_commit_index(&self, position: TermIndex) -> Result<()>;

    fn update_last_applied(&self, position: TermIndex) -> Result<()>;
}

#[derive(Debug, Default)]
struct ElectionState {
    current_term: u64,
    voted_for: Option<NodeId>,
}

#[derive(Debug, Default)]
pub struct InMemoryElectionStore {
    state: Mutex<ElectionState>,
}

impl InMemoryElectionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ElectionStore for InMemoryElectionStore {
    fn voted_for(&self) -> Option<NodeId> {
        self.state.lock().voted_for.clone()
    }

    fn current_term(&self) -> u64 {
        self.state.lock().current_term
    }

    fn mark_voted_for(&self, candidate: Option<NodeId>) -> Result<()> {
        self.state.lock().voted_for = candidate;
        Ok(())
    }

    fn update_current_term(&self, term: u64) -> Result<()> {
        let mut state = self.state.lock();
        state.current_term = term;
        state.voted_for = None;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryProcessorStore {
    commit: Mutex<TermIndex>,
    applied: Mutex<TermIndex>,
}

impl InMemoryProcessorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProcessorStore for InMemoryProcessorStore {
    fn commit_index(&self) -> u64 {
        self.commit.lock().index
    }

    fn commit_term(&self) -> u64 {
        self.commit.lock().term
    }

    fn last_applied_index(&self) -> u64 {
        self.applied.lock().index
    }

    fn last_applied_term(&self) -> u64 {
        self.applied.lock().term
    }

    fn update_commit_index(&self, position: TermIndex) -> Result<()> {
        *self.commit.lock() = position;
        Ok(())
    }

    fn update_last_applied(&self, position: TermIndex) -> Result<()> {
        *self.applied.lock() = position;
        Ok(())
    }
}

/// Everything a group member must remember across restarts, besides the log.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct PersistedState {
    current_term: u64,
    voted_for: Option<NodeId>,
    commit: TermIndex,
    last_applied: TermIndex,
}

/// Election and processor state in one JSON file, replaced atomically on
/// every change.
pub struct FileRaftStateStore {
    path: PathBuf,
    state: Mutex<PersistedState>,
}

impl FileRaftStateStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let state = match fs::read(&path) {
            Ok(data) => serde_json::from_slice(&data)?,
            Err(e) if e.kind() == ErrorKind::NotFound => PersistedState::default(),
            Err(e) => return Err(e.into()),
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    fn update(&self, change: impl FnOnce(&mut PersistedState)) -> Result<()> {
        let mut state = self.state.lock();
        let mut next = state.clone();
        change(&mut next);
        if next == *state {
            return Ok(());
        }
        let temp = self.path.with_extension("temp");
        {
            let mut file = File::create(&temp)?;
            file.write_all(&serde_json::to_vec_pretty(&next)?)?;
            file.sync_all()?;
        }
        fs::rename(&temp, &self.path)?;
        *state = next;
        Ok(())
    }
}

impl ElectionStore for FileRaftStateStore {
    fn voted_for(&self) -> Option<NodeId> {
        self.state.lock().voted_for.clone()
    }

    fn current_term(&self) -> u64 {
        self.state.lock().current_term
    }

    fn mark_voted_for(&self, candidate: Option<NodeId>) -> Result<()> {
        self.update(|s| s.voted_for = candidate)
    }

    fn update_current_term(&self, term: u64) -> Result<()> {
        self.update(|s| {
            s.current_term = term;
            s.voted_for = None;
        })
    }
}

impl ProcessorStore for FileRaftStateStore {
    fn commit_index(&self) -> u64 {
        self.state.lock().commit.index
    }

    fn commit_term(&self) -> u64 {
        self.state.lock().commit.term
    }

    fn last_applied_index(&self) -> u64 {
        self.state.lock().last_applied.index
    }

    fn last_applied_term(&self) -> u64 {
        self.state.lock().last_applied.term
    }

    fn update_commit_index(&self, position: TermIndex) -> Result<()> {
        self.update(|s| s.commit = position)
    }

    fn update_last_applied(&self, position: TermIndex) -> Result<()> {
        self.update(|s| s.last_applied = position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_term_update_clears_vote() {
        let store = InMemoryElectionStore::new();
        store.mark_voted_for(Some("node-1".to_string())).unwrap();
        assert_eq!(store.voted_for().as_deref(), Some("node-1"));
        store.update_current_term(3).unwrap();
        assert_eq!(store.current_term(), 3);
        assert_eq!(store.voted_for(), None);
    }

    #[test]
    fn test_file_state_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("group").join("raft.state");
        {
            let store = FileRaftStateStore::open(&path).unwrap();
            store.update_current_term(5).unwrap();
            store.mark_voted_for(Some("node-2".to_string())).unwrap();
            store.update_commit_index(TermIndex::new(5, 12)).unwrap();
            store.update_last_applied(TermIndex::new(4, 10)).unwrap();
        }
        let store = FileRaftStateStore::open(&path).unwrap();
        assert_eq!(store.current_term(), 5);
        assert_eq!(store.voted_for().as_deref(), Some("node-2"));
        assert_eq!(store.commit_index(), 12);
        assert_eq!(store.commit_term(), 5);
        assert_eq!(store.last_applied_index(), 10);
        assert_eq!(store.last_applied_term(), 4);
        assert!(!path.with_extension("temp").exists());
    }
}
