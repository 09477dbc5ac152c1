use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};
use std::fmt;

pub mod clock;
pub mod configuration;
pub mod election;
pub mod file_log_store;
pub mod group;
pub mod log_store;
pub mod membership;
pub mod messages;
pub mod network;
pub mod node;
pub mod processor;
pub mod replicator;
pub mod snapshot;
pub mod state_store;
pub mod tcp;
#[cfg(test)]
pub(crate) mod test_support;

pub use clock::{Clock, ManualClock, SystemClock};
pub use configuration::CurrentConfiguration;
pub use election::{Election, ElectionResult, MajorityStrategy, VoteStrategy};
pub use file_log_store::FileLogEntryStore;
pub use group::{ConnectionPool, GroupStorage, PeerConnector, RaftGroup, RaftPeer};
pub use log_store::{EntryIterator, InMemoryLogEntryStore, LogEntryStore};
pub use membership::{MembershipState, Transition};
pub use messages::*;
pub use network::{Dispatcher, InMemoryConnector, InMemoryNetwork};
pub use node::{Completion, RaftNode, RaftTicker};
pub use processor::{LogEntryConsumer, LogEntryProcessor};
pub use replicator::ReplicatorPeer;
pub use snapshot::{NoopSnapshotManager, SnapshotChunks, SnapshotManager, SNAPSHOT_CHUNKS_BUFFER_SIZE};
pub use state_store::{
    ElectionStore, FileRaftStateStore, InMemoryElectionStore, InMemoryProcessorStore,
    ProcessorStore,
};
pub use tcp::{RaftServer, TcpConnector, TcpRaftPeer};

/// Unique name of a node in the cluster
pub type NodeId = String;

/// A member of a raft group
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Encode, Decode)]
pub struct Node {
    pub node_id: NodeId,
    pub host: String,
    pub port: u16,
}

impl Node {
    pub fn new(node_id: impl Into<NodeId>, host: impl Into<String>, port: u16) -> Self {
        Self {
            node_id: node_id.into(),
            host: host.into(),
            port,
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Term and index of a log position. Index 0 with term 0 is the empty log.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Encode, Decode,
)]
pub struct TermIndex {
    pub term: u64,
    pub index: u64,
}

impl TermIndex {
    pub fn new(term: u64, index: u64) -> Self {
        Self { term, index }
    }

    /// Raft's "at least as up-to-date" comparison of two last log positions.
    pub fn is_up_to_date_with(&self, other: &TermIndex) -> bool {
        self.term > other.term || (self.term == other.term && self.index >= other.index)
    }
}

impl fmt::Display for TermIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.index, self.term)
    }
}

/// An entry in the replicated log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct LogEntry {
    /// Term in which the leader created the entry
    pub term: u64,

    /// Position in the log, starting at 1
    pub index: u64,

    pub payload: EntryPayload,
}

impl LogEntry {
    pub fn term_index(&self) -> TermIndex {
        TermIndex::new(self.term, self.index)
    }
}

/// Content of a log entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub enum EntryPayload {
    /// Appended by a new leader to commit entries of earlier terms
    Noop,

    /// Application data, dispatched to consumers by type
    Serialized { entry_type: String, data: Vec<u8> },

    /// New member list of the group
    Configuration { members: Vec<Node> },
}

/// Role of the local node in a group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Idle,
    Follower,
    Candidate,
    Leader,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::Idle => "idle",
            Role::Follower => "follower",
            Role::Candidate => "candidate",
            Role::Leader => "leader",
        };
        f.write_str(name)
    }
}

/// Number of votes or acknowledgements needed out of `members`.
pub fn majority(members: usize) -> usize {
    members / 2 + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_majority() {
        assert_eq!(majority(1), 1);
        assert_eq!(majority(2), 2);
        assert_eq!(majority(3), 2);
        assert_eq!(majority(4), 3);
        assert_eq!(majority(5), 3);
    }

    #[test]
    fn test_up_to_date_comparison() {
        let ours = TermIndex::new(2, 10);
        assert!(TermIndex::new(3, 1).is_up_to_date_with(&ours));
        assert!(TermIndex::new(2, 10).is_up_to_date_with(&ours));
        assert!(!TermIndex::new(2, 9).is_up_to_date_with(&ours));
        assert!(!TermIndex::new(1, 100).is_up_to_date_with(&ours));
    }
}
