use super::clock::Clock;
use super::configuration::CurrentConfiguration;
use super::file_log_store::FileLogEntryStore;
use super::log_store::{InMemoryLogEntryStore, LogEntryStore};
use super::messages::RaftRequest;
use super::processor::LogEntryProcessor;
use super::snapshot::{NoopSnapshotManager, SnapshotManager};
use super::state_store::{
    ElectionStore, FileRaftStateStore, InMemoryElectionStore, InMemoryProcessorStore,
    ProcessorStore,
};
use super::{EntryPayload, Node, NodeId};
use crate::config::RaftConfiguration;
use crate::error::{Error, Result};
use crate::metrics;
use dashmap::DashMap;
use parking_lot::RwLock;
use rand::Rng;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Outbound handle to one member of a group. Sending never waits for the
/// answer; responses come back through the local node's dispatcher.
pub trait RaftPeer: Send + Sync {
    fn node_id(&self) -> &str;

    fn send(&self, request: RaftRequest) -> Result<()>;
}

/// Creates peer handles for a transport.
pub trait PeerConnector: Send + Sync {
    fn connect(&self, group_id: &str, node: &Node) -> Result<Arc<dyn RaftPeer>>;
}

/// Caches one peer handle per group and node.
pub struct ConnectionPool {
    connector: Arc<dyn PeerConnector>,
    peers: DashMap<(String, NodeId), Arc<dyn RaftPeer>>,
}

impl ConnectionPool {
    pub fn new(connector: Arc<dyn PeerConnector>) -> Self {
        Self {
            connector,
            peers: DashMap::new(),
        }
    }

    pub fn get(&self, group_id: &str, node: &Node) -> Result<Arc<dyn RaftPeer>> {
        let key = (group_id.to_string(), node.node_id.clone());
        if let Some(peer) = self.peers.get(&key) {
            return Ok(peer.clone());
        }
        let peer = self.connector.connect(group_id, node)?;
        debug!("{}: connected to {} at {}", group_id, node.node_id, node.address());
        Ok(self.peers.entry(key).or_insert(peer).clone())
    }

    pub fn remove(&self, group_id: &str, node_id: &str) {
        self.peers.remove(&(group_id.to_string(), node_id.to_string()));
    }

    pub fn clear(&self) {
        self.peers.clear();
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

/// Persistent collaborators of a group.
pub struct GroupStorage {
    pub log_store: Arc<dyn LogEntryStore>,
    pub election_store: Arc<dyn ElectionStore>,
    pub processor_store: Arc<dyn ProcessorStore>,
    pub snapshot_manager: Arc<dyn SnapshotManager>,
}

impl GroupStorage {
    /// Volatile storage, nothing survives a restart.
    pub fn in_memory() -> Self {
        Self {
            log_store: Arc::new(InMemoryLogEntryStore::new()),
            election_store: Arc::new(InMemoryElectionStore::new()),
            processor_store: Arc::new(InMemoryProcessorStore::new()),
            snapshot_manager: Arc::new(NoopSnapshotManager),
        }
    }

    /// Log files and a state file below `dir`.
    pub fn open(dir: impl AsRef<Path>, config: &RaftConfiguration) -> Result<Self> {
        let dir = dir.as_ref();
        let log_store = FileLogEntryStore::open(dir.join("log"), config.log_segment_size)?;
        let state = Arc::new(FileRaftStateStore::open(dir.join("raft.state"))?);
        Ok(Self {
            log_store: Arc::new(log_store),
            election_store: state.clone(),
            processor_store: state,
            snapshot_manager: Arc::new(NoopSnapshotManager),
        })
    }

    pub fn with_snapshot_manager(mut self, snapshot_manager: Arc<dyn SnapshotManager>) -> Self {
        self.snapshot_manager = snapshot_manager;
        self
    }
}

/// Everything the membership states and replicators of one group share.
pub struct RaftGroup {
    group_id: String,
    local_node: Node,
    config: RaftConfiguration,
    log_store: Arc<dyn LogEntryStore>,
    election_store: Arc<dyn ElectionStore>,
    processor: Arc<LogEntryProcessor>,
    snapshot_manager: Arc<dyn SnapshotManager>,
    configuration: RwLock<CurrentConfiguration>,
    connections: Arc<ConnectionPool>,
    clock: Arc<dyn Clock>,
}

impl RaftGroup {
    /// Members stored in the log take precedence over `members`.
    pub fn new(
        group_id: impl Into<String>,
        local_node: Node,
        members: Vec<Node>,
        config: RaftConfiguration,
        storage: GroupStorage,
        connections: Arc<ConnectionPool>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let group_id = group_id.into();
        let processor = Arc::new(LogEntryProcessor::new(
            group_id.clone(),
            storage.processor_store,
        ));
        let configuration = recover_configuration(
            storage.log_store.as_ref(),
            processor.commit_index(),
            members,
        )?;
        metrics::term_changed(&group_id, storage.election_store.current_term());
        Ok(Self {
            group_id,
            local_node,
            config,
            log_store: storage.log_store,
            election_store: storage.election_store,
            processor,
            snapshot_manager: storage.snapshot_manager,
            configuration: RwLock::new(configuration),
            connections,
            clock,
        })
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    pub fn local_node(&self) -> &Node {
        &self.local_node
    }

    pub fn local_node_id(&self) -> &str {
        &self.local_node.node_id
    }

    pub fn local_log_entry_store(&self) -> &Arc<dyn LogEntryStore> {
        &self.log_store
    }

    pub fn local_election_store(&self) -> &Arc<dyn ElectionStore> {
        &self.election_store
    }

    pub fn log_entry_processor(&self) -> &Arc<LogEntryProcessor> {
        &self.processor
    }

    pub fn raft_configuration(&self) -> &RaftConfiguration {
        &self.config
    }

    pub fn snapshot_manager(&self) -> &Arc<dyn SnapshotManager> {
        &self.snapshot_manager
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn now(&self) -> Instant {
        self.clock.now()
    }

    pub fn current_term(&self) -> u64 {
        self.election_store.current_term()
    }

    /// Moves to `term` if it is newer than the current one, clearing the vote.
    /// Returns true when the term changed.
    pub fn update_current_term(&self, term: u64, cause: &str) -> Result<bool> {
        let current = self.election_store.current_term();
        if term <= current {
            return Ok(false);
        }
        info!(
            "{}: term {} -> {}: {}",
            self.group_id, current, term, cause
        );
        self.election_store.update_current_term(term)?;
        metrics::term_changed(&self.group_id, term);
        Ok(true)
    }

    pub fn configuration(&self) -> CurrentConfiguration {
        self.configuration.read().clone()
    }

    pub fn members(&self) -> Vec<Node> {
        self.configuration.read().group_members().to_vec()
    }

    /// Members other than the local node.
    pub fn other_members(&self) -> Vec<Node> {
        self.configuration
            .read()
            .group_members()
            .iter()
            .filter(|m| m.node_id != self.local_node.node_id)
            .cloned()
            .collect()
    }

    pub fn is_member(&self, node_id: &str) -> bool {
        self.configuration.read().is_member(node_id)
    }

    /// Replaces the member list with a committed one.
    pub fn update_members(&self, members: Vec<Node>) {
        let mut configuration = self.configuration.write();
        let previous = configuration.group_members().to_vec();
        configuration.apply(members);
        self.log_member_change(&previous, configuration.group_members());
    }

    fn log_member_change(&self, previous: &[Node], members: &[Node]) {
        for removed in previous.iter().filter(|m| !members.contains(m)) {
            self.connections.remove(&self.group_id, &removed.node_id);
        }
        info!(
            "{}: members {:?}",
            self.group_id,
            members.iter().map(|m| m.node_id.as_str()).collect::<Vec<_>>()
        );
    }

    /// Member list of a configuration entry that has been applied.
    pub(crate) fn apply_members(&self, index: u64, members: Vec<Node>) {
        let mut configuration = self.configuration.write();
        let previous = configuration.group_members().to_vec();
        if configuration.apply_at(index, members) && previous != configuration.group_members() {
            self.log_member_change(&previous, configuration.group_members());
        }
    }

    /// Appends a configuration entry and makes it effective right away.
    pub(crate) fn propose_members(&self, term: u64, members: Vec<Node>) -> Result<u64> {
        let mut configuration = self.configuration.write();
        if !configuration.is_committed() {
            return Err(Error::ConfigurationChangeInProgress);
        }
        let entry = self.log_store.create_entry(
            term,
            EntryPayload::Configuration {
                members: members.clone(),
            },
        )?;
        configuration.propose(members, entry.index);
        Ok(entry.index)
    }

    pub(crate) fn on_commit(&self, commit_index: u64) {
        if self.configuration.write().on_commit(commit_index) {
            debug!("{}: configuration committed", self.group_id);
        }
    }

    pub fn peer(&self, node_id: &str) -> Result<Arc<dyn RaftPeer>> {
        let node = self
            .configuration
            .read()
            .member(node_id)
            .cloned()
            .ok_or_else(|| Error::Config(format!("{} is not a member of {}", node_id, self.group_id)))?;
        self.connections.get(&self.group_id, &node)
    }

    /// Random election deadline between the minimum and maximum election timeout.
    pub fn next_election_deadline(&self) -> Instant {
        let min = self.config.min_election_timeout_ms;
        let max = self.config.max_election_timeout_ms;
        let timeout = rand::rng().random_range(min..=max);
        self.clock.now() + Duration::from_millis(timeout)
    }
}

/// Latest member list in the log, pending when it is not committed yet.
fn recover_configuration(
    log: &dyn LogEntryStore,
    commit_index: u64,
    members: Vec<Node>,
) -> Result<CurrentConfiguration> {
    let mut configuration = CurrentConfiguration::new(members);
    let first = log.first_log_index();
    let mut index = log.last_log_index();
    while index >= first && index > 0 {
        if let Some(entry) = log.entry(index)? {
            if let EntryPayload::Configuration { members } = entry.payload {
                if index <= commit_index {
                    configuration.apply(members);
                } else {
                    configuration.propose(members, index);
                }
                break;
            }
        }
        index -= 1;
    }
    Ok(configuration)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::clock::ManualClock;
    use parking_lot::Mutex;

    struct NullPeer(NodeId);

    impl RaftPeer for NullPeer {
        fn node_id(&self) -> &str {
            &self.0
        }

        fn send(&self, _request: RaftRequest) -> Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct CountingConnector {
        connects: Mutex<usize>,
    }

    impl PeerConnector for CountingConnector {
        fn connect(&self, _group_id: &str, node: &Node) -> Result<Arc<dyn RaftPeer>> {
            *self.connects.lock() += 1;
            Ok(Arc::new(NullPeer(node.node_id.clone())))
        }
    }

    fn members() -> Vec<Node> {
        vec![
            Node::new("a", "localhost", 1),
            Node::new("b", "localhost", 2),
            Node::new("c", "localhost", 3),
        ]
    }

    fn group(storage: GroupStorage, connector: Arc<CountingConnector>) -> RaftGroup {
        RaftGroup::new(
            "g",
            members()[0].clone(),
            members(),
            RaftConfiguration::default(),
            storage,
            Arc::new(ConnectionPool::new(connector)),
            Arc::new(ManualClock::new()),
        )
        .unwrap()
    }

    #[test]
    fn test_peers_are_cached() {
        let connector = Arc::new(CountingConnector::default());
        let group = group(GroupStorage::in_memory(), connector.clone());

        assert_eq!(group.peer("b").unwrap().node_id(), "b");
        group.peer("b").unwrap();
        group.peer("c").unwrap();
        assert_eq!(*connector.connects.lock(), 2);
        assert!(group.peer("unknown").is_err());
        assert_eq!(group.other_members().len(), 2);
    }

    #[test]
    fn test_term_only_moves_forward() {
        let group = group(GroupStorage::in_memory(), Arc::new(CountingConnector::default()));
        group
            .local_election_store()
            .mark_voted_for(Some("a".to_string()))
            .unwrap();
        assert!(group.update_current_term(2, "test").unwrap());
        assert_eq!(group.local_election_store().voted_for(), None);

        group
            .local_election_store()
            .mark_voted_for(Some("b".to_string()))
            .unwrap();
        assert!(!group.update_current_term(2, "test").unwrap());
        assert!(!group.update_current_term(1, "test").unwrap());
        assert_eq!(group.local_election_store().voted_for().as_deref(), Some("b"));
    }

    #[test]
    fn test_configuration_recovered_from_log() {
        let storage = GroupStorage::in_memory();
        storage
            .log_store
            .create_entry(1, EntryPayload::Noop)
            .unwrap();
        storage
            .log_store
            .create_entry(
                1,
                EntryPayload::Configuration {
                    members: members()[..2].to_vec(),
                },
            )
            .unwrap();
        let group = group(storage, Arc::new(CountingConnector::default()));
        assert_eq!(group.members().len(), 2);
        assert!(!group.configuration().is_committed());

        group.on_commit(2);
        assert!(group.configuration().is_committed());
    }

    #[test]
    fn test_single_configuration_change_at_a_time() {
        let group = group(GroupStorage::in_memory(), Arc::new(CountingConnector::default()));
        let index = group.propose_members(1, members()[..2].to_vec()).unwrap();
        assert_eq!(index, 1);
        assert!(matches!(
            group.propose_members(1, members()),
            Err(Error::ConfigurationChangeInProgress)
        ));
    }
}
