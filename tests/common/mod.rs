#![allow(dead_code)]

use lightning_eventstore::config::RaftConfiguration;
use lightning_eventstore::raft::{
    ConnectionPool, Dispatcher, GroupStorage, InMemoryNetwork, ManualClock, Node, RaftGroup,
    RaftNode, Role,
};
use lightning_eventstore::replication::{EventStoreApplier, EventStoreSnapshotManager};
use lightning_eventstore::storage::{
    Event, EventStore, EventTypeContext, SerializedObject, StorageProperties,
};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub const GROUP: &str = "default";

pub fn init_test_logging() {
    lightning_eventstore::logging::init_test_logging();
}

pub fn domain_event(aggregate: &str, seq: u64) -> Event {
    Event::domain(
        aggregate,
        seq,
        "Order",
        SerializedObject::new("OrderUpdated", format!("{}-{}", aggregate, seq).into_bytes()),
    )
}

pub fn domain_event_with_payload(aggregate: &str, seq: u64, size: usize) -> Event {
    Event::domain(
        aggregate,
        seq,
        "Order",
        SerializedObject::new("OrderUpdated", vec![seq as u8; size]),
    )
}

pub fn plain_event(size: usize) -> Event {
    Event::non_domain(SerializedObject::new("Ping", vec![7; size]))
}

pub struct TestStore {
    pub store: Arc<EventStore>,
    pub properties: StorageProperties,
    pub _temp_dir: TempDir,
}

impl TestStore {
    pub fn new(segment_size: u64) -> Self {
        let temp_dir = TempDir::new().expect("temp dir");
        let properties = StorageProperties::new(temp_dir.path()).with_segment_size(segment_size);
        let store = EventStore::open(EventTypeContext::events(GROUP), &properties)
            .expect("open event store");
        Self {
            store: Arc::new(store),
            properties,
            _temp_dir: temp_dir,
        }
    }

    /// Opens the same directory again, after closing the current store.
    pub fn reopen(self) -> Self {
        self.store.close();
        let store = EventStore::open(EventTypeContext::events(GROUP), &self.properties)
            .expect("reopen event store");
        Self {
            store: Arc::new(store),
            properties: self.properties,
            _temp_dir: self._temp_dir,
        }
    }
}

/// Nodes of one group connected by an [`InMemoryNetwork`] and sharing a
/// manual clock. Nothing happens unless the test ticks or delivers.
pub struct TestCluster {
    pub network: Arc<InMemoryNetwork>,
    pub clock: Arc<ManualClock>,
    pub nodes: Vec<Arc<RaftNode>>,
    pub stores: Vec<TestStore>,
    dispatchers: Vec<Dispatcher>,
    disconnected: Mutex<HashSet<String>>,
}

impl TestCluster {
    pub fn new(size: usize) -> Self {
        Self::build(size, RaftConfiguration::default(), false)
    }

    /// Every node applies committed events to its own event store.
    pub fn with_event_stores(size: usize, config: RaftConfiguration) -> Self {
        Self::build(size, config, true)
    }

    fn build(size: usize, config: RaftConfiguration, event_stores: bool) -> Self {
        let network = InMemoryNetwork::new();
        let clock = Arc::new(ManualClock::new());
        let members: Vec<Node> = (0..size)
            .map(|i| Node::new(format!("n{}", i), "localhost", 7000 + i as u16))
            .collect();

        let mut nodes = Vec::new();
        let mut stores = Vec::new();
        let mut dispatchers = Vec::new();
        for member in &members {
            let mut storage = GroupStorage::in_memory();
            let mut store = None;
            if event_stores {
                let test_store = TestStore::new(1024 * 1024);
                storage = storage.with_snapshot_manager(Arc::new(EventStoreSnapshotManager::new(
                    test_store.store.clone(),
                )));
                store = Some(test_store);
            }
            let group = RaftGroup::new(
                GROUP,
                member.clone(),
                members.clone(),
                config.clone(),
                storage,
                Arc::new(ConnectionPool::new(network.connector(member.node_id.clone()))),
                clock.clone(),
            )
            .expect("raft group");
            if let Some(store) = &store {
                group
                    .log_entry_processor()
                    .register_consumer(Arc::new(EventStoreApplier::new(store.store.clone())));
            }
            let node = RaftNode::new(Arc::new(group));
            let dispatcher = Dispatcher::new();
            dispatcher.register(&node);
            network.register(member.node_id.clone(), dispatcher.clone());
            node.start().expect("start node");

            nodes.push(node);
            dispatchers.push(dispatcher);
            if let Some(store) = store {
                stores.push(store);
            }
        }
        Self {
            network,
            clock,
            nodes,
            stores,
            dispatchers,
            disconnected: Mutex::new(HashSet::new()),
        }
    }

    pub fn node(&self, node_id: &str) -> &Arc<RaftNode> {
        self.nodes
            .iter()
            .find(|node| node.node_id() == node_id)
            .expect("unknown node")
    }

    pub fn store(&self, node_id: &str) -> &Arc<EventStore> {
        let position = self
            .nodes
            .iter()
            .position(|node| node.node_id() == node_id)
            .expect("unknown node");
        &self.stores[position].store
    }

    pub fn leaders(&self) -> Vec<&Arc<RaftNode>> {
        self.nodes
            .iter()
            .filter(|node| node.role() == Role::Leader)
            .collect()
    }

    pub fn disconnect(&self, node_id: &str) {
        self.network.disconnect(node_id);
        self.disconnected.lock().insert(node_id.to_string());
    }

    pub fn reconnect(&self, node_id: &str) {
        self.network.reconnect(node_id);
        self.disconnected.lock().remove(node_id);
    }

    /// Ticks every connected node, then delivers all traffic.
    pub fn step(&self, elapsed: Duration) {
        self.clock.advance(elapsed);
        for node in &self.nodes {
            if !self.disconnected.lock().contains(node.node_id()) {
                node.tick().expect("tick");
            }
        }
        self.network.deliver_all();
    }

    /// Runs heartbeat-sized steps.
    pub fn settle(&self, rounds: usize) {
        for _ in 0..rounds {
            self.step(Duration::from_millis(100));
        }
    }

    /// Lets `node_id` time out first so that it wins the election.
    pub fn elect(&self, node_id: &str) -> Arc<RaftNode> {
        self.clock.advance(Duration::from_millis(2500));
        let node = self.node(node_id).clone();
        node.tick().expect("tick");
        self.network.deliver_all();
        assert_eq!(node.role(), Role::Leader, "{} did not win", node_id);
        self.settle(3);
        node
    }
}

impl Drop for TestCluster {
    fn drop(&mut self) {
        for node in &self.nodes {
            node.stop();
        }
        for dispatcher in &self.dispatchers {
            dispatcher.unregister(GROUP);
        }
        for store in &self.stores {
            store.store.close();
        }
    }
}
