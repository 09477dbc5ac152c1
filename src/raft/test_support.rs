use super::clock::ManualClock;
use super::group::{ConnectionPool, GroupStorage, PeerConnector, RaftGroup, RaftPeer};
use super::messages::RaftRequest;
use super::{Node, NodeId};
use crate::config::RaftConfiguration;
use crate::error::Result;
use parking_lot::Mutex;
use std::sync::Arc;

/// Captures requests instead of delivering them.
#[derive(Default)]
pub(crate) struct Outbox {
    sent: Mutex<Vec<(NodeId, RaftRequest)>>,
}

impl Outbox {
    pub(crate) fn take(&self) -> Vec<(NodeId, RaftRequest)> {
        std::mem::take(&mut *self.sent.lock())
    }

    pub(crate) fn sent(&self) -> Vec<(NodeId, RaftRequest)> {
        self.sent.lock().clone()
    }
}

struct OutboxPeer {
    node_id: NodeId,
    outbox: Arc<Outbox>,
}

impl RaftPeer for OutboxPeer {
    fn node_id(&self) -> &str {
        &self.node_id
    }

    fn send(&self, request: RaftRequest) -> Result<()> {
        self.outbox.sent.lock().push((self.node_id.clone(), request));
        Ok(())
    }
}

pub(crate) struct OutboxConnector(pub Arc<Outbox>);

impl PeerConnector for OutboxConnector {
    fn connect(&self, _group_id: &str, node: &Node) -> Result<Arc<dyn RaftPeer>> {
        Ok(Arc::new(OutboxPeer {
            node_id: node.node_id.clone(),
            outbox: self.0.clone(),
        }))
    }
}

/// Nodes `n0..n{size}` on consecutive local ports.
pub(crate) fn members(size: usize) -> Vec<Node> {
    (0..size)
        .map(|i| Node::new(format!("n{}", i), "localhost", 9000 + i as u16))
        .collect()
}

/// Group seen from `n0`.
pub(crate) fn group_with(
    size: usize,
    storage: GroupStorage,
    config: RaftConfiguration,
    outbox: Arc<Outbox>,
    clock: Arc<ManualClock>,
) -> RaftGroup {
    let members = members(size);
    RaftGroup::new(
        "g",
        members[0].clone(),
        members,
        config,
        storage,
        Arc::new(ConnectionPool::new(Arc::new(OutboxConnector(outbox)))),
        clock,
    )
    .unwrap()
}

pub(crate) fn group(size: usize, outbox: Arc<Outbox>) -> RaftGroup {
    group_with(
        size,
        GroupStorage::in_memory(),
        RaftConfiguration::default(),
        outbox,
        Arc::new(ManualClock::new()),
    )
}
