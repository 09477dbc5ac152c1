use super::group::{PeerConnector, RaftPeer};
use super::messages::{RaftRequest, RaftResponse};
use super::node::RaftNode;
use super::{Node, NodeId};
use crate::error::Result;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

/// Routes incoming messages to the local node of their group.
#[derive(Clone, Default)]
pub struct Dispatcher {
    nodes: Arc<DashMap<String, Weak<RaftNode>>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, node: &Arc<RaftNode>) {
        self.nodes
            .insert(node.group_id().to_string(), Arc::downgrade(node));
    }

    pub fn unregister(&self, group_id: &str) {
        self.nodes.remove(group_id);
    }

    fn node(&self, group_id: &str) -> Option<Arc<RaftNode>> {
        let node = self.nodes.get(group_id).and_then(|node| node.upgrade());
        if node.is_none() {
            debug!("no local node for group {}", group_id);
        }
        node
    }

    /// Answers a request, none when the group is unknown or handling failed.
    pub fn handle_request(&self, request: &RaftRequest) -> Option<RaftResponse> {
        let node = self.node(request.group_id())?;
        match node.handle_request(request) {
            Ok(response) => Some(response),
            Err(e) => {
                warn!("{}: failed to handle request: {}", request.group_id(), e);
                None
            }
        }
    }

    pub fn on_response(&self, response: &RaftResponse) {
        if let Some(node) = self.node(response.group_id()) {
            if let Err(e) = node.on_response(response) {
                warn!(
                    "{}: failed to handle response from {}: {}",
                    response.group_id(),
                    response.responder_id(),
                    e
                );
            }
        }
    }
}

struct Envelope {
    from: NodeId,
    to: NodeId,
    request: RaftRequest,
}

/// Message queue between nodes of one process. Nothing moves until
/// [`InMemoryNetwork::deliver_all`] is called.
#[derive(Default)]
pub struct InMemoryNetwork {
    queue: Mutex<VecDeque<Envelope>>,
    dispatchers: DashMap<NodeId, Dispatcher>,
    disconnected: Mutex<HashSet<NodeId>>,
}

impl InMemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, node_id: impl Into<NodeId>, dispatcher: Dispatcher) {
        self.dispatchers.insert(node_id.into(), dispatcher);
    }

    pub fn connector(self: &Arc<Self>, node_id: impl Into<NodeId>) -> Arc<InMemoryConnector> {
        Arc::new(InMemoryConnector {
            network: self.clone(),
            from: node_id.into(),
        })
    }

    /// Drops every message from and to `node_id` until reconnected.
    pub fn disconnect(&self, node_id: &str) {
        self.disconnected.lock().insert(node_id.to_string());
    }

    pub fn reconnect(&self, node_id: &str) {
        self.disconnected.lock().remove(node_id);
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    fn is_connected(&self, node_id: &str) -> bool {
        !self.disconnected.lock().contains(node_id)
    }

    fn dispatcher(&self, node_id: &str) -> Option<Dispatcher> {
        self.dispatchers.get(node_id).map(|d| d.clone())
    }

    fn enqueue(&self, envelope: Envelope) {
        self.queue.lock().push_back(envelope);
    }

    /// Delivers queued requests and their responses, including the ones sent
    /// while delivering. Returns the number of requests handled.
    pub fn deliver_all(&self) -> usize {
        let mut delivered = 0;
        loop {
            let Some(envelope) = self.queue.lock().pop_front() else {
                return delivered;
            };
            if !self.is_connected(&envelope.from) || !self.is_connected(&envelope.to) {
                continue;
            }
            let Some(receiver) = self.dispatcher(&envelope.to) else {
                continue;
            };
            delivered += 1;
            let Some(response) = receiver.handle_request(&envelope.request) else {
                continue;
            };
            if !self.is_connected(&envelope.from) || !self.is_connected(&envelope.to) {
                continue;
            }
            if let Some(sender) = self.dispatcher(&envelope.from) {
                sender.on_response(&response);
            }
        }
    }
}

pub struct InMemoryConnector {
    network: Arc<InMemoryNetwork>,
    from: NodeId,
}

impl PeerConnector for InMemoryConnector {
    fn connect(&self, _group_id: &str, node: &Node) -> Result<Arc<dyn RaftPeer>> {
        Ok(Arc::new(InMemoryPeer {
            network: self.network.clone(),
            from: self.from.clone(),
            to: node.node_id.clone(),
        }))
    }
}

struct InMemoryPeer {
    network: Arc<InMemoryNetwork>,
    from: NodeId,
    to: NodeId,
}

impl RaftPeer for InMemoryPeer {
    fn node_id(&self) -> &str {
        &self.to
    }

    fn send(&self, request: RaftRequest) -> Result<()> {
        self.network.enqueue(Envelope {
            from: self.from.clone(),
            to: self.to.clone(),
            request,
        });
        Ok(())
    }
}
