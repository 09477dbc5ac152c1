//! Raft messages over TCP.
//!
//! Each frame is a big-endian `u32` length followed by the bincode encoding of
//! a request or response. A peer connection carries requests one way and the
//! responses back on the same stream; a request may go unanswered.

use super::group::{PeerConnector, RaftPeer};
use super::messages::{RaftRequest, RaftResponse};
use super::network::Dispatcher;
use super::{Node, NodeId};
use crate::error::{Error, Result};
use bincode::{config, Decode, Encode};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;
const OUTBOUND_QUEUE_SIZE: usize = 1024;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

async fn write_frame<W, T>(writer: &mut W, value: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Encode,
{
    let bytes = bincode::encode_to_vec(value, config::standard())?;
    if bytes.len() > MAX_FRAME_SIZE {
        return Err(Error::PayloadTooLarge {
            size: bytes.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    writer.write_all(&(bytes.len() as u32).to_be_bytes()).await?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// None when the stream was closed between frames.
async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: Decode<()>,
{
    let mut len = [0u8; 4];
    match reader.read_exact(&mut len).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(Error::PayloadTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }
    let mut buffer = vec![0u8; len];
    reader.read_exact(&mut buffer).await?;
    let (value, _) = bincode::decode_from_slice(&buffer, config::standard())?;
    Ok(Some(value))
}

/// Accepts peer connections and answers their requests through a dispatcher.
pub struct RaftServer {
    local_addr: SocketAddr,
    shutdown_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

impl RaftServer {
    pub async fn bind(address: &str, dispatcher: Dispatcher) -> Result<Self> {
        let listener = TcpListener::bind(address).await?;
        let local_addr = listener.local_addr()?;
        info!("raft server listening on {}", local_addr);

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
        let handle = tokio::spawn(async move {
            let mut connections = Vec::new();
            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            debug!("accepted raft connection from {}", peer);
                            connections.retain(|c: &JoinHandle<()>| !c.is_finished());
                            connections.push(tokio::spawn(serve(stream, dispatcher.clone())));
                        }
                        Err(e) => warn!("failed to accept raft connection: {}", e),
                    },
                    _ = shutdown_rx.recv() => break,
                }
            }
            for connection in connections {
                connection.abort();
            }
        });
        Ok(Self {
            local_addr,
            shutdown_tx,
            handle,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
        let _ = self.handle.await;
    }
}

async fn serve(stream: TcpStream, dispatcher: Dispatcher) {
    let (mut reader, mut writer) = stream.into_split();
    loop {
        let request: RaftRequest = match read_frame(&mut reader).await {
            Ok(Some(request)) => request,
            Ok(None) => return,
            Err(e) => {
                debug!("dropping raft connection: {}", e);
                return;
            }
        };
        // handlers take the node lock and may append to the event store
        let handler = dispatcher.clone();
        let handled = tokio::task::spawn_blocking(move || handler.handle_request(&request)).await;
        let response = match handled {
            Ok(response) => response,
            Err(e) => {
                warn!("raft request handler failed: {}", e);
                return;
            }
        };
        if let Some(response) = response {
            if let Err(e) = write_frame(&mut writer, &response).await {
                debug!("failed to answer raft request: {}", e);
                return;
            }
        }
    }
}

/// Connects peers over TCP. Responses are handed to `dispatcher`.
pub struct TcpConnector {
    runtime: Handle,
    dispatcher: Dispatcher,
}

impl TcpConnector {
    pub fn new(runtime: Handle, dispatcher: Dispatcher) -> Self {
        Self {
            runtime,
            dispatcher,
        }
    }
}

impl PeerConnector for TcpConnector {
    fn connect(&self, _group_id: &str, node: &Node) -> Result<Arc<dyn RaftPeer>> {
        Ok(Arc::new(TcpRaftPeer::spawn(
            &self.runtime,
            node,
            self.dispatcher.clone(),
        )))
    }
}

/// Queues requests for a background task that owns the connection.
/// The task reconnects on the next request after a failure and ends when the
/// peer is dropped.
pub struct TcpRaftPeer {
    node_id: NodeId,
    tx: mpsc::Sender<RaftRequest>,
}

impl TcpRaftPeer {
    pub fn spawn(runtime: &Handle, node: &Node, dispatcher: Dispatcher) -> Self {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_SIZE);
        runtime.spawn(run_connection(node.clone(), rx, dispatcher));
        Self {
            node_id: node.node_id.clone(),
            tx,
        }
    }
}

impl RaftPeer for TcpRaftPeer {
    fn node_id(&self) -> &str {
        &self.node_id
    }

    fn send(&self, request: RaftRequest) -> Result<()> {
        self.tx.try_send(request).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => Error::Io(io::Error::new(
                io::ErrorKind::WouldBlock,
                format!("outbound queue to {} is full", self.node_id),
            )),
            mpsc::error::TrySendError::Closed(_) => Error::Shutdown,
        })
    }
}

async fn run_connection(
    node: Node,
    mut rx: mpsc::Receiver<RaftRequest>,
    dispatcher: Dispatcher,
) {
    let address = node.address();
    let mut connection: Option<(OwnedWriteHalf, JoinHandle<()>)> = None;
    while let Some(request) = rx.recv().await {
        if connection
            .as_ref()
            .is_some_and(|(_, reader)| reader.is_finished())
        {
            connection = None;
        }
        if connection.is_none() {
            match timeout(CONNECT_TIMEOUT, TcpStream::connect(&address)).await {
                Ok(Ok(stream)) => {
                    let _ = stream.set_nodelay(true);
                    let (reader, writer) = stream.into_split();
                    let reader = tokio::spawn(read_responses(
                        reader,
                        dispatcher.clone(),
                        node.node_id.clone(),
                    ));
                    connection = Some((writer, reader));
                }
                Ok(Err(e)) => {
                    debug!("cannot connect to {} at {}: {}", node.node_id, address, e);
                    continue;
                }
                Err(_) => {
                    debug!("timed out connecting to {} at {}", node.node_id, address);
                    continue;
                }
            }
        }
        if let Some((writer, _)) = connection.as_mut() {
            if let Err(e) = write_frame(writer, &request).await {
                debug!("failed to send to {}: {}", node.node_id, e);
                if let Some((_, reader)) = connection.take() {
                    reader.abort();
                }
            }
        }
    }
    if let Some((_, reader)) = connection {
        reader.abort();
    }
}

async fn read_responses(mut reader: OwnedReadHalf, dispatcher: Dispatcher, node_id: NodeId) {
    loop {
        match read_frame::<_, RaftResponse>(&mut reader).await {
            Ok(Some(response)) => {
                let handler = dispatcher.clone();
                if let Err(e) =
                    tokio::task::spawn_blocking(move || handler.on_response(&response)).await
                {
                    warn!("raft response handler for {} failed: {}", node_id, e);
                    return;
                }
            }
            Ok(None) => return,
            Err(e) => {
                debug!("connection to {} failed: {}", node_id, e);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::messages::RequestVoteRequest;

    #[tokio::test]
    async fn test_frames_round_trip_over_a_stream() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let request = RaftRequest::RequestVote(RequestVoteRequest {
            group_id: "g".to_string(),
            term: 4,
            candidate_id: "n1".to_string(),
            last_log_index: 12,
            last_log_term: 3,
            request_id: "r".to_string(),
        });
        write_frame(&mut client, &request).await.unwrap();
        drop(client);

        let read: Option<RaftRequest> = read_frame(&mut server).await.unwrap();
        assert_eq!(read, Some(request));
        let closed: Option<RaftRequest> = read_frame(&mut server).await.unwrap();
        assert_eq!(closed, None);
    }

    #[tokio::test]
    async fn test_server_answers_vote_requests() {
        use crate::config::RaftConfiguration;
        use crate::raft::test_support::{group_with, Outbox};
        use crate::raft::{GroupStorage, ManualClock, RaftNode};

        let group = group_with(
            3,
            GroupStorage::in_memory(),
            RaftConfiguration::default(),
            Arc::new(Outbox::default()),
            Arc::new(ManualClock::new()),
        );
        let node = RaftNode::new(Arc::new(group));
        node.start().unwrap();
        let dispatcher = Dispatcher::new();
        dispatcher.register(&node);
        let server = RaftServer::bind("127.0.0.1:0", dispatcher).await.unwrap();

        let stream = TcpStream::connect(server.local_addr()).await.unwrap();
        let (mut reader, mut writer) = stream.into_split();
        let request = RaftRequest::RequestVote(RequestVoteRequest {
            group_id: node.group_id().to_string(),
            term: 1,
            candidate_id: "n1".to_string(),
            last_log_index: 0,
            last_log_term: 0,
            request_id: "vote-1".to_string(),
        });
        write_frame(&mut writer, &request).await.unwrap();
        let response: Option<RaftResponse> = read_frame(&mut reader).await.unwrap();
        let Some(RaftResponse::RequestVote(vote)) = response else {
            panic!("expected a vote response, got {:?}", response);
        };
        assert!(vote.vote_granted);
        assert_eq!(node.current_term(), 1);

        server.shutdown().await;
        node.stop();
    }

    #[tokio::test]
    async fn test_oversized_frame_is_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client
            .write_all(&((MAX_FRAME_SIZE + 1) as u32).to_be_bytes())
            .await
            .unwrap();
        let result: Result<Option<RaftRequest>> = read_frame(&mut server).await;
        assert!(matches!(result, Err(Error::PayloadTooLarge { .. })));
    }
}
