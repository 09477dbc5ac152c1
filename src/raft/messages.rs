use super::{LogEntry, Node, NodeId};
use crate::storage::event::SerializedObject;
use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

/// RequestVote RPC arguments
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct RequestVoteRequest {
    pub group_id: String,

    /// Candidate's term
    pub term: u64,

    pub candidate_id: NodeId,

    /// Index of candidate's last log entry
    pub last_log_index: u64,

    /// Term of candidate's last log entry
    pub last_log_term: u64,

    /// Random id, echoed in the response so late answers can be matched
    pub request_id: String,
}

/// RequestVote RPC reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct RequestVoteResponse {
    pub group_id: String,
    pub request_id: String,
    pub responder_id: NodeId,
    pub term: u64,
    pub vote_granted: bool,
}

/// AppendEntries RPC arguments, an empty entry list is a heartbeat
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct AppendEntriesRequest {
    pub group_id: String,
    pub request_id: String,
    pub term: u64,
    pub leader_id: NodeId,

    /// Index of log entry immediately preceding the new ones
    pub prev_log_index: u64,

    /// Term of the prev_log_index entry
    pub prev_log_term: u64,

    /// Leader's commit index
    pub commit_index: u64,

    pub entries: Vec<LogEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub enum AppendEntriesResult {
    /// The follower's log matches the leader's up to `last_log_index`
    Success { last_log_index: u64 },

    /// Lets the leader restart replication after the follower's applied state
    Failure {
        last_applied_index: u64,
        last_applied_event_sequence: i64,
    },
}

/// AppendEntries RPC reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct AppendEntriesResponse {
    pub group_id: String,
    pub request_id: String,
    pub responder_id: NodeId,
    pub term: u64,
    pub result: AppendEntriesResult,
}

impl AppendEntriesResponse {
    pub fn is_success(&self) -> bool {
        matches!(self.result, AppendEntriesResult::Success { .. })
    }
}

/// InstallSnapshot RPC arguments
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct InstallSnapshotRequest {
    pub group_id: String,
    pub request_id: String,
    pub term: u64,
    pub leader_id: NodeId,
    pub last_included_term: u64,
    pub last_included_index: u64,

    /// Sequence number of this request within the snapshot, starting at 0
    pub offset: u64,

    /// True for the final request of the snapshot
    pub done: bool,

    pub data: Vec<SerializedObject>,

    /// Group members, sent with the first request only
    pub last_config: Option<Vec<Node>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub enum InstallSnapshotResult {
    Success { last_received_offset: u64 },
    Failure,
}

/// InstallSnapshot RPC reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct InstallSnapshotResponse {
    pub group_id: String,
    pub request_id: String,
    pub responder_id: NodeId,
    pub term: u64,
    pub result: InstallSnapshotResult,
}

/// Requests a node receives from a peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub enum RaftRequest {
    RequestVote(RequestVoteRequest),
    AppendEntries(AppendEntriesRequest),
    InstallSnapshot(InstallSnapshotRequest),
}

impl RaftRequest {
    pub fn group_id(&self) -> &str {
        match self {
            RaftRequest::RequestVote(r) => &r.group_id,
            RaftRequest::AppendEntries(r) => &r.group_id,
            RaftRequest::InstallSnapshot(r) => &r.group_id,
        }
    }

    pub fn term(&self) -> u64 {
        match self {
            RaftRequest::RequestVote(r) => r.term,
            RaftRequest::AppendEntries(r) => r.term,
            RaftRequest::InstallSnapshot(r) => r.term,
        }
    }
}

/// Responses travelling back to the node that sent the request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub enum RaftResponse {
    RequestVote(RequestVoteResponse),
    AppendEntries(AppendEntriesResponse),
    InstallSnapshot(InstallSnapshotResponse),
}

impl RaftResponse {
    pub fn group_id(&self) -> &str {
        match self {
            RaftResponse::RequestVote(r) => &r.group_id,
            RaftResponse::AppendEntries(r) => &r.group_id,
            RaftResponse::InstallSnapshot(r) => &r.group_id,
        }
    }

    pub fn term(&self) -> u64 {
        match self {
            RaftResponse::RequestVote(r) => r.term,
            RaftResponse::AppendEntries(r) => r.term,
            RaftResponse::InstallSnapshot(r) => r.term,
        }
    }

    pub fn responder_id(&self) -> &str {
        match self {
            RaftResponse::RequestVote(r) => &r.responder_id,
            RaftResponse::AppendEntries(r) => &r.responder_id,
            RaftResponse::InstallSnapshot(r) => &r.responder_id,
        }
    }
}

/// Random identifier for a request.
pub fn new_request_id() -> String {
    format!("{:016x}", rand::random::<u64>())
}
