use super::group::RaftGroup;
use super::log_store::EntryIterator;
use super::messages::{
    new_request_id, AppendEntriesRequest, AppendEntriesResponse, AppendEntriesResult,
    InstallSnapshotRequest, InstallSnapshotResponse, InstallSnapshotResult, RaftRequest,
};
use super::snapshot::{SnapshotChunks, SNAPSHOT_CHUNKS_BUFFER_SIZE};
use super::{LogEntry, NodeId, TermIndex};
use crate::error::{Error, Result};
use crate::metrics;
use std::iter::Peekable;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, info, warn};

/// What the follower last reported about its applied state.
#[derive(Debug, Clone, Copy, Default)]
struct FollowerProgress {
    last_applied_index: Option<u64>,
    last_applied_event_sequence: i64,
}

struct AppendEntryState {
    next_index: u64,
    iterator: Option<EntryIterator>,
    /// One message may go out regardless of the flow window
    probe: bool,
}

impl AppendEntryState {
    fn new(next_index: u64) -> Self {
        Self {
            next_index,
            iterator: None,
            probe: true,
        }
    }

    fn rewind(&mut self, next_index: u64) {
        self.next_index = next_index;
        self.iterator = None;
        self.probe = true;
    }

    fn can_send(&self, match_index: u64, flow_buffer: u64) -> bool {
        self.probe || self.next_index.saturating_sub(match_index) < flow_buffer
    }
}

struct InstallSnapshotState {
    chunks: Peekable<SnapshotChunks>,
    last_included: TermIndex,
    next_offset: u64,
    last_received_offset: Option<u64>,
    done_offset: Option<u64>,
    /// Start of the stream or the last acknowledged chunk
    last_progress: Instant,
}

impl InstallSnapshotState {
    fn in_flight(&self) -> u64 {
        self.next_offset - self.last_received_offset.map_or(0, |offset| offset + 1)
    }
}

enum ReplicatorState {
    Idle,
    AppendEntry(AppendEntryState),
    InstallSnapshot(InstallSnapshotState),
}

/// Leader side sender for one follower, polled by the leader's tick.
pub struct ReplicatorPeer {
    node_id: NodeId,
    match_index: AtomicU64,
    state: ReplicatorState,
    follower: FollowerProgress,
    last_message_sent: Option<Instant>,
    last_response: Option<Instant>,
}

impl ReplicatorPeer {
    pub fn new(node_id: impl Into<NodeId>) -> Self {
        Self {
            node_id: node_id.into(),
            match_index: AtomicU64::new(0),
            state: ReplicatorState::Idle,
            follower: FollowerProgress {
                last_applied_index: None,
                last_applied_event_sequence: -1,
            },
            last_message_sent: None,
            last_response: None,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Starts sending from the end of the leader's log.
    pub fn start(&mut self, group: &RaftGroup) {
        let next_index = group.local_log_entry_store().last_log_index() + 1;
        debug!(
            "{}: replicating to {} from {}",
            group.group_id(),
            self.node_id,
            next_index
        );
        self.state = ReplicatorState::AppendEntry(AppendEntryState::new(next_index));
        self.last_message_sent = None;
    }

    pub fn stop(&mut self) {
        self.state = ReplicatorState::Idle;
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.state, ReplicatorState::Idle)
    }

    pub fn is_installing_snapshot(&self) -> bool {
        matches!(self.state, ReplicatorState::InstallSnapshot(_))
    }

    pub fn match_index(&self) -> u64 {
        self.match_index.load(Ordering::Acquire)
    }

    /// Next log index to send, none unless entries are being replicated.
    pub fn next_index(&self) -> Option<u64> {
        match &self.state {
            ReplicatorState::AppendEntry(state) => Some(state.next_index),
            _ => None,
        }
    }

    /// When the follower last answered in the current term.
    pub fn last_response(&self) -> Option<Instant> {
        self.last_response
    }

    /// Sends whatever the flow window allows. Failures are logged and retried
    /// on the next poll. Returns the number of entries or chunks sent.
    pub fn send_next_entries(&mut self, group: &RaftGroup) -> usize {
        match self.try_send(group) {
            Ok(sent) => sent,
            Err(e) => {
                warn!(
                    "{}: sending to {} failed: {}",
                    group.group_id(),
                    self.node_id,
                    e
                );
                if let ReplicatorState::AppendEntry(state) = &mut self.state {
                    state.iterator = None;
                } else {
                    self.state = ReplicatorState::Idle;
                }
                0
            }
        }
    }

    fn try_send(&mut self, group: &RaftGroup) -> Result<usize> {
        if let ReplicatorState::AppendEntry(_) = self.state {
            match self.send_entries(group) {
                Err(Error::LogCompacted { requested, .. }) => {
                    info!(
                        "{}: entry {} for {} is compacted, sending snapshot",
                        group.group_id(),
                        requested,
                        self.node_id
                    );
                    self.start_snapshot(group);
                }
                other => return other,
            }
        }
        let stalled = match &self.state {
            ReplicatorState::InstallSnapshot(state) => {
                group.now().duration_since(state.last_progress)
                    >= group.raft_configuration().max_election_timeout()
            }
            _ => false,
        };
        if stalled {
            warn!(
                "{}: no snapshot progress from {}, restarting",
                group.group_id(),
                self.node_id
            );
            self.start_snapshot(group);
        }
        self.send_snapshot_chunks(group)
    }

    fn send_entries(&mut self, group: &RaftGroup) -> Result<usize> {
        let ReplicatorState::AppendEntry(state) = &mut self.state else {
            return Ok(0);
        };
        let config = group.raft_configuration();
        let now = group.now();
        let match_index = self.match_index.load(Ordering::Acquire);
        let heartbeat_due = self
            .last_message_sent
            .map_or(true, |sent| now.duration_since(sent) >= config.heartbeat_timeout());
        if heartbeat_due && !state.probe && state.next_index > match_index + 1 {
            // nothing acknowledged for a heartbeat interval
            state.rewind(match_index + 1);
        }
        if state.iterator.is_none() {
            state.iterator = Some(EntryIterator::new(
                group.local_log_entry_store().clone(),
                state.next_index,
            )?);
        }
        let peer = group.peer(&self.node_id)?;

        let mut sent = 0usize;
        while state.can_send(match_index, config.flow_buffer) {
            let Some(iterator) = state.iterator.as_mut() else {
                break;
            };
            let previous = iterator.previous();
            let mut entries = Vec::new();
            while entries.len() < config.max_entries_per_batch {
                match iterator.next() {
                    Some(entry) => entries.push(entry?),
                    None => break,
                }
            }
            if entries.is_empty() {
                break;
            }
            let count = entries.len();
            if let Err(e) = peer.send(append_entries_request(group, previous, entries)) {
                state.iterator = None;
                return Err(e);
            }
            state.next_index += count as u64;
            state.probe = false;
            sent += count;
            self.last_message_sent = Some(now);
        }

        if sent == 0 && heartbeat_due {
            let previous = match group.local_log_entry_store().term_at(match_index)? {
                Some(term) => TermIndex::new(term, match_index),
                None => state
                    .iterator
                    .as_ref()
                    .map(|iterator| iterator.previous())
                    .unwrap_or_default(),
            };
            peer.send(append_entries_request(group, previous, Vec::new()))?;
            self.last_message_sent = Some(now);
        }
        if sent > 0 {
            metrics::log_entries(group.group_id(), "replicated", sent as u64);
        }
        Ok(sent)
    }

    fn start_snapshot(&mut self, group: &RaftGroup) {
        let manager = group.snapshot_manager();
        let last_included = group.log_entry_processor().last_applied();
        let to_sequence = manager.last_sequence();
        let from_sequence = match self.follower.last_applied_index {
            None | Some(0) => 0,
            Some(_) => self.follower.last_applied_event_sequence + 1,
        };
        info!(
            "{}: installing snapshot on {} up to {}, events {}..={}",
            group.group_id(),
            self.node_id,
            last_included,
            from_sequence,
            to_sequence
        );
        self.state = ReplicatorState::InstallSnapshot(InstallSnapshotState {
            chunks: manager
                .stream_snapshot_chunks(from_sequence, to_sequence)
                .peekable(),
            last_included,
            next_offset: 0,
            last_received_offset: None,
            done_offset: None,
            last_progress: group.now(),
        });
    }

    fn send_snapshot_chunks(&mut self, group: &RaftGroup) -> Result<usize> {
        let ReplicatorState::InstallSnapshot(state) = &mut self.state else {
            return Ok(0);
        };
        let config = group.raft_configuration();
        let peer = group.peer(&self.node_id)?;
        let mut sent = 0usize;
        while state.done_offset.is_none()
            && sent < config.max_snapshot_chunks_per_batch
            && state.in_flight() < config.snapshot_flow_buffer
        {
            let mut data = Vec::with_capacity(SNAPSHOT_CHUNKS_BUFFER_SIZE);
            while data.len() < SNAPSHOT_CHUNKS_BUFFER_SIZE {
                match state.chunks.next() {
                    Some(chunk) => data.push(chunk?),
                    None => break,
                }
            }
            let done = state.chunks.peek().is_none();
            let offset = state.next_offset;
            let count = data.len();
            let request = InstallSnapshotRequest {
                group_id: group.group_id().to_string(),
                request_id: new_request_id(),
                term: group.current_term(),
                leader_id: group.local_node_id().to_string(),
                last_included_term: state.last_included.term,
                last_included_index: state.last_included.index,
                offset,
                done,
                data,
                last_config: (offset == 0).then(|| group.members()),
            };
            peer.send(RaftRequest::InstallSnapshot(request))?;
            for _ in 0..count {
                metrics::snapshot_chunk_sent(group.group_id());
            }
            state.next_offset += 1;
            if done {
                state.done_offset = Some(offset);
            }
            sent += count;
            self.last_message_sent = Some(group.now());
        }
        Ok(sent)
    }

    /// Moves the follower's cursors. A response from a newer term only updates
    /// the local term; the owning leader steps down on its next check.
    pub fn handle_append_entries_response(
        &mut self,
        group: &RaftGroup,
        response: &AppendEntriesResponse,
    ) -> Result<()> {
        if !self.accept_response(group, response.term, &response.responder_id)? {
            return Ok(());
        }
        match response.result {
            AppendEntriesResult::Success { last_log_index } => {
                let matched = self
                    .match_index
                    .fetch_max(last_log_index, Ordering::AcqRel)
                    .max(last_log_index);
                if let ReplicatorState::AppendEntry(state) = &mut self.state {
                    if state.next_index <= matched {
                        state.rewind(matched + 1);
                    }
                }
            }
            AppendEntriesResult::Failure {
                last_applied_index,
                last_applied_event_sequence,
            } => {
                self.follower = FollowerProgress {
                    last_applied_index: Some(last_applied_index),
                    last_applied_event_sequence,
                };
                if let ReplicatorState::AppendEntry(state) = &mut self.state {
                    debug!(
                        "{}: {} rejected entries, resending from {}",
                        group.group_id(),
                        self.node_id,
                        last_applied_index + 1
                    );
                    state.rewind(last_applied_index + 1);
                }
            }
        }
        Ok(())
    }

    pub fn handle_install_snapshot_response(
        &mut self,
        group: &RaftGroup,
        response: &InstallSnapshotResponse,
    ) -> Result<()> {
        if !self.accept_response(group, response.term, &response.responder_id)? {
            return Ok(());
        }
        let ReplicatorState::InstallSnapshot(state) = &mut self.state else {
            return Ok(());
        };
        match response.result {
            InstallSnapshotResult::Success {
                last_received_offset,
            } => {
                state.last_received_offset = Some(
                    state
                        .last_received_offset
                        .map_or(last_received_offset, |o| o.max(last_received_offset)),
                );
                state.last_progress = group.now();
                if state.done_offset == Some(last_received_offset) {
                    let index = state.last_included.index;
                    self.match_index.fetch_max(index, Ordering::AcqRel);
                    info!(
                        "{}: snapshot installed on {} up to {}",
                        group.group_id(),
                        self.node_id,
                        index
                    );
                    self.state = ReplicatorState::AppendEntry(AppendEntryState::new(index + 1));
                }
            }
            InstallSnapshotResult::Failure => {
                warn!(
                    "{}: {} failed to install snapshot",
                    group.group_id(),
                    self.node_id
                );
                self.state = ReplicatorState::Idle;
            }
        }
        Ok(())
    }

    /// Handles the term of a response, true when it belongs to the current term.
    fn accept_response(&mut self, group: &RaftGroup, term: u64, responder: &str) -> Result<bool> {
        let current = group.current_term();
        if term > current {
            group.update_current_term(term, &format!("response from {}", responder))?;
            return Ok(false);
        }
        if term < current {
            return Ok(false);
        }
        self.last_response = Some(group.now());
        Ok(true)
    }
}

fn append_entries_request(
    group: &RaftGroup,
    previous: TermIndex,
    entries: Vec<LogEntry>,
) -> RaftRequest {
    RaftRequest::AppendEntries(AppendEntriesRequest {
        group_id: group.group_id().to_string(),
        request_id: new_request_id(),
        term: group.current_term(),
        leader_id: group.local_node_id().to_string(),
        prev_log_index: previous.index,
        prev_log_term: previous.term,
        commit_index: group.log_entry_processor().commit_index(),
        entries,
    })
}
