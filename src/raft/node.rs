use super::group::RaftGroup;
use super::membership::{FollowerState, Handled, MembershipState, Transition};
use super::messages::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    RaftRequest, RaftResponse, RequestVoteRequest, RequestVoteResponse,
};
use super::{EntryPayload, Node, NodeId, Role};
use crate::error::{Error, Result};
use crate::metrics;
use parking_lot::{Mutex, MutexGuard};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Resolved with the log index once the entry is applied.
pub type Completion = oneshot::Receiver<Result<u64>>;

/// The local member of one raft group.
///
/// Requests, responses and ticks may arrive on any thread. They are applied to
/// the membership state one at a time.
pub struct RaftNode {
    group: Arc<RaftGroup>,
    state: Mutex<MembershipState>,
    pending: Mutex<BTreeMap<u64, oneshot::Sender<Result<u64>>>>,
}

impl RaftNode {
    pub fn new(group: Arc<RaftGroup>) -> Arc<Self> {
        Arc::new(Self {
            group,
            state: Mutex::new(MembershipState::Idle),
            pending: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn group(&self) -> &Arc<RaftGroup> {
        &self.group
    }

    pub fn group_id(&self) -> &str {
        self.group.group_id()
    }

    pub fn node_id(&self) -> &str {
        self.group.local_node_id()
    }

    /// Joins the group as a follower.
    pub fn start(&self) -> Result<()> {
        let mut state = self.state.lock();
        if let MembershipState::Idle = *state {
            self.transition(
                &mut state,
                Transition::ToFollower {
                    cause: "started".to_string(),
                },
            );
        }
        Ok(())
    }

    pub fn stop(&self) {
        let mut state = self.state.lock();
        self.transition(&mut state, Transition::ToIdle);
    }

    /// Drives timeouts, replication and apply. Called periodically.
    pub fn tick(&self) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(transition) = state.tick(&self.group)? {
            self.transition(&mut state, transition);
        }
        self.apply_committed();
        self.compact_log();
        Ok(())
    }

    pub fn role(&self) -> Role {
        self.state.lock().role()
    }

    pub fn is_leader(&self) -> bool {
        self.role() == Role::Leader
    }

    pub fn leader(&self) -> Option<NodeId> {
        self.state.lock().leader(&self.group)
    }

    pub fn current_term(&self) -> u64 {
        self.group.current_term()
    }

    pub fn commit_index(&self) -> u64 {
        self.group.log_entry_processor().commit_index()
    }

    pub fn last_applied_index(&self) -> u64 {
        self.group.log_entry_processor().last_applied_index()
    }

    /// Match index of a follower while this node leads.
    pub fn match_index(&self, node_id: &str) -> Option<u64> {
        self.state
            .lock()
            .leader_state()
            .and_then(|leader| leader.replicator(node_id))
            .map(|replicator| replicator.match_index())
    }

    pub fn append_entries(&self, request: &AppendEntriesRequest) -> Result<AppendEntriesResponse> {
        let mut state = self.state.lock();
        let response = match state.append_entries(&self.group, request)? {
            Handled::Reply(response) => response,
            Handled::AsFollower { cause } => {
                let mut follower = self.leave(&mut state, cause);
                let response = follower.append_entries(&self.group, request);
                *state = MembershipState::Follower(follower);
                response?
            }
        };
        self.apply_committed();
        Ok(response)
    }

    pub fn request_vote(&self, request: &RequestVoteRequest) -> Result<RequestVoteResponse> {
        let mut state = self.state.lock();
        match state.request_vote(&self.group, request)? {
            Handled::Reply(response) => Ok(response),
            Handled::AsFollower { cause } => {
                let mut follower = self.leave(&mut state, cause);
                let response = follower.request_vote(&self.group, request);
                *state = MembershipState::Follower(follower);
                response
            }
        }
    }

    pub fn install_snapshot(
        &self,
        request: &InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        let mut state = self.state.lock();
        match state.install_snapshot(&self.group, request)? {
            Handled::Reply(response) => Ok(response),
            Handled::AsFollower { cause } => {
                let mut follower = self.leave(&mut state, cause);
                let response = follower.install_snapshot(&self.group, request);
                *state = MembershipState::Follower(follower);
                response
            }
        }
    }

    pub fn handle_request(&self, request: &RaftRequest) -> Result<RaftResponse> {
        Ok(match request {
            RaftRequest::RequestVote(r) => RaftResponse::RequestVote(self.request_vote(r)?),
            RaftRequest::AppendEntries(r) => RaftResponse::AppendEntries(self.append_entries(r)?),
            RaftRequest::InstallSnapshot(r) => {
                RaftResponse::InstallSnapshot(self.install_snapshot(r)?)
            }
        })
    }

    pub fn on_response(&self, response: &RaftResponse) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(transition) = state.on_response(&self.group, response)? {
            self.transition(&mut state, transition);
        }
        self.apply_committed();
        Ok(())
    }

    /// Appends application data. Fails with [`Error::NotLeader`] on followers.
    pub fn append_entry(&self, entry_type: &str, data: Vec<u8>) -> Result<Completion> {
        let mut state = self.leader_state()?;
        let entry = self.group.local_log_entry_store().create_entry(
            self.group.current_term(),
            EntryPayload::Serialized {
                entry_type: entry_type.to_string(),
                data,
            },
        )?;
        metrics::log_entries(self.group_id(), "appended", 1);
        self.complete_on_apply(&mut state, entry.index)
    }

    /// Adds a member, one change at a time.
    pub fn add_node(&self, node: Node) -> Result<Completion> {
        let mut state = self.leader_state()?;
        let mut members = self.group.members();
        if members.iter().any(|m| m.node_id == node.node_id) {
            return Err(Error::Config(format!(
                "{} is already a member of {}",
                node.node_id,
                self.group_id()
            )));
        }
        info!("{}: adding {}", self.group_id(), node.node_id);
        members.push(node);
        let index = self
            .group
            .propose_members(self.group.current_term(), members)?;
        self.complete_on_apply(&mut state, index)
    }

    pub fn remove_node(&self, node_id: &str) -> Result<Completion> {
        let mut state = self.leader_state()?;
        let mut members = self.group.members();
        let before = members.len();
        members.retain(|m| m.node_id != node_id);
        if members.len() == before {
            return Err(Error::Config(format!(
                "{} is not a member of {}",
                node_id,
                self.group_id()
            )));
        }
        info!("{}: removing {}", self.group_id(), node_id);
        let index = self
            .group
            .propose_members(self.group.current_term(), members)?;
        self.complete_on_apply(&mut state, index)
    }

    fn leader_state(&self) -> Result<MutexGuard<'_, MembershipState>> {
        let state = self.state.lock();
        if state.role() != Role::Leader {
            return Err(Error::NotLeader {
                leader: state.leader(&self.group),
            });
        }
        Ok(state)
    }

    fn complete_on_apply(&self, state: &mut MembershipState, index: u64) -> Result<Completion> {
        let (sender, receiver) = oneshot::channel();
        self.pending.lock().insert(index, sender);
        if let Some(leader) = state.leader_state_mut() {
            leader.advance_commit(&self.group)?;
        }
        self.apply_committed();
        Ok(receiver)
    }

    /// Stops the current state and returns the follower that replaces it.
    fn leave(&self, state: &mut MembershipState, cause: String) -> FollowerState {
        let from = state.role();
        state.stop();
        if from == Role::Leader {
            self.fail_pending();
        }
        info!(
            "{}: {} -> {} ({})",
            self.group_id(),
            from,
            Role::Follower,
            cause
        );
        FollowerState::new(&self.group)
    }

    fn transition(&self, state: &mut MembershipState, transition: Transition) {
        let mut next = Some(transition);
        while let Some(transition) = next.take() {
            let from = state.role();
            state.stop();
            *state = match MembershipState::enter(&self.group, &transition) {
                Ok(entered) => entered,
                Err(e) => {
                    error!(
                        "{}: cannot leave {} ({}): {}",
                        self.group_id(),
                        from,
                        transition,
                        e
                    );
                    MembershipState::Follower(FollowerState::new(&self.group))
                }
            };
            info!(
                "{}: {} -> {} ({})",
                self.group_id(),
                from,
                state.role(),
                transition
            );
            if from == Role::Leader && state.role() != Role::Leader {
                self.fail_pending();
            }
            next = state.immediate_transition();
        }
    }

    fn fail_pending(&self) {
        let pending = std::mem::take(&mut *self.pending.lock());
        for (_, sender) in pending {
            let _ = sender.send(Err(Error::NotLeader { leader: None }));
        }
    }

    /// Applies committed entries and completes the clients waiting for them.
    fn apply_committed(&self) {
        let group = &self.group;
        let processor = group.log_entry_processor();
        let result = processor.apply(group.local_log_entry_store().as_ref(), |entry| {
            if let EntryPayload::Configuration { members } = &entry.payload {
                group.apply_members(entry.index, members.clone());
            }
        });
        if let Err(e) = result {
            warn!("{}: apply stopped: {}", self.group_id(), e);
        }

        let last_applied = processor.last_applied_index();
        let mut pending = self.pending.lock();
        let waiting = pending.split_off(&(last_applied + 1));
        for (index, sender) in std::mem::replace(&mut *pending, waiting) {
            let _ = sender.send(Ok(index));
        }
    }

    fn compact_log(&self) {
        let config = self.group.raft_configuration();
        if !config.log_compaction_enabled {
            return;
        }
        let log = self.group.local_log_entry_store();
        let target = self
            .group
            .log_entry_processor()
            .last_applied_index()
            .saturating_sub(config.retained_log_entries);
        if target > log.boundary().index {
            if let Err(e) = log.compact_to(target) {
                warn!("{}: log compaction to {} failed: {}", self.group_id(), target, e);
            }
        }
    }
}

/// Background task ticking a node at a fixed interval.
pub struct RaftTicker {
    shutdown_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

impl RaftTicker {
    /// Must be called within a tokio runtime.
    pub fn spawn(node: Arc<RaftNode>, interval: Duration) -> Self {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let ticked = node.clone();
                        match tokio::task::spawn_blocking(move || ticked.tick()).await {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => warn!("{}: tick failed: {}", node.group_id(), e),
                            Err(e) => warn!("{}: tick task failed: {}", node.group_id(), e),
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        break;
                    }
                }
            }
        });
        Self {
            shutdown_tx,
            handle,
        }
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
        let _ = self.handle.await;
    }
}
