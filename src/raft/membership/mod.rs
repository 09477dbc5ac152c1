//! Role of the local node in a group.
//!
//! Every state answers the three requests. Candidates and leaders that see a
//! request from a newer term hand it over to a new follower state, which is the
//! only place the term is adopted from a request.

mod candidate;
mod follower;
mod leader;

pub use candidate::CandidateState;
pub use follower::FollowerState;
pub use leader::LeaderState;

use super::group::RaftGroup;
use super::messages::{
    AppendEntriesRequest, AppendEntriesResponse, AppendEntriesResult, InstallSnapshotRequest,
    InstallSnapshotResponse, InstallSnapshotResult, RaftResponse, RequestVoteRequest,
    RequestVoteResponse,
};
use super::{NodeId, Role};
use crate::error::Result;
use std::fmt;

/// Next state requested by the current one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    ToFollower { cause: String },
    ToCandidate,
    ToLeader,
    ToIdle,
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transition::ToFollower { cause } => f.write_str(cause),
            Transition::ToCandidate => f.write_str("election timeout"),
            Transition::ToLeader => f.write_str("election won"),
            Transition::ToIdle => f.write_str("stopped"),
        }
    }
}

/// Result of a request handled by the current state.
#[derive(Debug)]
pub enum Handled<R> {
    Reply(R),
    /// The request is from a newer leader or candidate and must be handled by
    /// a follower
    AsFollower { cause: String },
}

pub enum MembershipState {
    Idle,
    Follower(FollowerState),
    Candidate(CandidateState),
    Leader(LeaderState),
}

impl MembershipState {
    /// Creates and starts the state a transition leads to.
    pub fn enter(group: &RaftGroup, transition: &Transition) -> Result<Self> {
        Ok(match transition {
            Transition::ToFollower { .. } => MembershipState::Follower(FollowerState::new(group)),
            Transition::ToCandidate => MembershipState::Candidate(CandidateState::start(group)?),
            Transition::ToLeader => MembershipState::Leader(LeaderState::start(group)?),
            Transition::ToIdle => MembershipState::Idle,
        })
    }

    pub fn role(&self) -> Role {
        match self {
            MembershipState::Idle => Role::Idle,
            MembershipState::Follower(_) => Role::Follower,
            MembershipState::Candidate(_) => Role::Candidate,
            MembershipState::Leader(_) => Role::Leader,
        }
    }

    pub fn leader(&self, group: &RaftGroup) -> Option<NodeId> {
        match self {
            MembershipState::Follower(follower) => follower.leader().map(str::to_string),
            MembershipState::Leader(_) => Some(group.local_node_id().to_string()),
            _ => None,
        }
    }

    pub fn leader_state(&self) -> Option<&LeaderState> {
        match self {
            MembershipState::Leader(leader) => Some(leader),
            _ => None,
        }
    }

    pub fn leader_state_mut(&mut self) -> Option<&mut LeaderState> {
        match self {
            MembershipState::Leader(leader) => Some(leader),
            _ => None,
        }
    }

    pub fn stop(&mut self) {
        if let MembershipState::Leader(leader) = self {
            leader.stop();
        }
    }

    /// A transition that is due right after entering this state.
    pub fn immediate_transition(&self) -> Option<Transition> {
        match self {
            MembershipState::Candidate(candidate) => candidate.decided(),
            _ => None,
        }
    }

    pub fn tick(&mut self, group: &RaftGroup) -> Result<Option<Transition>> {
        match self {
            MembershipState::Idle => Ok(None),
            MembershipState::Follower(follower) => Ok(follower.tick(group)),
            MembershipState::Candidate(candidate) => Ok(candidate.tick(group)),
            MembershipState::Leader(leader) => leader.tick(group),
        }
    }

    pub fn append_entries(
        &mut self,
        group: &RaftGroup,
        request: &AppendEntriesRequest,
    ) -> Result<Handled<AppendEntriesResponse>> {
        match self {
            MembershipState::Idle => Ok(Handled::Reply(append_entries_failure(group, request))),
            MembershipState::Follower(follower) => {
                follower.append_entries(group, request).map(Handled::Reply)
            }
            MembershipState::Candidate(_) if request.term >= group.current_term() => {
                Ok(Handled::AsFollower {
                    cause: format!("{} is leader in term {}", request.leader_id, request.term),
                })
            }
            MembershipState::Leader(_) if request.term > group.current_term() => {
                Ok(Handled::AsFollower {
                    cause: format!("{} is leader in term {}", request.leader_id, request.term),
                })
            }
            _ => Ok(Handled::Reply(append_entries_failure(group, request))),
        }
    }

    pub fn request_vote(
        &mut self,
        group: &RaftGroup,
        request: &RequestVoteRequest,
    ) -> Result<Handled<RequestVoteResponse>> {
        match self {
            MembershipState::Idle => Ok(Handled::Reply(vote_response(group, request, false))),
            MembershipState::Follower(follower) => {
                follower.request_vote(group, request).map(Handled::Reply)
            }
            _ if request.term > group.current_term() => Ok(Handled::AsFollower {
                cause: format!(
                    "{} is candidate in term {}",
                    request.candidate_id, request.term
                ),
            }),
            _ => Ok(Handled::Reply(vote_response(group, request, false))),
        }
    }

    pub fn install_snapshot(
        &mut self,
        group: &RaftGroup,
        request: &InstallSnapshotRequest,
    ) -> Result<Handled<InstallSnapshotResponse>> {
        match self {
            MembershipState::Idle => Ok(Handled::Reply(install_snapshot_response(
                group,
                request,
                InstallSnapshotResult::Failure,
            ))),
            MembershipState::Follower(follower) => {
                follower.install_snapshot(group, request).map(Handled::Reply)
            }
            MembershipState::Candidate(_) if request.term >= group.current_term() => {
                Ok(Handled::AsFollower {
                    cause: format!("{} is leader in term {}", request.leader_id, request.term),
                })
            }
            MembershipState::Leader(_) if request.term > group.current_term() => {
                Ok(Handled::AsFollower {
                    cause: format!("{} is leader in term {}", request.leader_id, request.term),
                })
            }
            _ => Ok(Handled::Reply(install_snapshot_response(
                group,
                request,
                InstallSnapshotResult::Failure,
            ))),
        }
    }

    pub fn on_response(
        &mut self,
        group: &RaftGroup,
        response: &RaftResponse,
    ) -> Result<Option<Transition>> {
        match self {
            MembershipState::Idle => Ok(None),
            MembershipState::Follower(_) => {
                group.update_current_term(
                    response.term(),
                    &format!("response from {}", response.responder_id()),
                )?;
                Ok(None)
            }
            MembershipState::Candidate(candidate) => candidate.on_response(group, response),
            MembershipState::Leader(leader) => leader.on_response(group, response),
        }
    }
}

/// Rejection that lets the leader restart after the local applied state.
pub(crate) fn append_entries_failure(
    group: &RaftGroup,
    request: &AppendEntriesRequest,
) -> AppendEntriesResponse {
    let processor = group.log_entry_processor();
    append_entries_response(
        group,
        request,
        AppendEntriesResult::Failure {
            last_applied_index: processor.last_applied_index(),
            last_applied_event_sequence: processor.last_applied_event_sequence(),
        },
    )
}

pub(crate) fn append_entries_response(
    group: &RaftGroup,
    request: &AppendEntriesRequest,
    result: AppendEntriesResult,
) -> AppendEntriesResponse {
    AppendEntriesResponse {
        group_id: group.group_id().to_string(),
        request_id: request.request_id.clone(),
        responder_id: group.local_node_id().to_string(),
        term: group.current_term(),
        result,
    }
}

pub(crate) fn vote_response(
    group: &RaftGroup,
    request: &RequestVoteRequest,
    vote_granted: bool,
) -> RequestVoteResponse {
    RequestVoteResponse {
        group_id: group.group_id().to_string(),
        request_id: request.request_id.clone(),
        responder_id: group.local_node_id().to_string(),
        term: group.current_term(),
        vote_granted,
    }
}

pub(crate) fn install_snapshot_response(
    group: &RaftGroup,
    request: &InstallSnapshotRequest,
    result: InstallSnapshotResult,
) -> InstallSnapshotResponse {
    InstallSnapshotResponse {
        group_id: group.group_id().to_string(),
        request_id: request.request_id.clone(),
        responder_id: group.local_node_id().to_string(),
        term: group.current_term(),
        result,
    }
}
