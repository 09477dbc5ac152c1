use super::Transition;
use crate::error::Result;
use crate::raft::election::{Election, ElectionResult, MajorityStrategy};
use crate::raft::group::RaftGroup;
use crate::raft::messages::RaftResponse;
use std::time::Instant;

pub struct CandidateState {
    election: Election,
    deadline: Instant,
}

impl CandidateState {
    pub fn start(group: &RaftGroup) -> Result<Self> {
        Ok(Self {
            election: Election::start(group, Box::new(MajorityStrategy))?,
            deadline: group.next_election_deadline(),
        })
    }

    pub fn election(&self) -> &Election {
        &self.election
    }

    pub fn decided(&self) -> Option<Transition> {
        self.election.result().map(|result| match result {
            ElectionResult::Won => Transition::ToLeader,
            ElectionResult::Lost { cause } => Transition::ToFollower { cause },
        })
    }

    /// A split vote runs into the deadline and starts the next election.
    pub fn tick(&mut self, group: &RaftGroup) -> Option<Transition> {
        self.decided().or_else(|| {
            (group.now() >= self.deadline).then_some(Transition::ToCandidate)
        })
    }

    pub fn on_response(
        &mut self,
        group: &RaftGroup,
        response: &RaftResponse,
    ) -> Result<Option<Transition>> {
        match response {
            RaftResponse::RequestVote(vote) => {
                self.election.on_vote_response(group, vote)?;
                Ok(self.decided())
            }
            other => {
                let newer = group.update_current_term(
                    other.term(),
                    &format!("response from {}", other.responder_id()),
                )?;
                Ok(newer.then(|| Transition::ToFollower {
                    cause: format!("{} is in newer term {}", other.responder_id(), other.term()),
                }))
            }
        }
    }
}
