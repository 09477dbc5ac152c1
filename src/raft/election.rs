use super::group::RaftGroup;
use super::messages::{new_request_id, RaftRequest, RequestVoteRequest, RequestVoteResponse};
use super::{majority, NodeId};
use crate::error::Result;
use crate::metrics;
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Decides an election from the votes counted so far.
pub trait VoteStrategy: Send + Sync {
    fn is_won(&self, granted: usize, members: usize) -> bool;

    fn is_lost(&self, denied: usize, members: usize) -> bool;
}

/// Needs `members / 2 + 1` granted votes, the local vote included.
#[derive(Debug, Default, Clone, Copy)]
pub struct MajorityStrategy;

impl VoteStrategy for MajorityStrategy {
    fn is_won(&self, granted: usize, members: usize) -> bool {
        granted >= majority(members)
    }

    fn is_lost(&self, denied: usize, members: usize) -> bool {
        denied > members.saturating_sub(majority(members))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElectionResult {
    Won,
    Lost { cause: String },
}

impl ElectionResult {
    pub fn is_won(&self) -> bool {
        matches!(self, ElectionResult::Won)
    }
}

#[derive(Default)]
struct Tally {
    votes: HashMap<NodeId, bool>,
    result: Option<ElectionResult>,
}

/// One election attempt of a candidate.
pub struct Election {
    group_id: String,
    term: u64,
    members: usize,
    request_ids: HashMap<NodeId, String>,
    strategy: Box<dyn VoteStrategy>,
    tally: Mutex<Tally>,
}

impl Election {
    /// Moves to the next term, votes for the local node and asks every other
    /// member for its vote.
    pub fn start(group: &RaftGroup, strategy: Box<dyn VoteStrategy>) -> Result<Self> {
        let term = group.current_term() + 1;
        group.update_current_term(term, "election timeout")?;
        let local = group.local_node_id().to_string();
        group
            .local_election_store()
            .mark_voted_for(Some(local.clone()))?;
        metrics::election_started(group.group_id());

        let last_log = group.local_log_entry_store().last_log();
        let members = group.members();
        let mut tally = Tally::default();
        if members.iter().any(|m| m.node_id == local) {
            tally.votes.insert(local, true);
        }

        let mut request_ids = HashMap::new();
        for member in group.other_members() {
            let request = RequestVoteRequest {
                group_id: group.group_id().to_string(),
                term,
                candidate_id: group.local_node_id().to_string(),
                last_log_index: last_log.index,
                last_log_term: last_log.term,
                request_id: new_request_id(),
            };
            request_ids.insert(member.node_id.clone(), request.request_id.clone());
            let sent = group
                .peer(&member.node_id)
                .and_then(|peer| peer.send(RaftRequest::RequestVote(request)));
            if let Err(e) = sent {
                warn!(
                    "{}: failed to request vote from {}: {}",
                    group.group_id(),
                    member.node_id,
                    e
                );
            }
        }
        info!(
            "{}: starting election for term {} with {} members",
            group.group_id(),
            term,
            members.len()
        );

        let election = Self {
            group_id: group.group_id().to_string(),
            term,
            members: members.len(),
            request_ids,
            strategy,
            tally: Mutex::new(tally),
        };
        election.evaluate(&mut election.tally.lock());
        Ok(election)
    }

    pub fn term(&self) -> u64 {
        self.term
    }

    /// Counts a vote once per voter. Returns the result once decided.
    pub fn on_vote_response(
        &self,
        group: &RaftGroup,
        response: &RequestVoteResponse,
    ) -> Result<Option<ElectionResult>> {
        let mut tally = self.tally.lock();
        if tally.result.is_some() {
            return Ok(tally.result.clone());
        }
        if response.term > self.term {
            group.update_current_term(
                response.term,
                &format!("vote response from {}", response.responder_id),
            )?;
            let result = ElectionResult::Lost {
                cause: format!(
                    "{} is in newer term {}",
                    response.responder_id, response.term
                ),
            };
            metrics::election_finished(&self.group_id, false);
            tally.result = Some(result.clone());
            return Ok(Some(result));
        }
        if response.term < self.term
            || self.request_ids.get(&response.responder_id) != Some(&response.request_id)
        {
            debug!(
                "{}: ignoring stale vote from {} for term {}",
                self.group_id, response.responder_id, response.term
            );
            return Ok(None);
        }
        if tally.votes.contains_key(&response.responder_id) {
            return Ok(None);
        }
        tally
            .votes
            .insert(response.responder_id.clone(), response.vote_granted);
        self.evaluate(&mut tally);
        Ok(tally.result.clone())
    }

    pub fn result(&self) -> Option<ElectionResult> {
        self.tally.lock().result.clone()
    }

    pub fn is_won(&self) -> bool {
        matches!(self.result(), Some(ElectionResult::Won))
    }

    fn evaluate(&self, tally: &mut Tally) {
        let granted = tally.votes.values().filter(|granted| **granted).count();
        let denied = tally.votes.len() - granted;
        let result = if self.strategy.is_won(granted, self.members) {
            ElectionResult::Won
        } else if self.strategy.is_lost(denied, self.members) {
            ElectionResult::Lost {
                cause: format!("{} of {} members denied the vote", denied, self.members),
            }
        } else {
            return;
        };
        info!(
            "{}: election for term {} {}",
            self.group_id,
            self.term,
            if result.is_won() { "won" } else { "lost" }
        );
        metrics::election_finished(&self.group_id, result.is_won());
        tally.result = Some(result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::test_support::{group, Outbox};
    use std::sync::Arc;

    fn vote(election: &Election, outbox: &Outbox, from: &str, granted: bool) -> RequestVoteResponse {
        let request_id = outbox
            .sent()
            .into_iter()
            .find_map(|(to, request)| match request {
                RaftRequest::RequestVote(r) if to == from => Some(r.request_id),
                _ => None,
            })
            .unwrap();
        RequestVoteResponse {
            group_id: "g".to_string(),
            request_id,
            responder_id: from.to_string(),
            term: election.term(),
            vote_granted: granted,
        }
    }

    #[test]
    fn test_start_bumps_term_and_votes_for_self() {
        let outbox = Arc::new(Outbox::default());
        let group = group(3, outbox.clone());
        let election = Election::start(&group, Box::new(MajorityStrategy)).unwrap();

        assert_eq!(election.term(), 1);
        assert_eq!(group.current_term(), 1);
        assert_eq!(group.local_election_store().voted_for().as_deref(), Some("n0"));
        assert_eq!(outbox.sent().len(), 2);
        assert_eq!(election.result(), None);
    }

    #[test]
    fn test_three_members_need_one_other_vote() {
        let outbox = Arc::new(Outbox::default());
        let group = group(3, outbox.clone());
        let election = Election::start(&group, Box::new(MajorityStrategy)).unwrap();

        assert!(!election.is_won());
        let response = vote(&election, &outbox, "n1", true);
        assert_eq!(
            election.on_vote_response(&group, &response).unwrap(),
            Some(ElectionResult::Won)
        );
    }

    #[test]
    fn test_five_members_count_each_voter_once() {
        let outbox = Arc::new(Outbox::default());
        let group = group(5, outbox.clone());
        let election = Election::start(&group, Box::new(MajorityStrategy)).unwrap();

        let response = vote(&election, &outbox, "n1", true);
        election.on_vote_response(&group, &response).unwrap();
        election.on_vote_response(&group, &response).unwrap();
        assert!(!election.is_won());

        let response = vote(&election, &outbox, "n2", true);
        election.on_vote_response(&group, &response).unwrap();
        assert!(election.is_won());
    }

    #[test]
    fn test_denials_lose_the_election() {
        let outbox = Arc::new(Outbox::default());
        let group = group(3, outbox.clone());
        let election = Election::start(&group, Box::new(MajorityStrategy)).unwrap();

        let response = vote(&election, &outbox, "n1", false);
        assert_eq!(election.on_vote_response(&group, &response).unwrap(), None);
        let response = vote(&election, &outbox, "n2", false);
        assert!(matches!(
            election.on_vote_response(&group, &response).unwrap(),
            Some(ElectionResult::Lost { .. })
        ));
    }

    #[test]
    fn test_higher_term_loses_and_updates_term() {
        let outbox = Arc::new(Outbox::default());
        let group = group(3, outbox.clone());
        let election = Election::start(&group, Box::new(MajorityStrategy)).unwrap();

        let mut response = vote(&election, &outbox, "n1", false);
        response.term = 7;
        assert!(matches!(
            election.on_vote_response(&group, &response).unwrap(),
            Some(ElectionResult::Lost { .. })
        ));
        assert_eq!(group.current_term(), 7);
        assert_eq!(group.local_election_store().voted_for(), None);
    }

    #[test]
    fn test_stale_responses_are_ignored() {
        let outbox = Arc::new(Outbox::default());
        let group = group(3, outbox.clone());
        let first = Election::start(&group, Box::new(MajorityStrategy)).unwrap();
        let old_vote = vote(&first, &outbox, "n1", true);

        outbox.take();
        let second = Election::start(&group, Box::new(MajorityStrategy)).unwrap();
        assert_eq!(second.term(), 2);
        assert_eq!(second.on_vote_response(&group, &old_vote).unwrap(), None);

        let mut wrong_id = vote(&second, &outbox, "n1", true);
        wrong_id.request_id = "not-ours".to_string();
        assert_eq!(second.on_vote_response(&group, &wrong_id).unwrap(), None);
        assert!(!second.is_won());
    }

    #[test]
    fn test_single_member_wins_immediately() {
        let outbox = Arc::new(Outbox::default());
        let group = group(1, outbox);
        let election = Election::start(&group, Box::new(MajorityStrategy)).unwrap();
        assert!(election.is_won());
    }
}
