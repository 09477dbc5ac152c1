use super::Transition;
use crate::error::Result;
use crate::metrics;
use crate::raft::group::RaftGroup;
use crate::raft::messages::RaftResponse;
use crate::raft::replicator::ReplicatorPeer;
use crate::raft::{majority, EntryPayload, NodeId, TermIndex};
use std::collections::HashMap;
use std::time::Instant;
use tracing::{debug, info};

pub struct LeaderState {
    replicators: HashMap<NodeId, ReplicatorPeer>,
    since: Instant,
}

impl LeaderState {
    /// Starts a replicator per follower and appends the entry that commits
    /// everything from earlier terms.
    pub fn start(group: &RaftGroup) -> Result<Self> {
        let mut leader = Self {
            replicators: HashMap::new(),
            since: group.now(),
        };
        leader.sync_replicators(group);
        let entry = group
            .local_log_entry_store()
            .create_entry(group.current_term(), EntryPayload::Noop)?;
        metrics::log_entries(group.group_id(), "appended", 1);
        info!(
            "{}: leader in term {}, first entry {}",
            group.group_id(),
            group.current_term(),
            entry.index
        );
        leader.advance_commit(group)?;
        Ok(leader)
    }

    pub fn stop(&mut self) {
        for replicator in self.replicators.values_mut() {
            replicator.stop();
        }
    }

    pub fn replicator(&self, node_id: &str) -> Option<&ReplicatorPeer> {
        self.replicators.get(node_id)
    }

    pub fn tick(&mut self, group: &RaftGroup) -> Result<Option<Transition>> {
        self.sync_replicators(group);
        for replicator in self.replicators.values_mut() {
            if replicator.is_idle() {
                replicator.start(group);
            }
            replicator.send_next_entries(group);
        }
        self.advance_commit(group)?;

        let configuration = group.configuration();
        if configuration.is_committed() && !configuration.is_member(group.local_node_id()) {
            return Ok(Some(Transition::ToFollower {
                cause: "removed from the group".to_string(),
            }));
        }
        Ok(self.lost_quorum(group).map(|cause| Transition::ToFollower { cause }))
    }

    pub fn on_response(
        &mut self,
        group: &RaftGroup,
        response: &RaftResponse,
    ) -> Result<Option<Transition>> {
        let term = group.current_term();
        let replicator = self.replicators.get_mut(response.responder_id());
        match (response, replicator) {
            (RaftResponse::AppendEntries(r), Some(replicator)) => {
                replicator.handle_append_entries_response(group, r)?
            }
            (RaftResponse::InstallSnapshot(r), Some(replicator)) => {
                replicator.handle_install_snapshot_response(group, r)?
            }
            (RaftResponse::RequestVote(_), _) | (_, None) => {
                group.update_current_term(
                    response.term(),
                    &format!("response from {}", response.responder_id()),
                )?;
            }
        }
        if group.current_term() > term {
            return Ok(Some(Transition::ToFollower {
                cause: format!(
                    "{} is in newer term {}",
                    response.responder_id(),
                    response.term()
                ),
            }));
        }
        self.advance_commit(group)?;
        Ok(None)
    }

    /// Commits the highest index stored on a majority, if it is from the
    /// current term.
    pub fn advance_commit(&self, group: &RaftGroup) -> Result<bool> {
        let log = group.local_log_entry_store();
        let local = group.local_node_id();
        let last_log_index = log.last_log_index();
        let mut matched: Vec<u64> = group
            .members()
            .iter()
            .map(|member| {
                if member.node_id == local {
                    last_log_index
                } else {
                    self.replicators
                        .get(&member.node_id)
                        .map_or(0, |replicator| replicator.match_index())
                }
            })
            .collect();
        if matched.is_empty() {
            return Ok(false);
        }
        matched.sort_unstable_by(|a, b| b.cmp(a));
        let index = matched[majority(matched.len()) - 1];

        let processor = group.log_entry_processor();
        let term = group.current_term();
        if index <= processor.commit_index() || log.term_at(index)? != Some(term) {
            return Ok(false);
        }
        processor.mark_committed(TermIndex::new(term, index))?;
        group.on_commit(index);
        Ok(true)
    }

    /// Cause for stepping down when a majority has not answered for the
    /// maximum election timeout.
    fn lost_quorum(&self, group: &RaftGroup) -> Option<String> {
        let now = group.now();
        let timeout = group.raft_configuration().max_election_timeout();
        if now.duration_since(self.since) < timeout {
            return None;
        }
        let members = group.members();
        let local = group.local_node_id();
        let reachable = members
            .iter()
            .filter(|member| {
                member.node_id == local
                    || self
                        .replicators
                        .get(&member.node_id)
                        .and_then(|replicator| replicator.last_response())
                        .is_some_and(|at| now.duration_since(at) < timeout)
            })
            .count();
        if reachable >= majority(members.len()) {
            return None;
        }
        Some(format!(
            "only {} of {} members reachable",
            reachable,
            members.len()
        ))
    }

    fn sync_replicators(&mut self, group: &RaftGroup) {
        let others = group.other_members();
        self.replicators.retain(|node_id, _| {
            let keep = others.iter().any(|member| &member.node_id == node_id);
            if !keep {
                debug!("{}: stop replicating to {}", group.group_id(), node_id);
            }
            keep
        });
        for member in others {
            self.replicators
                .entry(member.node_id.clone())
                .or_insert_with(|| {
                    let mut replicator = ReplicatorPeer::new(member.node_id.clone());
                    replicator.start(group);
                    replicator
                });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RaftConfiguration;
    use crate::raft::clock::ManualClock;
    use crate::raft::group::GroupStorage;
    use crate::raft::messages::{AppendEntriesResponse, AppendEntriesResult, RaftRequest};
    use crate::raft::test_support::{group, group_with, Outbox};
    use std::sync::Arc;
    use std::time::Duration;

    fn ack(from: &str, term: u64, last_log_index: u64) -> RaftResponse {
        RaftResponse::AppendEntries(AppendEntriesResponse {
            group_id: "g".to_string(),
            request_id: "r".to_string(),
            responder_id: from.to_string(),
            term,
            result: AppendEntriesResult::Success { last_log_index },
        })
    }

    #[test]
    fn test_start_appends_noop_and_replicates_it() {
        let outbox = Arc::new(Outbox::default());
        let group = group(3, outbox.clone());
        group.update_current_term(1, "test").unwrap();
        let mut leader = LeaderState::start(&group).unwrap();
        assert_eq!(group.local_log_entry_store().last_log(), TermIndex::new(1, 1));

        leader.tick(&group).unwrap();
        let sent: Vec<_> = outbox
            .take()
            .into_iter()
            .filter_map(|(to, request)| match request {
                RaftRequest::AppendEntries(r) => Some((to, r.entries.len())),
                _ => None,
            })
            .collect();
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|(_, entries)| *entries == 1));
    }

    #[test]
    fn test_commit_needs_majority_in_current_term() {
        let outbox = Arc::new(Outbox::default());
        let group = group(5, outbox);
        group.update_current_term(2, "test").unwrap();
        let mut leader = LeaderState::start(&group).unwrap();
        let processor = group.log_entry_processor().clone();

        leader.on_response(&group, &ack("n1", 2, 1)).unwrap();
        assert_eq!(processor.commit_index(), 0);
        leader.on_response(&group, &ack("n2", 2, 1)).unwrap();
        assert_eq!(processor.commit_index(), 1);
    }

    #[test]
    fn test_newer_term_steps_down() {
        let outbox = Arc::new(Outbox::default());
        let group = group(3, outbox);
        group.update_current_term(1, "test").unwrap();
        let mut leader = LeaderState::start(&group).unwrap();
        let transition = leader.on_response(&group, &ack("n1", 5, 0)).unwrap();
        assert!(matches!(transition, Some(Transition::ToFollower { .. })));
        assert_eq!(group.current_term(), 5);
    }

    #[test]
    fn test_steps_down_without_quorum() {
        let outbox = Arc::new(Outbox::default());
        let clock = Arc::new(ManualClock::new());
        let group = group_with(
            3,
            GroupStorage::in_memory(),
            RaftConfiguration::default(),
            outbox,
            clock.clone(),
        );
        group.update_current_term(1, "test").unwrap();
        let mut leader = LeaderState::start(&group).unwrap();

        clock.advance(Duration::from_millis(1000));
        leader.on_response(&group, &ack("n1", 1, 1)).unwrap();
        clock.advance(Duration::from_millis(2000));
        assert_eq!(leader.tick(&group).unwrap(), None);

        clock.advance(Duration::from_millis(1000));
        assert!(matches!(
            leader.tick(&group).unwrap(),
            Some(Transition::ToFollower { .. })
        ));
    }

    #[test]
    fn test_single_member_commits_alone() {
        let outbox = Arc::new(Outbox::default());
        let group = group(1, outbox);
        group.update_current_term(1, "test").unwrap();
        LeaderState::start(&group).unwrap();
        assert_eq!(group.log_entry_processor().commit_index(), 1);
    }
}
