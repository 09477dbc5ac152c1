use super::{
    append_entries_failure, append_entries_response, install_snapshot_response, vote_response,
    Transition,
};
use crate::error::Result;
use crate::raft::group::RaftGroup;
use crate::raft::messages::{
    AppendEntriesRequest, AppendEntriesResponse, AppendEntriesResult, InstallSnapshotRequest,
    InstallSnapshotResponse, InstallSnapshotResult, RequestVoteRequest, RequestVoteResponse,
};
use crate::raft::{NodeId, TermIndex};
use std::time::Instant;
use tracing::{debug, error, info, warn};

pub struct FollowerState {
    election_deadline: Instant,
    leader: Option<NodeId>,
    /// Offset of the next install snapshot request, none outside a snapshot
    next_snapshot_offset: Option<u64>,
}

impl FollowerState {
    pub fn new(group: &RaftGroup) -> Self {
        Self {
            election_deadline: group.next_election_deadline(),
            leader: None,
            next_snapshot_offset: None,
        }
    }

    pub fn leader(&self) -> Option<&str> {
        self.leader.as_deref()
    }

    pub fn tick(&mut self, group: &RaftGroup) -> Option<Transition> {
        if group.now() < self.election_deadline {
            return None;
        }
        if !group.is_member(group.local_node_id()) {
            self.election_deadline = group.next_election_deadline();
            return None;
        }
        Some(Transition::ToCandidate)
    }

    /// Accepts the leader of `term`, adopting the term when it is newer.
    fn follow(&mut self, group: &RaftGroup, term: u64, leader_id: &str) -> Result<()> {
        group.update_current_term(term, &format!("message from leader {}", leader_id))?;
        self.election_deadline = group.next_election_deadline();
        if self.leader.as_deref() != Some(leader_id) {
            info!(
                "{}: following {} in term {}",
                group.group_id(),
                leader_id,
                term
            );
            self.leader = Some(leader_id.to_string());
        }
        Ok(())
    }

    pub fn append_entries(
        &mut self,
        group: &RaftGroup,
        request: &AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        if request.term < group.current_term() {
            return Ok(append_entries_failure(group, request));
        }
        self.follow(group, request.term, &request.leader_id)?;

        let log = group.local_log_entry_store();
        let processor = group.log_entry_processor();
        let boundary = log.boundary();
        if request.prev_log_index > boundary.index
            && log.term_at(request.prev_log_index)? != Some(request.prev_log_term)
        {
            debug!(
                "{}: no entry {}@{}, last log {}",
                group.group_id(),
                request.prev_log_index,
                request.prev_log_term,
                log.last_log()
            );
            return Ok(append_entries_failure(group, request));
        }

        for (position, entry) in request.entries.iter().enumerate() {
            if entry.index <= boundary.index {
                continue;
            }
            match log.term_at(entry.index)? {
                Some(term) if term == entry.term => continue,
                Some(term) => {
                    if entry.index <= processor.commit_index() {
                        error!(
                            "{}: entry {} conflicts with committed term {}",
                            group.group_id(),
                            entry.term_index(),
                            term
                        );
                        return Ok(append_entries_failure(group, request));
                    }
                    warn!(
                        "{}: replacing entries from {} (term {} -> {})",
                        group.group_id(),
                        entry.index,
                        term,
                        entry.term
                    );
                    log.delete_from(entry.index)?;
                }
                None => {}
            }
            log.append(&request.entries[position..])?;
            break;
        }

        let last_new = request.prev_log_index + request.entries.len() as u64;
        let commit = request.commit_index.min(last_new);
        if commit > processor.commit_index() {
            if let Some(term) = log.term_at(commit)? {
                processor.mark_committed(TermIndex::new(term, commit))?;
                group.on_commit(commit);
            }
        }
        Ok(append_entries_response(
            group,
            request,
            AppendEntriesResult::Success {
                last_log_index: last_new,
            },
        ))
    }

    pub fn request_vote(
        &mut self,
        group: &RaftGroup,
        request: &RequestVoteRequest,
    ) -> Result<RequestVoteResponse> {
        if request.term < group.current_term() {
            return Ok(vote_response(group, request, false));
        }
        group.update_current_term(
            request.term,
            &format!("vote request from {}", request.candidate_id),
        )?;

        let election_store = group.local_election_store();
        let candidate_log = TermIndex::new(request.last_log_term, request.last_log_index);
        let free = election_store
            .voted_for()
            .map_or(true, |voted_for| voted_for == request.candidate_id);
        let granted =
            free && candidate_log.is_up_to_date_with(&group.local_log_entry_store().last_log());
        if granted {
            election_store.mark_voted_for(Some(request.candidate_id.clone()))?;
            self.election_deadline = group.next_election_deadline();
        }
        debug!(
            "{}: vote for {} in term {}: {}",
            group.group_id(),
            request.candidate_id,
            request.term,
            granted
        );
        Ok(vote_response(group, request, granted))
    }

    pub fn install_snapshot(
        &mut self,
        group: &RaftGroup,
        request: &InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        if request.term < group.current_term() {
            return Ok(install_snapshot_response(
                group,
                request,
                InstallSnapshotResult::Failure,
            ));
        }
        self.follow(group, request.term, &request.leader_id)?;

        let manager = group.snapshot_manager();
        let processor = group.log_entry_processor();
        if request.offset == 0 {
            info!(
                "{}: receiving snapshot up to {}@{}",
                group.group_id(),
                request.last_included_index,
                request.last_included_term
            );
            if processor.last_applied_index() == 0 {
                manager.clear()?;
            }
            if let Some(members) = &request.last_config {
                group.update_members(members.clone());
            }
            self.next_snapshot_offset = Some(0);
        }
        if self.next_snapshot_offset != Some(request.offset) {
            warn!(
                "{}: snapshot request {} out of order, expected {:?}",
                group.group_id(),
                request.offset,
                self.next_snapshot_offset
            );
            return Ok(install_snapshot_response(
                group,
                request,
                InstallSnapshotResult::Failure,
            ));
        }
        for chunk in &request.data {
            if let Err(e) = manager.apply_snapshot_data(chunk) {
                warn!("{}: failed to apply snapshot chunk: {}", group.group_id(), e);
                self.next_snapshot_offset = None;
                return Ok(install_snapshot_response(
                    group,
                    request,
                    InstallSnapshotResult::Failure,
                ));
            }
        }
        self.next_snapshot_offset = Some(request.offset + 1);

        if request.done {
            let last_included =
                TermIndex::new(request.last_included_term, request.last_included_index);
            group.local_log_entry_store().reset(last_included)?;
            processor.reset(last_included)?;
            group.on_commit(last_included.index);
            self.next_snapshot_offset = None;
            info!(
                "{}: snapshot installed up to {}",
                group.group_id(),
                last_included
            );
        }
        Ok(install_snapshot_response(
            group,
            request,
            InstallSnapshotResult::Success {
                last_received_offset: request.offset,
            },
        ))
    }
}
