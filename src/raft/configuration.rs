use super::{Node, NodeId};

/// Member list of a group and whether the latest change to it is committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentConfiguration {
    members: Vec<Node>,
    /// Log index of a configuration entry that is not committed yet
    pending_index: Option<u64>,
}

impl CurrentConfiguration {
    pub fn new(members: Vec<Node>) -> Self {
        Self {
            members,
            pending_index: None,
        }
    }

    pub fn group_members(&self) -> &[Node] {
        &self.members
    }

    pub fn is_committed(&self) -> bool {
        self.pending_index.is_none()
    }

    pub fn is_member(&self, node_id: &str) -> bool {
        self.members.iter().any(|m| m.node_id == node_id)
    }

    pub fn member(&self, node_id: &str) -> Option<&Node> {
        self.members.iter().find(|m| m.node_id == node_id)
    }

    pub fn member_ids(&self) -> Vec<NodeId> {
        self.members.iter().map(|m| m.node_id.clone()).collect()
    }

    /// Switches to a new member list appended at `index`, effective immediately.
    pub fn propose(&mut self, members: Vec<Node>, index: u64) {
        self.members = members;
        self.pending_index = Some(index);
    }

    /// Member list taken from a committed entry or a snapshot.
    pub fn apply(&mut self, members: Vec<Node>) {
        self.members = members;
        self.pending_index = None;
    }

    /// Member list of an applied configuration entry. Ignored when a later
    /// change is pending.
    pub fn apply_at(&mut self, index: u64, members: Vec<Node>) -> bool {
        if self.pending_index.is_some_and(|pending| pending > index) {
            return false;
        }
        self.apply(members);
        true
    }

    /// Marks a pending change committed once the commit index reaches it.
    pub fn on_commit(&mut self, commit_index: u64) -> bool {
        match self.pending_index {
            Some(index) if index <= commit_index => {
                self.pending_index = None;
                true
            }
            _ => false,
        }
    }
}
