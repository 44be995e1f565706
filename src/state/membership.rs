//! Domain Membership
//!
//! Tracks the set of nodes that take part in the local domain's election.

use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::state::{DomainId, DomainNode, NodeId};

/// Validated view of the local node and its domain peers
#[derive(Debug, Clone)]
pub struct DomainMembership {
    /// This node
    local: DomainNode,
    /// Other nodes of the local domain, keyed by id
    peers: BTreeMap<NodeId, DomainNode>,
}

impl DomainMembership {
    /// Create membership for a node with no known peers
    pub fn new(local: DomainNode) -> Result<Self> {
        if local.id == 0 {
            return Err(Error::ReservedNodeId);
        }
        Ok(Self {
            local,
            peers: BTreeMap::new(),
        })
    }

    /// Create membership from the full node list (may include the local node)
    pub fn with_nodes(local: DomainNode, nodes: Vec<DomainNode>) -> Result<Self> {
        let mut membership = Self::new(local)?;
        membership.replace(nodes)?;
        Ok(membership)
    }

    /// Validate a node list and compute the resulting peer map
    ///
    /// Nodes of other domains are skipped. Duplicate ids, the reserved id and
    /// an entry for the local id that disagrees with the local node are
    /// configuration errors.
    fn validate(&self, nodes: Vec<DomainNode>) -> Result<BTreeMap<NodeId, DomainNode>> {
        let mut seen = BTreeMap::new();
        for node in nodes {
            if node.id == 0 {
                return Err(Error::ReservedNodeId);
            }
            if seen.contains_key(&node.id) {
                return Err(Error::DuplicateNodeId(node.id));
            }
            seen.insert(node.id, node);
        }

        if let Some(me) = seen.remove(&self.local.id) {
            if me.domain_id != self.local.domain_id || me.address() != self.local.address() {
                return Err(Error::DuplicateNodeId(me.id));
            }
        }

        seen.retain(|_, n| n.domain_id == self.local.domain_id);
        Ok(seen)
    }

    /// Replace the peer set. Returns true if it actually changed.
    pub fn replace(&mut self, nodes: Vec<DomainNode>) -> Result<bool> {
        let peers = self.validate(nodes)?;
        let changed = peers != self.peers;
        self.peers = peers;
        Ok(changed)
    }

    /// This node's identity
    pub fn local(&self) -> &DomainNode {
        &self.local
    }

    /// This node's id
    pub fn local_id(&self) -> NodeId {
        self.local.id
    }

    /// Local domain id
    pub fn domain_id(&self) -> DomainId {
        self.local.domain_id
    }

    /// Whether this node may become leader
    pub fn leader_eligible(&self) -> bool {
        self.local.leader_eligible
    }

    /// Ids of every other node in the domain
    pub fn peer_ids(&self) -> Vec<NodeId> {
        self.peers.keys().copied().collect()
    }

    /// Number of peers (excluding self)
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Look up a peer
    pub fn peer(&self, id: NodeId) -> Option<&DomainNode> {
        self.peers.get(&id)
    }

    /// All nodes including self
    pub fn all_nodes(&self) -> Vec<DomainNode> {
        let mut nodes: Vec<DomainNode> = self.peers.values().cloned().collect();
        nodes.push(self.local.clone());
        nodes.sort_by_key(|n| n.id);
        nodes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local() -> DomainNode {
        DomainNode::new(2, 1, "10.0.0.2", 6642)
    }

    #[test]
    fn test_membership_excludes_self_and_foreign_domains() {
        let membership = DomainMembership::with_nodes(
            local(),
            vec![
                DomainNode::new(1, 1, "10.0.0.1", 6642),
                local(),
                DomainNode::new(3, 1, "10.0.0.3", 6642),
                DomainNode::new(4, 9, "10.0.0.4", 6642),
            ],
        )
        .unwrap();

        assert_eq!(membership.peer_ids(), vec![1, 3]);
        assert_eq!(membership.peer_count(), 2);
        assert_eq!(membership.all_nodes().len(), 3);
    }

    #[test]
    fn test_membership_rejects_duplicates() {
        let mut membership = DomainMembership::new(local()).unwrap();
        let err = membership
            .replace(vec![
                DomainNode::new(1, 1, "10.0.0.1", 6642),
                DomainNode::new(1, 1, "10.0.0.9", 6642),
            ])
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateNodeId(1)));
        assert_eq!(membership.peer_count(), 0);
    }

    #[test]
    fn test_membership_rejects_conflicting_self_entry() {
        let mut membership = DomainMembership::new(local()).unwrap();
        let err = membership
            .replace(vec![DomainNode::new(2, 1, "10.0.0.77", 6642)])
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateNodeId(2)));
    }

    #[test]
    fn test_membership_reserved_id() {
        assert!(matches!(
            DomainMembership::new(DomainNode::new(0, 1, "h", 1)),
            Err(Error::ReservedNodeId)
        ));
    }

    #[test]
    fn test_replace_reports_change() {
        let mut membership = DomainMembership::new(local()).unwrap();
        let nodes = vec![DomainNode::new(1, 1, "10.0.0.1", 6642)];
        assert!(membership.replace(nodes.clone()).unwrap());
        assert!(!membership.replace(nodes).unwrap());
    }
}
