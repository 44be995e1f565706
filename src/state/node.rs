//! Domain node identity

use serde::{Deserialize, Serialize};

/// Node identifier, unique within a domain. Zero is reserved.
pub type NodeId = u16;

/// Domain identifier
pub type DomainId = u16;

/// A peer taking part in a domain's leader election
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DomainNode {
    /// Node id (1..=65535)
    pub id: NodeId,
    /// Domain the node belongs to
    pub domain_id: DomainId,
    /// Host name or IP address
    pub host: String,
    /// Cluster port
    pub port: u16,
    /// Whether the node may become leader
    #[serde(default = "default_leader_eligible")]
    pub leader_eligible: bool,
}

fn default_leader_eligible() -> bool {
    true
}

impl DomainNode {
    /// Create a new leader-eligible node
    pub fn new(id: NodeId, domain_id: DomainId, host: impl Into<String>, port: u16) -> Self {
        Self {
            id,
            domain_id,
            host: host.into(),
            port,
            leader_eligible: true,
        }
    }

    /// Mark the node as never eligible for leadership
    pub fn ineligible(mut self) -> Self {
        self.leader_eligible = false;
        self
    }

    /// host:port form of the node address
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl std::fmt::Display for DomainNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "node {} ({}:{}, domain {})", self.id, self.host, self.port, self.domain_id)
    }
}
