//! State Management Module
//!
//! Domain membership and the weighted leader election that runs over it.

mod node;
mod membership;
pub mod election;

pub use node::{DomainId, DomainNode, NodeId};
pub use membership::DomainMembership;
pub use election::{
    node_weight, DomainElection, ElectionConfig, ElectionPhase, ElectionStatus,
    LeadershipListener, LARGE_BONUS,
};
