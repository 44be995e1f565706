//! WolfHA - Domain Leader Election and Push Replication
//!
//! High-availability coordination for clustered controllers. The nodes of a
//! domain elect a single leader, and the leader pushes its state to every
//! follower.
//!
//! # Architecture
//!
//! - [`state::DomainElection`] runs a weighted, message-driven election among
//!   the nodes of one domain. An incumbent leader keeps office unless an
//!   operator rigs a new election.
//! - [`replication::ReplicationCoordinator`] runs on the leader and drives one
//!   [`replication::FollowerSyncState`] per follower: at most one push in
//!   flight, a quiet period after each push, randomized exponential backoff
//!   after failures.
//! - [`ha::HaSync`] connects the two: it listens for leadership changes and
//!   pauses or resumes replication accordingly.

pub mod config;
pub mod error;
pub mod state;
pub mod replication;
pub mod network;
pub mod ha;

pub use config::WolfHaConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::WolfHaConfig;
    pub use crate::error::{Error, Result};
    pub use crate::ha::{ContentSource, HaSync};
    pub use crate::network::{ElectionTransport, LocalLinkFactory, LocalNetwork};
    pub use crate::replication::{
        PeerLink, PeerLinkFactory, ReplicationConfig, ReplicationCoordinator, SnapshotContent,
        SyncContent, SyncReceiver,
    };
    pub use crate::state::{
        DomainElection, DomainMembership, DomainNode, ElectionConfig, LeadershipListener, NodeId,
    };
}
