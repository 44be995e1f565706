//! Replication Module
//!
//! Push-based replication of leader state to followers: one
//! [`FollowerSyncState`] per follower, driven by a [`ReplicationCoordinator`]
//! on the leader, received by a [`SyncReceiver`] on each follower.

pub mod content;
pub mod link;
mod follower;
mod coordinator;
mod receiver;
mod stats;

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use content::{SnapshotContent, SyncContent, JSON_CONTENT_TYPE};
pub use link::{PeerLink, PeerLinkFactory, PushMethod, PushOutcome, PushRequest};
pub use follower::{
    Dispatch, Evaluation, FollowerId, FollowerSnapshot, FollowerStatus, FollowerSyncState,
};
pub use coordinator::{ReplicationCoordinator, RunState};
pub use receiver::{ContentSink, MemorySink, ReceiveOutcome, ReceiverStats, SyncReceiver, SyncRole};
pub use stats::{PushStats, PushStatsSnapshot};

/// Configuration for replication
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Rest period after a completed push before the next one
    #[serde(default = "default_quiescence_ms")]
    pub quiescence_ms: u64,
    /// Outstanding push is abandoned after this long
    #[serde(default = "default_update_timeout_ms")]
    pub update_timeout_ms: u64,
    /// Upper bound of the retry backoff
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Longest the coordinator loop sleeps without re-evaluating
    #[serde(default = "default_max_poll_interval_ms")]
    pub max_poll_interval_ms: u64,
    /// Range of the randomized first backoff
    #[serde(default = "default_initial_backoff_min_ms")]
    pub initial_backoff_min_ms: u64,
    #[serde(default = "default_initial_backoff_max_ms")]
    pub initial_backoff_max_ms: u64,
}

fn default_quiescence_ms() -> u64 {
    250
}

fn default_update_timeout_ms() -> u64 {
    2000
}

fn default_max_backoff_ms() -> u64 {
    10_000
}

fn default_max_poll_interval_ms() -> u64 {
    2000
}

fn default_initial_backoff_min_ms() -> u64 {
    100
}

fn default_initial_backoff_max_ms() -> u64 {
    300
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            quiescence_ms: default_quiescence_ms(),
            update_timeout_ms: default_update_timeout_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            max_poll_interval_ms: default_max_poll_interval_ms(),
            initial_backoff_min_ms: default_initial_backoff_min_ms(),
            initial_backoff_max_ms: default_initial_backoff_max_ms(),
        }
    }
}

impl ReplicationConfig {
    pub fn quiescence(&self) -> Duration {
        Duration::from_millis(self.quiescence_ms)
    }

    pub fn update_timeout(&self) -> Duration {
        Duration::from_millis(self.update_timeout_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn max_poll_interval(&self) -> Duration {
        Duration::from_millis(self.max_poll_interval_ms)
    }
}
