//! HA Sync
//!
//! Connects the domain election to replication: the leader pushes, followers
//! receive. Registered on a [`DomainElection`](crate::state::DomainElection)
//! as a [`LeadershipListener`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::error::Result;
use crate::replication::{ReplicationCoordinator, SyncContent, SyncReceiver, SyncRole};
use crate::state::{LeadershipListener, NodeId};

/// Supplies the current local state when this node takes office
#[async_trait::async_trait]
pub trait ContentSource<C>: Send + Sync {
    async fn current_content(&self) -> Result<Option<C>>;
}

/// Leadership-driven replication for one node
pub struct HaSync<C: SyncContent> {
    coordinator: Arc<ReplicationCoordinator<C>>,
    receiver: Arc<SyncReceiver>,
    source: Option<Arc<dyn ContentSource<C>>>,
    published: AtomicU64,
    /// Set only by the election; guards the coordinator's run state
    leading: Mutex<bool>,
}

impl<C: SyncContent> HaSync<C> {
    pub fn new(
        coordinator: Arc<ReplicationCoordinator<C>>,
        receiver: Arc<SyncReceiver>,
        source: Option<Arc<dyn ContentSource<C>>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            coordinator,
            receiver,
            source,
            published: AtomicU64::new(0),
            leading: Mutex::new(false),
        })
    }

    /// Start the coordinator paused. Pushing begins once the election
    /// reports this node as leader.
    pub async fn start(&self) -> Result<()> {
        let leading = self.leading.lock().await;
        if *leading {
            self.coordinator.start().await
        } else {
            self.coordinator.start_paused().await
        }
    }

    pub async fn shutdown(&self) {
        self.coordinator.shutdown().await;
    }

    /// Replicate new local state. Only pushed while this node leads.
    pub async fn publish(&self, content: C) {
        self.published.fetch_add(1, Ordering::Relaxed);
        self.coordinator.set_content(Arc::new(content)).await;
    }

    /// Number of [`HaSync::publish`] calls
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    pub fn role(&self) -> SyncRole {
        self.receiver.role()
    }

    pub fn coordinator(&self) -> &Arc<ReplicationCoordinator<C>> {
        &self.coordinator
    }

    pub fn receiver(&self) -> &Arc<SyncReceiver> {
        &self.receiver
    }
}

#[async_trait::async_trait]
impl<C: SyncContent> LeadershipListener for HaSync<C> {
    async fn on_became_leader(&self) {
        self.receiver.set_role(SyncRole::Leader);

        // Local state may have moved on while following
        if let Some(source) = &self.source {
            match source.current_content().await {
                Ok(Some(content)) => self.coordinator.set_content(Arc::new(content)).await,
                Ok(None) => {}
                Err(e) => tracing::warn!("Could not refresh content after taking office: {}", e),
            }
        }

        *self.leading.lock().await = true;
        self.coordinator.resume();
        tracing::info!("Replication active, pushing to followers");
    }

    async fn on_became_follower(&self, leader: Option<NodeId>) {
        self.receiver.set_role(SyncRole::Follower);
        *self.leading.lock().await = false;
        self.coordinator.pause();
        match leader {
            Some(leader) => tracing::info!("Replication paused, following node {}", leader),
            None => tracing::info!("Replication paused, no leader elected"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::LocalLinkFactory;
    use crate::replication::{MemorySink, ReplicationConfig, RunState, SnapshotContent};
    use std::time::Duration;

    struct FixedSource(SnapshotContent);

    #[async_trait::async_trait]
    impl ContentSource<SnapshotContent> for FixedSource {
        async fn current_content(&self) -> Result<Option<SnapshotContent>> {
            Ok(Some(self.0.clone()))
        }
    }

    fn ha(source: Option<Arc<dyn ContentSource<SnapshotContent>>>) -> Arc<HaSync<SnapshotContent>> {
        let factory = LocalLinkFactory::new(Duration::ZERO);
        let coordinator = ReplicationCoordinator::new(ReplicationConfig::default(), Arc::new(factory));
        let receiver = Arc::new(SyncReceiver::new(MemorySink::new()));
        HaSync::new(coordinator, receiver, source)
    }

    #[tokio::test]
    async fn test_follower_pauses_and_leader_resumes() {
        let sync = ha(None);
        sync.on_became_follower(Some(3)).await;
        sync.start().await.unwrap();
        assert_eq!(sync.role(), SyncRole::Follower);
        assert_eq!(sync.coordinator().run_state(), RunState::Paused);

        sync.on_became_leader().await;
        assert_eq!(sync.role(), SyncRole::Leader);
        assert_eq!(sync.coordinator().run_state(), RunState::Running);

        sync.on_became_follower(None).await;
        assert_eq!(sync.coordinator().run_state(), RunState::Paused);
        sync.shutdown().await;
    }

    #[tokio::test]
    async fn test_nothing_pushed_before_election() {
        let factory = LocalLinkFactory::new(Duration::ZERO);
        let follower_sink = MemorySink::new();
        let follower = Arc::new(SyncReceiver::new(follower_sink.clone()));
        follower.set_role(SyncRole::Follower);
        factory.register("10.0.0.2:6643", follower);

        let config = ReplicationConfig {
            quiescence_ms: 10,
            ..ReplicationConfig::default()
        };
        let coordinator = ReplicationCoordinator::new(config, Arc::new(factory));
        coordinator.add_follower("2", "10.0.0.2:6643").await.unwrap();
        let sync = HaSync::new(coordinator, Arc::new(SyncReceiver::new(MemorySink::new())), None);

        sync.start().await.unwrap();
        assert_eq!(sync.coordinator().run_state(), RunState::Paused);
        sync.publish(SnapshotContent::new("text/plain", "early")).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(follower_sink.last().is_none());

        sync.on_became_leader().await;
        for _ in 0..100 {
            if follower_sink.last().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(
            follower_sink.last().unwrap().1,
            bytes::Bytes::from_static(b"early")
        );
        sync.shutdown().await;
    }

    #[tokio::test]
    async fn test_leader_refreshes_content_from_source() {
        let current = SnapshotContent::new("text/plain", "local-state");
        let sync = ha(Some(Arc::new(FixedSource(current.clone()))));
        sync.start().await.unwrap();

        sync.on_became_leader().await;
        let pending = sync.coordinator().pending_content().await.unwrap();
        assert_eq!(*pending, current);

        sync.publish(SnapshotContent::new("text/plain", "next")).await;
        assert_eq!(sync.published(), 1);
        assert_eq!(
            sync.coordinator().pending_content().await.unwrap().body().clone(),
            bytes::Bytes::from_static(b"next")
        );
        sync.shutdown().await;
    }
}
