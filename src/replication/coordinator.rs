//! Replication Coordinator
//!
//! Runs on the leader. Holds the desired content and one push state per
//! follower, and drives them from a single background loop that sleeps until
//! the earliest follower needs attention, new content arrives or a push
//! completes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex as SyncMutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;

use super::content::SyncContent;
use super::follower::{Dispatch, FollowerId, FollowerSnapshot, FollowerSyncState};
use super::link::{PeerLink, PeerLinkFactory, PushOutcome};
use super::stats::{PushStats, PushStatsSnapshot};
use super::ReplicationConfig;
use crate::error::{Error, Result};

/// Lifecycle of the coordinator loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    Created,
    Running,
    /// Loop alive but not pushing, used while the node is not leader
    Paused,
    Stopped,
}

struct FollowerEntry<C: SyncContent> {
    address: String,
    link: Arc<dyn PeerLink>,
    stats: Arc<PushStats>,
    state: Arc<SyncMutex<FollowerSyncState<C>>>,
}

struct Shared<C: SyncContent> {
    desired: Option<Arc<C>>,
    followers: HashMap<FollowerId, Arc<FollowerEntry<C>>>,
}

/// Pushes the desired content to every follower
pub struct ReplicationCoordinator<C: SyncContent> {
    config: Arc<ReplicationConfig>,
    factory: Arc<dyn PeerLinkFactory>,
    shared: RwLock<Shared<C>>,
    run_state: watch::Sender<RunState>,
    wake: Arc<Notify>,
    stats: Arc<PushStats>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl<C: SyncContent> ReplicationCoordinator<C> {
    pub fn new(config: ReplicationConfig, factory: Arc<dyn PeerLinkFactory>) -> Arc<Self> {
        let (run_state, _) = watch::channel(RunState::Created);
        Arc::new(Self {
            config: Arc::new(config),
            factory,
            shared: RwLock::new(Shared {
                desired: None,
                followers: HashMap::new(),
            }),
            run_state,
            wake: Arc::new(Notify::new()),
            stats: PushStats::new(),
            driver: Mutex::new(None),
        })
    }

    /// Start the background loop
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.launch(RunState::Running).await
    }

    /// Start the background loop without pushing until [`Self::resume`]
    pub async fn start_paused(self: &Arc<Self>) -> Result<()> {
        self.launch(RunState::Paused).await
    }

    async fn launch(self: &Arc<Self>, initial: RunState) -> Result<()> {
        let started = self.run_state.send_if_modified(|state| {
            if *state == RunState::Created {
                *state = initial;
                true
            } else {
                false
            }
        });
        if !started {
            return Err(Error::InvalidState(format!(
                "coordinator cannot start from {:?}",
                self.run_state()
            )));
        }

        let this = Arc::clone(self);
        *self.driver.lock().await = Some(tokio::spawn(this.run()));
        tracing::info!("Replication coordinator started ({:?})", initial);
        Ok(())
    }

    /// Stop the loop and release all links. Idempotent.
    pub async fn shutdown(&self) {
        let stopped = self.run_state.send_if_modified(|state| {
            if *state == RunState::Stopped {
                false
            } else {
                *state = RunState::Stopped;
                true
            }
        });
        self.wake.notify_one();

        if let Some(handle) = self.driver.lock().await.take() {
            if let Err(e) = handle.await {
                tracing::error!("Replication loop ended abnormally: {}", e);
            }
        }
        if stopped {
            self.factory.close_all();
            tracing::info!("Replication coordinator stopped");
        }
    }

    /// Stop pushing without forgetting followers
    pub fn pause(&self) {
        self.run_state.send_if_modified(|state| {
            if *state == RunState::Running {
                *state = RunState::Paused;
                true
            } else {
                false
            }
        });
    }

    /// Resume pushing after [`ReplicationCoordinator::pause`]
    pub fn resume(&self) {
        self.run_state.send_if_modified(|state| {
            if *state == RunState::Paused {
                *state = RunState::Running;
                true
            } else {
                false
            }
        });
    }

    pub fn run_state(&self) -> RunState {
        *self.run_state.borrow()
    }

    /// Replace the content every follower should converge to
    pub async fn set_content(&self, content: Arc<C>) {
        self.shared.write().await.desired = Some(content);
        self.wake.notify_one();
    }

    /// Content followers are being driven towards
    pub async fn pending_content(&self) -> Option<Arc<C>> {
        self.shared.read().await.desired.clone()
    }

    /// Add a follower. Re-adding a known id at the same address keeps its
    /// state; a new address keeps the state but forgets what it holds.
    pub async fn add_follower(&self, id: impl Into<FollowerId>, address: &str) -> Result<()> {
        let id = id.into();
        let link = self.factory.link(address)?;
        let mut shared = self.shared.write().await;
        self.install(&mut shared, id, address, link);
        drop(shared);
        self.wake.notify_one();
        Ok(())
    }

    /// Remove a follower. Results of its outstanding push are discarded.
    pub async fn remove_follower(&self, id: &str) -> bool {
        let removed = self.shared.write().await.followers.remove(id).is_some();
        if removed {
            tracing::info!("Removed follower {}", id);
            self.wake.notify_one();
        }
        removed
    }

    /// Remove every follower not listed
    pub async fn retain_followers(&self, ids: &[FollowerId]) {
        let mut shared = self.shared.write().await;
        shared.followers.retain(|id, _| {
            let keep = ids.contains(id);
            if !keep {
                tracing::info!("Removed follower {}", id);
            }
            keep
        });
        drop(shared);
        self.wake.notify_one();
    }

    /// Make the follower set exactly `followers` (id to address).
    /// Followers already present with the same address keep their state.
    pub async fn set_followers(&self, followers: &HashMap<FollowerId, String>) -> Result<()> {
        // Validate every address before touching the current set
        let mut links = Vec::new();
        {
            let shared = self.shared.read().await;
            for (id, address) in followers {
                let unchanged = shared
                    .followers
                    .get(id)
                    .is_some_and(|existing| &existing.address == address);
                if !unchanged {
                    links.push((id.clone(), address.as_str(), self.factory.link(address)?));
                }
            }
        }

        let mut shared = self.shared.write().await;
        shared.followers.retain(|id, _| followers.contains_key(id));
        for (id, address, link) in links {
            self.install(&mut shared, id, address, link);
        }
        drop(shared);
        self.wake.notify_one();
        Ok(())
    }

    pub async fn follower_ids(&self) -> Vec<FollowerId> {
        let mut ids: Vec<_> = self.shared.read().await.followers.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn has_follower(&self, id: &str) -> bool {
        self.shared.read().await.followers.contains_key(id)
    }

    /// Content each follower is known to hold
    pub async fn follower_contents(&self) -> HashMap<FollowerId, Option<Arc<C>>> {
        self.shared
            .read()
            .await
            .followers
            .iter()
            .map(|(id, entry)| (id.clone(), entry.state.lock().converged().cloned()))
            .collect()
    }

    pub async fn follower_status(&self, id: &str) -> Option<FollowerSnapshot> {
        let shared = self.shared.read().await;
        shared.followers.get(id).map(|entry| entry.state.lock().snapshot())
    }

    pub async fn follower_stats(&self, id: &str) -> Option<PushStatsSnapshot> {
        let shared = self.shared.read().await;
        shared.followers.get(id).map(|entry| entry.stats.snapshot())
    }

    /// Counters across all followers, including removed ones
    pub fn stats(&self) -> PushStatsSnapshot {
        self.stats.snapshot()
    }

    /// Insert or update one follower. A follower that moves keeps its push
    /// state, so an outstanding push to the old address still counts
    /// against single-flight.
    fn install(
        &self,
        shared: &mut Shared<C>,
        id: FollowerId,
        address: &str,
        link: Arc<dyn PeerLink>,
    ) {
        let entry = match shared.followers.get(&id) {
            Some(existing) if existing.address == address => {
                tracing::debug!("Follower {} already at {}", id, address);
                return;
            }
            Some(existing) => {
                tracing::info!("Moved follower {} from {} to {}", id, existing.address, address);
                existing.state.lock().retarget();
                FollowerEntry {
                    address: address.to_string(),
                    link,
                    stats: Arc::clone(&existing.stats),
                    state: Arc::clone(&existing.state),
                }
            }
            None => {
                tracing::info!("Added follower {} at {}", id, address);
                FollowerEntry {
                    address: address.to_string(),
                    link,
                    stats: self.stats.child(),
                    state: Arc::new(SyncMutex::new(FollowerSyncState::new(
                        id.as_str(),
                        Instant::now(),
                    ))),
                }
            }
        };
        shared.followers.insert(id, Arc::new(entry));
    }

    async fn run(self: Arc<Self>) {
        let mut run_state = self.run_state.subscribe();
        loop {
            let state = *run_state.borrow_and_update();
            match state {
                RunState::Stopped => break,
                RunState::Created | RunState::Paused => {
                    if run_state.changed().await.is_err() {
                        break;
                    }
                    continue;
                }
                RunState::Running => {}
            }

            let wait = self.tick(Instant::now()).await;
            tokio::select! {
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(wait) => {}
                _ = run_state.changed() => {}
            }
        }
        tracing::debug!("Replication loop exited");
    }

    /// Evaluate every follower, start due pushes and return how long to
    /// sleep before the next evaluation
    async fn tick(&self, now: Instant) -> std::time::Duration {
        let mut wait = self.config.max_poll_interval();
        let mut dispatches = Vec::new();
        {
            let shared = self.shared.read().await;
            for entry in shared.followers.values() {
                let evaluation = {
                    let mut state = entry.state.lock();
                    state.set_desired(shared.desired.clone());
                    state.evaluate(now, &self.config)
                };
                if evaluation.timed_out {
                    entry.stats.record_timeout();
                }
                if let Some(next) = evaluation.next_check {
                    wait = wait.min(next.saturating_duration_since(now));
                }
                if let Some(dispatch) = evaluation.dispatch {
                    dispatches.push((Arc::clone(entry), dispatch));
                }
            }
        }

        for (entry, dispatch) in dispatches {
            self.dispatch(entry, dispatch);
        }
        wait
    }

    fn dispatch(&self, entry: Arc<FollowerEntry<C>>, dispatch: Dispatch<C>) {
        let Dispatch {
            attempt, request, ..
        } = dispatch;
        entry.stats.record_request(request.body.len() as u64);

        let config = Arc::clone(&self.config);
        let wake = Arc::clone(&self.wake);
        tokio::spawn(async move {
            let outcome = entry.link.send(request).await;
            match &outcome {
                PushOutcome::Success => entry.stats.record_success(),
                PushOutcome::Rejected(_) => entry.stats.record_rejection(),
                PushOutcome::Failed(e) => entry.stats.record_failure(&e.to_string()),
            }
            entry
                .state
                .lock()
                .complete(attempt, &outcome, Instant::now(), &config);
            wake.notify_one();
        });
    }
}
