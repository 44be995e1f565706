//! Domain Leader Election
//!
//! Weighted, message-driven election. Every node broadcasts its candidacy,
//! collects the candidacies of its peers and decides on the heaviest one,
//! either once it has heard from every peer or when the phase timer fires.
//! The winner announces itself, waits for acknowledgements (or the
//! inauguration timer) and then takes office.
//!
//! All transitions run under one mutex. Network sends and leadership
//! notifications happen after the mutex is released.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::network::{ElectionBody, ElectionMessage, ElectionTransport};
use crate::state::{DomainId, DomainMembership, DomainNode, NodeId};

/// Bonus added to the incumbent leader's weight. Exceeds any node id.
pub const LARGE_BONUS: i32 = u16::MAX as i32 + 1;

/// Election phase of the local node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ElectionPhase {
    /// Initial state on startup
    Init,
    /// Election in progress
    Election,
    /// Won the election, waiting to make sure nobody objects
    LeaderElect,
    /// Current domain leader
    Leader,
    /// Following another node (or nobody, if no node is eligible)
    Follower,
}

impl std::fmt::Display for ElectionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ElectionPhase::Init => write!(f, "INIT"),
            ElectionPhase::Election => write!(f, "ELECTION"),
            ElectionPhase::LeaderElect => write!(f, "LEADER_ELECT"),
            ElectionPhase::Leader => write!(f, "LEADER"),
            ElectionPhase::Follower => write!(f, "FOLLOWER"),
        }
    }
}

/// Election configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElectionConfig {
    /// Duration of the init, decision and inauguration timers in milliseconds
    #[serde(default = "default_phase_timeout_ms")]
    pub phase_timeout_ms: u64,
}

fn default_phase_timeout_ms() -> u64 {
    1000
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            phase_timeout_ms: default_phase_timeout_ms(),
        }
    }
}

impl ElectionConfig {
    /// Phase timer duration
    pub fn phase_timeout(&self) -> Duration {
        Duration::from_millis(self.phase_timeout_ms)
    }
}

/// Receives leadership transitions of the local node
#[async_trait::async_trait]
pub trait LeadershipListener: Send + Sync {
    /// The local node took office as domain leader
    async fn on_became_leader(&self);

    /// The local node follows `leader` (`None` if no node could be elected)
    async fn on_became_follower(&self, leader: Option<NodeId>);
}

/// Election weight of a node
///
/// Ineligible nodes weigh `-id` and get no bonuses. Eligible nodes weigh
/// their id, plus [`LARGE_BONUS`] when they are the incumbent, plus twice
/// that when they forced a rigged election.
pub fn node_weight(id: NodeId, leader_eligible: bool, incumbent: Option<NodeId>, rigged: bool) -> i32 {
    if !leader_eligible {
        return -i32::from(id);
    }
    let mut weight = i32::from(id);
    if incumbent == Some(id) {
        weight += LARGE_BONUS;
    }
    if rigged {
        weight += 2 * LARGE_BONUS;
    }
    weight
}

/// Read-only view of the election state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElectionStatus {
    pub node_id: NodeId,
    pub domain_id: DomainId,
    pub phase: ElectionPhase,
    pub leader_id: Option<NodeId>,
    pub top_candidate: Option<NodeId>,
    pub top_candidate_weight: i32,
    pub responded: Vec<NodeId>,
    pub peers: Vec<NodeId>,
    pub rigged: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerKind {
    Init,
    Decision,
    Inauguration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Notice {
    Leader,
    Follower(Option<NodeId>),
}

/// Mutex-guarded state of the current election round
struct ElectionRound {
    phase: ElectionPhase,
    top_candidate: Option<NodeId>,
    top_weight: i32,
    /// Peers that responded in the current phase
    acks: HashSet<NodeId>,
    leader: Option<NodeId>,
    rigged: bool,
    membership: DomainMembership,
    timer: Option<JoinHandle<()>>,
    /// Bumped on every phase entry; stale timer fires are discarded
    timer_generation: u64,
    last_notice: Option<Notice>,
    shutdown: bool,
}

impl ElectionRound {
    fn local_weight(&self) -> i32 {
        node_weight(
            self.membership.local_id(),
            self.membership.leader_eligible(),
            self.leader,
            self.rigged,
        )
    }

    fn heard_from_all_peers(&self) -> bool {
        self.membership.peer_ids().iter().all(|p| self.acks.contains(p))
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        self.timer_generation += 1;
    }
}

/// Work produced under the lock and performed after it is released
#[derive(Default)]
struct Effects {
    sends: Vec<(NodeId, ElectionBody)>,
}

/// Leader election for the local node's domain
pub struct DomainElection {
    me: Weak<DomainElection>,
    node_id: NodeId,
    domain_id: DomainId,
    config: ElectionConfig,
    transport: Arc<dyn ElectionTransport>,
    round: Mutex<ElectionRound>,
    listeners: Arc<RwLock<Vec<Arc<dyn LeadershipListener>>>>,
    notice_tx: mpsc::UnboundedSender<Notice>,
    notice_rx: Mutex<Option<mpsc::UnboundedReceiver<Notice>>>,
    notifier: Mutex<Option<JoinHandle<()>>>,
    transaction_id: AtomicU64,
}

impl DomainElection {
    /// Create a new election for the local node of `membership`
    pub fn new(
        membership: DomainMembership,
        config: ElectionConfig,
        transport: Arc<dyn ElectionTransport>,
    ) -> Arc<Self> {
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            node_id: membership.local_id(),
            domain_id: membership.domain_id(),
            config,
            transport,
            round: Mutex::new(ElectionRound {
                phase: ElectionPhase::Init,
                top_candidate: None,
                top_weight: 0,
                acks: HashSet::new(),
                leader: None,
                rigged: false,
                membership,
                timer: None,
                timer_generation: 0,
                last_notice: None,
                shutdown: false,
            }),
            listeners: Arc::new(RwLock::new(Vec::new())),
            notice_tx,
            notice_rx: Mutex::new(Some(notice_rx)),
            notifier: Mutex::new(None),
            transaction_id: AtomicU64::new(1),
        })
    }

    /// Register a listener for leadership transitions
    pub async fn register_listener(&self, listener: Arc<dyn LeadershipListener>) {
        self.listeners.write().await.push(listener);
    }

    /// Start the election service
    ///
    /// Spawns the notification task and arms the initial timer: if nothing
    /// else has started an election within one phase timeout, this node does.
    pub async fn start(&self) -> Result<()> {
        let mut round = self.round.lock().await;
        if round.shutdown {
            return Err(Error::ShuttingDown);
        }
        let mut rx = self
            .notice_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| Error::InvalidState("election already started".into()))?;

        let listeners = Arc::clone(&self.listeners);
        let node_id = self.node_id;
        let notifier = tokio::spawn(async move {
            while let Some(notice) = rx.recv().await {
                let listeners = listeners.read().await.clone();
                match notice {
                    Notice::Leader => {
                        tracing::info!("Node {} is now the domain leader", node_id);
                        for listener in &listeners {
                            listener.on_became_leader().await;
                        }
                    }
                    Notice::Follower(leader) => {
                        tracing::info!("Node {} is now a domain follower; leader is {:?}", node_id, leader);
                        for listener in &listeners {
                            listener.on_became_follower(leader).await;
                        }
                    }
                }
            }
        });
        *self.notifier.lock().await = Some(notifier);

        if round.phase == ElectionPhase::Init {
            self.arm_timer(&mut round, TimerKind::Init);
        }
        Ok(())
    }

    /// Stop timers and the notification task. Idempotent.
    pub async fn shutdown(&self) {
        {
            let mut round = self.round.lock().await;
            if round.shutdown {
                return;
            }
            round.shutdown = true;
            round.cancel_timer();
        }
        if let Some(notifier) = self.notifier.lock().await.take() {
            notifier.abort();
        }
        tracing::debug!("Election service stopped");
    }

    // ========== Triggers ==========

    /// A peer connected or disconnected
    pub async fn connectivity_changed(&self) {
        self.transition(|this, round, fx| {
            tracing::trace!("connectivity changed -> begin election");
            this.begin_election(round, fx);
        })
        .await;
    }

    /// The set of domain nodes changed
    ///
    /// Configuration errors are returned and leave the current membership
    /// untouched. An unchanged node set does not trigger an election.
    pub async fn membership_changed(&self, nodes: Vec<DomainNode>) -> Result<()> {
        let mut fx = Effects::default();
        {
            let mut round = self.round.lock().await;
            if round.shutdown {
                return Err(Error::ShuttingDown);
            }
            if round.membership.replace(nodes)? {
                tracing::info!("Domain membership changed: peers {:?}", round.membership.peer_ids());
                self.begin_election(&mut round, &mut fx);
            }
        }
        self.flush(fx).await;
        Ok(())
    }

    /// Start a new election; a rigged election is won by this node
    pub async fn force_election(&self, rigged: bool) {
        self.transition(|this, round, fx| {
            if rigged && !round.membership.leader_eligible() {
                tracing::warn!("Ignoring rigged flag: node {} is not leader-eligible", round.membership.local_id());
            } else {
                round.rigged = rigged;
            }
            this.begin_election(round, fx);
        })
        .await;
    }

    /// Dispatch an inbound election message
    pub async fn handle_message(&self, message: ElectionMessage) {
        if message.domain_id != self.domain_id {
            let err = Error::DomainMismatch {
                expected: self.domain_id,
                actual: message.domain_id,
            };
            tracing::warn!("Dropping {} from node {}: {}", message.body.type_name(), message.body.sender(), err);
            return;
        }

        tracing::trace!(
            "Received {} from node {} (txn {})",
            message.body.type_name(),
            message.body.sender(),
            message.transaction_id
        );
        match message.body {
            ElectionBody::Candidate { from, weight } => self.on_candidate(from, weight).await,
            ElectionBody::LeaderAnnounce { from, weight } => self.on_leader_announce(from, weight).await,
            ElectionBody::LeaderAck { from } => self.on_leader_ack(from).await,
        }
    }

    /// A peer stands for election
    pub async fn on_candidate(&self, from: NodeId, weight: i32) {
        self.transition(|this, round, fx| {
            if round.phase != ElectionPhase::Election {
                tracing::trace!("Candidate({}) in {} -> begin election", from, round.phase);
                this.begin_election(round, fx);
            }
            if round.phase == ElectionPhase::Election {
                this.record_candidate(round, fx, from, weight);
            }
        })
        .await;
    }

    /// A peer announces it won the election
    pub async fn on_leader_announce(&self, from: NodeId, weight: i32) {
        self.transition(|this, round, fx| match round.phase {
            ElectionPhase::Init => this.accept_leader(round, fx, from),
            ElectionPhase::Follower if round.leader.is_none() => this.accept_leader(round, fx, from),
            ElectionPhase::Election => {
                if round.top_candidate.is_none() || beats(from, weight, round.top_candidate, round.top_weight) {
                    round.top_candidate = Some(from);
                    round.top_weight = weight;
                }
                if round.top_candidate != Some(from) {
                    tracing::trace!("LeaderAnnounce({}) disagrees with top candidate -> begin election", from);
                    this.begin_election(round, fx);
                } else {
                    this.accept_leader(round, fx, from);
                }
            }
            ElectionPhase::Follower => {
                if round.leader != Some(from) {
                    tracing::trace!("LeaderAnnounce({}) while following {:?} -> begin election", from, round.leader);
                    this.begin_election(round, fx);
                } else {
                    fx.sends.push((from, ElectionBody::LeaderAck { from: round.membership.local_id() }));
                }
            }
            ElectionPhase::LeaderElect | ElectionPhase::Leader => {
                tracing::trace!("LeaderAnnounce({}) in {} -> begin election", from, round.phase);
                this.begin_election(round, fx);
            }
        })
        .await;
    }

    /// A peer accepted this node as leader
    pub async fn on_leader_ack(&self, from: NodeId) {
        self.transition(|this, round, fx| match round.phase {
            ElectionPhase::LeaderElect => {
                round.acks.insert(from);
                if round.heard_from_all_peers() {
                    this.inaugurate(round);
                }
            }
            ElectionPhase::Init | ElectionPhase::Follower => {
                tracing::trace!("LeaderAck({}) in {} -> begin election", from, round.phase);
                this.begin_election(round, fx);
            }
            ElectionPhase::Election | ElectionPhase::Leader => {}
        })
        .await;
    }

    // ========== Operational surface ==========

    /// Current phase
    pub async fn phase(&self) -> ElectionPhase {
        self.round.lock().await.phase
    }

    /// Leader of the domain, if known
    pub async fn current_leader(&self) -> Option<NodeId> {
        self.round.lock().await.leader
    }

    /// Whether this node currently holds office
    pub async fn is_leader(&self) -> bool {
        self.round.lock().await.phase == ElectionPhase::Leader
    }

    /// Whether the transport reports a connection to the node
    pub fn is_connected(&self, node: NodeId) -> bool {
        self.transport.is_connected(node)
    }

    /// Election weight this node would currently campaign with
    pub async fn local_weight(&self) -> i32 {
        self.round.lock().await.local_weight()
    }

    /// Snapshot of the election state
    pub async fn status(&self) -> ElectionStatus {
        let round = self.round.lock().await;
        let mut responded: Vec<NodeId> = round.acks.iter().copied().collect();
        responded.sort_unstable();
        ElectionStatus {
            node_id: self.node_id,
            domain_id: self.domain_id,
            phase: round.phase,
            leader_id: round.leader,
            top_candidate: round.top_candidate,
            top_candidate_weight: round.top_weight,
            responded,
            peers: round.membership.peer_ids(),
            rigged: round.rigged,
        }
    }

    // ========== Transitions (called with the round locked) ==========

    async fn transition<F>(&self, f: F)
    where
        F: FnOnce(&Self, &mut ElectionRound, &mut Effects),
    {
        let mut fx = Effects::default();
        {
            let mut round = self.round.lock().await;
            if round.shutdown {
                return;
            }
            f(self, &mut round, &mut fx);
        }
        self.flush(fx).await;
    }

    fn enter_phase(&self, round: &mut ElectionRound, phase: ElectionPhase) {
        round.cancel_timer();
        round.acks.clear();
        if round.phase != phase {
            tracing::debug!("Election phase {} -> {}", round.phase, phase);
        }
        round.phase = phase;
    }

    fn begin_election(&self, round: &mut ElectionRound, fx: &mut Effects) {
        if round.phase != ElectionPhase::Election {
            tracing::info!("Entering election for domain {} leader", round.membership.domain_id());
        }

        let local_id = round.membership.local_id();
        round.top_candidate = round.membership.leader_eligible().then_some(local_id);
        round.top_weight = round.local_weight();
        self.enter_phase(round, ElectionPhase::Election);

        let weight = round.top_weight;
        for peer in round.membership.peer_ids() {
            fx.sends.push((peer, ElectionBody::Candidate { from: local_id, weight }));
        }

        self.arm_timer(round, TimerKind::Decision);
        if round.membership.peer_count() == 0 {
            self.decide(round, fx);
        }
    }

    fn record_candidate(&self, round: &mut ElectionRound, fx: &mut Effects, from: NodeId, weight: i32) {
        round.acks.insert(from);
        if weight > 0 && beats(from, weight, round.top_candidate, round.top_weight) {
            round.top_candidate = Some(from);
            round.top_weight = weight;
        }
        if round.heard_from_all_peers() {
            self.decide(round, fx);
        }
    }

    fn decide(&self, round: &mut ElectionRound, fx: &mut Effects) {
        let local_id = round.membership.local_id();
        let eligible = round.membership.leader_eligible();

        match round.top_candidate {
            top if eligible && (top.is_none() || top == Some(local_id)) => {
                tracing::info!("Won election for domain {}; announcing", round.membership.domain_id());
                let weight = round.local_weight();
                self.enter_phase(round, ElectionPhase::LeaderElect);
                for peer in round.membership.peer_ids() {
                    fx.sends.push((peer, ElectionBody::LeaderAnnounce { from: local_id, weight }));
                }
                self.arm_timer(round, TimerKind::Inauguration);
                if round.membership.peer_count() == 0 {
                    self.inaugurate(round);
                }
            }
            None => {
                // Only reachable for an ineligible node that heard no eligible peer
                self.enter_phase(round, ElectionPhase::Follower);
                round.leader = None;
                self.notify(round, Notice::Follower(None));
            }
            Some(winner) => {
                self.enter_phase(round, ElectionPhase::Follower);
                round.leader = Some(winner);
                fx.sends.push((winner, ElectionBody::LeaderAck { from: local_id }));
                self.notify(round, Notice::Follower(Some(winner)));
            }
        }

        round.rigged = false;
    }

    fn accept_leader(&self, round: &mut ElectionRound, fx: &mut Effects, leader: NodeId) {
        self.enter_phase(round, ElectionPhase::Follower);
        round.leader = Some(leader);
        fx.sends.push((leader, ElectionBody::LeaderAck { from: round.membership.local_id() }));
        self.notify(round, Notice::Follower(Some(leader)));
    }

    fn inaugurate(&self, round: &mut ElectionRound) {
        if round.phase != ElectionPhase::LeaderElect {
            return;
        }
        round.leader = Some(round.membership.local_id());
        self.enter_phase(round, ElectionPhase::Leader);
        self.notify(round, Notice::Leader);
    }

    fn notify(&self, round: &mut ElectionRound, notice: Notice) {
        if round.last_notice == Some(notice) {
            return;
        }
        round.last_notice = Some(notice);
        // Receiver lives until shutdown; a send error only means we are stopping
        let _ = self.notice_tx.send(notice);
    }

    fn arm_timer(&self, round: &mut ElectionRound, kind: TimerKind) {
        let generation = round.timer_generation;
        let delay = self.config.phase_timeout();
        let me = self.me.clone();
        round.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(election) = me.upgrade() {
                election.on_timer(kind, generation).await;
            }
        }));
    }

    async fn on_timer(&self, kind: TimerKind, generation: u64) {
        self.transition(|this, round, fx| {
            if generation != round.timer_generation {
                return;
            }
            // The handle belongs to the task running this code; dropping it
            // must not abort us before the effects are flushed.
            drop(round.timer.take());
            match (kind, round.phase) {
                (TimerKind::Init, ElectionPhase::Init) => {
                    tracing::trace!("init timeout -> begin election");
                    this.begin_election(round, fx);
                }
                (TimerKind::Decision, ElectionPhase::Election) => this.decide(round, fx),
                (TimerKind::Inauguration, ElectionPhase::LeaderElect) => this.inaugurate(round),
                _ => {}
            }
        })
        .await;
    }

    async fn flush(&self, fx: Effects) {
        if fx.sends.is_empty() {
            return;
        }
        let domain_id = self.domain_id;
        let sends = fx.sends.into_iter().map(|(to, body)| {
            let message = ElectionMessage {
                domain_id,
                transaction_id: self.transaction_id.fetch_add(1, Ordering::Relaxed),
                body,
            };
            async move {
                if let Err(e) = self.transport.send(to, message).await {
                    tracing::debug!("Failed to send {} to node {}: {}", body.type_name(), to, e);
                }
            }
        });
        futures::future::join_all(sends).await;
    }
}

/// Whether candidate `id` with `weight` beats the current top candidate.
/// Equal weights go to the lower id.
fn beats(id: NodeId, weight: i32, top: Option<NodeId>, top_weight: i32) -> bool {
    match top {
        None => true,
        Some(top_id) => weight > top_weight || (weight == top_weight && id < top_id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::LocalNetwork;
    use std::sync::atomic::AtomicUsize;

    const TIMEOUT_MS: u64 = 60;

    fn config() -> ElectionConfig {
        ElectionConfig {
            phase_timeout_ms: TIMEOUT_MS,
        }
    }

    fn nodes(ids: &[NodeId]) -> Vec<DomainNode> {
        ids.iter()
            .map(|id| DomainNode::new(*id, 1, format!("10.0.0.{}", id), 6642))
            .collect()
    }

    async fn domain(network: &Arc<LocalNetwork>, all: Vec<DomainNode>) -> Vec<Arc<DomainElection>> {
        let mut elections = Vec::new();
        for node in &all {
            let membership = DomainMembership::with_nodes(node.clone(), all.clone()).unwrap();
            let transport = network.transport(node.id);
            let election = DomainElection::new(membership, config(), transport);
            network.register(node.id, &election);
            election.start().await.unwrap();
            elections.push(election);
        }
        elections
    }

    async fn wait_for_single_leader(elections: &[Arc<DomainElection>]) -> NodeId {
        for _ in 0..200 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let mut leaders = Vec::new();
            let mut followers = 0;
            for e in elections {
                match e.phase().await {
                    ElectionPhase::Leader => leaders.push(e.status().await.node_id),
                    ElectionPhase::Follower => followers += 1,
                    _ => {}
                }
            }
            if leaders.len() == 1 && followers == elections.len() - 1 {
                let leader = leaders[0];
                let mut agreed = true;
                for e in elections {
                    agreed &= e.current_leader().await == Some(leader);
                }
                if agreed {
                    return leader;
                }
            }
        }
        panic!("domain did not converge");
    }

    #[derive(Default)]
    struct CountingListener {
        leader: AtomicUsize,
        follower: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl LeadershipListener for CountingListener {
        async fn on_became_leader(&self) {
            self.leader.fetch_add(1, Ordering::SeqCst);
        }

        async fn on_became_follower(&self, _leader: Option<NodeId>) {
            self.follower.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_weight_function() {
        assert_eq!(node_weight(5, true, None, false), 5);
        assert_eq!(node_weight(5, false, Some(5), true), -5);
        assert_eq!(node_weight(2, true, Some(2), false), 2 + LARGE_BONUS);
        assert_eq!(node_weight(2, true, Some(3), true), 2 + 2 * LARGE_BONUS);
        // Incumbency always beats a higher id
        assert!(node_weight(1, true, Some(1), false) > node_weight(u16::MAX, true, Some(1), false));
        // Rigging beats incumbency
        assert!(node_weight(1, true, Some(9), true) > node_weight(9, true, Some(9), false));
    }

    #[test]
    fn test_tie_break_prefers_lower_id() {
        assert!(beats(2, 10, Some(3), 10));
        assert!(!beats(4, 10, Some(3), 10));
        assert!(beats(4, 11, Some(3), 10));
        assert!(beats(4, -4, None, 0));
    }

    #[tokio::test]
    async fn test_single_node_becomes_leader() {
        let network = LocalNetwork::new();
        let elections = domain(&network, nodes(&[7])).await;
        let listener = Arc::new(CountingListener::default());
        elections[0].register_listener(listener.clone()).await;

        elections[0].connectivity_changed().await;
        assert_eq!(elections[0].phase().await, ElectionPhase::Leader);
        assert_eq!(elections[0].current_leader().await, Some(7));

        // Re-election with the same outcome does not notify again
        elections[0].connectivity_changed().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(listener.leader.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_highest_id_wins_without_incumbent() {
        let network = LocalNetwork::new();
        let elections = domain(&network, nodes(&[1, 2, 3])).await;

        let leader = wait_for_single_leader(&elections).await;
        assert_eq!(leader, 3);
    }

    #[tokio::test]
    async fn test_incumbent_keeps_office() {
        let network = LocalNetwork::new();
        let elections = domain(&network, nodes(&[1, 2, 3])).await;

        // Make node 2 leader with a rigged election
        elections[1].force_election(true).await;
        assert_eq!(wait_for_single_leader(&elections).await, 2);

        // Node 1 and 3 campaign with their base weights; node 2 carries the bonus
        assert_eq!(elections[0].local_weight().await, 1);
        assert_eq!(elections[2].local_weight().await, 3);
        assert_eq!(elections[1].local_weight().await, 2 + LARGE_BONUS);

        elections[0].connectivity_changed().await;
        elections[2].connectivity_changed().await;
        assert_eq!(wait_for_single_leader(&elections).await, 2);
    }

    #[tokio::test]
    async fn test_ineligible_node_never_wins() {
        let network = LocalNetwork::new();
        let mut all = nodes(&[1, 2]);
        all.push(DomainNode::new(9, 1, "10.0.0.9", 6642).ineligible());
        let elections = domain(&network, all).await;

        assert_eq!(wait_for_single_leader(&elections).await, 2);
        assert_eq!(elections[2].local_weight().await, -9);
    }

    #[tokio::test]
    async fn test_leader_listener_called_once_per_change() {
        let network = LocalNetwork::new();
        let elections = domain(&network, nodes(&[1, 2])).await;
        let on_two = Arc::new(CountingListener::default());
        elections[1].register_listener(on_two.clone()).await;

        assert_eq!(wait_for_single_leader(&elections).await, 2);
        for _ in 0..3 {
            elections[0].connectivity_changed().await;
            assert_eq!(wait_for_single_leader(&elections).await, 2);
        }
        tokio::time::sleep(Duration::from_millis(TIMEOUT_MS * 3)).await;
        assert_eq!(on_two.leader.load(Ordering::SeqCst), 1);
        assert_eq!(on_two.follower.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_partitioned_leader_reelects() {
        let network = LocalNetwork::new();
        let elections = domain(&network, nodes(&[1, 2, 3])).await;
        assert_eq!(wait_for_single_leader(&elections).await, 3);

        // Cut node 3 off; the remaining pair must converge on node 2
        network.isolate(3);
        for e in &elections {
            e.connectivity_changed().await;
        }
        assert_eq!(wait_for_single_leader(&elections[..2]).await, 2);
        assert!(!elections[0].is_connected(3));
    }

    #[tokio::test]
    async fn test_membership_change_validation() {
        let network = LocalNetwork::new();
        let elections = domain(&network, nodes(&[1, 2])).await;

        let err = elections[0]
            .membership_changed(vec![
                DomainNode::new(2, 1, "10.0.0.2", 6642),
                DomainNode::new(2, 1, "10.0.0.5", 6642),
            ])
            .await
            .unwrap_err();
        assert!(err.is_config());
        assert_eq!(elections[0].status().await.peers, vec![2]);
    }

    #[tokio::test]
    async fn test_foreign_domain_message_dropped() {
        let network = LocalNetwork::new();
        let elections = domain(&network, nodes(&[4])).await;

        elections[0]
            .handle_message(ElectionMessage {
                domain_id: 99,
                transaction_id: 1,
                body: ElectionBody::LeaderAnnounce { from: 8, weight: 8 },
            })
            .await;
        assert_eq!(elections[0].phase().await, ElectionPhase::Init);
    }

    #[tokio::test]
    async fn test_announce_in_init_is_accepted() {
        let network = LocalNetwork::new();
        let elections = domain(&network, nodes(&[1, 2])).await;
        // Keep node 2 from reacting to the acknowledgement
        network.isolate(2);

        elections[0].on_leader_announce(2, 2).await;
        assert_eq!(elections[0].phase().await, ElectionPhase::Follower);
        assert_eq!(elections[0].current_leader().await, Some(2));
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent_and_stops_timers() {
        let network = LocalNetwork::new();
        let elections = domain(&network, nodes(&[1, 2])).await;

        elections[0].shutdown().await;
        elections[0].shutdown().await;
        tokio::time::sleep(Duration::from_millis(TIMEOUT_MS * 3)).await;
        assert_eq!(elections[0].phase().await, ElectionPhase::Init);
        assert!(elections[0].start().await.is_err());
    }
}
