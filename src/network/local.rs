//! In-Process Network
//!
//! Loopback implementations of the election transport and the replication
//! links, with controllable partitions. Used by the simulator and tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::RwLock;

use super::{ElectionMessage, ElectionTransport};
use crate::error::{Error, Result};
use crate::replication::link::{validate_address, PeerLink, PeerLinkFactory, PushOutcome, PushRequest};
use crate::replication::SyncReceiver;
use crate::state::{DomainElection, NodeId};

/// Election message bus between nodes of the same process
pub struct LocalNetwork {
    me: Weak<LocalNetwork>,
    nodes: RwLock<HashMap<NodeId, Weak<DomainElection>>>,
    isolated: RwLock<HashSet<NodeId>>,
    severed: RwLock<HashSet<(NodeId, NodeId)>>,
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            nodes: RwLock::new(HashMap::new()),
            isolated: RwLock::new(HashSet::new()),
            severed: RwLock::new(HashSet::new()),
        })
    }

    /// Transport sending on behalf of `id`
    pub fn transport(&self, id: NodeId) -> Arc<dyn ElectionTransport> {
        Arc::new(LocalTransport {
            network: self.me.clone(),
            from: id,
        })
    }

    /// Deliver messages addressed to `id` to `election`
    pub fn register(&self, id: NodeId, election: &Arc<DomainElection>) {
        self.nodes.write().insert(id, Arc::downgrade(election));
    }

    /// Cut `id` off from every other node
    pub fn isolate(&self, id: NodeId) {
        tracing::debug!("Isolating node {}", id);
        self.isolated.write().insert(id);
    }

    /// Undo [`LocalNetwork::isolate`]
    pub fn rejoin(&self, id: NodeId) {
        self.isolated.write().remove(&id);
    }

    /// Cut the link between two nodes in both directions
    pub fn sever(&self, a: NodeId, b: NodeId) {
        self.severed.write().insert(pair(a, b));
    }

    /// Restore every isolated node and severed link
    pub fn heal(&self) {
        self.isolated.write().clear();
        self.severed.write().clear();
    }

    fn reachable(&self, from: NodeId, to: NodeId) -> bool {
        if from == to || !self.nodes.read().contains_key(&to) {
            return false;
        }
        let isolated = self.isolated.read();
        if isolated.contains(&from) || isolated.contains(&to) {
            return false;
        }
        !self.severed.read().contains(&pair(from, to))
    }
}

fn pair(a: NodeId, b: NodeId) -> (NodeId, NodeId) {
    (a.min(b), a.max(b))
}

struct LocalTransport {
    network: Weak<LocalNetwork>,
    from: NodeId,
}

#[async_trait::async_trait]
impl ElectionTransport for LocalTransport {
    async fn send(&self, to: NodeId, message: ElectionMessage) -> Result<()> {
        let network = self
            .network
            .upgrade()
            .ok_or_else(|| Error::Network("network torn down".to_string()))?;
        if !network.reachable(self.from, to) {
            return Err(Error::ConnectionFailed {
                address: format!("node {}", to),
                reason: "unreachable".to_string(),
            });
        }
        let target = network
            .nodes
            .read()
            .get(&to)
            .and_then(Weak::upgrade)
            .ok_or(Error::UnknownNode(to))?;

        tokio::spawn(async move {
            target.handle_message(message).await;
        });
        Ok(())
    }

    fn is_connected(&self, node: NodeId) -> bool {
        self.network
            .upgrade()
            .is_some_and(|network| network.reachable(self.from, node))
    }
}

#[derive(Default)]
struct LinkRegistry {
    receivers: RwLock<HashMap<String, Arc<SyncReceiver>>>,
    closed: AtomicBool,
}

/// Links delivering pushes straight to registered receivers
#[derive(Clone)]
pub struct LocalLinkFactory {
    registry: Arc<LinkRegistry>,
    latency: Duration,
}

impl LocalLinkFactory {
    /// Create a factory whose pushes take `latency` to complete
    pub fn new(latency: Duration) -> Self {
        Self {
            registry: Arc::new(LinkRegistry::default()),
            latency,
        }
    }

    /// Make `receiver` reachable at `address`
    pub fn register(&self, address: &str, receiver: Arc<SyncReceiver>) {
        self.registry
            .receivers
            .write()
            .insert(address.to_string(), receiver);
    }

    pub fn unregister(&self, address: &str) {
        self.registry.receivers.write().remove(address);
    }

    pub fn is_closed(&self) -> bool {
        self.registry.closed.load(Ordering::SeqCst)
    }
}

impl PeerLinkFactory for LocalLinkFactory {
    fn link(&self, address: &str) -> Result<Arc<dyn PeerLink>> {
        validate_address(address)?;
        Ok(Arc::new(LocalPeerLink {
            address: address.to_string(),
            registry: Arc::clone(&self.registry),
            latency: self.latency,
        }))
    }

    fn close_all(&self) {
        self.registry.closed.store(true, Ordering::SeqCst);
    }
}

struct LocalPeerLink {
    address: String,
    registry: Arc<LinkRegistry>,
    latency: Duration,
}

#[async_trait::async_trait]
impl PeerLink for LocalPeerLink {
    async fn send(&self, request: PushRequest) -> PushOutcome {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if self.registry.closed.load(Ordering::SeqCst) {
            return PushOutcome::Failed(Error::ShuttingDown);
        }

        let receiver = self.registry.receivers.read().get(&self.address).cloned();
        match receiver {
            Some(receiver) => receiver
                .receive(request)
                .await
                .into_push_outcome(&self.address),
            None => PushOutcome::Failed(Error::ConnectionFailed {
                address: self.address.clone(),
                reason: "connection refused".to_string(),
            }),
        }
    }

    fn address(&self) -> &str {
        &self.address
    }
}
