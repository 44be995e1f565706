//! Sync Receiver
//!
//! Follower side of replication. Pushes are only accepted while the local
//! node is a follower; a leader refuses them so that a stale leader cannot
//! overwrite the state of the current one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use super::link::{PushOutcome, PushRequest};
use crate::error::{Error, Result};

/// Local replication role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncRole {
    Leader,
    Follower,
}

/// Applies received content to local state
#[async_trait::async_trait]
pub trait ContentSink: Send + Sync {
    async fn apply(&self, content_type: &str, body: Bytes) -> Result<()>;
}

/// Outcome of handling one push
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiveOutcome {
    Accepted,
    /// Refused because the local node is the leader
    Rejected(String),
    /// The sink could not apply the content
    Failed(String),
}

impl ReceiveOutcome {
    /// Map to the outcome reported back to the pushing leader
    pub fn into_push_outcome(self, address: &str) -> PushOutcome {
        match self {
            ReceiveOutcome::Accepted => PushOutcome::Success,
            ReceiveOutcome::Rejected(reason) => PushOutcome::Rejected(reason),
            ReceiveOutcome::Failed(reason) => PushOutcome::Failed(Error::ConnectionFailed {
                address: address.to_string(),
                reason,
            }),
        }
    }
}

/// Receiver counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReceiverStats {
    pub accepted: u64,
    pub ignored: u64,
    pub failed: u64,
    pub bytes_received: u64,
}

/// Follower-side handler for pushes
pub struct SyncReceiver {
    role: RwLock<SyncRole>,
    sink: Arc<dyn ContentSink>,
    accepted: AtomicU64,
    ignored: AtomicU64,
    failed: AtomicU64,
    bytes_received: AtomicU64,
}

impl SyncReceiver {
    /// Create a receiver. It refuses pushes until told it is a follower.
    pub fn new(sink: Arc<dyn ContentSink>) -> Self {
        Self {
            role: RwLock::new(SyncRole::Leader),
            sink,
            accepted: AtomicU64::new(0),
            ignored: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
        }
    }

    pub fn role(&self) -> SyncRole {
        *self.role.read()
    }

    pub fn set_role(&self, role: SyncRole) {
        let mut current = self.role.write();
        if *current != role {
            tracing::info!("Sync receiver role {:?} -> {:?}", *current, role);
            *current = role;
        }
    }

    /// Handle one push from the leader
    pub async fn receive(&self, request: PushRequest) -> ReceiveOutcome {
        if self.role() == SyncRole::Leader {
            self.ignored.fetch_add(1, Ordering::Relaxed);
            tracing::warn!("Ignoring pushed update, this node is the leader");
            return ReceiveOutcome::Rejected("node is leader".to_string());
        }

        let size = request.body.len() as u64;
        match self.sink.apply(&request.content_type, request.body).await {
            Ok(()) => {
                self.accepted.fetch_add(1, Ordering::Relaxed);
                self.bytes_received.fetch_add(size, Ordering::Relaxed);
                tracing::debug!("Applied {} byte update ({})", size, request.content_type);
                ReceiveOutcome::Accepted
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                tracing::error!("Failed to apply pushed update: {}", e);
                ReceiveOutcome::Failed(e.to_string())
            }
        }
    }

    pub fn stats(&self) -> ReceiverStats {
        ReceiverStats {
            accepted: self.accepted.load(Ordering::Relaxed),
            ignored: self.ignored.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }
}

/// Sink that keeps the last applied content in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    last: Mutex<Option<(String, Bytes)>>,
}

impl MemorySink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Content type and bytes of the last applied update
    pub fn last(&self) -> Option<(String, Bytes)> {
        self.last.lock().clone()
    }
}

#[async_trait::async_trait]
impl ContentSink for MemorySink {
    async fn apply(&self, content_type: &str, body: Bytes) -> Result<()> {
        *self.last.lock() = Some((content_type.to_string(), body));
        Ok(())
    }
}
