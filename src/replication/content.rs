//! Replicated Content
//!
//! The value pushed from the leader to its followers is opaque to the
//! replication engine: it only needs to compare two values and to produce
//! the bytes to send given what a follower already has.

use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;

use crate::error::Result;

/// Content type used for JSON snapshots
pub const JSON_CONTENT_TYPE: &str = "application/json; charset=UTF-8";

/// Immutable, comparable payload replicated to followers
pub trait SyncContent: PartialEq + std::fmt::Debug + Send + Sync + 'static {
    /// MIME type of the bytes produced by [`SyncContent::diff_from`]
    fn content_type(&self) -> &str;

    /// Bytes that bring a follower holding `previous` up to this content.
    /// Full-snapshot content ignores `previous`.
    fn diff_from(&self, previous: Option<&Self>) -> Bytes;
}

/// Whether two optional shared contents are equal
pub fn same_content<C: SyncContent>(a: Option<&Arc<C>>, b: Option<&Arc<C>>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => Arc::ptr_eq(a, b) || **a == **b,
        _ => false,
    }
}

/// Full snapshot of the replicated state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotContent {
    content_type: String,
    body: Bytes,
}

impl SnapshotContent {
    /// Create a snapshot from raw bytes
    pub fn new(content_type: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            content_type: content_type.into(),
            body: body.into(),
        }
    }

    /// Serialize a value into a JSON snapshot
    pub fn json<T: Serialize>(value: &T) -> Result<Self> {
        let body = serde_json::to_vec(value)?;
        Ok(Self::new(JSON_CONTENT_TYPE, body))
    }

    /// Snapshot bytes
    pub fn body(&self) -> &Bytes {
        &self.body
    }
}

impl SyncContent for SnapshotContent {
    fn content_type(&self) -> &str {
        &self.content_type
    }

    fn diff_from(&self, _previous: Option<&Self>) -> Bytes {
        self.body.clone()
    }
}
