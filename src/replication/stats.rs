//! Push Statistics
//!
//! Per-follower counters. Every follower's counters have the coordinator's
//! aggregate as parent, which is updated alongside the child.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Push counters
#[derive(Debug, Default)]
pub struct PushStats {
    parent: Option<Arc<PushStats>>,
    requests: AtomicU64,
    bytes_sent: AtomicU64,
    successes: AtomicU64,
    rejections: AtomicU64,
    failures: AtomicU64,
    timeouts: AtomicU64,
    last_error: Mutex<Option<String>>,
    last_success: Mutex<Option<DateTime<Utc>>>,
}

/// Read-only copy of [`PushStats`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PushStatsSnapshot {
    pub requests: u64,
    pub bytes_sent: u64,
    pub successes: u64,
    pub rejections: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub last_error: Option<String>,
    pub last_success: Option<DateTime<Utc>>,
}

impl PushStats {
    /// Create root counters
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create counters that also feed `self`
    pub fn child(self: &Arc<Self>) -> Arc<Self> {
        Arc::new(Self {
            parent: Some(Arc::clone(self)),
            ..Self::default()
        })
    }

    pub(crate) fn record_request(&self, bytes: u64) {
        if let Some(parent) = &self.parent {
            parent.record_request(bytes);
        }
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_success(&self) {
        if let Some(parent) = &self.parent {
            parent.record_success();
        }
        self.successes.fetch_add(1, Ordering::Relaxed);
        *self.last_success.lock() = Some(Utc::now());
    }

    pub(crate) fn record_rejection(&self) {
        if let Some(parent) = &self.parent {
            parent.record_rejection();
        }
        self.rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failure(&self, error: &str) {
        if let Some(parent) = &self.parent {
            parent.record_failure(error);
        }
        self.failures.fetch_add(1, Ordering::Relaxed);
        *self.last_error.lock() = Some(error.to_string());
    }

    pub(crate) fn record_timeout(&self) {
        if let Some(parent) = &self.parent {
            parent.record_timeout();
        }
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy the current counters
    pub fn snapshot(&self) -> PushStatsSnapshot {
        PushStatsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            rejections: self.rejections.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            last_error: self.last_error.lock().clone(),
            last_success: *self.last_success.lock(),
        }
    }
}
