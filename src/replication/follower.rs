//! Follower Sync State
//!
//! Per-follower push state machine. All transitions take an explicit `now`
//! so the machine can be driven by the coordinator loop or by tests alike.
//!
//! ```text
//!   Idle --dispatch--> Pushing --success/rejected--> Quiescent --quiescence--> Idle
//!                         |  \--failed--> Error --backoff--> Idle
//!                         \--update timeout--> Idle
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use serde::{Deserialize, Serialize};

use super::content::{same_content, SyncContent};
use super::link::{PushMethod, PushOutcome, PushRequest};
use super::ReplicationConfig;

/// Follower identity within a replication group
pub type FollowerId = String;

/// Push status of one follower
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FollowerStatus {
    /// Ready to push when content differs
    Idle,
    /// Exactly one push is outstanding
    Pushing,
    /// Last push failed, waiting out the backoff
    Error,
    /// Last push completed, waiting out the quiescence period
    Quiescent,
}

impl std::fmt::Display for FollowerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FollowerStatus::Idle => write!(f, "IDLE"),
            FollowerStatus::Pushing => write!(f, "PUSHING"),
            FollowerStatus::Error => write!(f, "ERROR"),
            FollowerStatus::Quiescent => write!(f, "QUIESCENT"),
        }
    }
}

/// A push the caller must perform
#[derive(Debug)]
pub struct Dispatch<C> {
    /// Attempt number to hand back to [`FollowerSyncState::complete`]
    pub attempt: u64,
    pub content: Arc<C>,
    pub request: PushRequest,
}

/// Result of [`FollowerSyncState::evaluate`]
#[derive(Debug)]
pub struct Evaluation<C> {
    pub dispatch: Option<Dispatch<C>>,
    /// When the follower next needs attention, if ever
    pub next_check: Option<Instant>,
    /// The outstanding push was abandoned after the update timeout
    pub timed_out: bool,
}

struct InFlight<C> {
    attempt: u64,
    content: Arc<C>,
    started: Instant,
    /// Sent to an address the follower has since moved away from
    retargeted: bool,
}

/// Push state of one follower
pub struct FollowerSyncState<C: SyncContent> {
    id: FollowerId,
    status: FollowerStatus,
    desired: Option<Arc<C>>,
    converged: Option<Arc<C>>,
    in_flight: Option<InFlight<C>>,
    consecutive_errors: u32,
    backoff: Duration,
    last_transition: Instant,
    attempts: u64,
    ignored_count: u64,
}

/// Serializable view of a follower
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FollowerSnapshot {
    pub id: FollowerId,
    pub status: FollowerStatus,
    pub needs_update: bool,
    pub consecutive_errors: u32,
    pub backoff_ms: u64,
    pub attempts: u64,
    pub ignored_count: u64,
}

impl<C: SyncContent> FollowerSyncState<C> {
    pub fn new(id: impl Into<FollowerId>, now: Instant) -> Self {
        Self {
            id: id.into(),
            status: FollowerStatus::Idle,
            desired: None,
            converged: None,
            in_flight: None,
            consecutive_errors: 0,
            backoff: Duration::ZERO,
            last_transition: now,
            attempts: 0,
            ignored_count: 0,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn status(&self) -> FollowerStatus {
        self.status
    }

    /// Content the follower is known to hold
    pub fn converged(&self) -> Option<&Arc<C>> {
        self.converged.as_ref()
    }

    pub fn desired(&self) -> Option<&Arc<C>> {
        self.desired.as_ref()
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors
    }

    pub fn backoff(&self) -> Duration {
        self.backoff
    }

    /// Pushes the follower refused because it thought it was authoritative
    pub fn ignored_count(&self) -> u64 {
        self.ignored_count
    }

    pub fn set_desired(&mut self, desired: Option<Arc<C>>) {
        self.desired = desired;
    }

    /// The follower moved to a new address. Its content is unknown again, and
    /// an outstanding push still blocks the next one until it resolves.
    pub fn retarget(&mut self) {
        self.converged = None;
        if let Some(in_flight) = self.in_flight.as_mut() {
            in_flight.retargeted = true;
        }
    }

    /// Desired content is known and differs from what the follower holds
    pub fn needs_update(&self) -> bool {
        self.desired.is_some() && !same_content(self.desired.as_ref(), self.converged.as_ref())
    }

    /// Apply expired timers, then start a push if one is due
    pub fn evaluate(&mut self, now: Instant, config: &ReplicationConfig) -> Evaluation<C> {
        let mut timed_out = false;

        match self.status {
            FollowerStatus::Error if now >= self.last_transition + self.backoff => {
                tracing::debug!("Follower {} backoff elapsed, retrying", self.id);
                self.enter(FollowerStatus::Idle, now);
            }
            FollowerStatus::Quiescent if now >= self.last_transition + config.quiescence() => {
                self.enter(FollowerStatus::Idle, now);
            }
            FollowerStatus::Pushing => {
                let expired = self
                    .in_flight
                    .as_ref()
                    .map_or(true, |f| now >= f.started + config.update_timeout());
                if expired {
                    tracing::warn!(
                        "Update to follower {} timed out after {:?}",
                        self.id,
                        config.update_timeout()
                    );
                    self.in_flight = None;
                    timed_out = true;
                    self.enter(FollowerStatus::Idle, now);
                }
            }
            _ => {}
        }

        let dispatch = if self.status == FollowerStatus::Idle && self.needs_update() {
            self.start_push(now)
        } else {
            None
        };

        let next_check = match self.status {
            FollowerStatus::Error => Some(self.last_transition + self.backoff),
            FollowerStatus::Quiescent => Some(self.last_transition + config.quiescence()),
            FollowerStatus::Pushing => self
                .in_flight
                .as_ref()
                .map(|f| f.started + config.update_timeout()),
            FollowerStatus::Idle => None,
        };

        Evaluation {
            dispatch,
            next_check,
            timed_out,
        }
    }

    fn start_push(&mut self, now: Instant) -> Option<Dispatch<C>> {
        let content = self.desired.clone()?;
        self.attempts += 1;

        let request = PushRequest {
            method: PushMethod::Put,
            content_type: content.content_type().to_string(),
            body: content.diff_from(self.converged.as_deref()),
        };
        tracing::debug!(
            "Pushing {} bytes to follower {} (attempt {})",
            request.body.len(),
            self.id,
            self.attempts
        );

        self.in_flight = Some(InFlight {
            attempt: self.attempts,
            content: Arc::clone(&content),
            started: now,
            retargeted: false,
        });
        self.enter(FollowerStatus::Pushing, now);

        Some(Dispatch {
            attempt: self.attempts,
            content,
            request,
        })
    }

    /// Record the outcome of a push. Returns false when the outcome belongs
    /// to an attempt that is no longer outstanding and was discarded.
    pub fn complete(
        &mut self,
        attempt: u64,
        outcome: &PushOutcome,
        now: Instant,
        config: &ReplicationConfig,
    ) -> bool {
        let current = self.status == FollowerStatus::Pushing
            && self.in_flight.as_ref().is_some_and(|f| f.attempt == attempt);
        if !current {
            tracing::debug!(
                "Discarding stale result of attempt {} for follower {}",
                attempt,
                self.id
            );
            return false;
        }
        let Some(in_flight) = self.in_flight.take() else {
            return false;
        };

        match outcome {
            PushOutcome::Success => {
                if !in_flight.retargeted {
                    self.converged = Some(in_flight.content);
                }
                self.consecutive_errors = 0;
                self.backoff = Duration::ZERO;
                self.enter(FollowerStatus::Quiescent, now);
            }
            PushOutcome::Rejected(reason) => {
                tracing::warn!(
                    "Follower {} ignored our update, it believes it is in charge: {}",
                    self.id,
                    reason
                );
                self.ignored_count += 1;
                self.consecutive_errors = 0;
                self.backoff = Duration::ZERO;
                self.enter(FollowerStatus::Quiescent, now);
            }
            PushOutcome::Failed(e) => {
                self.consecutive_errors += 1;
                self.backoff = next_backoff(self.consecutive_errors, self.backoff, config);
                tracing::warn!(
                    "Update to follower {} failed ({} in a row), retrying in {:?}: {}",
                    self.id,
                    self.consecutive_errors,
                    self.backoff,
                    e
                );
                self.enter(FollowerStatus::Error, now);
            }
        }
        true
    }

    pub fn snapshot(&self) -> FollowerSnapshot {
        FollowerSnapshot {
            id: self.id.clone(),
            status: self.status,
            needs_update: self.needs_update(),
            consecutive_errors: self.consecutive_errors,
            backoff_ms: self.backoff.as_millis() as u64,
            attempts: self.attempts,
            ignored_count: self.ignored_count,
        }
    }

    fn enter(&mut self, status: FollowerStatus, now: Instant) {
        self.status = status;
        self.last_transition = now;
    }
}

/// Randomized first backoff, doubling afterwards, capped at the maximum
fn next_backoff(consecutive_errors: u32, previous: Duration, config: &ReplicationConfig) -> Duration {
    let next = if consecutive_errors <= 1 {
        let min = config.initial_backoff_min_ms;
        let max = config.initial_backoff_max_ms.max(min);
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    } else {
        previous.saturating_mul(2)
    };
    next.min(config.max_backoff())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::replication::SnapshotContent;

    fn content(body: &'static str) -> Arc<SnapshotContent> {
        Arc::new(SnapshotContent::new("text/plain", body))
    }

    fn failed() -> PushOutcome {
        PushOutcome::Failed(Error::Network("connection refused".into()))
    }

    #[test]
    fn test_idle_without_content_does_nothing() {
        let config = ReplicationConfig::default();
        let now = Instant::now();
        let mut state = FollowerSyncState::<SnapshotContent>::new("f1", now);

        let eval = state.evaluate(now, &config);
        assert!(eval.dispatch.is_none());
        assert!(eval.next_check.is_none());
        assert_eq!(state.status(), FollowerStatus::Idle);
    }

    #[test]
    fn test_single_flight_then_quiescence() {
        let config = ReplicationConfig::default();
        let t0 = Instant::now();
        let mut state = FollowerSyncState::new("f1", t0);
        state.set_desired(Some(content("v1")));

        let dispatch = state.evaluate(t0, &config).dispatch.unwrap();
        assert_eq!(dispatch.attempt, 1);
        assert_eq!(dispatch.request.method, PushMethod::Put);
        assert_eq!(&dispatch.request.body[..], b"v1");
        assert_eq!(state.status(), FollowerStatus::Pushing);

        // New content while pushing waits for the outstanding push
        state.set_desired(Some(content("v2")));
        let eval = state.evaluate(t0 + Duration::from_millis(10), &config);
        assert!(eval.dispatch.is_none());
        assert_eq!(eval.next_check, Some(t0 + config.update_timeout()));

        let t1 = t0 + Duration::from_millis(20);
        assert!(state.complete(1, &PushOutcome::Success, t1, &config));
        assert_eq!(state.status(), FollowerStatus::Quiescent);
        assert_eq!(state.converged().map(|c| c.body().clone()), Some("v1".into()));

        // Still quiescent just before the period ends
        let eval = state.evaluate(t1 + config.quiescence() - Duration::from_millis(1), &config);
        assert!(eval.dispatch.is_none());
        assert_eq!(eval.next_check, Some(t1 + config.quiescence()));

        let dispatch = state.evaluate(t1 + config.quiescence(), &config).dispatch.unwrap();
        assert_eq!(dispatch.attempt, 2);
        assert_eq!(&dispatch.request.body[..], b"v2");
    }

    #[test]
    fn test_converged_follower_stays_idle() {
        let config = ReplicationConfig::default();
        let t0 = Instant::now();
        let mut state = FollowerSyncState::new("f1", t0);
        state.set_desired(Some(content("v1")));

        let dispatch = state.evaluate(t0, &config).dispatch.unwrap();
        state.complete(dispatch.attempt, &PushOutcome::Success, t0, &config);

        // Equal but distinct value is not pushed again
        state.set_desired(Some(content("v1")));
        let eval = state.evaluate(t0 + config.quiescence(), &config);
        assert!(eval.dispatch.is_none());
        assert!(eval.next_check.is_none());
        assert_eq!(state.status(), FollowerStatus::Idle);
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let config = ReplicationConfig {
            max_backoff_ms: 1000,
            ..Default::default()
        };
        let mut now = Instant::now();
        let mut state = FollowerSyncState::new("f1", now);
        state.set_desired(Some(content("v1")));

        let mut backoffs = Vec::new();
        for _ in 0..6 {
            let dispatch = state.evaluate(now, &config).dispatch.unwrap();
            assert!(state.complete(dispatch.attempt, &failed(), now, &config));
            assert_eq!(state.status(), FollowerStatus::Error);
            backoffs.push(state.backoff());

            // Not retried before the backoff elapses
            let early = state.evaluate(now + state.backoff() - Duration::from_millis(1), &config);
            assert!(early.dispatch.is_none());
            now += state.backoff();
        }

        assert!(backoffs[0] >= Duration::from_millis(100));
        assert!(backoffs[0] <= Duration::from_millis(300));
        assert_eq!(backoffs[1], (backoffs[0] * 2).min(Duration::from_millis(1000)));
        assert_eq!(*backoffs.last().unwrap(), Duration::from_millis(1000));
        assert_eq!(state.consecutive_errors(), 6);
    }

    #[test]
    fn test_success_resets_errors() {
        let config = ReplicationConfig::default();
        let t0 = Instant::now();
        let mut state = FollowerSyncState::new("f1", t0);
        state.set_desired(Some(content("v1")));

        let dispatch = state.evaluate(t0, &config).dispatch.unwrap();
        state.complete(dispatch.attempt, &failed(), t0, &config);
        let t1 = t0 + state.backoff();
        let dispatch = state.evaluate(t1, &config).dispatch.unwrap();
        state.complete(dispatch.attempt, &PushOutcome::Success, t1, &config);

        assert_eq!(state.consecutive_errors(), 0);
        assert_eq!(state.status(), FollowerStatus::Quiescent);
    }

    #[test]
    fn test_rejection_counts_ignored_and_keeps_content() {
        let config = ReplicationConfig::default();
        let t0 = Instant::now();
        let mut state = FollowerSyncState::new("f1", t0);
        state.set_desired(Some(content("v1")));

        // A failure first, so the rejection has a backoff to clear
        let first = state.evaluate(t0, &config).dispatch.unwrap();
        assert!(state.complete(first.attempt, &failed(), t0, &config));
        assert!(state.backoff() > Duration::ZERO);

        let t1 = t0 + state.backoff();
        let dispatch = state.evaluate(t1, &config).dispatch.unwrap();
        let rejected = PushOutcome::Rejected("node is leader".into());
        assert!(state.complete(dispatch.attempt, &rejected, t1, &config));

        assert_eq!(state.status(), FollowerStatus::Quiescent);
        assert_eq!(state.ignored_count(), 1);
        assert_eq!(state.consecutive_errors(), 0);
        assert_eq!(state.backoff(), Duration::ZERO);
        assert!(state.converged().is_none());
        assert!(state.needs_update());

        // Retried after the quiescence period, not after a backoff
        let early = state.evaluate(t1 + config.quiescence() - Duration::from_millis(1), &config);
        assert!(early.dispatch.is_none());
        assert_eq!(early.next_check, Some(t1 + config.quiescence()));
        assert!(state.evaluate(t1 + config.quiescence(), &config).dispatch.is_some());
    }

    #[test]
    fn test_retarget_keeps_single_flight() {
        let config = ReplicationConfig::default();
        let t0 = Instant::now();
        let mut state = FollowerSyncState::new("f1", t0);
        state.set_desired(Some(content("v1")));
        let old = state.evaluate(t0, &config).dispatch.unwrap();

        state.retarget();
        assert_eq!(state.status(), FollowerStatus::Pushing);
        assert!(state.evaluate(t0, &config).dispatch.is_none());

        // The push to the old address does not count as converged
        assert!(state.complete(old.attempt, &PushOutcome::Success, t0, &config));
        assert!(state.converged().is_none());
        assert!(state.needs_update());
        assert!(state.evaluate(t0 + config.quiescence(), &config).dispatch.is_some());
    }

    #[test]
    fn test_update_timeout_discards_late_result() {
        let config = ReplicationConfig::default();
        let t0 = Instant::now();
        let mut state = FollowerSyncState::new("f1", t0);
        state.set_desired(Some(content("v1")));

        let first = state.evaluate(t0, &config).dispatch.unwrap();

        let t1 = t0 + config.update_timeout();
        let eval = state.evaluate(t1, &config);
        assert!(eval.timed_out);
        let second = eval.dispatch.unwrap();
        assert_eq!(second.attempt, first.attempt + 1);

        // The abandoned push reporting late has no effect
        assert!(!state.complete(first.attempt, &PushOutcome::Success, t1, &config));
        assert_eq!(state.status(), FollowerStatus::Pushing);
        assert!(state.converged().is_none());

        assert!(state.complete(second.attempt, &PushOutcome::Success, t1, &config));
        assert_eq!(state.status(), FollowerStatus::Quiescent);
    }

    #[test]
    fn test_result_without_push_is_ignored() {
        let config = ReplicationConfig::default();
        let now = Instant::now();
        let mut state = FollowerSyncState::<SnapshotContent>::new("f1", now);
        assert!(!state.complete(1, &PushOutcome::Success, now, &config));
        assert_eq!(state.status(), FollowerStatus::Idle);
    }
}
