//! Pure channel state machine.
//!
//! [`SupervisorMachine`] decides transitions; it owns the session-layer
//! [`RetryState`] and [`FailureHistory`] but performs no I/O and reads no
//! clock. Each input returns at most one [`Effect`] for the driver to carry
//! out, and [`next_wake`](SupervisorMachine::next_wake) tells the driver when
//! to call [`on_tick`](SupervisorMachine::on_tick).
//!
//! ```text
//!            attached                 connected
//!   Idle ---------------> Connecting -----------> Live
//!    ^                     ^    |                  |
//!    |          eligible   |    | failed           | closed
//!    |                     |    v                  |
//!    |                    Backoff <----------------+ (delay > 0)
//!    |                                             |
//!    +------ detached (from any state) ------------+
//! ```

use super::ChannelState;
use crate::network::LossReason;
use crate::reconnect::{FailureEvent, FailureHistory, FailureKind, ReconnectPolicy, RetryState};
use crate::tls::ConnectError;
use log::{debug, info, warn};
use std::time::Duration;
use tokio::time::Instant;

/// Action the driver must take after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    /// Start one connect attempt.
    StartConnect,
    /// Abandon the in-flight connect attempt.
    AbortConnect,
    /// Tear down the live session of this generation.
    Teardown { generation: u64 },
}

/// Channel state machine.
#[derive(Debug)]
pub struct SupervisorMachine {
    policy: ReconnectPolicy,
    stable_window: Duration,
    state: ChannelState,
    attached: bool,
    generation: u64,
    retry: RetryState,
    history: FailureHistory,
    /// When the live session counts as stable.
    stable_at: Option<Instant>,
}

impl SupervisorMachine {
    /// Create an idle, detached machine.
    pub fn new(policy: ReconnectPolicy, stable_window: Duration, history_capacity: usize) -> Self {
        Self {
            policy,
            stable_window,
            state: ChannelState::Idle,
            attached: false,
            generation: 0,
            retry: RetryState::new(),
            history: FailureHistory::new(history_capacity),
            stable_at: None,
        }
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }

    /// Generation of the current (or last) live session; 0 before the first.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn retry_state(&self) -> &RetryState {
        &self.retry
    }

    pub fn history(&self) -> &FailureHistory {
        &self.history
    }

    /// Returns true if `generation` is the live session.
    pub fn is_current(&self, generation: u64) -> bool {
        self.state == ChannelState::Live && generation == self.generation
    }

    /// The network became attached.
    pub fn on_attached(&mut self, _now: Instant) -> Option<Effect> {
        self.attached = true;
        if self.state == ChannelState::Idle {
            self.transition(ChannelState::Connecting);
            return Some(Effect::StartConnect);
        }
        None
    }

    /// The network went away. Valid from any state.
    pub fn on_detached(&mut self, now: Instant, reason: &LossReason) -> Option<Effect> {
        let was_attached = std::mem::replace(&mut self.attached, false);
        if was_attached {
            self.history.record(FailureEvent::new(
                now,
                FailureKind::AttachmentLost,
                reason.to_string(),
            ));
            self.policy.on_failure(&mut self.retry, now);
        }

        let effect = match self.state {
            ChannelState::Live => Some(Effect::Teardown {
                generation: self.generation,
            }),
            ChannelState::Connecting => Some(Effect::AbortConnect),
            ChannelState::Idle | ChannelState::Backoff => None,
        };
        self.stable_at = None;
        self.transition(ChannelState::Idle);
        effect
    }

    /// The in-flight connect attempt succeeded. Returns the new generation.
    pub fn on_connected(&mut self, now: Instant) -> u64 {
        self.generation += 1;
        self.policy.on_success(&mut self.retry);
        self.history.mark_success();
        self.stable_at = Some(now + self.stable_window);
        self.transition(ChannelState::Live);
        self.generation
    }

    /// The in-flight connect attempt failed.
    pub fn on_connect_failed(&mut self, now: Instant, error: &ConnectError) -> Option<Effect> {
        if self.state != ChannelState::Connecting {
            debug!("Ignoring connect failure while {}", self.state);
            return None;
        }
        self.history.record(FailureEvent::new(
            now,
            FailureKind::ConnectFailed,
            error.to_string(),
        ));
        let delay = self.policy.on_failure(&mut self.retry, now);
        warn!(
            "Connect failed: {} (retry in {:?}, attempt {})",
            error,
            delay,
            self.retry.attempt_count()
        );
        self.transition(ChannelState::Backoff);
        None
    }

    /// The live session of `generation` closed.
    ///
    /// Closures of superseded generations are ignored.
    pub fn on_session_closed(
        &mut self,
        now: Instant,
        generation: u64,
        reason: &str,
    ) -> Option<Effect> {
        if !self.is_current(generation) {
            debug!("Ignoring closure of stale session {}", generation);
            return None;
        }
        self.stable_at = None;
        self.history.record(FailureEvent::new(
            now,
            FailureKind::SessionClosed,
            reason,
        ));
        let closures = self.history.closures_within(now, self.stable_window);
        let delay = self.policy.on_session_closed(&mut self.retry, closures, now);
        info!(
            "Session {} closed: {} (reconnect in {:?})",
            generation, reason, delay
        );

        if delay.is_zero() {
            self.transition(ChannelState::Connecting);
            Some(Effect::StartConnect)
        } else {
            self.transition(ChannelState::Backoff);
            None
        }
    }

    /// Time-driven transitions: leave Backoff once eligible, and forget old
    /// failures once a session has been stable for the window.
    pub fn on_tick(&mut self, now: Instant) -> Option<Effect> {
        match self.state {
            ChannelState::Backoff if self.attached && self.retry.is_eligible(now) => {
                self.transition(ChannelState::Connecting);
                Some(Effect::StartConnect)
            }
            ChannelState::Live => {
                if self.stable_at.is_some_and(|at| now >= at) {
                    debug!("Session stable, clearing failure history");
                    self.stable_at = None;
                    self.history.clear();
                }
                None
            }
            _ => None,
        }
    }

    /// Orderly stop. Not a failure; nothing is recorded.
    pub fn on_shutdown(&mut self) -> Option<Effect> {
        let effect = match self.state {
            ChannelState::Live => Some(Effect::Teardown {
                generation: self.generation,
            }),
            ChannelState::Connecting => Some(Effect::AbortConnect),
            ChannelState::Idle | ChannelState::Backoff => None,
        };
        self.attached = false;
        self.stable_at = None;
        self.transition(ChannelState::Idle);
        effect
    }

    /// Next instant at which [`on_tick`](Self::on_tick) has work to do.
    pub fn next_wake(&self) -> Option<Instant> {
        match self.state {
            ChannelState::Backoff if self.attached => {
                Some(self.retry.next_eligible_time().unwrap_or_else(Instant::now))
            }
            ChannelState::Live => self.stable_at,
            _ => None,
        }
    }

    fn transition(&mut self, state: ChannelState) {
        if self.state != state {
            info!(
                "Channel {} -> {} (attempt {})",
                self.state,
                state,
                self.retry.attempt_count()
            );
        }
        self.state = state;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine() -> SupervisorMachine {
        let policy = ReconnectPolicy::new(Duration::from_secs(1), Duration::from_secs(60), 0, 0);
        SupervisorMachine::new(policy, Duration::from_secs(30), 16)
    }

    // ==================== Transition Tests ====================

    #[test]
    fn test_attach_starts_connect() {
        let mut m = machine();
        let now = Instant::now();
        assert_eq!(m.state(), ChannelState::Idle);
        assert_eq!(m.on_attached(now), Some(Effect::StartConnect));
        assert_eq!(m.state(), ChannelState::Connecting);
    }

    #[test]
    fn test_connect_success_goes_live_with_new_generation() {
        let mut m = machine();
        let now = Instant::now();
        m.on_attached(now);
        assert_eq!(m.on_connected(now), 1);
        assert_eq!(m.state(), ChannelState::Live);
        assert!(m.is_current(1));
        assert!(!m.is_current(0));
    }

    #[test]
    fn test_connect_failure_backs_off_until_eligible() {
        let mut m = machine();
        let now = Instant::now();
        m.on_attached(now);
        m.on_connect_failed(now, &ConnectError::HandshakeTimeout);

        assert_eq!(m.state(), ChannelState::Backoff);
        assert_eq!(m.retry_state().attempt_count(), 1);
        assert_eq!(m.next_wake(), Some(now + Duration::from_secs(1)));

        assert_eq!(m.on_tick(now + Duration::from_millis(999)), None);
        assert_eq!(m.state(), ChannelState::Backoff);
        assert_eq!(
            m.on_tick(now + Duration::from_secs(1)),
            Some(Effect::StartConnect)
        );
        assert_eq!(m.state(), ChannelState::Connecting);
    }

    #[test]
    fn test_repeated_failures_double_delay() {
        let mut m = machine();
        let mut now = Instant::now();
        m.on_attached(now);
        for expected in [1, 2, 4, 8] {
            m.on_connect_failed(now, &ConnectError::NetworkUnreachable("x".into()));
            let wake = m.next_wake().unwrap();
            assert_eq!(wake - now, Duration::from_secs(expected));
            now = wake;
            assert_eq!(m.on_tick(now), Some(Effect::StartConnect));
        }
    }

    #[test]
    fn test_detach_from_each_state() {
        let now = Instant::now();

        let mut m = machine();
        assert_eq!(m.on_detached(now, &LossReason::RadioDown), None);
        assert_eq!(m.state(), ChannelState::Idle);

        let mut m = machine();
        m.on_attached(now);
        assert_eq!(
            m.on_detached(now, &LossReason::RadioDown),
            Some(Effect::AbortConnect)
        );
        assert_eq!(m.state(), ChannelState::Idle);

        let mut m = machine();
        m.on_attached(now);
        let generation = m.on_connected(now);
        assert_eq!(
            m.on_detached(now, &LossReason::LeaseExpired),
            Some(Effect::Teardown { generation })
        );
        assert_eq!(m.state(), ChannelState::Idle);
        assert!(!m.is_current(generation));

        let mut m = machine();
        m.on_attached(now);
        m.on_connect_failed(now, &ConnectError::HandshakeTimeout);
        assert_eq!(m.on_detached(now, &LossReason::RadioDown), None);
        assert_eq!(m.state(), ChannelState::Idle);
        assert_eq!(m.next_wake(), None);
    }

    #[test]
    fn test_backoff_waits_for_reattach() {
        let mut m = machine();
        let now = Instant::now();
        m.on_attached(now);
        m.on_connect_failed(now, &ConnectError::HandshakeTimeout);
        m.on_detached(now, &LossReason::RadioDown);

        // Idle stays idle on ticks while detached
        assert_eq!(m.on_tick(now + Duration::from_secs(600)), None);
        assert_eq!(m.state(), ChannelState::Idle);

        assert_eq!(m.on_attached(now), Some(Effect::StartConnect));
    }

    #[test]
    fn test_late_connect_failure_ignored() {
        let mut m = machine();
        let now = Instant::now();
        m.on_attached(now);
        m.on_detached(now, &LossReason::RadioDown);
        let attempts = m.retry_state().attempt_count();

        assert_eq!(m.on_connect_failed(now, &ConnectError::HandshakeTimeout), None);
        assert_eq!(m.state(), ChannelState::Idle);
        assert_eq!(m.retry_state().attempt_count(), attempts);
    }

    #[test]
    fn test_shutdown_records_nothing() {
        let mut m = machine();
        let now = Instant::now();
        m.on_attached(now);
        let generation = m.on_connected(now);

        assert_eq!(m.on_shutdown(), Some(Effect::Teardown { generation }));
        assert_eq!(m.state(), ChannelState::Idle);
        assert!(m.history().is_empty());
        assert_eq!(m.retry_state().attempt_count(), 0);
    }

    // ==================== Session Closure Tests ====================

    #[test]
    fn test_first_closure_reconnects_immediately() {
        let mut m = machine();
        let now = Instant::now();
        m.on_attached(now);
        let generation = m.on_connected(now);

        assert_eq!(
            m.on_session_closed(now, generation, "remote closed"),
            Some(Effect::StartConnect)
        );
        assert_eq!(m.state(), ChannelState::Connecting);
        assert_eq!(m.retry_state().attempt_count(), 1);
        assert_eq!(m.history().total_session(), 1);
    }

    #[test]
    fn test_flapping_session_backs_off() {
        let mut m = machine();
        let now = Instant::now();
        m.on_attached(now);

        let g1 = m.on_connected(now);
        m.on_session_closed(now, g1, "remote closed");
        let g2 = m.on_connected(now + Duration::from_secs(1));
        assert_eq!(m.on_session_closed(now + Duration::from_secs(2), g2, "remote closed"), None);
        assert_eq!(m.state(), ChannelState::Backoff);
        assert_eq!(
            m.next_wake(),
            Some(now + Duration::from_secs(2) + Duration::from_secs(1))
        );
    }

    #[test]
    fn test_connect_failure_after_flapping_keeps_backing_off() {
        let mut m = machine();
        let mut now = Instant::now();
        m.on_attached(now);

        let mut last = Duration::ZERO;
        for _ in 0..4 {
            let g = m.on_connected(now);
            m.on_session_closed(now, g, "remote closed");
            let wake = m.next_wake().unwrap_or(now);
            assert!(wake - now >= last);
            last = wake - now;
            if m.state() == ChannelState::Backoff {
                assert_eq!(m.on_tick(wake), Some(Effect::StartConnect));
            }
            now = wake;
        }
        assert_eq!(last, Duration::from_secs(4));
        assert_eq!(m.state(), ChannelState::Connecting);

        m.on_connect_failed(now, &ConnectError::NetworkUnreachable("refused".into()));
        assert_eq!(m.state(), ChannelState::Backoff);
        let delay = m.next_wake().unwrap() - now;
        assert!(delay >= last, "{:?} < {:?}", delay, last);
    }

    #[test]
    fn test_stable_session_forgets_closures() {
        let mut m = machine();
        let now = Instant::now();
        m.on_attached(now);

        let g1 = m.on_connected(now);
        m.on_session_closed(now, g1, "remote closed");
        let g2 = m.on_connected(now);
        assert_eq!(m.next_wake(), Some(now + Duration::from_secs(30)));

        let later = now + Duration::from_secs(30);
        assert_eq!(m.on_tick(later), None);
        assert!(m.history().is_empty());
        assert_eq!(m.next_wake(), None);

        // Closure after stability reconnects immediately again
        assert_eq!(
            m.on_session_closed(later, g2, "remote closed"),
            Some(Effect::StartConnect)
        );
    }

    #[test]
    fn test_stale_closure_ignored() {
        let mut m = machine();
        let now = Instant::now();
        m.on_attached(now);
        let g1 = m.on_connected(now);
        m.on_session_closed(now, g1, "remote closed");
        let g2 = m.on_connected(now);

        assert_eq!(m.on_session_closed(now, g1, "late"), None);
        assert_eq!(m.state(), ChannelState::Live);
        assert!(m.is_current(g2));
    }

    // ==================== Scenario Tests ====================

    #[test]
    fn test_attempt_counts_through_recovery_scenario() {
        let mut m = machine();
        let start = Instant::now();
        let mut counts = Vec::new();

        // Detached -> Attached
        assert_eq!(m.on_attached(start), Some(Effect::StartConnect));
        counts.push(m.retry_state().attempt_count());

        // Handshake fails with an expired certificate -> Backoff(d1)
        m.on_connect_failed(start, &ConnectError::CertificateExpired);
        assert_eq!(m.state(), ChannelState::Backoff);
        counts.push(m.retry_state().attempt_count());

        // After d1 the handshake succeeds -> Live
        let d1 = m.next_wake().unwrap();
        assert_eq!(d1 - start, Duration::from_secs(1));
        assert_eq!(m.on_tick(d1), Some(Effect::StartConnect));
        let g1 = m.on_connected(d1);
        assert_eq!(m.state(), ChannelState::Live);
        counts.push(m.retry_state().attempt_count());

        // Remote closes -> Connecting immediately
        let closed_at = d1 + Duration::from_secs(5);
        m.on_tick(closed_at);
        counts.push(m.retry_state().attempt_count());
        assert_eq!(
            m.on_session_closed(closed_at, g1, "remote closed"),
            Some(Effect::StartConnect)
        );
        assert_eq!(m.state(), ChannelState::Connecting);
        counts.push(m.retry_state().attempt_count());

        // Succeeds immediately -> Live
        let g2 = m.on_connected(closed_at);
        assert_eq!(g2, g1 + 1);
        counts.push(m.retry_state().attempt_count());

        assert_eq!(counts, vec![0, 1, 0, 0, 1, 0]);
    }
}
