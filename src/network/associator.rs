//! Network associator: attachment state machine over a [`LinkDriver`].
//!
//! ```text
//! Detached --begin_attach--> Attaching --ok--> Attached
//!    ^                           |                |
//!    +---------- failure --------+---- loss ------+
//! ```
//!
//! Failed attempts and losses are recorded as network-layer failures and gate
//! the next `begin_attach()` through the reconnect policy. Once an
//! association has held for the stable window the history is cleared.

use super::{AttachmentEvent, AttachmentState, ChannelStats, LinkDriver, LinkError, LossReason};
use crate::config::{ChannelConfig, Credentials};
use crate::reconnect::{FailureEvent, FailureHistory, FailureKind, ReconnectPolicy, RetryState};
use log::{debug, info, warn};
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, timeout, Instant};
use tokio_util::sync::CancellationToken;

/// Drives association and owns the attachment state.
pub struct NetworkAssociator<D: LinkDriver> {
    driver: D,
    credentials: Arc<Credentials>,
    policy: ReconnectPolicy,
    attach_timeout: Duration,
    stable_window: Duration,
    /// When the current association counts as stable.
    stable_at: Option<Instant>,
    state: AttachmentState,
    retry: RetryState,
    history: FailureHistory,
    events: mpsc::UnboundedSender<AttachmentEvent>,
    stats: Option<Arc<ChannelStats>>,
}

impl<D: LinkDriver> NetworkAssociator<D> {
    /// Create an associator in the `Detached` state.
    ///
    /// Returns the receiving end of the attachment event channel; hand it to
    /// the channel supervisor.
    pub fn new(
        driver: D,
        credentials: Arc<Credentials>,
        config: &ChannelConfig,
        policy: ReconnectPolicy,
    ) -> (Self, mpsc::UnboundedReceiver<AttachmentEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let associator = Self {
            driver,
            credentials,
            policy,
            attach_timeout: config.attach_timeout,
            stable_window: config.stable_window,
            stable_at: None,
            state: AttachmentState::Detached,
            retry: RetryState::new(),
            history: FailureHistory::new(config.history_capacity),
            events,
            stats: None,
        };
        (associator, events_rx)
    }

    /// Publish attachment state and failure counts to shared stats.
    pub fn with_stats(mut self, stats: Arc<ChannelStats>) -> Self {
        stats.set_attachment(self.state);
        self.stats = Some(stats);
        self
    }

    /// Current attachment state.
    pub fn state(&self) -> AttachmentState {
        self.state
    }

    /// Network-layer retry state.
    pub fn retry_state(&self) -> &RetryState {
        &self.retry
    }

    /// Network-layer failure history.
    pub fn history(&self) -> &FailureHistory {
        &self.history
    }

    /// Start one association attempt and wait for it to resolve.
    ///
    /// Valid only from `Detached` and only once the backoff delay from the
    /// previous failure has passed; otherwise nothing happens and an error
    /// says why.
    pub async fn begin_attach(&mut self) -> Result<Option<IpAddr>, AttachError> {
        if self.state != AttachmentState::Detached {
            return Err(AttachError::InvalidState(self.state));
        }
        if let Some(until) = self.retry.next_eligible_time() {
            if Instant::now() < until {
                return Err(AttachError::NotEligible { until });
            }
        }

        self.set_state(AttachmentState::Attaching);
        info!(
            "Attaching to network: {} (attempt {})",
            self.credentials.network().name(),
            self.retry.attempt_count() + 1
        );

        let result = match timeout(
            self.attach_timeout,
            self.driver.associate(self.credentials.network()),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(LinkError::Timeout),
        };

        match result {
            Ok(ip) => {
                self.policy.on_success(&mut self.retry);
                self.history.mark_success();
                self.stable_at = Some(Instant::now() + self.stable_window);
                self.set_state(AttachmentState::Attached);
                match ip {
                    Some(ip) => info!("Network attached, IP: {}", ip),
                    None => info!("Network attached"),
                }
                self.emit(AttachmentEvent::Attached { ip });
                Ok(ip)
            }
            Err(error) => {
                let now = Instant::now();
                self.history.record(FailureEvent::new(
                    now,
                    FailureKind::AttachFailed,
                    error.to_string(),
                ));
                let delay = self.policy.on_failure(&mut self.retry, now);
                self.set_state(AttachmentState::Detached);
                if let Some(stats) = &self.stats {
                    stats.record_attach_failure();
                }
                warn!(
                    "Network attach failed: {} (retry in {:?}, attempt {})",
                    error,
                    delay,
                    self.retry.attempt_count()
                );
                self.emit(AttachmentEvent::AttachFailed {
                    error: error.clone(),
                });
                Err(AttachError::Link(error))
            }
        }
    }

    /// Wait for the current association to be lost and record it.
    ///
    /// Returns `None` immediately when not attached.
    pub async fn wait_for_loss(&mut self) -> Option<LossReason> {
        if self.state != AttachmentState::Attached {
            return None;
        }
        let reason = self.driver.wait_for_loss().await;
        self.on_loss(reason.clone());
        Some(reason)
    }

    /// Clear the failure history once the association has been stable.
    pub fn on_tick(&mut self, now: Instant) {
        if self.stable_at.is_some_and(|at| now >= at) {
            debug!("Network stable, clearing failure history");
            self.stable_at = None;
            self.history.clear();
        }
    }

    /// When the current association will count as stable, if attached.
    pub fn stable_at(&self) -> Option<Instant> {
        self.stable_at
    }

    /// Drive attach / wait-for-loss until cancelled, then disconnect.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!("Network associator started");

        loop {
            if self.state == AttachmentState::Attached {
                let stable_at = self.stable_at;
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = self.wait_for_loss() => {}
                    _ = sleep_until(stable_at.unwrap_or_else(Instant::now)), if stable_at.is_some() => {
                        self.on_tick(Instant::now());
                    }
                }
                continue;
            }

            if let Some(until) = self.retry.next_eligible_time() {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = sleep_until(until) => {}
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.begin_attach() => {
                    if let Err(e) = result {
                        debug!("Attach attempt ended: {}", e);
                    }
                }
            }
        }

        if self.state != AttachmentState::Detached {
            self.driver.disconnect().await;
            self.set_state(AttachmentState::Detached);
        }
        info!("Network associator stopped");
    }

    fn on_loss(&mut self, reason: LossReason) {
        let now = Instant::now();
        self.stable_at = None;
        self.history.record(FailureEvent::new(
            now,
            FailureKind::AttachmentLost,
            reason.to_string(),
        ));
        let delay = self.policy.on_failure(&mut self.retry, now);
        self.set_state(AttachmentState::Detached);
        if let Some(stats) = &self.stats {
            stats.record_attachment_lost();
        }
        warn!("Network lost: {} (reattach in {:?})", reason, delay);
        self.emit(AttachmentEvent::Lost { reason });
    }

    fn set_state(&mut self, state: AttachmentState) {
        if self.state != state {
            debug!("Attachment {} -> {}", self.state, state);
        }
        self.state = state;
        if let Some(stats) = &self.stats {
            stats.set_attachment(state);
        }
    }

    fn emit(&self, event: AttachmentEvent) {
        if self.events.send(event).is_err() {
            debug!("No consumer for attachment events");
        }
    }
}

/// Errors returned by [`NetworkAssociator::begin_attach`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachError {
    /// `begin_attach` is only valid from `Detached`.
    InvalidState(AttachmentState),
    /// Backoff from an earlier failure has not elapsed.
    NotEligible { until: Instant },
    /// The association attempt failed.
    Link(LinkError),
}

impl fmt::Display for AttachError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidState(state) => write!(f, "cannot attach while {}", state),
            Self::NotEligible { until } => {
                write!(
                    f,
                    "backing off for another {:?}",
                    until.saturating_duration_since(Instant::now())
                )
            }
            Self::Link(e) => write!(f, "attach failed: {}", e),
        }
    }
}

impl std::error::Error for AttachError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Link(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetworkIdentity;
    use std::collections::VecDeque;
    use std::net::Ipv4Addr;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Link whose attach outcomes are scripted and whose losses are injected.
    struct ScriptedLink {
        outcomes: VecDeque<Result<Option<IpAddr>, LinkError>>,
        losses: mpsc::UnboundedReceiver<LossReason>,
        attempts: Arc<AtomicUsize>,
        disconnected: Arc<AtomicBool>,
    }

    impl LinkDriver for ScriptedLink {
        async fn associate(
            &mut self,
            _network: &NetworkIdentity,
        ) -> Result<Option<IpAddr>, LinkError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            self.outcomes
                .pop_front()
                .unwrap_or(Ok(Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)))))
        }

        async fn wait_for_loss(&mut self) -> LossReason {
            match self.losses.recv().await {
                Some(reason) => reason,
                None => std::future::pending().await,
            }
        }

        async fn disconnect(&mut self) {
            self.disconnected.store(true, Ordering::SeqCst);
        }
    }

    /// Link that never finishes associating.
    struct HangingLink;

    impl LinkDriver for HangingLink {
        async fn associate(
            &mut self,
            _network: &NetworkIdentity,
        ) -> Result<Option<IpAddr>, LinkError> {
            std::future::pending().await
        }

        async fn wait_for_loss(&mut self) -> LossReason {
            std::future::pending().await
        }

        async fn disconnect(&mut self) {}
    }

    struct Harness {
        associator: NetworkAssociator<ScriptedLink>,
        events: mpsc::UnboundedReceiver<AttachmentEvent>,
        losses: mpsc::UnboundedSender<LossReason>,
        attempts: Arc<AtomicUsize>,
        disconnected: Arc<AtomicBool>,
    }

    fn credentials() -> Arc<Credentials> {
        Arc::new(Credentials::from_parts("Workshop", "password123", "example.com", 443, b"").unwrap())
    }

    fn policy() -> ReconnectPolicy {
        ReconnectPolicy::new(Duration::from_secs(1), Duration::from_secs(60), 0, 0)
    }

    fn harness(outcomes: Vec<Result<Option<IpAddr>, LinkError>>) -> Harness {
        let (losses, losses_rx) = mpsc::unbounded_channel();
        let attempts = Arc::new(AtomicUsize::new(0));
        let disconnected = Arc::new(AtomicBool::new(false));
        let link = ScriptedLink {
            outcomes: outcomes.into(),
            losses: losses_rx,
            attempts: attempts.clone(),
            disconnected: disconnected.clone(),
        };
        let (associator, events) =
            NetworkAssociator::new(link, credentials(), &ChannelConfig::default(), policy());
        Harness {
            associator,
            events,
            losses,
            attempts,
            disconnected,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_attach_success_emits_event() {
        let mut h = harness(vec![Ok(None)]);
        assert_eq!(h.associator.state(), AttachmentState::Detached);

        assert_eq!(h.associator.begin_attach().await, Ok(None));
        assert_eq!(h.associator.state(), AttachmentState::Attached);
        assert_eq!(
            h.events.recv().await,
            Some(AttachmentEvent::Attached { ip: None })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_attach_only_from_detached() {
        let mut h = harness(vec![]);
        h.associator.begin_attach().await.unwrap();

        let result = h.associator.begin_attach().await;
        assert_eq!(
            result,
            Err(AttachError::InvalidState(AttachmentState::Attached))
        );
        assert_eq!(h.attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_records_and_gates_next_attempt() {
        let mut h = harness(vec![Err(LinkError::AuthRejected)]);

        let result = h.associator.begin_attach().await;
        assert_eq!(result, Err(AttachError::Link(LinkError::AuthRejected)));
        assert_eq!(h.associator.state(), AttachmentState::Detached);
        assert_eq!(h.associator.retry_state().attempt_count(), 1);
        assert_eq!(h.associator.history().len(), 1);
        assert_eq!(
            h.events.recv().await,
            Some(AttachmentEvent::AttachFailed {
                error: LinkError::AuthRejected
            })
        );

        // Too early: refused without touching the driver
        assert!(matches!(
            h.associator.begin_attach().await,
            Err(AttachError::NotEligible { .. })
        ));
        assert_eq!(h.attempts.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(h.associator.begin_attach().await.is_ok());
        assert_eq!(h.associator.retry_state().attempt_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attach_timeout() {
        let (mut associator, mut events) = NetworkAssociator::new(
            HangingLink,
            credentials(),
            &ChannelConfig::default(),
            policy(),
        );

        let result = associator.begin_attach().await;
        assert_eq!(result, Err(AttachError::Link(LinkError::Timeout)));
        assert_eq!(associator.state(), AttachmentState::Detached);
        assert!(matches!(
            events.recv().await,
            Some(AttachmentEvent::AttachFailed {
                error: LinkError::Timeout
            })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_loss_detaches() {
        let mut h = harness(vec![]);
        h.associator.begin_attach().await.unwrap();
        h.losses.send(LossReason::LeaseExpired).unwrap();

        assert_eq!(
            h.associator.wait_for_loss().await,
            Some(LossReason::LeaseExpired)
        );
        assert_eq!(h.associator.state(), AttachmentState::Detached);
        assert_eq!(h.associator.history().total_network(), 1);

        // Not attached any more
        assert_eq!(h.associator.wait_for_loss().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_reattaches_in_order() {
        let h = harness(vec![Err(LinkError::NotFound)]);
        let Harness {
            associator,
            mut events,
            losses,
            attempts,
            disconnected,
        } = h;

        let cancel = CancellationToken::new();
        let task = tokio::spawn(associator.run(cancel.clone()));

        assert!(matches!(
            events.recv().await,
            Some(AttachmentEvent::AttachFailed { .. })
        ));
        assert!(matches!(
            events.recv().await,
            Some(AttachmentEvent::Attached { .. })
        ));

        losses.send(LossReason::RadioDown).unwrap();
        assert_eq!(
            events.recv().await,
            Some(AttachmentEvent::Lost {
                reason: LossReason::RadioDown
            })
        );
        assert!(matches!(
            events.recv().await,
            Some(AttachmentEvent::Attached { .. })
        ));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);

        cancel.cancel();
        task.await.unwrap();
        assert!(disconnected.load(Ordering::SeqCst));
    }

    // ==================== Stable Window Tests ====================

    #[tokio::test(start_paused = true)]
    async fn test_stable_association_clears_history() {
        let mut h = harness(vec![Err(LinkError::NotFound)]);
        h.associator.begin_attach().await.unwrap_err();
        tokio::time::advance(Duration::from_secs(1)).await;
        h.associator.begin_attach().await.unwrap();
        assert_eq!(h.associator.history().len(), 1);

        // Not yet stable
        tokio::time::advance(Duration::from_secs(29)).await;
        h.associator.on_tick(Instant::now());
        assert_eq!(h.associator.history().len(), 1);

        tokio::time::advance(Duration::from_secs(1)).await;
        h.associator.on_tick(Instant::now());
        assert!(h.associator.history().is_empty());
        assert_eq!(h.associator.history().total_network(), 1);
        assert_eq!(h.associator.stable_at(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_loss_before_stable_keeps_history() {
        let mut h = harness(vec![]);
        h.associator.begin_attach().await.unwrap();
        h.losses.send(LossReason::RadioDown).unwrap();
        h.associator.wait_for_loss().await;
        assert_eq!(h.associator.stable_at(), None);

        tokio::time::advance(Duration::from_secs(60)).await;
        h.associator.on_tick(Instant::now());
        assert_eq!(h.associator.history().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stays_attached_past_stable_window() {
        let Harness {
            associator,
            mut events,
            losses,
            attempts,
            ..
        } = harness(vec![]);

        let cancel = CancellationToken::new();
        let task = tokio::spawn(associator.run(cancel.clone()));
        assert!(matches!(
            events.recv().await,
            Some(AttachmentEvent::Attached { .. })
        ));

        tokio::time::sleep(Duration::from_secs(45)).await;
        assert!(events.try_recv().is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);

        losses.send(LossReason::RadioDown).unwrap();
        assert_eq!(
            events.recv().await,
            Some(AttachmentEvent::Lost {
                reason: LossReason::RadioDown
            })
        );
        assert!(matches!(
            events.recv().await,
            Some(AttachmentEvent::Attached { .. })
        ));

        cancel.cancel();
        task.await.unwrap();
    }
}
