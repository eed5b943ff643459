//! Channel supervisor: keeps one live session to the endpoint.
//!
//! [`ChannelSupervisor`] consumes attachment events from the network
//! associator, asks the establisher for sessions, and drives the
//! [`SupervisorMachine`] through `Idle / Connecting / Live / Backoff`.
//! Applications talk to it only through a cloneable [`ChannelHandle`] and the
//! inbound receiver returned by [`ChannelSupervisor::new`].
//!
//! # Example
//!
//! ```ignore
//! let (supervisor, channel, mut inbound) =
//!     ChannelSupervisor::new(establisher, attachment_events, &config, policy);
//! tokio::spawn(supervisor.run(cancel.clone()));
//!
//! channel.send(b"hello".to_vec()).await?;
//! while let Some(bytes) = inbound.recv().await {
//!     log::info!("received {} bytes", bytes.len());
//! }
//! ```

use crate::config::ChannelConfig;
use crate::network::{AttachmentEvent, ChannelStats, LossReason};
use crate::reconnect::ReconnectPolicy;
use crate::tls::{ConnectError, Establish};
use log::{debug, info, trace, warn};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

mod machine;
mod session;

pub use machine::{Effect, SupervisorMachine};
pub use session::CloseReason;
use session::{Keepalive, Outbound, SessionEvent, SessionTask, StopMode};

/// Channel lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelState {
    /// Network detached; nothing to do.
    Idle,
    /// A connect attempt is in flight.
    Connecting,
    /// A session is up; sends are accepted.
    Live,
    /// Waiting out the reconnect delay.
    Backoff,
}

impl ChannelState {
    /// Lowercase name for logs and stats.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Live => "live",
            Self::Backoff => "backoff",
        }
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Published channel status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelStatus {
    pub state: ChannelState,
    /// Generation of the live session, or of the last one when not live.
    pub generation: u64,
}

/// Reference to one specific live session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionRef {
    generation: u64,
}

impl SessionRef {
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// The channel is not live, or the frame could not be flushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelNotReady;

impl fmt::Display for ChannelNotReady {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "channel not ready")
    }
}

impl std::error::Error for ChannelNotReady {}

/// Errors from [`ChannelHandle::send_on`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelError {
    /// No live session, or the frame could not be flushed.
    NotReady,
    /// The referenced session has been superseded.
    StaleSession { held: u64, current: u64 },
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotReady => write!(f, "channel not ready"),
            Self::StaleSession { held, current } => {
                write!(f, "session {} superseded by {}", held, current)
            }
        }
    }
}

impl std::error::Error for ChannelError {}

impl From<ChannelNotReady> for ChannelError {
    fn from(_: ChannelNotReady) -> Self {
        Self::NotReady
    }
}

/// Outbound path into the live session task.
struct LiveLink {
    generation: u64,
    tx: mpsc::Sender<Outbound>,
}

/// State shared between the supervisor and its handles.
struct Shared {
    status: watch::Sender<ChannelStatus>,
    live: Mutex<Option<LiveLink>>,
}

impl Shared {
    fn live(&self) -> MutexGuard<'_, Option<LiveLink>> {
        self.live.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Application-facing handle to the channel.
#[derive(Clone)]
pub struct ChannelHandle {
    shared: Arc<Shared>,
}

impl ChannelHandle {
    /// Current lifecycle state.
    pub fn current_state(&self) -> ChannelState {
        self.shared.status.borrow().state
    }

    /// The live session, if any.
    pub fn current_session(&self) -> Option<SessionRef> {
        let status = *self.shared.status.borrow();
        (status.state == ChannelState::Live).then_some(SessionRef {
            generation: status.generation,
        })
    }

    /// Subscribe to status changes.
    pub fn watch_state(&self) -> watch::Receiver<ChannelStatus> {
        self.shared.status.subscribe()
    }

    /// Send one frame on whichever session is live, waiting until it is flushed.
    ///
    /// Fails immediately when not live. Never touches retry state.
    pub async fn send(&self, bytes: Vec<u8>) -> Result<(), ChannelNotReady> {
        let tx = self.live_sender(None).map_err(|_| ChannelNotReady)?;
        Self::deliver(tx, bytes).await.map_err(|_| ChannelNotReady)
    }

    /// Send one frame only if `session` is still the live session.
    pub async fn send_on(&self, session: SessionRef, bytes: Vec<u8>) -> Result<(), ChannelError> {
        let tx = self.live_sender(Some(session.generation))?;
        Self::deliver(tx, bytes).await
    }

    fn live_sender(&self, expected: Option<u64>) -> Result<mpsc::Sender<Outbound>, ChannelError> {
        let live = self.shared.live();
        let link = live.as_ref().ok_or(ChannelError::NotReady)?;
        match expected {
            Some(held) if held != link.generation => Err(ChannelError::StaleSession {
                held,
                current: link.generation,
            }),
            _ => Ok(link.tx.clone()),
        }
    }

    async fn deliver(tx: mpsc::Sender<Outbound>, bytes: Vec<u8>) -> Result<(), ChannelError> {
        let (done, flushed) = oneshot::channel();
        tx.send(Outbound { bytes, done })
            .await
            .map_err(|_| ChannelError::NotReady)?;
        match flushed.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                debug!("Send failed: {}", e);
                Err(ChannelError::NotReady)
            }
            Err(_) => Err(ChannelError::NotReady),
        }
    }
}

/// Owns the session and reacts to attachment, connect and session events.
pub struct ChannelSupervisor<E: Establish> {
    establisher: Arc<E>,
    machine: SupervisorMachine,
    attachment: mpsc::UnboundedReceiver<AttachmentEvent>,
    attachment_open: bool,
    shared: Arc<Shared>,
    inbound: mpsc::Sender<Vec<u8>>,
    session_tx: mpsc::UnboundedSender<SessionEvent>,
    session_rx: mpsc::UnboundedReceiver<SessionEvent>,
    connecting: Option<JoinHandle<Result<E::Io, ConnectError>>>,
    session: Option<SessionTask>,
    keepalive: Keepalive,
    outbound_queue: usize,
    stats: Option<Arc<ChannelStats>>,
}

impl<E: Establish> ChannelSupervisor<E> {
    /// Create a supervisor in `Idle`.
    ///
    /// Returns the supervisor, a handle for sending and observing state, and
    /// the receiver of inbound frames from the live session.
    pub fn new(
        establisher: E,
        attachment: mpsc::UnboundedReceiver<AttachmentEvent>,
        config: &ChannelConfig,
        policy: ReconnectPolicy,
    ) -> (Self, ChannelHandle, mpsc::Receiver<Vec<u8>>) {
        let (status, _) = watch::channel(ChannelStatus {
            state: ChannelState::Idle,
            generation: 0,
        });
        let shared = Arc::new(Shared {
            status,
            live: Mutex::new(None),
        });
        let (inbound, inbound_rx) = mpsc::channel(config.inbound_queue.max(1));
        let (session_tx, session_rx) = mpsc::unbounded_channel();

        let supervisor = Self {
            establisher: Arc::new(establisher),
            machine: SupervisorMachine::new(policy, config.stable_window, config.history_capacity),
            attachment,
            attachment_open: true,
            shared: shared.clone(),
            inbound,
            session_tx,
            session_rx,
            connecting: None,
            session: None,
            keepalive: Keepalive {
                interval: config.keepalive_interval,
                timeout: config.keepalive_timeout,
            },
            outbound_queue: config.outbound_queue.max(1),
            stats: None,
        };
        (supervisor, ChannelHandle { shared }, inbound_rx)
    }

    /// Publish state and counters to shared stats.
    pub fn with_stats(mut self, stats: Arc<ChannelStats>) -> Self {
        self.stats = Some(stats);
        self.publish();
        self
    }

    /// Process events until cancelled, then close the session gracefully.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!("Channel supervisor started");

        loop {
            let wake = self.machine.next_wake();
            tokio::select! {
                _ = cancel.cancelled() => break,

                event = self.attachment.recv(), if self.attachment_open => match event {
                    Some(event) => self.on_attachment(event).await,
                    None => {
                        warn!("Attachment events ended; treating network as lost");
                        self.attachment_open = false;
                        let reason = LossReason::Other("associator stopped".into());
                        let effect = self.machine.on_detached(Instant::now(), &reason);
                        self.apply(effect).await;
                    }
                },

                outcome = connect_outcome(&mut self.connecting) => {
                    self.on_connect_outcome(outcome).await;
                }

                Some(event) = self.session_rx.recv() => self.on_session_event(event).await,

                _ = sleep_until_opt(wake) => {
                    let effect = self.machine.on_tick(Instant::now());
                    self.apply(effect).await;
                }
            }
            self.publish();
        }

        let effect = self.machine.on_shutdown();
        self.apply_with(effect, StopMode::Graceful).await;
        self.publish();
        info!("Channel supervisor stopped");
    }

    async fn on_attachment(&mut self, event: AttachmentEvent) {
        let now = Instant::now();
        match event {
            AttachmentEvent::Attached { ip } => {
                debug!("Network attached ({:?})", ip);
                let effect = self.machine.on_attached(now);
                self.apply(effect).await;
            }
            AttachmentEvent::AttachFailed { error } => {
                debug!("Network attach failed: {}", error);
            }
            AttachmentEvent::Lost { reason } => {
                let effect = self.machine.on_detached(now, &reason);
                self.apply(effect).await;
            }
        }
    }

    async fn on_connect_outcome(&mut self, outcome: Result<E::Io, ConnectError>) {
        match outcome {
            Ok(io) => {
                if self.machine.state() != ChannelState::Connecting {
                    debug!("Dropping session that completed after {}", self.machine.state());
                    return;
                }
                let generation = self.machine.on_connected(Instant::now());
                self.start_session(io, generation);
            }
            Err(e) => {
                if let Some(stats) = &self.stats {
                    stats.record_connect_failure();
                }
                let effect = self.machine.on_connect_failed(Instant::now(), &e);
                self.apply(effect).await;
            }
        }
    }

    async fn on_session_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Data { generation, bytes } => {
                if !self.machine.is_current(generation) {
                    trace!("Dropping data from stale session {}", generation);
                    return;
                }
                let len = bytes.len();
                match self.inbound.try_send(bytes) {
                    Ok(()) => {
                        if let Some(stats) = &self.stats {
                            stats.traffic.record_rx(len);
                        }
                    }
                    Err(TrySendError::Full(_)) => {
                        warn!("Inbound queue full, dropping {} byte frame", len);
                        if let Some(stats) = &self.stats {
                            stats.traffic.record_dropped();
                        }
                    }
                    Err(TrySendError::Closed(_)) => {
                        trace!("No inbound consumer, dropping {} byte frame", len);
                    }
                }
            }
            SessionEvent::Closed { generation, reason } => {
                if !self.machine.is_current(generation) {
                    debug!("Ignoring closure of stale session {}", generation);
                    return;
                }
                // The task has already ended; this just reaps it
                self.teardown(StopMode::Abort).await;
                if let Some(stats) = &self.stats {
                    stats.record_session_closed();
                }
                let effect =
                    self.machine
                        .on_session_closed(Instant::now(), generation, &reason.to_string());
                self.apply(effect).await;
            }
        }
    }

    async fn apply(&mut self, effect: Option<Effect>) {
        self.apply_with(effect, StopMode::Abort).await;
    }

    async fn apply_with(&mut self, effect: Option<Effect>, stop: StopMode) {
        match effect {
            None => {}
            Some(Effect::StartConnect) => self.start_connect(),
            Some(Effect::AbortConnect) => {
                if let Some(handle) = self.connecting.take() {
                    debug!("Aborting in-flight connect");
                    handle.abort();
                    // Resolves once the attempt's socket and TLS state are dropped
                    let _ = handle.await;
                }
            }
            Some(Effect::Teardown { generation }) => {
                debug!("Tearing down session {}", generation);
                self.teardown(stop).await;
            }
        }
    }

    fn start_connect(&mut self) {
        if let Some(stale) = self.connecting.take() {
            stale.abort();
        }
        let establisher = self.establisher.clone();
        self.connecting = Some(tokio::spawn(async move { establisher.connect().await }));
    }

    fn start_session(&mut self, io: E::Io, generation: u64) {
        let (tx, outbound) = mpsc::channel(self.outbound_queue);
        let task = SessionTask::spawn(
            io,
            generation,
            outbound,
            self.session_tx.clone(),
            self.keepalive,
            self.stats.clone(),
        );
        self.session = Some(task);
        *self.shared.live() = Some(LiveLink { generation, tx });
        if let Some(stats) = &self.stats {
            stats.record_session_established();
        }
        info!("Channel live (session {})", generation);
    }

    /// Stop the session task and wait until its resources are released.
    async fn teardown(&mut self, mode: StopMode) {
        self.shared.live().take();
        if let Some(task) = self.session.take() {
            let generation = task.generation();
            task.stop(mode).await;
            debug!("Session {} released", generation);
        }
    }

    fn publish(&self) {
        let status = ChannelStatus {
            state: self.machine.state(),
            generation: self.machine.generation(),
        };
        self.shared.status.send_if_modified(|current| {
            let changed = *current != status;
            *current = status;
            changed
        });
        if let Some(stats) = &self.stats {
            stats.set_channel(
                status.state,
                status.generation,
                self.machine.retry_state().attempt_count(),
            );
        }
    }
}

/// Resolve with the in-flight connect result; pending while none is running.
async fn connect_outcome<T>(
    connecting: &mut Option<JoinHandle<Result<T, ConnectError>>>,
) -> Result<T, ConnectError> {
    let Some(handle) = connecting.as_mut() else {
        return std::future::pending().await;
    };
    let result = handle.await;
    *connecting = None;
    match result {
        Ok(outcome) => outcome,
        Err(e) => Err(ConnectError::NetworkUnreachable(format!(
            "connect task ended: {}",
            e
        ))),
    }
}

async fn sleep_until_opt(at: Option<Instant>) {
    match at {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> ChannelHandle {
        let (status, _) = watch::channel(ChannelStatus {
            state: ChannelState::Idle,
            generation: 0,
        });
        ChannelHandle {
            shared: Arc::new(Shared {
                status,
                live: Mutex::new(None),
            }),
        }
    }

    #[tokio::test]
    async fn test_send_not_ready_without_session() {
        let handle = handle();
        assert_eq!(handle.current_state(), ChannelState::Idle);
        assert_eq!(handle.current_session(), None);
        assert_eq!(handle.send(b"x".to_vec()).await, Err(ChannelNotReady));
    }

    #[tokio::test]
    async fn test_send_on_stale_generation() {
        let handle = handle();
        let (tx, _rx) = mpsc::channel(1);
        *handle.shared.live() = Some(LiveLink { generation: 2, tx });

        let stale = SessionRef { generation: 1 };
        assert_eq!(
            handle.send_on(stale, b"x".to_vec()).await,
            Err(ChannelError::StaleSession { held: 1, current: 2 })
        );
    }

    #[tokio::test]
    async fn test_send_waits_for_flush() {
        let handle = handle();
        let (tx, mut rx) = mpsc::channel::<Outbound>(1);
        *handle.shared.live() = Some(LiveLink { generation: 1, tx });

        let flusher = tokio::spawn(async move {
            let frame = rx.recv().await.unwrap();
            assert_eq!(frame.bytes, b"abc");
            frame.done.send(Ok(())).unwrap();
        });

        assert_eq!(handle.send(b"abc".to_vec()).await, Ok(()));
        flusher.await.unwrap();
    }

    #[tokio::test]
    async fn test_send_reports_flush_failure() {
        let handle = handle();
        let (tx, mut rx) = mpsc::channel::<Outbound>(1);
        *handle.shared.live() = Some(LiveLink { generation: 1, tx });

        tokio::spawn(async move {
            let frame = rx.recv().await.unwrap();
            let _ = frame
                .done
                .send(Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone")));
        });

        assert_eq!(handle.send(b"abc".to_vec()).await, Err(ChannelNotReady));
    }

    #[test]
    fn test_current_session_follows_status() {
        let handle = handle();
        handle.shared.status.send_replace(ChannelStatus {
            state: ChannelState::Live,
            generation: 4,
        });
        assert_eq!(handle.current_session().map(|s| s.generation()), Some(4));

        handle.shared.status.send_replace(ChannelStatus {
            state: ChannelState::Backoff,
            generation: 4,
        });
        assert_eq!(handle.current_session(), None);
    }
}
