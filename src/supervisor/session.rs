//! Task that owns one live session.
//!
//! The task multiplexes outbound frames, inbound frames, keepalive pings and
//! the keepalive deadline over a single [`SessionIo`]. It reports data and
//! closure to the supervisor tagged with its generation; the supervisor drops
//! anything from a superseded generation.

use crate::network::ChannelStats;
use crate::tls::{Frame, SessionIo};
use log::{debug, info, warn};
use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, timeout, Instant, MissedTickBehavior, Sleep};

/// Upper bound on the close handshake during graceful teardown.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// How to end a session the supervisor no longer wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StopMode {
    /// Send a close frame first (shutdown).
    Graceful,
    /// Drop the transport immediately (network gone).
    Abort,
}

/// One frame queued for sending, with its flush acknowledgement.
pub(crate) struct Outbound {
    pub bytes: Vec<u8>,
    pub done: oneshot::Sender<io::Result<()>>,
}

/// Why a live session ended on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer closed the session.
    RemoteClosed,
    /// Read or write failed.
    Transport(String),
    /// Nothing was received within the keepalive timeout.
    KeepaliveTimeout,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RemoteClosed => write!(f, "remote closed"),
            Self::Transport(msg) => write!(f, "transport error: {}", msg),
            Self::KeepaliveTimeout => write!(f, "keepalive timeout"),
        }
    }
}

/// Session notifications to the supervisor.
#[derive(Debug)]
pub(crate) enum SessionEvent {
    Data { generation: u64, bytes: Vec<u8> },
    Closed { generation: u64, reason: CloseReason },
}

/// Keepalive timing for a session task.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Keepalive {
    pub interval: Duration,
    pub timeout: Duration,
}

/// Handle to a running session task.
pub(crate) struct SessionTask {
    generation: u64,
    stop: oneshot::Sender<StopMode>,
    handle: JoinHandle<()>,
}

impl SessionTask {
    /// Spawn the task that owns `io`.
    pub fn spawn<Io: SessionIo>(
        io: Io,
        generation: u64,
        outbound: mpsc::Receiver<Outbound>,
        events: mpsc::UnboundedSender<SessionEvent>,
        keepalive: Keepalive,
        stats: Option<Arc<ChannelStats>>,
    ) -> Self {
        let (stop, stop_rx) = oneshot::channel();
        let handle = tokio::spawn(run_session(
            io, generation, outbound, stop_rx, events, keepalive, stats,
        ));
        Self {
            generation,
            stop,
            handle,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Stop the task and wait until it has released the session.
    ///
    /// An abort cancels the task outright, so a write stuck on a dead
    /// transport cannot hold the teardown.
    pub async fn stop(self, mode: StopMode) {
        // Fails only if the task already ended on its own
        let _ = self.stop.send(mode);
        if mode == StopMode::Abort {
            self.handle.abort();
        }
        if let Err(e) = self.handle.await {
            if !e.is_cancelled() {
                warn!("Session {} task failed: {}", self.generation, e);
            }
        }
    }
}

/// What cut an in-flight write short.
enum Interrupted {
    Stop(StopMode),
    Deadline,
}

/// Drive `op` while still honouring a stop request and the keepalive deadline.
async fn guarded<T>(
    op: impl Future<Output = T>,
    stop: &mut oneshot::Receiver<StopMode>,
    deadline: Pin<&mut Sleep>,
) -> Result<T, Interrupted> {
    tokio::select! {
        out = op => Ok(out),
        mode = stop => Err(Interrupted::Stop(mode.unwrap_or(StopMode::Abort))),
        _ = deadline => Err(Interrupted::Deadline),
    }
}

async fn finish<Io: SessionIo>(io: &mut Io, generation: u64, mode: StopMode) {
    if mode == StopMode::Graceful && timeout(CLOSE_TIMEOUT, io.close()).await.is_err() {
        debug!("Session {} close handshake timed out", generation);
    }
    debug!("Session {} stopped", generation);
}

async fn run_session<Io: SessionIo>(
    mut io: Io,
    generation: u64,
    mut outbound: mpsc::Receiver<Outbound>,
    mut stop: oneshot::Receiver<StopMode>,
    events: mpsc::UnboundedSender<SessionEvent>,
    keepalive: Keepalive,
    stats: Option<Arc<ChannelStats>>,
) {
    let mut ping = interval_at(Instant::now() + keepalive.interval, keepalive.interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let deadline = sleep(keepalive.timeout);
    tokio::pin!(deadline);

    debug!("Session {} task started", generation);

    let reason = loop {
        tokio::select! {
            mode = &mut stop => {
                finish(&mut io, generation, mode.unwrap_or(StopMode::Abort)).await;
                return;
            }

            frame = io.recv() => match frame {
                Ok(Some(frame)) => {
                    deadline.as_mut().reset(Instant::now() + keepalive.timeout);
                    if let Frame::Data(bytes) = frame {
                        if events.send(SessionEvent::Data { generation, bytes }).is_err() {
                            return;
                        }
                    }
                }
                Ok(None) => break CloseReason::RemoteClosed,
                Err(e) => break CloseReason::Transport(e.to_string()),
            },

            Some(frame) = outbound.recv() => {
                let len = frame.bytes.len();
                let result = match guarded(io.send(frame.bytes), &mut stop, deadline.as_mut()).await {
                    Ok(result) => result,
                    Err(Interrupted::Stop(mode)) => {
                        let _ = frame.done.send(Err(io::Error::new(
                            io::ErrorKind::ConnectionAborted,
                            "session stopped",
                        )));
                        finish(&mut io, generation, mode).await;
                        return;
                    }
                    Err(Interrupted::Deadline) => {
                        let _ = frame.done.send(Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            "send stalled past keepalive timeout",
                        )));
                        break CloseReason::KeepaliveTimeout;
                    }
                };
                let failure = result.as_ref().err().map(|e| e.to_string());
                if failure.is_none() {
                    if let Some(stats) = &stats {
                        stats.traffic.record_tx(len);
                    }
                }
                // The sender may have given up waiting
                let _ = frame.done.send(result);
                if let Some(e) = failure {
                    break CloseReason::Transport(e);
                }
            }

            _ = ping.tick() => {
                match guarded(io.ping(), &mut stop, deadline.as_mut()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => break CloseReason::Transport(e.to_string()),
                    Err(Interrupted::Stop(mode)) => {
                        finish(&mut io, generation, mode).await;
                        return;
                    }
                    Err(Interrupted::Deadline) => break CloseReason::KeepaliveTimeout,
                }
            }

            _ = &mut deadline => break CloseReason::KeepaliveTimeout,
        }
    };

    info!("Session {} ended: {}", generation, reason);
    let _ = events.send(SessionEvent::Closed { generation, reason });
}
