//! HTTP stats server for channel monitoring.
//!
//! Provides a simple `/stats` endpoint that returns channel statistics as JSON.
//! Uses `tiny_http` which works on both host and ESP32 (via std::net).
//!
//! # Example Response
//!
//! ```json
//! {
//!   "uptime_secs": 3600,
//!   "device_id": "esp32-a1b2c3",
//!   "attachment": "attached",
//!   "channel": { "state": "live", "generation": 3, "attempt_count": 0 },
//!   "failures": {
//!     "attach_failed": 1,
//!     "attachment_lost": 0,
//!     "connect_failed": 4,
//!     "session_closed": 2
//!   },
//!   "sessions_established": 3,
//!   "traffic": {
//!     "frames_tx": 150, "frames_rx": 230,
//!     "bytes_tx": 9000, "bytes_rx": 12000,
//!     "inbound_dropped": 0
//!   }
//! }
//! ```

use super::AttachmentState;
use crate::supervisor::ChannelState;
use log::{error, info, warn};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;
use tiny_http::{Method, Response, Server};

/// Default port for the stats server.
pub const DEFAULT_STATS_PORT: u16 = 8080;

/// Payload counters for the secure channel.
#[derive(Debug, Default)]
pub struct TrafficStats {
    /// Frames sent.
    pub frames_tx: AtomicUsize,
    /// Frames delivered to the application.
    pub frames_rx: AtomicUsize,
    /// Payload bytes sent.
    pub bytes_tx: AtomicU64,
    /// Payload bytes delivered.
    pub bytes_rx: AtomicU64,
    /// Inbound frames dropped because the application fell behind.
    pub inbound_dropped: AtomicUsize,
}

impl TrafficStats {
    /// Create new traffic stats.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a transmitted frame.
    pub fn record_tx(&self, len: usize) {
        self.frames_tx.fetch_add(1, Ordering::Relaxed);
        self.bytes_tx.fetch_add(len as u64, Ordering::Relaxed);
    }

    /// Record a delivered frame.
    pub fn record_rx(&self, len: usize) {
        self.frames_rx.fetch_add(1, Ordering::Relaxed);
        self.bytes_rx.fetch_add(len as u64, Ordering::Relaxed);
    }

    /// Record a dropped inbound frame.
    pub fn record_dropped(&self) {
        self.inbound_dropped.fetch_add(1, Ordering::Relaxed);
    }

    fn to_json(&self) -> String {
        format!(
            r#"{{"frames_tx":{},"frames_rx":{},"bytes_tx":{},"bytes_rx":{},"inbound_dropped":{}}}"#,
            self.frames_tx.load(Ordering::Relaxed),
            self.frames_rx.load(Ordering::Relaxed),
            self.bytes_tx.load(Ordering::Relaxed),
            self.bytes_rx.load(Ordering::Relaxed),
            self.inbound_dropped.load(Ordering::Relaxed)
        )
    }
}

/// Channel statistics container.
///
/// Shared between the associator, the supervisor and the stats server.
/// All fields use atomic types for thread-safe access without locking.
#[derive(Debug)]
pub struct ChannelStats {
    start_time: Instant,
    /// Device identifier shown in the report.
    pub device_id: String,
    attachment: AtomicU8,
    channel_state: AtomicU8,
    generation: AtomicU64,
    attempt_count: AtomicU32,
    /// Failed association attempts.
    pub attach_failed: AtomicUsize,
    /// Lost associations.
    pub attachment_lost: AtomicUsize,
    /// Failed connect attempts.
    pub connect_failed: AtomicUsize,
    /// Live sessions that closed.
    pub session_closed: AtomicUsize,
    /// Sessions that reached `Live`.
    pub sessions_established: AtomicUsize,
    /// Payload counters.
    pub traffic: TrafficStats,
}

impl ChannelStats {
    /// Create new channel statistics.
    pub fn new(device_id: String) -> Self {
        Self {
            start_time: Instant::now(),
            device_id,
            attachment: AtomicU8::new(attachment_code(AttachmentState::Detached)),
            channel_state: AtomicU8::new(channel_code(ChannelState::Idle)),
            generation: AtomicU64::new(0),
            attempt_count: AtomicU32::new(0),
            attach_failed: AtomicUsize::new(0),
            attachment_lost: AtomicUsize::new(0),
            connect_failed: AtomicUsize::new(0),
            session_closed: AtomicUsize::new(0),
            sessions_established: AtomicUsize::new(0),
            traffic: TrafficStats::new(),
        }
    }

    /// Get uptime in seconds.
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Publish the attachment state.
    pub fn set_attachment(&self, state: AttachmentState) {
        self.attachment.store(attachment_code(state), Ordering::Relaxed);
    }

    /// Last published attachment state.
    pub fn attachment(&self) -> AttachmentState {
        match self.attachment.load(Ordering::Relaxed) {
            1 => AttachmentState::Attaching,
            2 => AttachmentState::Attached,
            _ => AttachmentState::Detached,
        }
    }

    /// Publish the channel state with its generation and attempt count.
    pub fn set_channel(&self, state: ChannelState, generation: u64, attempt_count: u32) {
        self.channel_state.store(channel_code(state), Ordering::Relaxed);
        self.generation.store(generation, Ordering::Relaxed);
        self.attempt_count.store(attempt_count, Ordering::Relaxed);
    }

    /// Last published channel state.
    pub fn channel_state(&self) -> ChannelState {
        match self.channel_state.load(Ordering::Relaxed) {
            1 => ChannelState::Connecting,
            2 => ChannelState::Live,
            3 => ChannelState::Backoff,
            _ => ChannelState::Idle,
        }
    }

    /// Record a failed association attempt.
    pub fn record_attach_failure(&self) {
        self.attach_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a lost association.
    pub fn record_attachment_lost(&self) {
        self.attachment_lost.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed connect attempt.
    pub fn record_connect_failure(&self) {
        self.connect_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a live session closing.
    pub fn record_session_closed(&self) {
        self.session_closed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a session reaching `Live`.
    pub fn record_session_established(&self) {
        self.sessions_established.fetch_add(1, Ordering::Relaxed);
    }

    /// Serialize all statistics to JSON.
    pub fn to_json(&self) -> String {
        format!(
            r#"{{"uptime_secs":{},"device_id":"{}","attachment":"{}","channel":{{"state":"{}","generation":{},"attempt_count":{}}},"failures":{{"attach_failed":{},"attachment_lost":{},"connect_failed":{},"session_closed":{}}},"sessions_established":{},"traffic":{}}}"#,
            self.uptime_secs(),
            self.device_id,
            self.attachment(),
            self.channel_state(),
            self.generation.load(Ordering::Relaxed),
            self.attempt_count.load(Ordering::Relaxed),
            self.attach_failed.load(Ordering::Relaxed),
            self.attachment_lost.load(Ordering::Relaxed),
            self.connect_failed.load(Ordering::Relaxed),
            self.session_closed.load(Ordering::Relaxed),
            self.sessions_established.load(Ordering::Relaxed),
            self.traffic.to_json()
        )
    }
}

impl Default for ChannelStats {
    fn default() -> Self {
        Self::new("unknown".to_string())
    }
}

fn attachment_code(state: AttachmentState) -> u8 {
    match state {
        AttachmentState::Detached => 0,
        AttachmentState::Attaching => 1,
        AttachmentState::Attached => 2,
    }
}

fn channel_code(state: ChannelState) -> u8 {
    match state {
        ChannelState::Idle => 0,
        ChannelState::Connecting => 1,
        ChannelState::Live => 2,
        ChannelState::Backoff => 3,
    }
}

/// HTTP stats server.
///
/// Runs in a background thread and serves channel statistics as JSON.
pub struct StatsServer {
    handle: Option<thread::JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl StatsServer {
    /// Start the stats server.
    ///
    /// # Arguments
    ///
    /// * `bind_addr` - IP address to bind to (use `None` for 0.0.0.0)
    /// * `port` - Port to listen on
    /// * `stats` - Shared statistics to serve
    ///
    /// # Returns
    ///
    /// A handle to the running server. Drop it to stop the server.
    pub fn start(
        bind_addr: Option<IpAddr>,
        port: u16,
        stats: Arc<ChannelStats>,
    ) -> Result<Self, std::io::Error> {
        let addr = match bind_addr {
            Some(ip) => format!("{}:{}", ip, port),
            None => format!("0.0.0.0:{}", port),
        };

        let server = Server::http(&addr)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::AddrInUse, format!("{}", e)))?;

        info!("Stats server listening on http://{}/stats", addr);

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_clone = shutdown.clone();

        let handle = thread::Builder::new()
            .name("stats-server".into())
            .spawn(move || Self::run_server(server, stats, shutdown_clone))?;

        Ok(Self {
            handle: Some(handle),
            shutdown,
        })
    }

    fn run_server(server: Server, stats: Arc<ChannelStats>, shutdown: Arc<AtomicBool>) {
        let content_type = Self::header("Content-Type", "application/json");
        let location = Self::header("Location", "/stats");
        let allow_get = Self::header("Allow", "GET");

        loop {
            if shutdown.load(Ordering::Acquire) {
                info!("Stats server shutting down");
                break;
            }

            match server.recv_timeout(std::time::Duration::from_millis(100)) {
                Ok(Some(request)) => {
                    if request.method() != &Method::Get {
                        let mut response =
                            Response::from_string("Method Not Allowed").with_status_code(405);
                        if let Some(h) = &allow_get {
                            response = response.with_header(h.clone());
                        }
                        let _ = request.respond(response);
                        continue;
                    }

                    let path = request.url();

                    if path == "/stats" || path == "/stats/" {
                        let mut response =
                            Response::from_string(stats.to_json()).with_status_code(200);
                        if let Some(h) = &content_type {
                            response = response.with_header(h.clone());
                        }
                        if let Err(e) = request.respond(response) {
                            warn!("Failed to send response: {}", e);
                        }
                    } else if path == "/" {
                        let mut response = Response::from_string("See /stats for channel statistics")
                            .with_status_code(302);
                        if let Some(h) = &location {
                            response = response.with_header(h.clone());
                        }
                        if let Err(e) = request.respond(response) {
                            warn!("Failed to send redirect: {}", e);
                        }
                    } else {
                        let response = Response::from_string("Not Found").with_status_code(404);
                        if let Err(e) = request.respond(response) {
                            warn!("Failed to send 404: {}", e);
                        }
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    error!("Server error: {}", e);
                    break;
                }
            }
        }
    }

    fn header(name: &str, value: &str) -> Option<tiny_http::Header> {
        tiny_http::Header::from_bytes(name.as_bytes(), value.as_bytes()).ok()
    }

    /// Stop the server.
    ///
    /// Note: May take up to 100ms due to polling interval.
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for StatsServer {
    fn drop(&mut self) {
        self.stop();
    }
}
