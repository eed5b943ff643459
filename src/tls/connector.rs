//! TCP transport underneath the TLS session.
//!
//! Works on both host (via standard sockets) and ESP32 (via ESP-IDF sockets
//! exposed through tokio's mio backend).
//!
//! # Platform Notes
//!
//! - **ESP32**: Requires WiFi to be attached first; the channel supervisor
//!   only connects while attached

use log::{debug, info, warn};
use std::future::Future;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{lookup_host, TcpStream};

/// Opens the byte stream TLS runs over.
///
/// Implemented by [`TcpConnector`] for real sockets; tests substitute
/// in-memory or counting connectors.
pub trait Connector: Send + Sync + 'static {
    /// Stream type produced.
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Open a stream to `host:port`.
    fn open(&self, host: &str, port: u16) -> impl Future<Output = io::Result<Self::Stream>> + Send;
}

/// Plain TCP connector.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    type Stream = TcpStream;

    async fn open(&self, host: &str, port: u16) -> io::Result<TcpStream> {
        let addrs = lookup_host((host, port)).await.map_err(|e| {
            warn!("DNS resolution failed for {}: {}", host, e);
            e
        })?;

        let mut last_error = None;
        for addr in addrs {
            debug!("Resolved {} to {}", host, addr);
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    // Disable Nagle's algorithm for lower latency
                    if let Err(e) = stream.set_nodelay(true) {
                        warn!("Failed to disable Nagle's algorithm: {}", e);
                    }
                    info!("TCP connected to {} at {}", host, addr);
                    return Ok(stream);
                }
                Err(e) => {
                    warn!("TCP connection failed to {}: {}", addr, e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no addresses found for {}", host),
            )
        }))
    }
}
