//! Host link driver.
//!
//! On host systems, the OS handles networking. This driver is a thin wrapper
//! that reports the system as attached and detects the local address.

use super::{LinkDriver, LinkError, LossReason};
use crate::config::NetworkIdentity;
use log::info;
use std::net::IpAddr;

/// Host link driver.
///
/// Association always succeeds; the OS owns the actual interface. A broken
/// route surfaces later as a connect failure at the socket level.
pub struct HostLink {
    ip_addr: Option<IpAddr>,
}

impl HostLink {
    /// Create a new host link driver.
    pub fn new() -> Self {
        Self { ip_addr: None }
    }

    /// Local address found by the last association.
    pub fn ip_addr(&self) -> Option<IpAddr> {
        self.ip_addr
    }

    /// Get the primary local IP address.
    ///
    /// "Connects" a UDP socket to a public IP (nothing is sent), then reads
    /// back which local address the OS chose for that route.
    fn detect_local_ip() -> Option<IpAddr> {
        use std::net::UdpSocket;

        let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
        socket.connect("8.8.8.8:80").ok()?;
        let local_addr = socket.local_addr().ok()?;
        Some(local_addr.ip())
    }
}

impl Default for HostLink {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkDriver for HostLink {
    async fn associate(&mut self, network: &NetworkIdentity) -> Result<Option<IpAddr>, LinkError> {
        self.ip_addr = Self::detect_local_ip();

        match self.ip_addr {
            Some(ip) => info!("Host network ready ({}), local IP: {}", network.name(), ip),
            None => info!("Host network ready ({}), no default route", network.name()),
        }

        Ok(self.ip_addr)
    }

    async fn wait_for_loss(&mut self) -> LossReason {
        // The OS never tells us; the session layer notices dead routes
        std::future::pending().await
    }

    async fn disconnect(&mut self) {
        self.ip_addr = None;
    }
}
