//! Network attachment layer.
//!
//! This module provides a platform-independent association interface that works on:
//! - **ESP32** (`esp32` feature): WiFi association via ESP-IDF
//! - **Host**: Native OS networking (always attached)
//!
//! [`NetworkAssociator`] owns the [`AttachmentState`] and drives a
//! [`LinkDriver`]; it reports every transition on an ordered, single-consumer
//! channel of [`AttachmentEvent`]s that the channel supervisor consumes.
//!
//! # Example
//!
//! ```ignore
//! use secure_channel_esp32::network::{HostLink, NetworkAssociator};
//!
//! let (associator, attachment_events) =
//!     NetworkAssociator::new(HostLink::new(), credentials, &config, policy);
//! tokio::spawn(associator.run(cancel.clone()));
//! ```

use crate::config::NetworkIdentity;
use std::fmt;
use std::future::Future;
use std::net::IpAddr;

mod associator;
mod host;
mod stats_server;
#[cfg(feature = "esp32")]
mod wifi;

pub use associator::{AttachError, NetworkAssociator};
pub use host::HostLink;
pub use stats_server::{ChannelStats, StatsServer, TrafficStats, DEFAULT_STATS_PORT};
#[cfg(feature = "esp32")]
pub use wifi::WifiLink;

/// Link-layer attachment state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttachmentState {
    /// Not associated.
    Detached,
    /// Association in progress.
    Attaching,
    /// Associated and addressed.
    Attached,
}

impl AttachmentState {
    /// Lowercase name for logs and stats.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Detached => "detached",
            Self::Attaching => "attaching",
            Self::Attached => "attached",
        }
    }
}

impl fmt::Display for AttachmentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Attachment notifications, delivered in emission order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachmentEvent {
    /// Association succeeded.
    Attached { ip: Option<IpAddr> },
    /// An association attempt failed; still detached.
    AttachFailed { error: LinkError },
    /// An established association was lost.
    Lost { reason: LossReason },
}

/// Why an association attempt failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    /// The access point rejected the credentials.
    AuthRejected,
    /// No network with the configured name was found.
    NotFound,
    /// Association did not complete in time.
    Timeout,
    /// Address assignment (DHCP) failed.
    Dhcp(String),
    /// Driver-level failure.
    Driver(String),
}

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AuthRejected => write!(f, "authentication rejected"),
            Self::NotFound => write!(f, "network not found"),
            Self::Timeout => write!(f, "association timed out"),
            Self::Dhcp(msg) => write!(f, "DHCP failed: {}", msg),
            Self::Driver(msg) => write!(f, "driver error: {}", msg),
        }
    }
}

impl std::error::Error for LinkError {}

/// Why an established association went away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LossReason {
    /// Radio link dropped.
    RadioDown,
    /// The access point deauthenticated us.
    AuthRejected,
    /// Address lease expired.
    LeaseExpired,
    /// Anything else the driver reports.
    Other(String),
}

impl fmt::Display for LossReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RadioDown => write!(f, "radio down"),
            Self::AuthRejected => write!(f, "authentication rejected"),
            Self::LeaseExpired => write!(f, "lease expired"),
            Self::Other(msg) => write!(f, "{}", msg),
        }
    }
}

/// Wireless association primitive.
///
/// This trait abstracts over platform-specific association, allowing the
/// same associator to run on ESP32 (WiFi) and host (native).
pub trait LinkDriver: Send + 'static {
    /// Associate with the network and obtain an address.
    ///
    /// Returns the local IP address if the driver knows it.
    fn associate(
        &mut self,
        network: &NetworkIdentity,
    ) -> impl Future<Output = Result<Option<IpAddr>, LinkError>> + Send;

    /// Resolve when an established association is lost.
    ///
    /// Only polled while attached. Must be cancel-safe.
    fn wait_for_loss(&mut self) -> impl Future<Output = LossReason> + Send;

    /// Tear the association down.
    fn disconnect(&mut self) -> impl Future<Output = ()> + Send;
}
