//! Secure channel firmware library.
//!
//! Joins a wireless network, establishes a certificate-validated session to
//! one fixed endpoint, and keeps a persistent message channel over it,
//! recovering from radio and network failures on its own.
//!
//! Everything except the WiFi driver and NVS storage is platform-independent
//! and tested on the host machine without ESP32 hardware.
//!
//! # Components
//!
//! - [`config`] - credential store and channel tuning
//! - [`network`] - network associator and link drivers
//! - [`tls`] - secure channel establisher
//! - [`supervisor`] - channel supervisor and application handle
//! - [`reconnect`] - backoff policy and failure history

pub mod config;
pub mod network;
pub mod reconnect;
pub mod supervisor;
pub mod tls;
#[cfg(feature = "esp32")]
pub mod wifi;

// Re-export commonly used items
pub use config::{ChannelConfig, ConfigError, Credentials, Endpoint, NetworkIdentity, TrustAnchor};
pub use network::{
    AttachmentEvent, AttachmentState, ChannelStats, HostLink, LinkDriver, NetworkAssociator,
    StatsServer, DEFAULT_STATS_PORT,
};
pub use reconnect::{FailureHistory, ReconnectPolicy, RetryState};
pub use supervisor::{
    ChannelError, ChannelHandle, ChannelNotReady, ChannelState, ChannelStatus, ChannelSupervisor,
    SessionRef,
};
pub use tls::{ConnectError, Establish, SecureChannelEstablisher};
