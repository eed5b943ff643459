//! Configuration: the credential store and channel tuning.
//!
//! # Components
//!
//! - [`network`] - network name/secret validation (host-testable)
//! - [`trust_anchor`] - PEM/DER trust anchor parsing (host-testable)
//! - [`credentials`] - immutable credential store and its NVS format
//! - [`tuning`] - timeouts, keepalive and backoff parameters
//! - [`file`] - JSON credentials file (host only)
//!
//! Credentials are validated once at load and then passed to components as
//! `Arc<Credentials>`. There is no process-wide configuration singleton.

mod credentials;
#[cfg(not(target_os = "espidf"))]
mod file;
mod network;
mod trust_anchor;
mod tuning;

pub use credentials::{
    ConfigError, Credentials, Endpoint, DEFAULT_PATH, DEFAULT_PORT, MAX_HOST_LEN, MAX_PATH_LEN,
};
#[cfg(not(target_os = "espidf"))]
pub use file::{
    default_credentials_path, load_credentials, load_credentials_from, parse_credentials_json,
    CONFIG_ENV_VAR,
};
pub use network::{NetworkIdentity, MAX_NETWORK_NAME_LEN, MAX_SECRET_LEN, MIN_SECRET_LEN};
pub use trust_anchor::{TrustAnchor, MAX_TRUST_ANCHOR_LEN};
pub use tuning::{ChannelConfig, MAX_HANDSHAKE_TIMEOUT, MAX_JITTER_PERMILLE, MIN_HANDSHAKE_TIMEOUT};
