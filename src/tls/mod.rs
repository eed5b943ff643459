//! Certificate-validated secure channel to the endpoint.
//!
//! The stack for one session, bottom to top:
//!
//! | Layer | Provided by |
//! |-------|-------------|
//! | TCP | [`Connector`] ([`TcpConnector`] in production) |
//! | TLS 1.2/1.3 | `tokio-rustls`, trust anchor as the only root |
//! | WebSocket | `tokio-tungstenite`, binary frames |
//!
//! [`SecureChannelEstablisher::connect`] runs all three handshakes as one
//! bounded attempt and yields a [`WsSession`], or a typed [`ConnectError`].
//! It never retries; that is the supervisor's job.

use std::fmt;
use std::sync::{Arc, LazyLock};

mod connector;
mod establisher;
mod session;

pub use connector::{Connector, TcpConnector};
pub use establisher::{Establish, SecureChannelEstablisher};
pub use session::{Frame, SessionIo, WsSession};

/// Process-wide rustls crypto provider (ring backend).
///
/// Passed explicitly to every config builder so nothing depends on a
/// globally installed default.
static CRYPTO_PROVIDER: LazyLock<Arc<rustls::crypto::CryptoProvider>> =
    LazyLock::new(|| Arc::new(rustls::crypto::ring::default_provider()));

/// Why a connect attempt failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    /// The transport connection could not be opened or broke during setup.
    NetworkUnreachable(String),
    /// The attempt did not finish within the handshake timeout.
    HandshakeTimeout,
    /// The server certificate does not chain to the trust anchor or is malformed.
    CertificateInvalid(String),
    /// The server certificate is expired or not yet valid.
    CertificateExpired,
    /// The server certificate is not valid for the configured host.
    HostnameMismatch,
    /// The local configuration cannot produce a secure session (e.g. no trust anchor).
    ConfigurationInvalid(String),
    /// TLS failed for a reason unrelated to the certificate.
    HandshakeFailed(String),
    /// The server answered the WebSocket upgrade with this HTTP status.
    UpgradeRejected(u16),
}

impl ConnectError {
    /// Returns true for failures that concern the endpoint's identity or our
    /// trust configuration.
    pub fn is_security(&self) -> bool {
        matches!(
            self,
            Self::CertificateInvalid(_)
                | Self::CertificateExpired
                | Self::HostnameMismatch
                | Self::ConfigurationInvalid(_)
        )
    }
}

impl fmt::Display for ConnectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NetworkUnreachable(msg) => write!(f, "network unreachable: {}", msg),
            Self::HandshakeTimeout => write!(f, "handshake timed out"),
            Self::CertificateInvalid(msg) => write!(f, "certificate invalid: {}", msg),
            Self::CertificateExpired => write!(f, "certificate expired or not yet valid"),
            Self::HostnameMismatch => write!(f, "certificate does not match host"),
            Self::ConfigurationInvalid(msg) => write!(f, "configuration invalid: {}", msg),
            Self::HandshakeFailed(msg) => write!(f, "TLS handshake failed: {}", msg),
            Self::UpgradeRejected(status) => {
                write!(f, "WebSocket upgrade rejected with HTTP {}", status)
            }
        }
    }
}

impl std::error::Error for ConnectError {}
