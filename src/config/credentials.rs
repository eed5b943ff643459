//! Credential store: network identity plus endpoint identity.
//!
//! [`Credentials`] is loaded once at startup, validated, and then shared
//! read-only (behind an `Arc`) with every component that needs it. Anything
//! unusable (empty host, port 0, empty network name) fails here, before any
//! component starts.
//!
//! # Storage format
//!
//! For NVS the credentials are serialized as length-prefixed fields:
//!
//! ```text
//! [name_len:1][name][secret_len:1][secret][host_len:1][host][port:2 BE]
//! [path_len:1][path][anchor_len:2 BE][anchor DER]
//! ```

use super::network::NetworkIdentity;
use super::trust_anchor::{TrustAnchor, MAX_TRUST_ANCHOR_LEN};
use std::fmt;
use zeroize::Zeroizing;

/// Maximum host name length (RFC 1035).
pub const MAX_HOST_LEN: usize = 253;

/// Maximum request path length.
pub const MAX_PATH_LEN: usize = 255;

/// Default endpoint port (WebSocket over TLS).
pub const DEFAULT_PORT: u16 = 443;

/// Default request path for the WebSocket upgrade.
pub const DEFAULT_PATH: &str = "/";

/// Remote endpoint identity: where to connect and whom to trust.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    host: String,
    port: u16,
    path: String,
    trust_anchor: TrustAnchor,
}

impl Endpoint {
    /// Create an endpoint with the default path.
    pub fn new(
        host: impl Into<String>,
        port: u16,
        trust_anchor: TrustAnchor,
    ) -> Result<Self, ConfigError> {
        let endpoint = Self {
            host: host.into(),
            port,
            path: DEFAULT_PATH.to_string(),
            trust_anchor,
        };
        endpoint.validate()?;
        Ok(endpoint)
    }

    /// Replace the request path.
    pub fn with_path(mut self, path: impl Into<String>) -> Result<Self, ConfigError> {
        self.path = path.into();
        self.validate()?;
        Ok(self)
    }

    /// Validate the endpoint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.is_empty() {
            return Err(ConfigError::HostEmpty);
        }
        if self.host.len() > MAX_HOST_LEN {
            return Err(ConfigError::HostTooLong {
                len: self.host.len(),
                max: MAX_HOST_LEN,
            });
        }
        if self.host.chars().any(|c| c.is_whitespace() || c == '/') {
            return Err(ConfigError::HostInvalid(self.host.clone()));
        }
        if self.port == 0 {
            return Err(ConfigError::PortZero);
        }
        if !self.path.starts_with('/')
            || self.path.len() > MAX_PATH_LEN
            || self.path.chars().any(char::is_whitespace)
        {
            return Err(ConfigError::PathInvalid(self.path.clone()));
        }
        Ok(())
    }

    /// Host name (also used for SNI and certificate name checks).
    pub fn host(&self) -> &str {
        &self.host
    }

    /// TCP port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// WebSocket request path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Trust anchor for the endpoint's certificate chain.
    pub fn trust_anchor(&self) -> &TrustAnchor {
        &self.trust_anchor
    }

    /// Get the address string for connection (host:port).
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// WebSocket URL of the endpoint.
    pub fn url(&self) -> String {
        format!("wss://{}:{}{}", self.host, self.port, self.path)
    }
}

/// Immutable configuration loaded once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    network: NetworkIdentity,
    endpoint: Endpoint,
}

impl Credentials {
    /// Combine already-validated network and endpoint identities.
    pub fn new(network: NetworkIdentity, endpoint: Endpoint) -> Self {
        Self { network, endpoint }
    }

    /// Build credentials from raw values, validating all of them.
    pub fn from_parts(
        network_name: &str,
        network_secret: &str,
        host: &str,
        port: u16,
        trust_anchor: &[u8],
    ) -> Result<Self, ConfigError> {
        let network = NetworkIdentity::new(network_name, network_secret)?;
        let endpoint = Endpoint::new(host, port, TrustAnchor::parse(trust_anchor)?)?;
        Ok(Self::new(network, endpoint))
    }

    /// Credentials baked in at build time.
    ///
    /// Reads `SECURE_CHANNEL_NETWORK_NAME`, `SECURE_CHANNEL_NETWORK_SECRET`,
    /// `SECURE_CHANNEL_HOST`, `SECURE_CHANNEL_PORT` and
    /// `SECURE_CHANNEL_CA_PEM` from the build environment. Returns `None`
    /// when no network name was provided.
    pub fn from_build_env() -> Option<Result<Self, ConfigError>> {
        let name = option_env!("SECURE_CHANNEL_NETWORK_NAME")?;
        let secret = option_env!("SECURE_CHANNEL_NETWORK_SECRET").unwrap_or("");
        let host = option_env!("SECURE_CHANNEL_HOST").unwrap_or("");
        let anchor = option_env!("SECURE_CHANNEL_CA_PEM").unwrap_or("");

        let port = match option_env!("SECURE_CHANNEL_PORT") {
            None => DEFAULT_PORT,
            Some(raw) => match raw.parse() {
                Ok(port) => port,
                Err(_) => {
                    return Some(Err(ConfigError::InvalidFormat(format!(
                        "invalid port: {}",
                        raw
                    ))))
                }
            },
        };

        Some(Self::from_parts(name, secret, host, port, anchor.as_bytes()))
    }

    /// Wireless network identity.
    pub fn network(&self) -> &NetworkIdentity {
        &self.network
    }

    /// Remote endpoint identity.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Serialize to bytes for NVS storage.
    ///
    /// The buffer holds the network secret and is wiped on drop.
    pub fn to_bytes(&self) -> Zeroizing<Vec<u8>> {
        let network = &self.network;
        let endpoint = &self.endpoint;
        let anchor = endpoint.trust_anchor.der();

        let mut bytes = Zeroizing::new(Vec::with_capacity(
            8 + network.name().len()
                + network.secret().len()
                + endpoint.host.len()
                + endpoint.path.len()
                + anchor.len(),
        ));
        bytes.push(network.name().len() as u8);
        bytes.extend_from_slice(network.name().as_bytes());
        bytes.push(network.secret().len() as u8);
        bytes.extend_from_slice(network.secret().as_bytes());
        bytes.push(endpoint.host.len() as u8);
        bytes.extend_from_slice(endpoint.host.as_bytes());
        bytes.extend_from_slice(&endpoint.port.to_be_bytes());
        bytes.push(endpoint.path.len() as u8);
        bytes.extend_from_slice(endpoint.path.as_bytes());
        bytes.extend_from_slice(&(anchor.len() as u16).to_be_bytes());
        bytes.extend_from_slice(anchor);
        bytes
    }

    /// Deserialize from bytes, re-validating every field.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ConfigError> {
        let mut reader = FieldReader::new(bytes);

        let name = reader.string_u8("network name")?;
        let secret = Zeroizing::new(reader.string_u8("network secret")?);
        let host = reader.string_u8("host")?;
        let port = u16::from_be_bytes(reader.take_array("port")?);
        let path = reader.string_u8("path")?;
        let anchor_len = u16::from_be_bytes(reader.take_array("anchor length")?) as usize;
        if anchor_len > MAX_TRUST_ANCHOR_LEN {
            return Err(ConfigError::InvalidFormat(format!(
                "anchor length {} exceeds {}",
                anchor_len, MAX_TRUST_ANCHOR_LEN
            )));
        }
        let anchor = reader.take(anchor_len, "trust anchor")?;
        if !reader.is_empty() {
            return Err(ConfigError::InvalidFormat("trailing bytes".into()));
        }

        let network = NetworkIdentity::new(name, secret.as_str())?;
        let endpoint =
            Endpoint::new(host, port, TrustAnchor::from_der(anchor.to_vec())?)?.with_path(path)?;
        Ok(Self::new(network, endpoint))
    }
}

/// Cursor over the length-prefixed storage format.
struct FieldReader<'a> {
    bytes: &'a [u8],
}

impl<'a> FieldReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    fn take(&mut self, len: usize, field: &str) -> Result<&'a [u8], ConfigError> {
        if self.bytes.len() < len {
            return Err(ConfigError::InvalidFormat(format!("truncated {}", field)));
        }
        let (head, tail) = self.bytes.split_at(len);
        self.bytes = tail;
        Ok(head)
    }

    fn take_array<const N: usize>(&mut self, field: &str) -> Result<[u8; N], ConfigError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N, field)?);
        Ok(out)
    }

    fn string_u8(&mut self, field: &str) -> Result<String, ConfigError> {
        let [len] = self.take_array::<1>(field)?;
        let raw = self.take(len as usize, field)?;
        String::from_utf8(raw.to_vec())
            .map_err(|_| ConfigError::InvalidFormat(format!("invalid {} UTF-8", field)))
    }
}

/// Errors that can occur while loading configuration.
///
/// All of these are fatal at startup: the process must not run with an
/// unusable identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Network name is empty.
    NetworkNameEmpty,
    /// Network name exceeds maximum length.
    NetworkNameTooLong { len: usize, max: usize },
    /// Secret is too short for WPA2.
    SecretTooShort { len: usize, min: usize },
    /// Secret exceeds maximum length.
    SecretTooLong { len: usize, max: usize },
    /// Endpoint host is empty.
    HostEmpty,
    /// Endpoint host exceeds maximum length.
    HostTooLong { len: usize, max: usize },
    /// Endpoint host contains characters that cannot appear in a host name.
    HostInvalid(String),
    /// Endpoint port is 0.
    PortZero,
    /// Request path is not an absolute path.
    PathInvalid(String),
    /// Non-empty trust anchor is not a well-formed certificate.
    TrustAnchorMalformed(String),
    /// Timing or backoff tuning is out of range.
    InvalidTuning(&'static str),
    /// Invalid data format during deserialization.
    InvalidFormat(String),
    /// Configuration source could not be read.
    Io(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NetworkNameEmpty => write!(f, "network name cannot be empty"),
            Self::NetworkNameTooLong { len, max } => {
                write!(f, "network name too long: {} bytes (max {})", len, max)
            }
            Self::SecretTooShort { len, min } => {
                write!(f, "network secret too short: {} bytes (min {})", len, min)
            }
            Self::SecretTooLong { len, max } => {
                write!(f, "network secret too long: {} bytes (max {})", len, max)
            }
            Self::HostEmpty => write!(f, "endpoint host cannot be empty"),
            Self::HostTooLong { len, max } => {
                write!(f, "endpoint host too long: {} bytes (max {})", len, max)
            }
            Self::HostInvalid(host) => write!(f, "invalid endpoint host: {:?}", host),
            Self::PortZero => write!(f, "endpoint port cannot be 0"),
            Self::PathInvalid(path) => write!(f, "invalid endpoint path: {:?}", path),
            Self::TrustAnchorMalformed(msg) => write!(f, "malformed trust anchor: {}", msg),
            Self::InvalidTuning(msg) => write!(f, "invalid channel tuning: {}", msg),
            Self::InvalidFormat(msg) => write!(f, "invalid format: {}", msg),
            Self::Io(msg) => write!(f, "cannot read configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}
