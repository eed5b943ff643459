//! Credentials file for host (development) builds.
//!
//! Reads JSON from the path in `SECURE_CHANNEL_CONFIG`, falling back to
//! `~/.secure-channel-esp32/credentials.json`.
//!
//! ```json
//! {
//!   "network_name": "Workshop",
//!   "network_secret": "correct-horse",
//!   "host": "ws.example.com",
//!   "port": 443,
//!   "path": "/device",
//!   "trust_anchor_path": "ca.pem"
//! }
//! ```
//!
//! `trust_anchor` may hold the PEM text inline instead of
//! `trust_anchor_path`. Relative anchor paths resolve against the directory
//! of the credentials file.

use super::credentials::{Credentials, Endpoint, DEFAULT_PORT};
use super::network::NetworkIdentity;
use super::trust_anchor::TrustAnchor;
use super::ConfigError;
use log::{debug, info};
use serde::Deserialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use zeroize::Zeroize;

/// Environment variable naming the credentials file.
pub const CONFIG_ENV_VAR: &str = "SECURE_CHANNEL_CONFIG";

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct CredentialsFile {
    network_name: String,
    #[serde(default)]
    network_secret: String,
    host: String,
    #[serde(default = "default_port")]
    port: u16,
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    trust_anchor: Option<String>,
    #[serde(default)]
    trust_anchor_path: Option<PathBuf>,
}

impl Drop for CredentialsFile {
    fn drop(&mut self) {
        self.network_secret.zeroize();
    }
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

/// Get the default credentials file path.
///
/// Returns `~/.secure-channel-esp32/credentials.json`
pub fn default_credentials_path() -> io::Result<PathBuf> {
    let home = std::env::var("HOME")
        .map_err(|_| io::Error::new(io::ErrorKind::NotFound, "HOME not set"))?;
    Ok(PathBuf::from(home)
        .join(".secure-channel-esp32")
        .join("credentials.json"))
}

/// Load credentials from `SECURE_CHANNEL_CONFIG` or the default path.
pub fn load_credentials() -> Result<Credentials, ConfigError> {
    let path = match std::env::var_os(CONFIG_ENV_VAR) {
        Some(path) => PathBuf::from(path),
        None => default_credentials_path().map_err(|e| ConfigError::Io(e.to_string()))?,
    };
    load_credentials_from(&path)
}

/// Load credentials from a specific file.
pub fn load_credentials_from(path: &Path) -> Result<Credentials, ConfigError> {
    let text = fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("{}: {}", path.display(), e)))?;
    let credentials = parse_credentials_json(&text, path.parent())?;
    info!("Loaded credentials from {}", path.display());
    Ok(credentials)
}

/// Parse credentials JSON. `base_dir` anchors relative `trust_anchor_path`s.
pub fn parse_credentials_json(
    text: &str,
    base_dir: Option<&Path>,
) -> Result<Credentials, ConfigError> {
    let raw: CredentialsFile =
        serde_json::from_str(text).map_err(|e| ConfigError::InvalidFormat(e.to_string()))?;

    let anchor = match (&raw.trust_anchor, &raw.trust_anchor_path) {
        (Some(_), Some(_)) => {
            return Err(ConfigError::InvalidFormat(
                "set either trust_anchor or trust_anchor_path, not both".into(),
            ));
        }
        (Some(pem), None) => TrustAnchor::parse(pem.as_bytes())?,
        (None, Some(path)) => {
            let path = match base_dir {
                Some(dir) if path.is_relative() => dir.join(path),
                _ => path.clone(),
            };
            debug!("Reading trust anchor from {}", path.display());
            let bytes = fs::read(&path)
                .map_err(|e| ConfigError::Io(format!("{}: {}", path.display(), e)))?;
            TrustAnchor::parse(&bytes)?
        }
        (None, None) => TrustAnchor::empty(),
    };

    let network = NetworkIdentity::new(raw.network_name.as_str(), raw.network_secret.as_str())?;
    let mut endpoint = Endpoint::new(raw.host.as_str(), raw.port, anchor)?;
    if let Some(path) = &raw.path {
        endpoint = endpoint.with_path(path.as_str())?;
    }
    Ok(Credentials::new(network, endpoint))
}
