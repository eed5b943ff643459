//! Trust anchor certificate for the remote endpoint.
//!
//! The anchor is accepted as PEM or DER and always stored as DER. A non-empty
//! anchor must be a well-formed X.509 certificate. PEM armour without a body
//! (the placeholder shipped in unprovisioned builds) counts as empty.

use super::ConfigError;
use log::{debug, warn};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::CertificateDer;
use std::fmt;
use x509_parser::prelude::{FromDer, X509Certificate};

/// Largest accepted anchor (DER bytes). Keeps the NVS blob small.
pub const MAX_TRUST_ANCHOR_LEN: usize = 8 * 1024;

const PEM_BEGIN: &str = "-----BEGIN";

/// Certificate against which the endpoint's chain is validated.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct TrustAnchor {
    der: Vec<u8>,
}

impl TrustAnchor {
    /// An empty anchor. Loads, but the establisher refuses to connect with it.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Parse PEM or DER bytes, detecting the encoding.
    pub fn parse(bytes: &[u8]) -> Result<Self, ConfigError> {
        let trimmed = bytes.trim_ascii();
        if trimmed.is_empty() {
            return Ok(Self::empty());
        }
        if trimmed.starts_with(PEM_BEGIN.as_bytes()) {
            Self::from_pem(trimmed)
        } else {
            // DER may legitimately begin or end with whitespace-valued bytes
            Self::from_der(bytes.to_vec())
        }
    }

    /// Parse a PEM certificate. Only the first certificate of a bundle is used.
    pub fn from_pem(pem: &[u8]) -> Result<Self, ConfigError> {
        if is_placeholder(pem) {
            debug!("Trust anchor PEM has no body, treating as empty");
            return Ok(Self::empty());
        }

        let mut certs = CertificateDer::pem_slice_iter(pem);
        let first = match certs.next() {
            Some(Ok(cert)) => cert,
            Some(Err(e)) => {
                return Err(ConfigError::TrustAnchorMalformed(format!("bad PEM: {}", e)));
            }
            None => {
                return Err(ConfigError::TrustAnchorMalformed(
                    "no CERTIFICATE block found".into(),
                ));
            }
        };
        if certs.next().is_some() {
            warn!("Trust anchor PEM holds several certificates, using the first");
        }

        Self::from_der(first.as_ref().to_vec())
    }

    /// Wrap DER bytes after checking they form exactly one well-formed certificate.
    pub fn from_der(der: Vec<u8>) -> Result<Self, ConfigError> {
        if der.is_empty() {
            return Ok(Self::empty());
        }
        if der.len() > MAX_TRUST_ANCHOR_LEN {
            return Err(ConfigError::TrustAnchorMalformed(format!(
                "{} bytes exceeds limit of {}",
                der.len(),
                MAX_TRUST_ANCHOR_LEN
            )));
        }
        let (rest, _) = X509Certificate::from_der(&der)
            .map_err(|e| ConfigError::TrustAnchorMalformed(format!("bad X.509: {}", e)))?;
        if !rest.is_empty() {
            return Err(ConfigError::TrustAnchorMalformed(format!(
                "{} trailing bytes after certificate",
                rest.len()
            )));
        }
        Ok(Self { der })
    }

    /// Returns true if no certificate is configured.
    pub fn is_empty(&self) -> bool {
        self.der.is_empty()
    }

    /// Raw DER bytes (empty if unconfigured).
    pub fn der(&self) -> &[u8] {
        &self.der
    }

    /// Certificate in the form rustls consumes.
    pub fn to_certificate_der(&self) -> CertificateDer<'static> {
        CertificateDer::from(self.der.clone())
    }

    /// Subject distinguished name, for logging.
    pub fn subject(&self) -> Option<String> {
        let (_, cert) = X509Certificate::from_der(&self.der).ok()?;
        Some(cert.subject().to_string())
    }
}

impl fmt::Debug for TrustAnchor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.subject() {
            Some(subject) => write!(f, "TrustAnchor({}, {} bytes)", subject, self.der.len()),
            None => write!(f, "TrustAnchor(<empty>)"),
        }
    }
}

/// True if the PEM text is only armour lines and whitespace.
fn is_placeholder(pem: &[u8]) -> bool {
    String::from_utf8_lossy(pem)
        .lines()
        .map(str::trim)
        .all(|line| line.is_empty() || line.starts_with("-----"))
}
