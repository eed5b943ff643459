//! Wireless network identity.
//!
//! Platform-independent validation of the network name and secret handed to
//! the association driver.
//!
//! # Example
//!
//! ```
//! use secure_channel_esp32::config::NetworkIdentity;
//!
//! let network = NetworkIdentity::new("MyNetwork", "MyPassword").unwrap();
//! assert!(!network.is_open());
//! assert!(NetworkIdentity::open("CafeGuest").unwrap().is_open());
//! ```

use super::ConfigError;
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Maximum network name length per IEEE 802.11 standard.
pub const MAX_NETWORK_NAME_LEN: usize = 32;

/// Maximum secret length for WPA2.
pub const MAX_SECRET_LEN: usize = 64;

/// Minimum secret length for WPA2.
pub const MIN_SECRET_LEN: usize = 8;

/// Network name and secret used to attach to the wireless network.
///
/// The secret is wiped from memory when the value is dropped and never shows
/// up in `Debug` output.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct NetworkIdentity {
    name: String,
    secret: String,
}

impl NetworkIdentity {
    /// Create a network identity.
    ///
    /// Returns an error if the name or secret are invalid.
    pub fn new(name: impl Into<String>, secret: impl Into<String>) -> Result<Self, ConfigError> {
        let identity = Self {
            name: name.into(),
            secret: secret.into(),
        };
        identity.validate()?;
        Ok(identity)
    }

    /// Create an identity for an open network (no secret).
    pub fn open(name: impl Into<String>) -> Result<Self, ConfigError> {
        Self::new(name, String::new())
    }

    /// Validate the identity.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::NetworkNameEmpty);
        }
        if self.name.len() > MAX_NETWORK_NAME_LEN {
            return Err(ConfigError::NetworkNameTooLong {
                len: self.name.len(),
                max: MAX_NETWORK_NAME_LEN,
            });
        }

        // Empty is OK for open networks
        if !self.secret.is_empty() && self.secret.len() < MIN_SECRET_LEN {
            return Err(ConfigError::SecretTooShort {
                len: self.secret.len(),
                min: MIN_SECRET_LEN,
            });
        }
        if self.secret.len() > MAX_SECRET_LEN {
            return Err(ConfigError::SecretTooLong {
                len: self.secret.len(),
                max: MAX_SECRET_LEN,
            });
        }

        Ok(())
    }

    /// Network name (SSID).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Network secret (WPA2 passphrase, empty for open networks).
    pub fn secret(&self) -> &str {
        &self.secret
    }

    /// Check if this is an open network (no secret).
    pub fn is_open(&self) -> bool {
        self.secret.is_empty()
    }
}

impl fmt::Debug for NetworkIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkIdentity")
            .field("name", &self.name)
            .field("secret", &if self.is_open() { "<none>" } else { "<redacted>" })
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_identity() {
        let network = NetworkIdentity::new("TestNetwork", "password123").unwrap();
        assert_eq!(network.name(), "TestNetwork");
        assert_eq!(network.secret(), "password123");
        assert!(!network.is_open());
    }

    #[test]
    fn test_open_network() {
        let network = NetworkIdentity::open("OpenNetwork").unwrap();
        assert!(network.is_open());
        assert!(network.validate().is_ok());
    }

    #[test]
    fn test_empty_name() {
        let result = NetworkIdentity::new("", "password123");
        assert_eq!(result, Err(ConfigError::NetworkNameEmpty));
    }

    #[test]
    fn test_name_too_long() {
        let result = NetworkIdentity::new("a".repeat(33), "password123");
        assert!(matches!(result, Err(ConfigError::NetworkNameTooLong { .. })));
    }

    #[test]
    fn test_name_max_length() {
        assert!(NetworkIdentity::new("a".repeat(32), "password123").is_ok());
    }

    #[test]
    fn test_secret_too_short() {
        let result = NetworkIdentity::new("TestNetwork", "short");
        assert!(matches!(result, Err(ConfigError::SecretTooShort { .. })));
    }

    #[test]
    fn test_secret_bounds() {
        assert!(NetworkIdentity::new("TestNetwork", "12345678").is_ok());
        assert!(NetworkIdentity::new("TestNetwork", "a".repeat(64)).is_ok());
        let result = NetworkIdentity::new("TestNetwork", "a".repeat(65));
        assert!(matches!(result, Err(ConfigError::SecretTooLong { .. })));
    }

    #[test]
    fn test_debug_redacts_secret() {
        let network = NetworkIdentity::new("TestNetwork", "hunter2hunter2").unwrap();
        let debug = format!("{:?}", network);
        assert!(debug.contains("TestNetwork"));
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("<redacted>"));
    }
}
