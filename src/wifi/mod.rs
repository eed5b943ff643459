//! WiFi driver and credential storage (ESP32 only).
//!
//! - [`WifiManager`] - blocking ESP-IDF WiFi driver wrapper
//! - [`storage`] - NVS persistence for [`Credentials`](crate::config::Credentials)
//!
//! The async [`WifiLink`](crate::network::WifiLink) driver sits on top of
//! `WifiManager`.

mod connection;
pub mod storage;

pub use connection::{WifiError, WifiManager};
pub use storage::{clear_credentials, init_nvs, load_credentials, save_credentials};
