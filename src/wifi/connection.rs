//! WiFi connection management.
//!
//! This module wraps the ESP-IDF WiFi driver for associating with access
//! points. All calls block; run them off the async executor.

use crate::config::NetworkIdentity;
use crate::network::LinkError;
use esp_idf_hal::modem::Modem;
use esp_idf_svc::eventloop::EspSystemEventLoop;
use esp_idf_svc::wifi::{AuthMethod, BlockingWifi, ClientConfiguration, Configuration, EspWifi};
use esp_idf_sys::EspError;
use log::info;
use std::net::Ipv4Addr;

/// WiFi connection manager.
pub struct WifiManager<'a> {
    wifi: BlockingWifi<EspWifi<'a>>,
}

impl<'a> WifiManager<'a> {
    /// Create a new WiFi manager.
    pub fn new(modem: Modem, sysloop: EspSystemEventLoop) -> Result<Self, EspError> {
        let esp_wifi = EspWifi::new(modem, sysloop.clone(), None)?;
        let wifi = BlockingWifi::wrap(esp_wifi, sysloop)?;

        Ok(Self { wifi })
    }

    /// Associate with a network and wait for an address.
    ///
    /// Returns the station IP address on success.
    pub fn connect(&mut self, network: &NetworkIdentity) -> Result<Ipv4Addr, WifiError> {
        let auth_method = if network.is_open() {
            AuthMethod::None
        } else {
            AuthMethod::WPA2Personal
        };

        let wifi_config = Configuration::Client(ClientConfiguration {
            ssid: network
                .name()
                .try_into()
                .map_err(|_| WifiError::InvalidName)?,
            password: network
                .secret()
                .try_into()
                .map_err(|_| WifiError::InvalidSecret)?,
            auth_method,
            ..Default::default()
        });

        self.wifi.set_configuration(&wifi_config)?;

        if !self.wifi.is_started()? {
            self.wifi.start()?;
        }

        // Relies on ESP-IDF's internal association timeout
        self.wifi.connect().map_err(WifiError::ConnectionFailed)?;
        self.wifi.wait_netif_up().map_err(WifiError::DhcpFailed)?;

        let ip_info = self.wifi.wifi().sta_netif().get_ip_info()?;
        info!("Connected to WiFi, IP: {}", ip_info.ip);
        Ok(ip_info.ip)
    }

    /// Disconnect from the current network and stop the radio.
    pub fn disconnect(&mut self) -> Result<(), EspError> {
        info!("Disconnecting from WiFi");
        if self.wifi.is_connected()? {
            self.wifi.disconnect()?;
        }
        self.wifi.stop()?;
        Ok(())
    }

    /// Check if currently associated.
    pub fn is_connected(&self) -> bool {
        self.wifi.is_connected().unwrap_or(false)
    }
}

/// Errors that can occur during WiFi operations.
#[derive(Debug)]
pub enum WifiError {
    /// Network name does not fit the driver's SSID buffer.
    InvalidName,
    /// Secret does not fit the driver's password buffer.
    InvalidSecret,
    /// Failed to associate with the network.
    ConnectionFailed(EspError),
    /// Failed to obtain IP address via DHCP.
    DhcpFailed(EspError),
    /// ESP-IDF error.
    EspError(EspError),
}

impl From<EspError> for WifiError {
    fn from(e: EspError) -> Self {
        Self::EspError(e)
    }
}

impl From<WifiError> for LinkError {
    fn from(e: WifiError) -> Self {
        match e {
            WifiError::DhcpFailed(e) => LinkError::Dhcp(format!("{:?}", e)),
            WifiError::ConnectionFailed(e)
                if e.code() == esp_idf_sys::ESP_ERR_TIMEOUT as esp_idf_sys::esp_err_t =>
            {
                LinkError::Timeout
            }
            other => LinkError::Driver(other.to_string()),
        }
    }
}

impl std::fmt::Display for WifiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidName => write!(f, "invalid network name"),
            Self::InvalidSecret => write!(f, "invalid network secret"),
            Self::ConnectionFailed(e) => write!(f, "connection failed: {:?}", e),
            Self::DhcpFailed(e) => write!(f, "DHCP failed: {:?}", e),
            Self::EspError(e) => write!(f, "ESP error: {:?}", e),
        }
    }
}

impl std::error::Error for WifiError {}
