//! ESP32 WiFi link driver.
//!
//! Wraps the blocking [`WifiManager`] for the async associator. Driver calls
//! run on the blocking pool; loss is detected by polling the station state.

use super::{LinkDriver, LinkError, LossReason};
use crate::config::NetworkIdentity;
use crate::wifi::{WifiError, WifiManager};
use esp_idf_hal::modem::Modem;
use esp_idf_svc::eventloop::EspSystemEventLoop;
use log::warn;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// How often the station state is checked while attached.
const LOSS_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// WiFi-based link driver for ESP32.
pub struct WifiLink {
    wifi: Arc<Mutex<WifiManager<'static>>>,
}

impl WifiLink {
    /// Take the modem and bring up the WiFi driver.
    pub fn new(modem: Modem, sysloop: EspSystemEventLoop) -> Result<Self, WifiError> {
        let wifi = WifiManager::new(modem, sysloop)?;
        Ok(Self {
            wifi: Arc::new(Mutex::new(wifi)),
        })
    }

    fn lock(wifi: &Mutex<WifiManager<'static>>) -> MutexGuard<'_, WifiManager<'static>> {
        wifi.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl LinkDriver for WifiLink {
    async fn associate(&mut self, network: &NetworkIdentity) -> Result<Option<IpAddr>, LinkError> {
        let wifi = self.wifi.clone();
        let network = network.clone();

        let ip = tokio::task::spawn_blocking(move || Self::lock(&wifi).connect(&network))
            .await
            .map_err(|e| LinkError::Driver(e.to_string()))??;

        Ok(Some(IpAddr::V4(ip)))
    }

    async fn wait_for_loss(&mut self) -> LossReason {
        loop {
            tokio::time::sleep(LOSS_POLL_INTERVAL).await;
            if !Self::lock(&self.wifi).is_connected() {
                return LossReason::RadioDown;
            }
        }
    }

    async fn disconnect(&mut self) {
        let wifi = self.wifi.clone();
        match tokio::task::spawn_blocking(move || Self::lock(&wifi).disconnect()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("WiFi disconnect failed: {:?}", e),
            Err(e) => warn!("WiFi disconnect task failed: {}", e),
        }
    }
}
