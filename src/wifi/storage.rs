//! NVS persistence for provisioned credentials.
//!
//! Stores the serialized [`Credentials`] blob in ESP32's Non-Volatile
//! Storage so it persists across reboots.
//!
//! # Security
//!
//! The blob holds the network secret in the clear. For production devices,
//! enable NVS encryption.

use crate::config::{
    Credentials, MAX_HOST_LEN, MAX_NETWORK_NAME_LEN, MAX_PATH_LEN, MAX_SECRET_LEN,
    MAX_TRUST_ANCHOR_LEN,
};
use esp_idf_svc::nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault};
use esp_idf_sys::EspError;
use log::{debug, error, info, warn};
use std::sync::OnceLock;
use zeroize::Zeroizing;

/// NVS namespace for channel configuration.
const NVS_NAMESPACE: &str = "secure_chan";

/// NVS key for stored credentials.
const NVS_KEY: &str = "credentials";

/// Largest serialized credentials blob.
///
/// Length prefixes: name, secret, host and path take one byte each; port and
/// anchor take two.
const MAX_CREDENTIALS_BLOB: usize = 1
    + MAX_NETWORK_NAME_LEN
    + 1
    + MAX_SECRET_LEN
    + 1
    + MAX_HOST_LEN
    + 2
    + 1
    + MAX_PATH_LEN
    + 2
    + MAX_TRUST_ANCHOR_LEN;

static NVS_PARTITION: OnceLock<EspDefaultNvsPartition> = OnceLock::new();

/// Shared default NVS partition.
///
/// `EspNvsPartition::take()` may only succeed once per boot; every caller
/// gets a clone of the first handle.
pub fn nvs_partition() -> Result<EspDefaultNvsPartition, EspError> {
    if let Some(partition) = NVS_PARTITION.get() {
        return Ok(partition.clone());
    }
    let partition = EspDefaultNvsPartition::take()?;
    Ok(NVS_PARTITION.get_or_init(|| partition).clone())
}

/// Open the credentials namespace.
pub fn init_nvs() -> Result<EspNvs<NvsDefault>, EspError> {
    EspNvs::new(nvs_partition()?, NVS_NAMESPACE, true)
}

/// Load credentials from NVS.
///
/// Returns `None` if nothing is stored or the stored blob does not validate.
pub fn load_credentials(nvs: &EspNvs<NvsDefault>) -> Option<Credentials> {
    // Too large for the main task stack
    let mut buf = Zeroizing::new(vec![0u8; MAX_CREDENTIALS_BLOB]);

    let bytes = match nvs.get_raw(NVS_KEY, &mut buf) {
        Ok(Some(bytes)) => bytes,
        Ok(None) => {
            debug!("No credentials found in NVS");
            return None;
        }
        Err(e) => {
            warn!("Failed to read credentials from NVS: {:?}", e);
            return None;
        }
    };

    match Credentials::from_bytes(bytes) {
        Ok(credentials) => Some(credentials),
        Err(e) => {
            error!("Stored credentials are invalid: {}", e);
            None
        }
    }
}

/// Save credentials to NVS with read-back verification.
pub fn save_credentials(
    nvs: &mut EspNvs<NvsDefault>,
    credentials: &Credentials,
) -> Result<(), EspError> {
    let bytes = credentials.to_bytes();
    nvs.set_raw(NVS_KEY, &bytes)?;

    // Catch silent flash write failures
    let mut verify_buf = Zeroizing::new(vec![0u8; MAX_CREDENTIALS_BLOB]);
    let read_bytes = nvs.get_raw(NVS_KEY, &mut verify_buf)?.ok_or_else(|| {
        error!("Credentials not found after save - possible flash failure");
        EspError::from_infallible::<{ esp_idf_sys::ESP_ERR_NVS_NOT_FOUND }>()
    })?;

    if read_bytes != bytes.as_slice() {
        error!("Credentials verification failed - data mismatch after save");
        return Err(EspError::from_infallible::<{ esp_idf_sys::ESP_ERR_INVALID_CRC }>());
    }

    info!("Credentials saved and verified in NVS");
    Ok(())
}

/// Clear stored credentials from NVS.
pub fn clear_credentials(nvs: &mut EspNvs<NvsDefault>) -> Result<(), EspError> {
    nvs.remove(NVS_KEY)?;
    warn!("Credentials cleared from NVS");
    Ok(())
}
