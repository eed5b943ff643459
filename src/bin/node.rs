//! Secure channel node binary.
//!
//! Runs on both ESP32 and host platforms:
//! - **Host**: `cargo run --bin node`
//! - **ESP32**: `cargo espflash flash --bin node --features esp32 --release`
//!
//! ## Credentials
//!
//! - **Host**: JSON file from `$SECURE_CHANNEL_CONFIG` or
//!   `~/.secure-channel-esp32/credentials.json`, else build-time values
//! - **ESP32**: NVS, else build-time values (saved to NVS on first boot)
//!
//! On host, each line typed on stdin is sent over the channel and every
//! inbound frame is printed.
//!
//! ## Endpoints
//!
//! - Stats: http://localhost:8080/stats

use log::{error, info, warn};
use secure_channel_esp32::{
    ChannelConfig, ChannelStats, ChannelSupervisor, ConfigError, Credentials, NetworkAssociator,
    ReconnectPolicy, SecureChannelEstablisher, StatsServer, DEFAULT_STATS_PORT,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

// ESP32: Initialize ESP-IDF before anything else
#[cfg(feature = "esp32")]
fn platform_init() {
    esp_idf_sys::link_patches();
    esp_idf_svc::log::EspLogger::initialize_default();
    info!("ESP-IDF initialized");
}

// Host: Just initialize env_logger
#[cfg(not(feature = "esp32"))]
fn platform_init() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
}

#[cfg(not(feature = "esp32"))]
fn load_credentials() -> Result<Credentials, ConfigError> {
    match secure_channel_esp32::config::load_credentials() {
        Ok(credentials) => Ok(credentials),
        Err(ConfigError::Io(msg)) => {
            info!("No credentials file ({}), trying build-time values", msg);
            Credentials::from_build_env().unwrap_or(Err(ConfigError::Io(msg)))
        }
        Err(e) => Err(e),
    }
}

#[cfg(feature = "esp32")]
fn load_credentials() -> Result<Credentials, ConfigError> {
    use secure_channel_esp32::wifi;

    let mut nvs = wifi::init_nvs().map_err(|e| ConfigError::Io(format!("NVS: {:?}", e)))?;
    if let Some(credentials) = wifi::load_credentials(&nvs) {
        info!("Loaded credentials from NVS");
        return Ok(credentials);
    }

    let credentials = Credentials::from_build_env()
        .unwrap_or_else(|| Err(ConfigError::Io("no credentials provisioned".into())))?;
    if let Err(e) = wifi::save_credentials(&mut nvs, &credentials) {
        warn!("Failed to persist build-time credentials: {:?}", e);
    }
    Ok(credentials)
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    platform_init();

    info!("=== Secure channel node starting ===");

    #[cfg(feature = "esp32")]
    info!("Platform: ESP32");
    #[cfg(not(feature = "esp32"))]
    info!("Platform: Host");

    let config = ChannelConfig::default();
    let credentials = match load_credentials().and_then(|c| config.validate().map(|()| c)) {
        Ok(credentials) => Arc::new(credentials),
        Err(e) => {
            error!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };
    info!(
        "Network: {}, endpoint: {}",
        credentials.network().name(),
        credentials.endpoint().url()
    );
    if credentials.endpoint().trust_anchor().is_empty() {
        warn!("No trust anchor configured; the channel will never connect");
    }

    #[cfg(feature = "esp32")]
    let device_id = "esp32".to_string();
    #[cfg(not(feature = "esp32"))]
    let device_id = "host-node".to_string();

    // Start stats server
    let stats = Arc::new(ChannelStats::new(device_id));
    let _stats_server = match StatsServer::start(None, DEFAULT_STATS_PORT, stats.clone()) {
        Ok(server) => Some(server),
        Err(e) => {
            warn!("Failed to start stats server: {}", e);
            None
        }
    };

    #[cfg(feature = "esp32")]
    let link = {
        use esp_idf_hal::peripherals::Peripherals;
        use esp_idf_svc::eventloop::EspSystemEventLoop;

        let init = Peripherals::take().and_then(|p| {
            let sysloop = EspSystemEventLoop::take()?;
            Ok((p, sysloop))
        });
        let (peripherals, sysloop) = match init {
            Ok(init) => init,
            Err(e) => {
                error!("Failed to take peripherals: {:?}", e);
                std::process::exit(1);
            }
        };
        match secure_channel_esp32::network::WifiLink::new(peripherals.modem, sysloop) {
            Ok(link) => link,
            Err(e) => {
                error!("WiFi initialization failed: {}", e);
                std::process::exit(1);
            }
        }
    };
    #[cfg(not(feature = "esp32"))]
    let link = secure_channel_esp32::HostLink::new();

    let seed = ReconnectPolicy::random_seed();
    let policy = ReconnectPolicy::from_config(&config, seed);
    info!(
        "Backoff: base {:?}, ceiling {:?}, jitter {}‰",
        policy.base(),
        policy.ceiling(),
        policy.jitter_permille()
    );

    let (associator, attachment_events) =
        NetworkAssociator::new(link, credentials.clone(), &config, policy);
    let associator = associator.with_stats(stats.clone());

    let establisher = SecureChannelEstablisher::new(credentials.clone(), &config);
    let (supervisor, channel, mut inbound) =
        ChannelSupervisor::new(establisher, attachment_events, &config, policy);
    let supervisor = supervisor.with_stats(stats.clone());

    let cancel = CancellationToken::new();
    let associator_task = tokio::spawn(associator.run(cancel.clone()));
    let supervisor_task = tokio::spawn(supervisor.run(cancel.clone()));

    // Host: forward stdin lines to the channel
    #[cfg(not(feature = "esp32"))]
    let mut lines = {
        let (tx, rx) = tokio::sync::mpsc::channel::<String>(8);
        std::thread::spawn(move || {
            use std::io::BufRead;
            for line in std::io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                if tx.blocking_send(line).is_err() {
                    break;
                }
            }
        });
        rx
    };

    #[cfg(not(feature = "esp32"))]
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down...");
                break;
            }
            Some(bytes) = inbound.recv() => {
                println!("< {}", String::from_utf8_lossy(&bytes));
            }
            Some(line) = lines.recv() => {
                if let Err(e) = channel.send(line.into_bytes()).await {
                    println!("! {} ({})", e, channel.current_state());
                }
            }
        }
    }

    #[cfg(feature = "esp32")]
    {
        let _ = &channel;
        while let Some(bytes) = inbound.recv().await {
            info!("Received {} bytes", bytes.len());
        }
    }

    cancel.cancel();
    if let Err(e) = supervisor_task.await {
        error!("Supervisor task error: {}", e);
    }
    if let Err(e) = associator_task.await {
        error!("Associator task error: {}", e);
    }

    info!("Shutdown complete");
}
