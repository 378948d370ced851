/// Bluetooth Low Energy discovery of RuuviTag advertisements
use async_trait::async_trait;
use bluer::{AdapterEvent, Address, DiscoveryFilter, DiscoveryTransport};
use futures_util::StreamExt;
use log::{debug, warn};
use thiserror::Error;
use tokio::time::{sleep, Duration};

use crate::models::Captured;

// Ruuvi Innovations Ltd. manufacturer ID
pub const RUUVITAG_MANUFACTURER_ID: u16 = 0x0499;

/// One manufacturer data broadcast heard during a scan window
#[derive(Debug, Clone)]
pub struct Advertisement {
    pub device_id: String,
    pub payload: Vec<u8>,
    pub rssi: Option<i16>,
    pub received: Captured,
}

#[derive(Debug, Error)]
pub enum ScanStartError {
    #[error("failed to create Bluetooth session: {0}")]
    Session(#[source] bluer::Error),

    #[error("failed to get default Bluetooth adapter: {0}")]
    Adapter(#[source] bluer::Error),

    #[error("failed to power on adapter: {0}")]
    PowerOn(#[source] bluer::Error),

    #[error("failed to start device discovery: {0}")]
    Discovery(#[source] bluer::Error),

    #[error("radio unavailable: {0}")]
    Unavailable(String),
}

/// Source of raw RuuviTag broadcasts
///
/// An empty result is a valid outcome: nothing was in range during the window.
#[async_trait]
pub trait Radio: Send + Sync {
    /// Listen for `window` and return every RuuviTag broadcast received
    async fn scan(&self, window: Duration) -> Result<Vec<Advertisement>, ScanStartError>;
}

/// BlueZ-backed radio using the default adapter
///
/// A fresh session is opened for every scan so a restarted `bluetoothd`
/// or a re-attached adapter is picked up on the next cycle.
#[derive(Debug, Default)]
pub struct BluerRadio;

impl BluerRadio {
    pub fn new() -> Self {
        BluerRadio
    }

    async fn read_advertisement(
        adapter: &bluer::Adapter,
        addr: Address,
    ) -> Option<Advertisement> {
        let device = adapter.device(addr).ok()?;
        let device_id = device.address().to_string().to_uppercase();

        let payload = match device.manufacturer_data().await {
            Ok(Some(manufacturer_data)) => {
                manufacturer_data.get(&RUUVITAG_MANUFACTURER_ID)?.clone()
            }
            Ok(None) => return None,
            Err(e) => {
                debug!("Failed to get manufacturer data for {}: {}", device_id, e);
                return None;
            }
        };
        let rssi = device.rssi().await.ok().flatten();

        Some(Advertisement {
            device_id,
            payload,
            rssi,
            received: Captured::now(),
        })
    }
}

#[async_trait]
impl Radio for BluerRadio {
    async fn scan(&self, window: Duration) -> Result<Vec<Advertisement>, ScanStartError> {
        let session = bluer::Session::new()
            .await
            .map_err(ScanStartError::Session)?;
        let adapter = session
            .default_adapter()
            .await
            .map_err(ScanStartError::Adapter)?;
        adapter
            .set_powered(true)
            .await
            .map_err(ScanStartError::PowerOn)?;

        // Keep duplicates so every broadcast in the window is reported
        let filter = DiscoveryFilter {
            transport: DiscoveryTransport::Le,
            duplicate_data: true,
            ..Default::default()
        };
        if let Err(e) = adapter.set_discovery_filter(filter).await {
            warn!("Failed to set discovery filter: {}", e);
        }

        let events = adapter
            .discover_devices_with_changes()
            .await
            .map_err(ScanStartError::Discovery)?;
        tokio::pin!(events);

        let deadline = sleep(window);
        tokio::pin!(deadline);

        let mut advertisements = Vec::new();
        loop {
            tokio::select! {
                _ = &mut deadline => break,
                event = events.next() => match event {
                    Some(AdapterEvent::DeviceAdded(addr)) => {
                        if let Some(adv) = Self::read_advertisement(&adapter, addr).await {
                            advertisements.push(adv);
                        }
                    }
                    Some(event) => debug!("Discovery event: {:?}", event),
                    None => {
                        warn!("Discovery stream ended before the scan window elapsed");
                        break;
                    }
                },
            }
        }

        Ok(advertisements)
    }
}
