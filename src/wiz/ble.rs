//! Bluetooth LE advertisement scanning.
//!
//! Only discovery is supported over BLE. The GATT control protocol of these
//! bulbs is vendor specific and not implemented.

use std::time::Duration;

use async_trait::async_trait;
use color_eyre::Result;
use uuid::Uuid;

use crate::bulb::DiscoveredBulb;

/// 16-bit service 0xFD50, advertised by Tuya based bulbs.
pub const TUYA_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000fd50_0000_1000_8000_00805f9b34fb);

const NAME_HINTS: [&str; 6] = ["wiz", "wipro", "smart", "light", "bulb", "led"];
const UNKNOWN_NAME: &str = "Unknown Device";

#[derive(Clone, Debug, Default, PartialEq)]
pub struct BleAdvertisement {
    /// Hardware address, e.g. "A4:C1:38:12:34:56"
    pub address: String,
    pub name: Option<String>,
    pub services: Vec<Uuid>,
}

#[async_trait]
pub trait BleScanner: Send + Sync {
    /// Scans for `duration` and returns every advertisement seen.
    async fn scan(&self, duration: Duration) -> Result<Vec<BleAdvertisement>>;
}

/// Matches advertisements that look like a smart bulb, by name or by the
/// Tuya service UUID.
pub fn is_smart_bulb(advertisement: &BleAdvertisement) -> bool {
    let name_matches = advertisement.name.as_deref().is_some_and(|name| {
        let name = name.to_lowercase();
        NAME_HINTS.iter().any(|hint| name.contains(hint))
    });

    name_matches || advertisement.services.contains(&TUYA_SERVICE_UUID)
}

/// BLE devices have no IP address, so the MAC stands in for it.
pub fn to_discovered(advertisement: &BleAdvertisement) -> Option<DiscoveredBulb> {
    if !is_smart_bulb(advertisement) {
        return None;
    }

    let is_tuya = advertisement.services.contains(&TUYA_SERVICE_UUID);
    let name = match advertisement.name.as_deref() {
        Some(name) if !name.is_empty() && name != UNKNOWN_NAME => name.to_string(),
        _ if is_tuya => "Wipro/Tuya Light".to_string(),
        _ => UNKNOWN_NAME.to_string(),
    };

    Some(DiscoveredBulb {
        name,
        address: advertisement.address.clone(),
        mac: advertisement.address.clone(),
        is_ble: true,
    })
}

#[cfg(feature = "ble")]
pub mod btle {
    use std::time::Duration;

    use async_trait::async_trait;
    use btleplug::{
        api::{Central, Manager as _, Peripheral as _, ScanFilter},
        platform::Manager,
    };
    use color_eyre::Result;
    use eyre::eyre;

    use super::{BleAdvertisement, BleScanner};

    /// Scans with the first Bluetooth adapter of the host.
    pub struct BtleScanner {
        manager: Manager,
    }

    impl BtleScanner {
        pub async fn new() -> Result<BtleScanner> {
            Ok(BtleScanner {
                manager: Manager::new().await?,
            })
        }
    }

    #[async_trait]
    impl BleScanner for BtleScanner {
        async fn scan(&self, duration: Duration) -> Result<Vec<BleAdvertisement>> {
            let adapter = self
                .manager
                .adapters()
                .await?
                .into_iter()
                .next()
                .ok_or_else(|| eyre!("No Bluetooth adapter found"))?;

            adapter.start_scan(ScanFilter::default()).await?;
            tokio::time::sleep(duration).await;

            let mut advertisements = vec![];
            for peripheral in adapter.peripherals().await? {
                let Some(properties) = peripheral.properties().await.ok().flatten() else {
                    continue;
                };

                advertisements.push(BleAdvertisement {
                    address: properties.address.to_string(),
                    name: properties.local_name,
                    services: properties.services,
                });
            }

            if let Err(e) = adapter.stop_scan().await {
                log::warn!("Failed to stop BLE scan: {e}");
            }

            Ok(advertisements)
        }
    }
}
