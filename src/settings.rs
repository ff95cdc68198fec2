use std::{net::Ipv4Addr, time::Duration};

use serde::Deserialize;

#[derive(Clone, Deserialize, Debug)]
#[serde(default)]
pub struct NetworkSettings {
    pub port: u16,
    pub socket_timeout_ms: u64,
    pub probe_timeout_ms: u64,
    pub discovery_timeout_ms: u64,
    pub broadcast_listen_ms: u64,
    pub ip_scan_batch_size: usize,
    pub phone_mac: String,

    /// Pin the address used to derive the /24 that gets scanned, for hosts
    /// with more than one interface.
    pub local_ip: Option<Ipv4Addr>,
    pub broadcast_addr: Option<Ipv4Addr>,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        NetworkSettings {
            port: 38899,
            socket_timeout_ms: 2000,
            probe_timeout_ms: 500,
            discovery_timeout_ms: 5000,
            broadcast_listen_ms: 3000,
            ip_scan_batch_size: 50,
            phone_mac: "AAAAAAAAAAAA".to_string(),
            local_ip: None,
            broadcast_addr: None,
        }
    }
}

impl NetworkSettings {
    pub fn socket_timeout(&self) -> Duration {
        Duration::from_millis(self.socket_timeout_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery_timeout_ms)
    }

    pub fn broadcast_listen(&self) -> Duration {
        Duration::from_millis(self.broadcast_listen_ms)
    }
}

#[derive(Clone, Deserialize, Debug)]
#[serde(default)]
pub struct BleSettings {
    pub enabled: bool,
    pub scan_seconds: u64,
}

impl Default for BleSettings {
    fn default() -> Self {
        BleSettings {
            enabled: false,
            scan_seconds: 10,
        }
    }
}

#[derive(Clone, Deserialize, Debug)]
#[serde(default)]
pub struct PollingSettings {
    pub interval_ms: u64,
    pub cooldown_ms: u64,
}

impl Default for PollingSettings {
    fn default() -> Self {
        PollingSettings {
            interval_ms: 3000,
            cooldown_ms: 3000,
        }
    }
}

impl PollingSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

#[derive(Clone, Deserialize, Debug)]
#[serde(default)]
pub struct StorageSettings {
    pub devices_path: String,
    pub energy_path: String,
}

impl Default for StorageSettings {
    fn default() -> Self {
        StorageSettings {
            devices_path: "devices.json".to_string(),
            energy_path: "energy.json".to_string(),
        }
    }
}

#[derive(Clone, Deserialize, Debug)]
#[serde(default)]
pub struct DiscoverySettings {
    pub on_startup: bool,
    pub auto_adopt: bool,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        DiscoverySettings {
            on_startup: true,
            auto_adopt: false,
        }
    }
}

#[derive(Clone, Deserialize, Debug, Default)]
#[serde(default)]
pub struct Settings {
    pub network: NetworkSettings,
    pub ble: BleSettings,
    pub polling: PollingSettings,
    pub storage: StorageSettings,
    pub discovery: DiscoverySettings,
}

pub fn read_settings() -> Result<Settings, config::ConfigError> {
    config::Config::builder()
        .add_source(config::File::with_name("Settings").required(false))
        .add_source(config::Environment::with_prefix("WIZ").separator("__"))
        .build()?
        .try_deserialize::<Settings>()
}
