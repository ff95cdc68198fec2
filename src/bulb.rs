use derive_builder::Builder;
use palette::Srgb;
use serde::{Deserialize, Serialize};

use crate::wiz::scenes::SceneId;

pub const DEFAULT_WATTAGE: f32 = 9.0;
pub const DEFAULT_BRIGHTNESS: f32 = 50.0;

/// What the bulb is currently rendering. Exactly one of these is
/// authoritative, switching to one discards the others.
#[derive(Clone, Copy, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BulbMode {
    Color(Srgb<u8>),

    /// White light at the given color temperature in Kelvin (2700 - 6500)
    Temperature(u16),

    Scene(SceneId),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionType {
    #[default]
    Wifi,
    Ble,
}

#[derive(Builder, Clone, Debug, PartialEq, Deserialize, Serialize)]
#[builder(setter(into))]
pub struct Bulb {
    /// MAC address for discovered bulbs, a generated UUID for manually added ones
    pub id: String,
    pub name: String,

    /// IPv4 address for Wi-Fi bulbs, MAC address for BLE bulbs
    pub address: String,

    #[builder(default)]
    pub mac: Option<String>,

    #[builder(default)]
    pub is_on: bool,

    /// Percent, 0 - 100
    #[builder(default = "DEFAULT_BRIGHTNESS")]
    pub brightness: f32,

    /// `None` until a command or a status reply tells us otherwise
    #[builder(default, setter(strip_option))]
    pub mode: Option<BulbMode>,

    #[builder(default = "true")]
    pub available: bool,

    #[builder(default)]
    pub connection: ConnectionType,

    #[builder(default = "DEFAULT_WATTAGE")]
    pub wattage: f32,
}

impl Bulb {
    pub fn scene(&self) -> Option<SceneId> {
        match self.mode {
            Some(BulbMode::Scene(scene)) => Some(scene),
            _ => None,
        }
    }

    pub fn color(&self) -> Option<Srgb<u8>> {
        match self.mode {
            Some(BulbMode::Color(color)) => Some(color),
            _ => None,
        }
    }

    pub fn temperature(&self) -> Option<u16> {
        match self.mode {
            Some(BulbMode::Temperature(kelvin)) => Some(kelvin),
            _ => None,
        }
    }

    /// Estimated power draw in watts.
    pub fn power_draw(&self) -> f32 {
        if self.is_on {
            self.wattage * (self.brightness.clamp(0.0, 100.0) / 100.0)
        } else {
            0.0
        }
    }

    pub fn matches_discovered(&self, discovered: &DiscoveredBulb) -> bool {
        self.id == discovered.mac
            || self.mac.as_deref() == Some(discovered.mac.as_str())
            || self.address == discovered.address
    }
}

impl From<&DiscoveredBulb> for Bulb {
    fn from(discovered: &DiscoveredBulb) -> Self {
        Bulb {
            id: discovered.mac.clone(),
            name: discovered.name.clone(),
            address: discovered.address.clone(),
            mac: Some(discovered.mac.clone()),
            is_on: false,
            brightness: DEFAULT_BRIGHTNESS,
            mode: None,
            available: true,
            connection: if discovered.is_ble {
                ConnectionType::Ble
            } else {
                ConnectionType::Wifi
            },
            wattage: DEFAULT_WATTAGE,
        }
    }
}

/// Named set of bulbs that receive the same commands. Groups keep no
/// color or temperature of their own.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct BulbGroup {
    pub id: String,
    pub name: String,
    pub bulb_ids: Vec<String>,
    pub is_on: bool,
    pub brightness: f32,
}

/// A bulb found during discovery that has not been adopted yet.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct DiscoveredBulb {
    pub name: String,
    pub address: String,
    pub mac: String,
    pub is_ble: bool,
}

impl DiscoveredBulb {
    pub fn from_wifi(address: std::net::Ipv4Addr, mac: Option<String>) -> DiscoveredBulb {
        let last_octet = address.octets()[3];

        DiscoveredBulb {
            name: format!("WiZ Bulb ({last_octet})"),
            address: address.to_string(),
            mac: mac.unwrap_or_else(|| format!("unknown_{}", address.to_string().replace('.', "_"))),
            is_ble: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_fills_defaults() {
        let bulb = BulbBuilder::default()
            .id("a8bb50aabbcc")
            .name("Desk")
            .address("192.168.1.20")
            .build()
            .unwrap();

        assert!(!bulb.is_on);
        assert!(bulb.available);
        assert_eq!(bulb.brightness, DEFAULT_BRIGHTNESS);
        assert_eq!(bulb.wattage, DEFAULT_WATTAGE);
        assert_eq!(bulb.mode, None);
        assert_eq!(bulb.connection, ConnectionType::Wifi);
    }

    #[test]
    fn builder_requires_identity() {
        assert!(BulbBuilder::default().name("Desk").build().is_err());
    }

    #[test]
    fn mode_accessors_are_exclusive() {
        let mut bulb = BulbBuilder::default()
            .id("x")
            .name("x")
            .address("10.0.0.2")
            .mode(BulbMode::Color(Srgb::new(1, 2, 3)))
            .build()
            .unwrap();

        assert_eq!(bulb.color(), Some(Srgb::new(1, 2, 3)));
        assert_eq!(bulb.temperature(), None);
        assert_eq!(bulb.scene(), None);

        bulb.mode = Some(BulbMode::Temperature(2700));
        assert_eq!(bulb.color(), None);
        assert_eq!(bulb.temperature(), Some(2700));
    }

    #[test]
    fn power_draw_scales_with_brightness() {
        let mut bulb = BulbBuilder::default()
            .id("x")
            .name("x")
            .address("10.0.0.2")
            .wattage(10.0_f32)
            .brightness(40.0_f32)
            .build()
            .unwrap();

        assert_eq!(bulb.power_draw(), 0.0);
        bulb.is_on = true;
        assert!((bulb.power_draw() - 4.0).abs() < f32::EPSILON);
    }

    #[test]
    fn discovered_wifi_bulbs_get_placeholder_identity() {
        let discovered = DiscoveredBulb::from_wifi("10.0.0.5".parse().unwrap(), None);

        assert_eq!(discovered.name, "WiZ Bulb (5)");
        assert_eq!(discovered.mac, "unknown_10_0_0_5");
        assert!(!discovered.is_ble);

        let adopted = Bulb::from(&discovered);
        assert_eq!(adopted.id, "unknown_10_0_0_5");
        assert!(adopted.matches_discovered(&discovered));
    }

    #[test]
    fn persisted_form_round_trips() {
        let bulb = BulbBuilder::default()
            .id("a8bb50aabbcc")
            .name("Hall")
            .address("192.168.1.21")
            .mode(BulbMode::Scene(SceneId::new(5).unwrap()))
            .build()
            .unwrap();

        let json = serde_json::to_string(&bulb).unwrap();
        assert!(json.contains(r#""mode":{"scene":5}"#));
        assert_eq!(serde_json::from_str::<Bulb>(&json).unwrap(), bulb);
    }
}
