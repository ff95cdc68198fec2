use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use palette::Srgb;

use crate::{
    bulb::{Bulb, BulbMode, ConnectionType},
    protocols::udp::SocketManager,
    settings::NetworkSettings,
};

use super::{
    protocol::{parse_reply, PilotResult, Reply, WizRequest},
    scenes::SceneId,
    status::apply_pilot,
};

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("No usable response from bulb at {0}")]
    NoResponse(String),

    /// The bulb understood the request and refused it.
    #[error("Bulb rejected the command: {message} (code {code})")]
    Rejected { code: i64, message: String },

    #[error("Unknown scene {0:?}")]
    UnknownScene(String),

    #[error("Unknown bulb {0}")]
    UnknownBulb(String),

    #[error("Unknown group {0}")]
    UnknownGroup(String),

    #[error("Controlling BLE bulbs is not supported (bulb {0})")]
    Unsupported(String),

    #[error("Invalid bulb address {0:?}")]
    InvalidAddress(String),

    #[error("Invalid bulb: {0}")]
    Invalid(String),

    #[error("Failed to encode request: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Something a user wants a bulb to do.
#[derive(Clone, Debug, PartialEq)]
pub enum Intent {
    TurnOn,
    TurnOff,
    Toggle,
    Brightness(f32),
    Color(Srgb<u8>),
    Temperature(u16),
    Scene(String),
}

/// Works out the request for `intent` and the cached state the bulb will be
/// in once the bulb accepts it.
pub fn plan(bulb: &Bulb, intent: &Intent) -> Result<(WizRequest, Bulb), CommandError> {
    let mut updated = bulb.clone();
    updated.is_on = true;
    updated.available = true;

    let request = match intent {
        Intent::Toggle if bulb.is_on => return plan(bulb, &Intent::TurnOff),
        Intent::Toggle | Intent::TurnOn => WizRequest::turn_on(bulb.brightness, bulb.mode.as_ref()),
        Intent::TurnOff => {
            updated.is_on = false;
            WizRequest::turn_off()
        }
        Intent::Brightness(brightness) => {
            if !brightness.is_nan() {
                updated.brightness = brightness.clamp(0.0, 100.0);
            }
            WizRequest::set_brightness(*brightness)
        }
        Intent::Color(color) => {
            updated.mode = Some(BulbMode::Color(*color));
            WizRequest::set_color(*color)
        }
        Intent::Temperature(kelvin) => {
            updated.mode = Some(BulbMode::Temperature(*kelvin));
            WizRequest::set_temperature(*kelvin)
        }
        Intent::Scene(name) => {
            let scene =
                SceneId::from_name(name).ok_or_else(|| CommandError::UnknownScene(name.clone()))?;
            updated.mode = Some(BulbMode::Scene(scene));
            WizRequest::set_scene(scene)
        }
    };

    Ok((request, updated))
}

/// Sends commands and status queries to Wi-Fi bulbs over the shared socket.
#[derive(Clone, Debug)]
pub struct BulbController {
    socket: Arc<SocketManager>,
    port: u16,
    timeout: Duration,
}

impl BulbController {
    pub fn new(socket: Arc<SocketManager>, settings: &NetworkSettings) -> BulbController {
        BulbController {
            socket,
            port: settings.port,
            timeout: settings.socket_timeout(),
        }
    }

    fn target(&self, bulb: &Bulb) -> Result<SocketAddr, CommandError> {
        if bulb.connection == ConnectionType::Ble {
            return Err(CommandError::Unsupported(bulb.id.clone()));
        }

        let ip: IpAddr = bulb
            .address
            .parse()
            .map_err(|_| CommandError::InvalidAddress(bulb.address.clone()))?;

        Ok(SocketAddr::new(ip, self.port))
    }

    async fn exchange(&self, bulb: &Bulb, request: &WizRequest) -> Result<PilotResult, CommandError> {
        let target = self.target(bulb)?;
        let payload = request.to_bytes()?;

        let reply = self
            .socket
            .send_and_receive(&payload, target, self.timeout)
            .await
            .and_then(|bytes| parse_reply(&bytes));

        match reply {
            Some(Reply::Pilot(result)) => Ok(result),
            Some(Reply::Rejected(error)) => {
                log::warn!(
                    "{} ({}) rejected {}: {}",
                    bulb.name,
                    bulb.address,
                    request.method(),
                    error
                );
                Err(CommandError::Rejected {
                    code: error.code,
                    message: error.message,
                })
            }
            None => Err(CommandError::NoResponse(bulb.address.clone())),
        }
    }

    /// Sends one `setPilot` for `intent` and returns the bulb as it should be
    /// cached afterwards.
    pub async fn apply(&self, bulb: &Bulb, intent: &Intent) -> Result<Bulb, CommandError> {
        let (request, updated) = plan(bulb, intent)?;

        log::debug!("{} ({}): {:?}", bulb.name, bulb.address, intent);
        self.exchange(bulb, &request).await?;

        Ok(updated)
    }

    /// Queries the bulb and reconciles the reply with the cached state. A bulb
    /// that does not answer keeps its cached state and is marked unavailable.
    pub async fn fetch_status(&self, bulb: &Bulb) -> Bulb {
        match self.exchange(bulb, &WizRequest::get_pilot()).await {
            Ok(result) => apply_pilot(bulb, &result),
            Err(CommandError::Unsupported(_)) => bulb.clone(),
            Err(CommandError::Rejected { .. }) => Bulb {
                available: true,
                ..bulb.clone()
            },
            Err(e) => {
                log::debug!("Status of {} unavailable: {e}", bulb.name);
                Bulb {
                    available: false,
                    ..bulb.clone()
                }
            }
        }
    }
}
