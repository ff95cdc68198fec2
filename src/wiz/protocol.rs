//! JSON-over-UDP wire format spoken by the bulbs on port 38899.

use palette::Srgb;
use serde::{Deserialize, Serialize};

use crate::bulb::BulbMode;

use super::scenes::SceneId;

pub const MIN_DIMMING: u8 = 10;
pub const MAX_DIMMING: u8 = 100;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "method", content = "params", rename_all = "camelCase")]
pub enum WizRequest {
    Registration(RegistrationParams),
    GetPilot(GetPilotParams),
    SetPilot(SetPilotParams),
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationParams {
    pub phone_mac: String,
    pub register: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct GetPilotParams {}

/// Every field is optional. Absent fields are left out of the JSON entirely,
/// because `0` is a meaningful dimming, temperature or channel value and a
/// present field always overwrites device state.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SetPilotParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub dimming: Option<u8>,

    /// Kelvin
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temp: Option<u16>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub r: Option<u8>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub g: Option<u8>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub b: Option<u8>,

    /// Cold white channel
    #[serde(skip_serializing_if = "Option::is_none")]
    pub c: Option<u8>,

    /// Warm white channel
    #[serde(skip_serializing_if = "Option::is_none")]
    pub w: Option<u8>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed: Option<u16>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub scene_id: Option<u8>,
}

impl SetPilotParams {
    fn with_mode(mut self, mode: &BulbMode) -> Self {
        match mode {
            BulbMode::Scene(scene) => self.scene_id = Some(scene.id()),
            BulbMode::Temperature(kelvin) => self.temp = Some(*kelvin),
            BulbMode::Color(color) => {
                self.r = Some(color.red);
                self.g = Some(color.green);
                self.b = Some(color.blue);
            }
        }

        self
    }

    pub fn color(&self) -> Option<Srgb<u8>> {
        match (self.r, self.g, self.b) {
            (None, None, None) => None,
            (r, g, b) => Some(Srgb::new(
                r.unwrap_or_default(),
                g.unwrap_or_default(),
                b.unwrap_or_default(),
            )),
        }
    }
}

/// Brightness as sent on the wire. Bulbs misbehave outside of 10-100%.
pub fn clamp_dimming(brightness: f32) -> u8 {
    if brightness.is_nan() {
        return MIN_DIMMING;
    }

    brightness
        .round()
        .clamp(f32::from(MIN_DIMMING), f32::from(MAX_DIMMING)) as u8
}

impl WizRequest {
    pub fn registration(phone_mac: &str) -> WizRequest {
        WizRequest::Registration(RegistrationParams {
            phone_mac: phone_mac.to_string(),
            register: false,
        })
    }

    pub fn get_pilot() -> WizRequest {
        WizRequest::GetPilot(GetPilotParams {})
    }

    /// Turning on also resends dimming and the last known mode, otherwise the
    /// bulb falls back to its firmware defaults.
    pub fn turn_on(brightness: f32, mode: Option<&BulbMode>) -> WizRequest {
        let params = SetPilotParams {
            state: Some(true),
            dimming: Some(clamp_dimming(brightness)),
            ..Default::default()
        };

        WizRequest::SetPilot(match mode {
            Some(mode) => params.with_mode(mode),
            None => params,
        })
    }

    pub fn turn_off() -> WizRequest {
        WizRequest::SetPilot(SetPilotParams {
            state: Some(false),
            ..Default::default()
        })
    }

    pub fn set_brightness(brightness: f32) -> WizRequest {
        WizRequest::SetPilot(SetPilotParams {
            state: Some(true),
            dimming: Some(clamp_dimming(brightness)),
            ..Default::default()
        })
    }

    pub fn set_color(color: Srgb<u8>) -> WizRequest {
        WizRequest::SetPilot(
            SetPilotParams {
                state: Some(true),
                ..Default::default()
            }
            .with_mode(&BulbMode::Color(color)),
        )
    }

    pub fn set_temperature(kelvin: u16) -> WizRequest {
        WizRequest::SetPilot(SetPilotParams {
            state: Some(true),
            temp: Some(kelvin),
            ..Default::default()
        })
    }

    pub fn set_scene(scene: SceneId) -> WizRequest {
        WizRequest::SetPilot(SetPilotParams {
            state: Some(true),
            scene_id: Some(scene.id()),
            ..Default::default()
        })
    }

    pub fn method(&self) -> &'static str {
        match self {
            WizRequest::Registration(_) => "registration",
            WizRequest::GetPilot(_) => "getPilot",
            WizRequest::SetPilot(_) => "setPilot",
        }
    }

    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

/// `result` object of a reply. Carries the same optional pilot fields as
/// `setPilot` plus device metadata.
#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub struct PilotResult {
    pub mac: Option<String>,
    pub rssi: Option<i32>,
    pub src: Option<String>,
    pub success: Option<bool>,

    #[serde(flatten)]
    pub pilot: SetPilotParams,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct WizError {
    pub code: i64,
    pub message: String,
}

impl std::fmt::Display for WizError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct WizResponse {
    pub method: Option<String>,
    pub env: Option<String>,
    pub result: Option<PilotResult>,
    pub error: Option<WizError>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Pilot(PilotResult),
    Rejected(WizError),
}

/// Parses a datagram from a bulb.
///
/// Malformed JSON, anything after the JSON value other than whitespace, or a
/// reply with neither `result` nor `error`, yields
/// `None`. Firmware varies enough that this is routine and only logged.
pub fn parse_reply(bytes: &[u8]) -> Option<Reply> {
    let mut de = serde_json::Deserializer::from_slice(bytes);
    let response: Result<WizResponse, _> = serde_path_to_error::deserialize(&mut de);

    if response.is_ok() {
        if let Err(e) = de.end() {
            log::debug!("Ignoring reply with trailing data: {e}");
            return None;
        }
    }

    match response {
        Ok(WizResponse {
            error: Some(error), ..
        }) => Some(Reply::Rejected(error)),
        Ok(WizResponse {
            result: Some(result),
            ..
        }) => Some(Reply::Pilot(result)),
        Ok(response) => {
            log::debug!(
                "Ignoring reply without result (method: {:?})",
                response.method
            );
            None
        }
        Err(e) => {
            log::debug!(
                "Unparsable reply at {}: {} ({})",
                e.path(),
                e.inner(),
                String::from_utf8_lossy(bytes)
            );
            None
        }
    }
}
