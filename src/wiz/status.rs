use crate::bulb::{Bulb, BulbMode};

use super::{protocol::PilotResult, scenes::SceneId};

/// Infers what the bulb is rendering from a `getPilot` result.
///
/// Firmware reports scene, temperature and color fields side by side with
/// zeros meaning "not in use". A non-zero scene wins, then a non-zero
/// temperature, then any non-zero channel. Some firmware echoes both a
/// temperature and RGB, in which case temperature wins.
///
/// Returns `None` when the reply carries nothing informative.
pub fn infer_mode(result: &PilotResult) -> Option<BulbMode> {
    let pilot = &result.pilot;

    if let Some(scene) = pilot.scene_id.and_then(SceneId::new) {
        return Some(BulbMode::Scene(scene));
    }

    if let Some(kelvin) = pilot.temp.filter(|temp| *temp > 0) {
        return Some(BulbMode::Temperature(kelvin));
    }

    pilot
        .color()
        .filter(|color| color.red > 0 || color.green > 0 || color.blue > 0)
        .map(BulbMode::Color)
}

/// Folds a status reply into the cached bulb. Fields the bulb did not report
/// keep their cached value, and an uninformative reply keeps the cached mode.
pub fn apply_pilot(bulb: &Bulb, result: &PilotResult) -> Bulb {
    let mut bulb = bulb.clone();

    if let Some(state) = result.pilot.state {
        bulb.is_on = state;
    }

    if let Some(dimming) = result.pilot.dimming {
        bulb.brightness = f32::from(dimming);
    }

    if let Some(mode) = infer_mode(result) {
        bulb.mode = Some(mode);
    }

    if bulb.mac.is_none() {
        bulb.mac = result.mac.clone();
    }

    bulb.available = true;
    bulb
}
