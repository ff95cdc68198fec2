//! Built-in lighting effects of the bulb firmware.
//!
//! Scene ids are protocol constants: they never change and `0` means that no
//! scene is active.

use serde::{Deserialize, Serialize};

const SCENES: [(u8, &str); 33] = [
    (1, "ocean"),
    (2, "romance"),
    (3, "sunset"),
    (4, "party"),
    (5, "fireplace"),
    (6, "cozy"),
    (7, "forest"),
    (8, "pastel"),
    (9, "wakeup"),
    (10, "bedtime"),
    (11, "warmwhite"),
    (12, "daylight"),
    (13, "coolwhite"),
    (14, "nightlight"),
    (15, "focus"),
    (16, "relax"),
    (17, "truecolors"),
    (18, "tvtime"),
    (19, "plantgrowth"),
    (20, "spring"),
    (21, "summer"),
    (22, "fall"),
    (23, "deepdive"),
    (24, "jungle"),
    (25, "mojito"),
    (26, "club"),
    (27, "christmas"),
    (28, "halloween"),
    (29, "candlelight"),
    (30, "goldenwhite"),
    (31, "pulse"),
    (32, "steampunk"),
    (33, "diwali"),
];

/// A firmware scene id. Always non-zero.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(transparent)]
pub struct SceneId(u8);

impl SceneId {
    /// Returns `None` for `0`, which the firmware uses for "no scene".
    pub fn new(id: u8) -> Option<SceneId> {
        (id > 0).then_some(SceneId(id))
    }

    /// Looks up a scene by name, ignoring case and surrounding whitespace.
    pub fn from_name(name: &str) -> Option<SceneId> {
        let name = name.trim();

        SCENES
            .iter()
            .find(|(_, scene)| scene.eq_ignore_ascii_case(name))
            .map(|(id, _)| SceneId(*id))
    }

    pub fn id(self) -> u8 {
        self.0
    }

    /// Newer firmware knows scenes beyond this table, those have no name.
    pub fn name(self) -> Option<&'static str> {
        SCENES
            .iter()
            .find(|(id, _)| *id == self.0)
            .map(|(_, name)| *name)
    }
}

impl std::fmt::Display for SceneId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{name}"),
            None => write!(f, "scene #{}", self.0),
        }
    }
}
