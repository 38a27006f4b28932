/*!
 # Lamp state

 Byte-level values as the lamp understands them, plus the host's color payload.
*/

use serde::{Deserialize, Serialize};

use crate::effects;
use crate::{Error, Result};

/// Battery value meaning "never read"
pub const BATTERY_UNKNOWN: u8 = 255;

/// One color frame for the color characteristic
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Rgbw {
    pub white: u8,
    pub red: u8,
    pub green: u8,
    pub blue: u8,
}

impl Rgbw {
    pub const OFF: Rgbw = Rgbw {
        white: 0,
        red: 0,
        green: 0,
        blue: 0,
    };

    pub fn is_off(&self) -> bool {
        *self == Self::OFF
    }

    /// Wire order is white, red, green, blue.
    pub fn to_bytes(self) -> [u8; 4] {
        [self.white, self.red, self.green, self.blue]
    }

    pub fn from_bytes(bytes: [u8; 4]) -> Self {
        Rgbw {
            white: bytes[0],
            red: bytes[1],
            green: bytes[2],
            blue: bytes[3],
        }
    }
}

/// One frame for the color and effects characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EffectFrame {
    pub color: Rgbw,
    pub effect: u8,
    pub speed: u8,
}

impl EffectFrame {
    pub fn to_bytes(self) -> [u8; 8] {
        let [w, r, g, b] = self.color.to_bytes();
        [w, r, g, b, self.effect, 0x00, self.speed, self.speed]
    }
}

/// What the session believes the lamp is doing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LampState {
    pub power: bool,
    pub color: Rgbw,
    /// 0-254, or [`effects::OFF`]
    pub effect: u8,
    /// 1 is fastest, 255 slowest
    pub speed: u8,
    /// Percent, or [`BATTERY_UNKNOWN`]
    pub battery: u8,
}

impl Default for LampState {
    fn default() -> Self {
        LampState {
            power: false,
            color: Rgbw::OFF,
            effect: effects::OFF,
            speed: 1,
            battery: BATTERY_UNKNOWN,
        }
    }
}

/// Color payload as sent by the host: a mode tag plus channel maxima
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColorPayload {
    #[serde(rename = "m")]
    pub mode: u8,
    #[serde(rename = "r", default)]
    pub red: u8,
    #[serde(rename = "g", default)]
    pub green: u8,
    #[serde(rename = "b", default)]
    pub blue: u8,
    #[serde(rename = "cw", default)]
    pub cold_white: u8,
    #[serde(rename = "ww", default)]
    pub warm_white: u8,
}

impl ColorPayload {
    /// White-only color
    pub const MODE_WHITE: u8 = 1;
    /// RGB plus white channels
    pub const MODE_RGB: u8 = 3;

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Only modes 1 and 3 carry channels the lamp can show.
    pub fn validate(&self) -> Result<()> {
        match self.mode {
            Self::MODE_WHITE | Self::MODE_RGB => Ok(()),
            m => Err(Error::InvalidCommand(format!("unsupported color mode {m}"))),
        }
    }

    /// Channel maxima in lamp order. The lamp has a single white channel,
    /// driven from the warm white value.
    pub fn maxima(&self) -> Rgbw {
        Rgbw {
            white: self.warm_white,
            red: self.red,
            green: self.green,
            blue: self.blue,
        }
    }
}
