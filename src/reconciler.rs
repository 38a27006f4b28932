/*!
 # Host intent to device bytes

 Pure mappings between what the host asks for (percentages, selector levels,
 color payloads) and the byte values the lamp takes, and back.
*/

use crate::effects;
use crate::report::BatteryIcon;
use crate::state::{ColorPayload, Rgbw, BATTERY_UNKNOWN};
use crate::Result;

/// Scales a channel maximum (0-255) by a brightness level (0-100), rounding
/// to the nearest byte.
pub fn scale_channel(max: u8, level: u8) -> u8 {
    let level = level.min(100) as u32;
    ((max as u32 * level + 50) / 100).min(255) as u8
}

pub fn scale(max: Rgbw, level: u8) -> Rgbw {
    Rgbw {
        white: scale_channel(max.white, level),
        red: scale_channel(max.red, level),
        green: scale_channel(max.green, level),
        blue: scale_channel(max.blue, level),
    }
}

/// Scales every channel of a host color payload by `level`. Rejects color
/// modes the lamp can't show.
pub fn scale_color(payload: &ColorPayload, level: u8) -> Result<Rgbw> {
    payload.validate()?;
    Ok(scale(payload.maxima(), level))
}

/// Moves a color from brightness `from` to brightness `to`, truncating.
/// A `from` of 0 is taken as 100.
///
/// This is lossy: rescaling down then back up does not return the original
/// bytes.
pub fn rescale(color: Rgbw, from: u8, to: u8) -> Rgbw {
    let from = if from == 0 { 100 } else { from as u32 };
    let to = to.min(100) as u32;
    let channel = |c: u8| ((c as u32 * to) / from).min(255) as u8;
    Rgbw {
        white: channel(color.white),
        red: channel(color.red),
        green: channel(color.green),
        blue: channel(color.blue),
    }
}

/// Selector level 0 is "off", then one effect per step of ten.
pub fn effect_from_selector(level: u8) -> u8 {
    if level < 10 {
        effects::OFF
    } else {
        level / 10 - 1
    }
}

pub fn selector_from_effect(effect: u8) -> u8 {
    if effect == effects::OFF {
        0
    } else {
        (effect as u16 + 1).saturating_mul(10).min(u8::MAX as u16) as u8
    }
}

/// Dimmer level 100 is the fastest speed the host shows, which is device
/// speed 1. Speed 0 isn't valid on the lamp.
pub fn speed_from_level(level: u8) -> u8 {
    let level = level.min(100) as u32;
    (((100 - level) * 255 + 50) / 100).max(1) as u8
}

/// `None` means the battery was never read and the icon stays as is.
pub fn battery_icon(battery: u8) -> Option<BatteryIcon> {
    match battery {
        BATTERY_UNKNOWN => None,
        b if b >= 75 => Some(BatteryIcon::Full),
        b if b >= 50 => Some(BatteryIcon::Ok),
        b if b >= 25 => Some(BatteryIcon::Low),
        _ => Some(BatteryIcon::Empty),
    }
}
