/*!
 # Built-in PlayBulb effects

 Effect codes understood by the color and effects characteristic. The host
 exposes them as selector levels 10, 20, 30... in the same order.
*/

/// Effect code that disables any running effect
pub const OFF: u8 = 255;

/// Represents the built-in effects of a PlayBulb
#[derive(Debug, Clone, Copy)]
pub struct Effects {
    /// Blink the current color on and off
    pub flash: u8,
    /// Fade the current color in and out
    pub pulse: u8,
    /// Jump through the rainbow
    pub hard: u8,
    /// Crossfade through the rainbow
    pub soft: u8,
    /// Flicker like a candle
    pub candle: u8,
}

/// Predefined effects with their command values
pub const EFFECTS: Effects = Effects {
    flash: 0x00,
    pulse: 0x01,
    hard: 0x02,
    soft: 0x03,
    candle: 0x04,
};

impl Effects {
    /// Looks an effect up by its display name.
    pub fn by_name(&self, name: &str) -> Option<u8> {
        match name.to_lowercase().as_str() {
            "off" => Some(OFF),
            "flash" => Some(self.flash),
            "pulse" => Some(self.pulse),
            "hard" => Some(self.hard),
            "soft" => Some(self.soft),
            "candle" => Some(self.candle),
            _ => None,
        }
    }

    pub fn name(&self, code: u8) -> &'static str {
        match code {
            OFF => "off",
            c if c == self.flash => "flash",
            c if c == self.pulse => "pulse",
            c if c == self.hard => "hard",
            c if c == self.soft => "soft",
            c if c == self.candle => "candle",
            _ => "unknown",
        }
    }
}
