/*!
 # Configuration

 Loaded from a TOML file:

 ```toml
 interface = 0                 # hci0..hci3
 address = "AA:BB:CC:DD:EE:FF"
 battery_poll = 24             # hours between polls while off: 1, 6 or 24
 battery_device = true
 strict_device_check = false
 debug = 0
 ```
*/

use std::path::Path;
use std::time::Duration;

use chrono::TimeDelta;
use serde::Deserialize;

use crate::{Error, Result};

/// Connect budget for the first discovery of the lamp
pub const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Connect budget once the lamp has been seen
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Battery poll interval while the lamp is off
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(try_from = "u8")]
pub enum PollInterval {
    OneHour,
    SixHours,
    #[default]
    Day,
}

impl PollInterval {
    pub fn hours(self) -> i64 {
        match self {
            PollInterval::OneHour => 1,
            PollInterval::SixHours => 6,
            PollInterval::Day => 24,
        }
    }

    pub fn as_delta(self) -> TimeDelta {
        TimeDelta::hours(self.hours())
    }
}

impl TryFrom<u8> for PollInterval {
    type Error = String;

    fn try_from(hours: u8) -> std::result::Result<Self, Self::Error> {
        match hours {
            1 => Ok(PollInterval::OneHour),
            6 => Ok(PollInterval::SixHours),
            24 => Ok(PollInterval::Day),
            h => Err(format!("battery poll must be 1, 6 or 24 hours, got {h}")),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub interface: u8,
    pub address: String,
    #[serde(default)]
    pub battery_poll: PollInterval,
    /// Report battery level as its own host device
    #[serde(default)]
    pub battery_device: bool,
    /// Refuse to drive a lamp whose manufacturer/serial isn't known
    #[serde(default)]
    pub strict_device_check: bool,
    #[serde(default)]
    pub debug: u8,
}

impl Config {
    pub fn new(address: impl Into<String>) -> Self {
        Config {
            interface: 0,
            address: address.into(),
            battery_poll: PollInterval::default(),
            battery_device: false,
            strict_device_check: false,
            debug: 0,
        }
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let cfg: Config = toml::from_str(text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_toml(&std::fs::read_to_string(path)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.interface > 3 {
            return Err(Error::Config(format!(
                "interface must be 0-3, got {}",
                self.interface
            )));
        }
        if !is_mac_address(&self.address) {
            return Err(Error::Config(format!(
                "'{}' is not a Bluetooth MAC address",
                self.address
            )));
        }
        Ok(())
    }

    /// Log filter directive matching the debug level
    pub fn log_filter(&self) -> &'static str {
        match self.debug {
            0 => "playbulb=info,playbulbd=info",
            1 => "playbulb=trace,playbulbd=trace",
            _ => "playbulb=debug,playbulbd=debug",
        }
    }
}

fn is_mac_address(addr: &str) -> bool {
    let parts: Vec<&str> = addr.split(':').collect();
    parts.len() == 6
        && parts
            .iter()
            .all(|p| p.len() == 2 && p.chars().all(|c| c.is_ascii_hexdigit()))
}
