/*!
 # MiPow PlayBulb Bluetooth LE Lamp Controller Library

 A Rust library for driving MiPow PlayBulb RGBW lamps from a home-automation host.
 Supports the BTL200/201/203/300/301W/400/501A/505-GN/601 family.

 ## Features

 * Power on/off control
 * RGBW color and brightness control
 * Built-in effects (flash, pulse, hard, soft, candle)
 * Effect speed control
 * Battery level polling
 * A single serialized worker so host commands never race on the Bluetooth link

 ## Example

 ```no_run
 use playbulb::*;

 # struct Printer;
 # impl StateSink for Printer {
 #     fn update_device(&self, unit: Unit, update: &DeviceUpdate) {
 #         println!("{unit}: {update:?}");
 #     }
 # }
 #[tokio::main]
 async fn main() -> Result<()> {
     let config = Config::from_toml(r#"address = "AA:BB:CC:DD:EE:FF""#)?;

     let mut lamp = PlayBulb::new(config, BtleTransport::new(), Printer);
     lamp.start()?;

     lamp.handle_command(Command::On)?;
     lamp.handle_command(Command::SetEffect { selector: 50 })?; // candle

     lamp.stop().await;
     Ok(())
 }
 ```
*/

use thiserror::Error;

/// Custom error types for the PlayBulb controller library
#[derive(Error, Debug)]
pub enum Error {
    /// The Bluetooth link could not be established within the timeout
    #[error("connection error: {0}")]
    Connection(String),

    /// A write failed on an established link
    #[error("write error: {0}")]
    Write(String),

    /// A read failed on an established link
    #[error("read error: {0}")]
    Read(String),

    /// The connected device is not a supported PlayBulb
    #[error("unsupported device: manufacturer = '{manufacturer}', serial = '{serial}'")]
    ProtocolMismatch {
        manufacturer: String,
        serial: String,
    },

    /// Malformed command or payload
    #[error("invalid command: {0}")]
    InvalidCommand(String),

    /// No Bluetooth adapter at the configured interface index
    #[error("no Bluetooth adapter found")]
    NoBluetoothAdapters,

    /// No peripheral with the configured address was seen
    #[error("no device found with address {0}")]
    DeviceNotFound(String),

    /// A required characteristic was not exposed by the device
    #[error("could not find required BLE characteristic: {0}")]
    CharacteristicNotFound(&'static str),

    /// The task queue no longer accepts work
    #[error("task queue is closed")]
    QueueClosed,

    /// Invalid configuration value
    #[error("configuration error: {0}")]
    Config(String),

    /// Error from btleplug
    #[error(transparent)]
    BtlePlug(#[from] btleplug::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Toml(#[from] toml::de::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

pub mod btle;
pub mod characteristics;
pub mod config;
pub mod controller;
pub mod effects;
pub mod queue;
pub mod reconciler;
pub mod report;
pub mod schedule;
pub mod session;
pub mod state;
pub mod transport;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

// Re-export key types
pub use btle::BtleTransport;
pub use characteristics::{CharacteristicMap, LampIdentity, LogicalHandle};
pub use config::{Config, PollInterval};
pub use controller::{Command, PlayBulb, RestoredState};
pub use effects::{Effects, EFFECTS};
pub use queue::{Task, TaskQueue, TaskReceiver};
pub use report::{BatteryIcon, DeviceUpdate, StateSink, Unit};
pub use schedule::PollSchedule;
pub use session::{ConnectionState, DeviceSession};
pub use state::{ColorPayload, EffectFrame, LampState, Rgbw};
pub use transport::{DiscoveredCharacteristic, Link, Transport};
pub use worker::{Worker, WorkerState};
