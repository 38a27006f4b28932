/*!
 # PlayBulb GATT characteristics

 Known characteristic UUIDs are resolved once per connection into a
 [`CharacteristicMap`], a fixed-size table keyed by [`LogicalHandle`].
*/

use tracing::{debug, trace};
use uuid::Uuid;

use crate::transport::DiscoveredCharacteristic;

/// Expands a 16-bit Bluetooth SIG short UUID onto the base UUID.
const fn short_uuid(short: u16) -> Uuid {
    Uuid::from_u128(((short as u128) << 96) | 0x0000_0000_0000_1000_8000_0080_5f9b_34fb)
}

pub const DEVICE_NAME_UUID: Uuid = short_uuid(0x2a00);
pub const SERIAL_NUMBER_UUID: Uuid = short_uuid(0x2a25);
pub const MANUFACTURER_NAME_UUID: Uuid = short_uuid(0x2a29);
pub const BATTERY_LEVEL_UUID: Uuid = short_uuid(0x2a19);
/// White, red, green, blue
pub const COLOR_UUID: Uuid = short_uuid(0xfffc);
/// White, red, green, blue, effect, 0x00, speed, speed
pub const EFFECTS_UUID: Uuid = short_uuid(0xfffb);

/// Manufacturer string reported by every supported lamp
pub const MANUFACTURER: &str = "Mipow Limited";

/// Serial/model codes of the lamps known to speak this protocol
pub const SUPPORTED_SERIALS: [&str; 9] = [
    "BTL300",    // PlayBulb Candle
    "BTL200",    // PlayBulb Rainbow
    "BTL201",    // PlayBulb Smart
    "BTL203",    // PlayBulb Spot Mesh
    "BTL301W",   // PlayBulb Sphere
    "BTL400",    // PlayBulb Garden
    "BTL501A",   // PlayBulb Comet
    "BTL505-GN", // PlayBulb String
    "BTL601",    // PlayBulb Solar
];

/// Logical functions a lamp characteristic can serve
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogicalHandle {
    Name,
    Manufacturer,
    Serial,
    Battery,
    Color,
    Effects,
}

impl LogicalHandle {
    pub const ALL: [LogicalHandle; 6] = [
        LogicalHandle::Name,
        LogicalHandle::Manufacturer,
        LogicalHandle::Serial,
        LogicalHandle::Battery,
        LogicalHandle::Color,
        LogicalHandle::Effects,
    ];

    pub fn uuid(self) -> Uuid {
        match self {
            LogicalHandle::Name => DEVICE_NAME_UUID,
            LogicalHandle::Manufacturer => MANUFACTURER_NAME_UUID,
            LogicalHandle::Serial => SERIAL_NUMBER_UUID,
            LogicalHandle::Battery => BATTERY_LEVEL_UUID,
            LogicalHandle::Color => COLOR_UUID,
            LogicalHandle::Effects => EFFECTS_UUID,
        }
    }

    pub fn from_uuid(uuid: Uuid) -> Option<LogicalHandle> {
        Self::ALL.into_iter().find(|h| h.uuid() == uuid)
    }

    pub fn name(self) -> &'static str {
        match self {
            LogicalHandle::Name => "device name",
            LogicalHandle::Manufacturer => "manufacturer name",
            LogicalHandle::Serial => "serial number",
            LogicalHandle::Battery => "battery level",
            LogicalHandle::Color => "color control (fffc)",
            LogicalHandle::Effects => "color and effects control (fffb)",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// Handles resolved at connect time, invalid once the link is dropped
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CharacteristicMap {
    handles: [Option<u16>; 6],
}

impl CharacteristicMap {
    /// Builds the map from the characteristics a link enumerated. Unknown
    /// UUIDs are ignored; the first match for each logical handle wins.
    pub fn resolve(characteristics: &[DiscoveredCharacteristic]) -> Self {
        let mut map = Self::default();
        for c in characteristics {
            match LogicalHandle::from_uuid(c.uuid) {
                Some(logical) if map.get(logical).is_none() => {
                    debug!("Found {} characteristic at handle {:#06x}", logical.name(), c.handle);
                    map.handles[logical.index()] = Some(c.handle);
                }
                Some(_) => {}
                None => trace!("Ignoring characteristic {}", c.uuid),
            }
        }
        map
    }

    pub fn get(&self, logical: LogicalHandle) -> Option<u16> {
        self.handles[logical.index()]
    }

    pub fn clear(&mut self) {
        self.handles = [None; 6];
    }
}

/// Who the session is (or was last) connected to
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LampIdentity {
    pub interface: u8,
    pub address: String,
    pub manufacturer: Option<String>,
    pub serial: Option<String>,
    pub name: Option<String>,
}

impl LampIdentity {
    pub fn new(interface: u8, address: impl Into<String>) -> Self {
        Self {
            interface,
            address: address.into(),
            ..Default::default()
        }
    }

    /// Both the manufacturer and the serial have to match.
    pub fn is_supported(&self) -> bool {
        self.manufacturer.as_deref() == Some(MANUFACTURER)
            && self
                .serial
                .as_deref()
                .is_some_and(|s| SUPPORTED_SERIALS.contains(&s))
    }
}

/// Decodes a GATT string value, dropping the NUL padding some lamps send.
pub fn decode_string(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw)
        .trim_end_matches('\0')
        .trim()
        .to_string()
}
