/*!
 # Bluetooth transport seam

 The session never talks to a BLE stack directly. It opens a [`Link`] through a
 [`Transport`] and addresses characteristics by the numeric handle the link
 reported during enumeration.
*/

use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::Result;

/// A characteristic as reported by the link during enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveredCharacteristic {
    pub uuid: Uuid,
    pub handle: u16,
}

/// Opens links to a peripheral
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Opens a link to the peripheral with `address` on adapter `interface`.
    /// Gives up with [`Error::DeviceNotFound`] once `timeout` has passed
    /// without the peripheral showing up.
    ///
    /// [`Error::DeviceNotFound`]: crate::Error::DeviceNotFound
    async fn open(
        &self,
        interface: u8,
        address: &str,
        timeout: Duration,
    ) -> Result<Box<dyn Link>>;
}

/// One open BLE connection
#[async_trait]
pub trait Link: Send + Sync {
    async fn characteristics(&self) -> Result<Vec<DiscoveredCharacteristic>>;

    async fn read(&self, handle: u16) -> Result<Vec<u8>>;

    async fn write(&self, handle: u16, data: &[u8]) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;
}
