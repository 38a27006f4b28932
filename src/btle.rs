//! [`Transport`] backed by btleplug.

use async_trait::async_trait;
use btleplug::api::{
    CharPropFlags, Central, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use std::time::Duration;
use tokio::time::{self, Instant};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::transport::{DiscoveredCharacteristic, Link, Transport};
use crate::{Error, Result};

/// Pause between two looks at the scan results
const SCAN_POLL: Duration = Duration::from_millis(500);

/// Gets the Bluetooth adapter at `interface` (hci0, hci1...)
#[instrument(skip(manager))]
async fn get_central(manager: &Manager, interface: u8) -> Result<Adapter> {
    debug!("Getting Bluetooth adapter {}", interface);
    let adapters = manager.adapters().await?;
    if adapters.is_empty() {
        error!("No Bluetooth adapters found");
        return Err(Error::NoBluetoothAdapters);
    }

    match adapters.into_iter().nth(interface as usize) {
        Some(adapter) => Ok(adapter),
        None => {
            error!("No Bluetooth adapter at index {}", interface);
            Err(Error::NoBluetoothAdapters)
        }
    }
}

/// A running scan. Dropping it without [`stop`](Scan::stop), e.g. when the
/// caller's timeout cancels `open`, still stops the scan in the background.
struct Scan {
    central: Adapter,
    stopped: bool,
}

impl Scan {
    async fn start(central: &Adapter) -> Result<Scan> {
        central.start_scan(ScanFilter::default()).await?;
        Ok(Scan {
            central: central.clone(),
            stopped: false,
        })
    }

    async fn stop(mut self) {
        self.stopped = true;
        if let Err(e) = self.central.stop_scan().await {
            warn!("Could not stop scanning: {}", e);
        }
    }
}

impl Drop for Scan {
    fn drop(&mut self) {
        if self.stopped {
            return;
        }
        debug!("Scan abandoned, stopping it");
        let central = self.central.clone();
        if let Ok(rt) = tokio::runtime::Handle::try_current() {
            rt.spawn(async move {
                if let Err(e) = central.stop_scan().await {
                    warn!("Could not stop scanning: {}", e);
                }
            });
        }
    }
}

/// Looks for a peripheral with `address` in the scan results until
/// `deadline`.
async fn find_peripheral(
    central: &Adapter,
    address: &str,
    deadline: Instant,
) -> Result<Peripheral> {
    loop {
        let peripherals = central.peripherals().await?;
        trace!("Found {} BLE peripherals so far", peripherals.len());

        for p in peripherals {
            if p.address().to_string().eq_ignore_ascii_case(address)
                || p.id().to_string().eq_ignore_ascii_case(address)
            {
                debug!("Found device {}", address);
                return Ok(p);
            }
        }

        let now = Instant::now();
        if now >= deadline {
            error!("No device {} seen while scanning", address);
            return Err(Error::DeviceNotFound(address.to_string()));
        }
        trace!(
            "Still scanning for {}... ({:?} remaining)",
            address,
            deadline - now
        );
        time::sleep(SCAN_POLL.min(deadline - now)).await;
    }
}

/// Opens links through the system Bluetooth stack
#[derive(Debug, Default, Clone)]
pub struct BtleTransport;

impl BtleTransport {
    pub fn new() -> Self {
        BtleTransport
    }
}

#[async_trait]
impl Transport for BtleTransport {
    #[instrument(skip(self))]
    async fn open(
        &self,
        interface: u8,
        address: &str,
        timeout: Duration,
    ) -> Result<Box<dyn Link>> {
        let deadline = Instant::now() + timeout;
        let manager = Manager::new().await?;
        let central = get_central(&manager, interface).await?;

        debug!("Scanning for {}", address);
        let scan = Scan::start(&central).await?;
        let found = find_peripheral(&central, address, deadline).await;
        scan.stop().await;
        let peripheral = found?;

        info!("Connecting to device...");
        if !peripheral.is_connected().await? {
            peripheral.connect().await?;
        }

        debug!("Discovering services...");
        peripheral.discover_services().await?;
        let characteristics: Vec<Characteristic> =
            peripheral.characteristics().into_iter().collect();
        debug!("Device exposes {} characteristics", characteristics.len());

        Ok(Box::new(BtleLink {
            peripheral,
            characteristics,
        }))
    }
}

/// An open connection. Handles are positions in `characteristics`.
struct BtleLink {
    peripheral: Peripheral,
    characteristics: Vec<Characteristic>,
}

impl BtleLink {
    fn characteristic(&self, handle: u16) -> Result<&Characteristic> {
        self.characteristics
            .get(handle as usize)
            .ok_or_else(|| Error::Connection(format!("unknown handle {handle:#06x}")))
    }
}

#[async_trait]
impl Link for BtleLink {
    async fn characteristics(&self) -> Result<Vec<DiscoveredCharacteristic>> {
        Ok(self
            .characteristics
            .iter()
            .enumerate()
            .map(|(i, c)| DiscoveredCharacteristic {
                uuid: c.uuid,
                handle: i as u16,
            })
            .collect())
    }

    async fn read(&self, handle: u16) -> Result<Vec<u8>> {
        let characteristic = self.characteristic(handle)?;
        Ok(self.peripheral.read(characteristic).await?)
    }

    async fn write(&self, handle: u16, data: &[u8]) -> Result<()> {
        let characteristic = self.characteristic(handle)?;

        // Prefer WriteWithResponse when supported
        let write_type = if characteristic.properties.contains(CharPropFlags::WRITE) {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };
        Ok(self.peripheral.write(characteristic, data, write_type).await?)
    }

    async fn disconnect(&self) -> Result<()> {
        if self.peripheral.is_connected().await? {
            self.peripheral.disconnect().await?;
        } else {
            warn!("Peripheral already disconnected");
        }
        Ok(())
    }
}
