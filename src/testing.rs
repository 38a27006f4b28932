//! In-memory lamp and host used by the unit tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::characteristics::{
    BATTERY_LEVEL_UUID, COLOR_UUID, DEVICE_NAME_UUID, EFFECTS_UUID, MANUFACTURER,
    MANUFACTURER_NAME_UUID, SERIAL_NUMBER_UUID,
};
use crate::report::{DeviceUpdate, StateSink, Unit};
use crate::transport::{DiscoveredCharacteristic, Link, Transport};
use crate::{Error, Result};

pub const NAME: u16 = 0x03;
pub const MANUFACTURER_NAME: u16 = 0x0b;
pub const SERIAL: u16 = 0x0d;
pub const BATTERY: u16 = 0x1f;
pub const EFFECTS: u16 = 0x23;
pub const COLOR: u16 = 0x25;

/// One BLE operation seen by the fake
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    Open,
    Read(u16),
    Write(u16, Vec<u8>),
    Disconnect,
}

#[derive(Default)]
struct FakeLamp {
    fail_open: bool,
    /// Never shows up in a scan
    out_of_range: bool,
    open_budgets: Vec<Duration>,
    fail_writes: bool,
    fail_reads: bool,
    characteristics: Vec<DiscoveredCharacteristic>,
    values: HashMap<u16, Vec<u8>>,
    ops: Vec<Op>,
}

/// Scripted transport that records every operation
#[derive(Clone, Default)]
pub struct FakeTransport {
    lamp: Arc<Mutex<FakeLamp>>,
}

impl FakeTransport {
    /// A supported BTL300, switched off, battery at 80%.
    pub fn playbulb() -> Self {
        let fake = FakeTransport::default();
        {
            let mut lamp = fake.lamp.lock();
            lamp.characteristics = vec![
                DiscoveredCharacteristic {
                    uuid: DEVICE_NAME_UUID,
                    handle: NAME,
                },
                DiscoveredCharacteristic {
                    uuid: MANUFACTURER_NAME_UUID,
                    handle: MANUFACTURER_NAME,
                },
                DiscoveredCharacteristic {
                    uuid: SERIAL_NUMBER_UUID,
                    handle: SERIAL,
                },
                DiscoveredCharacteristic {
                    uuid: BATTERY_LEVEL_UUID,
                    handle: BATTERY,
                },
                DiscoveredCharacteristic {
                    uuid: EFFECTS_UUID,
                    handle: EFFECTS,
                },
                DiscoveredCharacteristic {
                    uuid: COLOR_UUID,
                    handle: COLOR,
                },
            ];
            lamp.values.insert(NAME, b"PLAYBULB CANDLE\0".to_vec());
            lamp.values
                .insert(MANUFACTURER_NAME, MANUFACTURER.as_bytes().to_vec());
            lamp.values.insert(SERIAL, b"BTL300".to_vec());
            lamp.values.insert(BATTERY, vec![80]);
            lamp.values.insert(COLOR, vec![0, 0, 0, 0]);
            lamp.values.insert(EFFECTS, vec![0, 0, 0, 0, 255, 0, 1, 1]);
        }
        fake
    }

    pub fn unreachable() -> Self {
        let fake = Self::playbulb();
        fake.lamp.lock().fail_open = true;
        fake
    }

    pub fn set_value(&self, handle: u16, value: Vec<u8>) {
        self.lamp.lock().values.insert(handle, value);
    }

    pub fn set_serial(&self, serial: &str) {
        self.set_value(SERIAL, serial.as_bytes().to_vec());
    }

    pub fn remove_characteristic(&self, handle: u16) {
        self.lamp
            .lock()
            .characteristics
            .retain(|c| c.handle != handle);
    }

    pub fn set_fail_open(&self, fail: bool) {
        self.lamp.lock().fail_open = fail;
    }

    /// Scans run out their whole budget, like a lamp nobody can hear.
    pub fn set_out_of_range(&self, out: bool) {
        self.lamp.lock().out_of_range = out;
    }

    /// Timeouts handed to every `open`
    pub fn open_budgets(&self) -> Vec<Duration> {
        self.lamp.lock().open_budgets.clone()
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.lamp.lock().fail_writes = fail;
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.lamp.lock().fail_reads = fail;
    }

    pub fn ops(&self) -> Vec<Op> {
        self.lamp.lock().ops.clone()
    }

    pub fn clear_ops(&self) {
        self.lamp.lock().ops.clear();
    }

    pub fn opens(&self) -> usize {
        self.ops().iter().filter(|op| **op == Op::Open).count()
    }

    /// Attempted writes, failed ones included
    pub fn writes(&self) -> Vec<(u16, Vec<u8>)> {
        self.ops()
            .into_iter()
            .filter_map(|op| match op {
                Op::Write(h, data) => Some((h, data)),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn open(
        &self,
        _interface: u8,
        address: &str,
        timeout: Duration,
    ) -> Result<Box<dyn Link>> {
        let out_of_range = {
            let mut lamp = self.lamp.lock();
            lamp.ops.push(Op::Open);
            lamp.open_budgets.push(timeout);
            lamp.out_of_range
        };
        if out_of_range {
            tokio::time::sleep(timeout).await;
            return Err(Error::DeviceNotFound(address.to_string()));
        }

        let lamp = self.lamp.lock();
        if lamp.fail_open {
            return Err(Error::Connection("device unreachable".into()));
        }
        Ok(Box::new(FakeLink {
            lamp: self.lamp.clone(),
        }))
    }
}

struct FakeLink {
    lamp: Arc<Mutex<FakeLamp>>,
}

#[async_trait]
impl Link for FakeLink {
    async fn characteristics(&self) -> Result<Vec<DiscoveredCharacteristic>> {
        Ok(self.lamp.lock().characteristics.clone())
    }

    async fn read(&self, handle: u16) -> Result<Vec<u8>> {
        let mut lamp = self.lamp.lock();
        lamp.ops.push(Op::Read(handle));
        if lamp.fail_reads {
            return Err(Error::Read("device went away".into()));
        }
        lamp.values
            .get(&handle)
            .cloned()
            .ok_or_else(|| Error::Read(format!("no value at {handle:#06x}")))
    }

    async fn write(&self, handle: u16, data: &[u8]) -> Result<()> {
        let mut lamp = self.lamp.lock();
        lamp.ops.push(Op::Write(handle, data.to_vec()));
        if lamp.fail_writes {
            return Err(Error::Write("device went away".into()));
        }
        lamp.values.insert(handle, data.to_vec());
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.lamp.lock().ops.push(Op::Disconnect);
        Ok(())
    }
}

/// Host stand-in that keeps every update it gets
#[derive(Clone, Default)]
pub struct RecordingSink {
    updates: Arc<Mutex<Vec<(Unit, DeviceUpdate)>>>,
}

impl RecordingSink {
    pub fn updates(&self) -> Vec<(Unit, DeviceUpdate)> {
        self.updates.lock().clone()
    }

    pub fn for_unit(&self, unit: Unit) -> Vec<DeviceUpdate> {
        self.updates()
            .into_iter()
            .filter(|(u, _)| *u == unit)
            .map(|(_, update)| update)
            .collect()
    }
}

impl StateSink for RecordingSink {
    fn update_device(&self, unit: Unit, update: &DeviceUpdate) {
        self.updates.lock().push((unit, update.clone()));
    }
}
