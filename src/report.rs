/*!
 # Host reporting

 The host sees the lamp as up to four devices ([`Unit`]). Updates are partial
 ([`DeviceUpdate`]) and only reach the host through a [`Reporter`], which drops
 them unless something observable changed.
*/

use std::fmt;

use tracing::{debug, trace};

use crate::state::ColorPayload;

/// Host-side devices fed by one lamp
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Unit {
    /// RGBW switch with brightness
    Switch,
    /// Effect selector
    Effects,
    /// Effect speed dimmer
    Speed,
    /// Optional battery percentage
    Battery,
}

impl Unit {
    pub const ALL: [Unit; 4] = [Unit::Switch, Unit::Effects, Unit::Speed, Unit::Battery];

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Unit::Switch => write!(f, "switch"),
            Unit::Effects => write!(f, "effects"),
            Unit::Speed => write!(f, "speed"),
            Unit::Battery => write!(f, "battery"),
        }
    }
}

/// Battery icon classes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatteryIcon {
    Full,
    Ok,
    Low,
    Empty,
}

impl BatteryIcon {
    pub fn id(self) -> &'static str {
        match self {
            BatteryIcon::Full => "mipowplaybulbfull",
            BatteryIcon::Ok => "mipowplaybulbok",
            BatteryIcon::Low => "mipowplaybulblow",
            BatteryIcon::Empty => "mipowplaybulbempty",
        }
    }
}

/// A partial device update. Absent fields are left as the host has them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceUpdate {
    pub power_on: Option<bool>,
    /// Brightness, selector or dimmer level, or battery percent on the battery unit
    pub level: Option<u8>,
    pub color: Option<ColorPayload>,
    pub timed_out: Option<bool>,
    /// Battery level attached to the device
    pub battery: Option<u8>,
    pub icon: Option<BatteryIcon>,
    /// Send even when nothing changed
    pub forced: bool,
}

impl DeviceUpdate {
    pub fn timed_out() -> Self {
        DeviceUpdate {
            timed_out: Some(true),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == DeviceUpdate::default()
    }
}

/// Receives updates for the host's devices
pub trait StateSink: Send + Sync + 'static {
    fn update_device(&self, unit: Unit, update: &DeviceUpdate);
}

/// Last values reported for one unit
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceRecord {
    pub power_on: bool,
    pub level: u8,
    pub color: Option<ColorPayload>,
    pub timed_out: bool,
    pub battery: Option<u8>,
    pub icon: Option<BatteryIcon>,
}

impl DeviceRecord {
    /// Folds `update` in and returns the fields that actually differ.
    fn merge(&mut self, update: &DeviceUpdate) -> DeviceUpdate {
        let mut changed = DeviceUpdate {
            forced: update.forced,
            ..Default::default()
        };

        if let Some(v) = update.power_on.filter(|v| *v != self.power_on) {
            self.power_on = v;
            changed.power_on = Some(v);
        }
        if let Some(v) = update.level.filter(|v| *v != self.level) {
            self.level = v;
            changed.level = Some(v);
        }
        if let Some(v) = update.color.filter(|v| Some(*v) != self.color) {
            self.color = Some(v);
            changed.color = Some(v);
        }
        if let Some(v) = update.timed_out.filter(|v| *v != self.timed_out) {
            self.timed_out = v;
            changed.timed_out = Some(v);
        }
        if let Some(v) = update.battery.filter(|v| Some(*v) != self.battery) {
            self.battery = Some(v);
            changed.battery = Some(v);
        }
        if let Some(v) = update.icon.filter(|v| Some(*v) != self.icon) {
            self.icon = Some(v);
            changed.icon = Some(v);
        }

        changed
    }
}

/// Change-detection gate in front of a [`StateSink`]
pub struct Reporter<S> {
    sink: S,
    records: [DeviceRecord; 4],
    battery_device: bool,
}

impl<S: StateSink> Reporter<S> {
    pub fn new(sink: S, battery_device: bool) -> Self {
        Reporter {
            sink,
            records: Default::default(),
            battery_device,
        }
    }

    /// Seeds the last-reported values, e.g. from what the host persisted.
    pub fn seed(&mut self, unit: Unit, record: DeviceRecord) {
        self.records[unit.index()] = record;
    }

    pub fn record(&self, unit: Unit) -> &DeviceRecord {
        &self.records[unit.index()]
    }

    /// Sends the part of `update` that changed. Returns whether the sink was
    /// called.
    pub fn report(&mut self, unit: Unit, update: DeviceUpdate) -> bool {
        if unit == Unit::Battery && !self.battery_device {
            trace!("No battery device, dropping update");
            return false;
        }

        let changed = self.records[unit.index()].merge(&update);
        let send = changed.forced || !changed.is_empty();
        debug!("Change in {} device = {}", unit, send);

        if send {
            self.sink.update_device(unit, &changed);
        }
        send
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingSink;

    #[test]
    fn test_change_detection() {
        let sink = RecordingSink::default();
        let mut reporter = Reporter::new(sink.clone(), false);

        let on = DeviceUpdate {
            power_on: Some(true),
            level: Some(80),
            timed_out: Some(false),
            ..Default::default()
        };

        assert!(reporter.report(Unit::Switch, on.clone()));
        assert!(!reporter.report(Unit::Switch, on.clone()));

        // only the changed field is passed on
        assert!(reporter.report(
            Unit::Switch,
            DeviceUpdate {
                level: Some(40),
                ..on.clone()
            }
        ));

        let updates = sink.updates();
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].0, Unit::Switch);
        assert_eq!(updates[0].1.power_on, Some(true));
        assert_eq!(updates[0].1.timed_out, None);
        assert_eq!(
            updates[1].1,
            DeviceUpdate {
                level: Some(40),
                ..Default::default()
            }
        );
        assert_eq!(reporter.record(Unit::Switch).level, 40);
    }

    #[test]
    fn test_forced_update() {
        let sink = RecordingSink::default();
        let mut reporter = Reporter::new(sink.clone(), false);

        let poll = DeviceUpdate {
            battery: Some(90),
            forced: true,
            ..Default::default()
        };
        assert!(reporter.report(Unit::Switch, poll.clone()));
        assert!(reporter.report(Unit::Switch, poll));
        assert_eq!(sink.updates().len(), 2);
        assert_eq!(sink.updates()[1].1.battery, None);
    }

    #[test]
    fn test_battery_device_disabled() {
        let sink = RecordingSink::default();
        let mut reporter = Reporter::new(sink.clone(), false);
        assert!(!reporter.report(Unit::Battery, DeviceUpdate::timed_out()));
        assert!(sink.updates().is_empty());

        let mut reporter = Reporter::new(sink.clone(), true);
        assert!(reporter.report(Unit::Battery, DeviceUpdate::timed_out()));
        assert_eq!(sink.updates().len(), 1);
    }
}
