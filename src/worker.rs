/*!
 # Task worker

 The only code that touches the [`DeviceSession`]. It drains the [`TaskQueue`]
 one task at a time, so no two BLE operations ever overlap, and turns every
 outcome into host updates. Errors never escape: a failed task marks the
 matching host device as timed out and the worker moves on.

 [`TaskQueue`]: crate::queue::TaskQueue
*/

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::time;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{CONNECT_TIMEOUT, DISCOVERY_TIMEOUT};
use crate::effects::{self, EFFECTS};
use crate::queue::{Task, TaskReceiver};
use crate::reconciler;
use crate::report::{DeviceRecord, DeviceUpdate, Reporter, StateSink, Unit};
use crate::session::DeviceSession;
use crate::state::{ColorPayload, EffectFrame, LampState, Rgbw, BATTERY_UNKNOWN};
use crate::transport::Transport;

/// The lamp drops effect and speed when it powers up; they are sent again
/// after this pause.
pub const SETTLE_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WorkerState {
    #[default]
    Running,
    /// Shutdown seen, closing the link
    Draining,
    Stopped,
}

#[derive(Debug, Default, Clone, Copy)]
struct StatusInner {
    state: WorkerState,
    power_on: bool,
    reconnected: bool,
}

/// What producers may read about the worker. Written only by the worker,
/// after a task completes.
#[derive(Debug, Default)]
pub struct WorkerStatus {
    inner: RwLock<StatusInner>,
}

impl WorkerStatus {
    pub fn state(&self) -> WorkerState {
        self.inner.read().state
    }

    /// Power state last reported to the host
    pub fn power_on(&self) -> bool {
        self.inner.read().power_on
    }

    /// Returns and clears the reconnect flag.
    pub fn take_reconnected(&self) -> bool {
        std::mem::take(&mut self.inner.write().reconnected)
    }

    fn set_state(&self, state: WorkerState) {
        self.inner.write().state = state;
    }
}

/// Last commanded lamp settings, replayed on init and power-on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Desired {
    pub power: bool,
    pub color: Rgbw,
    /// Brightness percent the color was scaled to
    pub level: u8,
    pub effect: u8,
    pub speed: u8,
}

impl Default for Desired {
    fn default() -> Self {
        Desired {
            power: false,
            color: Rgbw::OFF,
            level: 0,
            effect: effects::OFF,
            speed: 1,
        }
    }
}

pub struct Worker<T, S> {
    session: DeviceSession<T>,
    reporter: Reporter<S>,
    rx: TaskReceiver,
    status: Arc<WorkerStatus>,
    desired: Desired,
}

impl<T: Transport, S: StateSink> Worker<T, S> {
    pub fn new(
        session: DeviceSession<T>,
        reporter: Reporter<S>,
        rx: TaskReceiver,
        status: Arc<WorkerStatus>,
    ) -> Self {
        Worker {
            session,
            reporter,
            rx,
            status,
            desired: Desired::default(),
        }
    }

    pub fn with_desired(mut self, desired: Desired) -> Self {
        self.desired = desired;
        self
    }

    /// Seeds the last commanded settings, what the session believes, and what
    /// the host last showed. Only meaningful before [`run`](Self::run).
    pub fn restore(&mut self, desired: Desired, records: Vec<(Unit, DeviceRecord)>) {
        self.desired = desired;
        self.session.seed_state(LampState {
            power: desired.power,
            color: if desired.power {
                desired.color
            } else {
                Rgbw::OFF
            },
            effect: desired.effect,
            speed: desired.speed,
            battery: BATTERY_UNKNOWN,
        });
        for (unit, record) in records {
            self.reporter.seed(unit, record);
        }
        self.publish();
    }

    pub fn session(&self) -> &DeviceSession<T> {
        &self.session
    }

    pub fn desired(&self) -> &Desired {
        &self.desired
    }

    pub fn reporter(&self) -> &Reporter<S> {
        &self.reporter
    }

    /// Handles tasks in order until a shutdown task arrives or every
    /// producer is gone.
    #[instrument(skip(self), name = "worker")]
    pub async fn run(&mut self) {
        debug!("Entering tasks handler");
        self.status.set_state(WorkerState::Running);

        while let Some(task) = self.rx.recv().await {
            if task == Task::Shutdown {
                debug!("Shutdown requested, exiting tasks handler");
                self.status.set_state(WorkerState::Draining);
                self.session.disconnect().await;
                self.rx.task_done();
                break;
            }

            let action = task.action();
            debug!("Handling task '{}'", action);
            self.dispatch(task).await;
            self.publish();
            self.rx.task_done();
            debug!("Finished handling task '{}'", action);
        }

        self.session.disconnect().await;
        self.status.set_state(WorkerState::Stopped);
    }

    fn publish(&mut self) {
        if self.session.is_connected() {
            self.session.set_timeout(CONNECT_TIMEOUT);
        }
        let reconnected = self.session.take_reconnected();
        let mut status = self.status.inner.write();
        status.power_on = self.reporter.record(Unit::Switch).power_on;
        status.reconnected |= reconnected;
    }

    async fn dispatch(&mut self, task: Task) {
        match task {
            Task::Init => self.init().await,
            Task::On => self.on().await,
            Task::Off { forced } => self.off(forced).await,
            Task::SetColor { color, level } => self.set_color(color, level).await,
            Task::SetLevel { level, color } => self.set_level(level, color).await,
            Task::SetEffect { effect } => self.set_effect(effect).await,
            Task::SetSpeed { speed, level } => self.set_speed(speed, level).await,
            Task::GetBattery => self.get_battery().await,
            // handled by `run`
            Task::Shutdown => {}
        }
    }

    fn effect_frame(&self) -> EffectFrame {
        EffectFrame {
            color: self.session.state().color,
            effect: self.desired.effect,
            speed: self.desired.speed,
        }
    }

    fn report_switch(&mut self, ok: bool, update: DeviceUpdate) {
        let update = if ok {
            DeviceUpdate {
                timed_out: Some(false),
                ..update
            }
        } else {
            DeviceUpdate::timed_out()
        };
        self.reporter.report(Unit::Switch, update);
    }

    async fn init(&mut self) {
        self.session.set_timeout(DISCOVERY_TIMEOUT);
        if let Err(e) = self.session.connect(DISCOVERY_TIMEOUT).await {
            error!("Unable to reach the lamp, will retry on next command: {}", e);
            self.reporter.report(Unit::Switch, DeviceUpdate::timed_out());
            return;
        }
        self.session.set_timeout(CONNECT_TIMEOUT);
        self.reset_lamp().await;
    }

    /// Brings the lamp back to the last commanded state.
    async fn reset_lamp(&mut self) {
        info!(
            "Restoring lamp: power {}, color {:?}, effect {}, speed {}",
            self.desired.power,
            self.desired.color,
            EFFECTS.name(self.desired.effect),
            self.desired.speed
        );

        let frame = self.effect_frame();
        if let Err(e) = self.session.write_effect(frame).await {
            warn!("Could not restore effect: {}", e);
        }

        let color = if self.desired.power {
            self.desired.color
        } else {
            Rgbw::OFF
        };
        let ok = self.session.write_color(color).await.is_ok();

        if let Err(e) = self.session.read_state().await {
            warn!("Could not read lamp state: {}", e);
        }
        self.report_switch(ok, DeviceUpdate::default());
    }

    async fn on(&mut self) {
        if self.session.write_color(self.desired.color).await.is_err() {
            self.report_switch(false, DeviceUpdate::default());
            return;
        }
        self.desired.power = true;
        self.report_switch(
            true,
            DeviceUpdate {
                power_on: Some(true),
                ..Default::default()
            },
        );

        time::sleep(SETTLE_DELAY).await;
        let frame = self.effect_frame();
        if let Err(e) = self.session.write_effect(frame).await {
            warn!("Could not re-assert effect after power on: {}", e);
        }
    }

    async fn off(&mut self, forced: bool) {
        let already_off = self.session.is_connected() && self.session.state().color.is_off();
        let ok = if already_off && !forced {
            debug!("Lamp already off, nothing to write");
            true
        } else {
            self.session.write_color(Rgbw::OFF).await.is_ok()
        };

        if ok {
            self.desired.power = false;
        }
        self.report_switch(
            ok,
            DeviceUpdate {
                power_on: Some(false),
                ..Default::default()
            },
        );
    }

    async fn set_color(&mut self, payload: ColorPayload, level: u8) {
        let color = match reconciler::scale_color(&payload, level) {
            Ok(color) => color,
            Err(e) => {
                error!("Dropping 'Set Color': {}", e);
                return;
            }
        };
        self.desired.color = color;
        self.desired.level = level;

        let ok = self.session.write_color(color).await.is_ok();
        if ok {
            self.desired.power = true;
        }
        self.report_switch(
            ok,
            DeviceUpdate {
                power_on: Some(true),
                level: Some(level),
                color: Some(payload),
                ..Default::default()
            },
        );
    }

    async fn set_level(&mut self, level: u8, payload: Option<ColorPayload>) {
        let from = self.reporter.record(Unit::Switch).level;
        self.desired.color = reconciler::rescale(self.desired.color, from, level);
        self.desired.level = level;
        debug!("Brightness {}% -> {}%: {:?}", from, level, self.desired.color);

        let ok = self.session.write_color(self.desired.color).await.is_ok();
        if ok {
            self.desired.power = true;
        }
        self.report_switch(
            ok,
            DeviceUpdate {
                power_on: Some(true),
                level: Some(level),
                color: payload,
                ..Default::default()
            },
        );
    }

    async fn set_effect(&mut self, effect: u8) {
        self.desired.effect = effect;
        debug!("Setting effect '{}'", EFFECTS.name(effect));

        let frame = self.effect_frame();
        let update = match self.session.write_effect(frame).await {
            Ok(()) => DeviceUpdate {
                power_on: Some(effect != effects::OFF),
                level: Some(reconciler::selector_from_effect(effect)),
                timed_out: Some(false),
                ..Default::default()
            },
            Err(_) => DeviceUpdate::timed_out(),
        };
        self.reporter.report(Unit::Effects, update);
    }

    async fn set_speed(&mut self, speed: u8, level: u8) {
        self.desired.speed = speed;

        let frame = self.effect_frame();
        let update = match self.session.write_effect(frame).await {
            Ok(()) => DeviceUpdate {
                power_on: Some(speed != 0),
                level: Some(level),
                timed_out: Some(false),
                ..Default::default()
            },
            Err(_) => DeviceUpdate::timed_out(),
        };
        self.reporter.report(Unit::Speed, update);
    }

    async fn get_battery(&mut self) {
        let battery = match self.session.read_state().await {
            Ok(state) => state.battery,
            Err(_) => {
                self.reporter.report(Unit::Switch, DeviceUpdate::timed_out());
                self.reporter.report(Unit::Battery, DeviceUpdate::timed_out());
                return;
            }
        };
        info!("Battery level {}%", battery);

        self.reporter.report(
            Unit::Switch,
            DeviceUpdate {
                battery: Some(battery),
                timed_out: Some(false),
                forced: true,
                ..Default::default()
            },
        );

        if battery != BATTERY_UNKNOWN {
            self.reporter.report(
                Unit::Battery,
                DeviceUpdate {
                    level: Some(battery),
                    icon: reconciler::battery_icon(battery),
                    timed_out: Some(false),
                    ..Default::default()
                },
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{self, TaskQueue};
    use crate::report::BatteryIcon;
    use crate::testing::{FakeTransport, Op, RecordingSink, BATTERY, COLOR, EFFECTS};
    use tokio::time::Instant;

    fn setup(
        fake: &FakeTransport,
        battery_device: bool,
    ) -> (Worker<FakeTransport, RecordingSink>, TaskQueue, RecordingSink) {
        let (queue, rx) = queue::channel();
        let sink = RecordingSink::default();
        let session = DeviceSession::new(fake.clone(), 0, "AA:BB:CC:DD:EE:FF");
        let worker = Worker::new(
            session,
            Reporter::new(sink.clone(), battery_device),
            rx,
            Arc::new(WorkerStatus::default()),
        );
        (worker, queue, sink)
    }

    async fn run_all(
        worker: &mut Worker<FakeTransport, RecordingSink>,
        queue: &TaskQueue,
        tasks: Vec<Task>,
    ) {
        for task in tasks {
            queue.enqueue(task).unwrap();
        }
        queue.enqueue(Task::Shutdown).unwrap();
        worker.run().await;
        assert_eq!(queue.pending(), 0);
    }

    fn red() -> ColorPayload {
        ColorPayload {
            mode: 3,
            red: 200,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let fake = FakeTransport::playbulb();
        let (mut worker, queue, _) = setup(&fake, false);

        let other = queue.clone();
        queue.enqueue(Task::Off { forced: false }).unwrap();
        other.enqueue(Task::SetEffect { effect: 3 }).unwrap();
        queue.enqueue(Task::GetBattery).unwrap();
        other.enqueue(Task::Shutdown).unwrap();
        worker.run().await;

        let ops = fake.ops();
        let first_write = ops
            .iter()
            .position(|op| matches!(op, Op::Write(..)))
            .unwrap();
        assert_eq!(
            ops[first_write..],
            [
                Op::Write(COLOR, vec![0, 0, 0, 0]),
                Op::Write(EFFECTS, vec![0, 0, 0, 0, 3, 0, 1, 1]),
                Op::Read(COLOR),
                Op::Read(EFFECTS),
                Op::Read(BATTERY),
                Op::Disconnect,
            ]
        );
        assert_eq!(worker.status.state(), WorkerState::Stopped);
    }

    #[tokio::test]
    async fn test_second_off_writes_nothing() {
        let fake = FakeTransport::playbulb();
        let (mut worker, queue, sink) = setup(&fake, false);

        run_all(
            &mut worker,
            &queue,
            vec![Task::Off { forced: false }, Task::Off { forced: false }],
        )
        .await;
        assert_eq!(fake.writes().len(), 1);
        // the host already had the lamp as off
        assert!(sink.for_unit(Unit::Switch).is_empty());

        let fake = FakeTransport::playbulb();
        let (mut worker, queue, _) = setup(&fake, false);
        run_all(
            &mut worker,
            &queue,
            vec![Task::Off { forced: false }, Task::Off { forced: true }],
        )
        .await;
        assert_eq!(fake.writes().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_on_reasserts_effect_after_settling() {
        let fake = FakeTransport::playbulb();
        let (worker, queue, sink) = setup(&fake, false);
        let color = Rgbw {
            white: 5,
            red: 100,
            green: 0,
            blue: 50,
        };
        let mut worker = worker.with_desired(Desired {
            power: false,
            color,
            level: 100,
            effect: 4,
            speed: 20,
        });

        let start = Instant::now();
        run_all(&mut worker, &queue, vec![Task::On]).await;
        assert!(start.elapsed() >= SETTLE_DELAY);

        assert_eq!(
            fake.writes(),
            vec![
                (COLOR, vec![5, 100, 0, 50]),
                (EFFECTS, vec![5, 100, 0, 50, 4, 0, 20, 20]),
            ]
        );
        assert_eq!(
            sink.for_unit(Unit::Switch),
            vec![DeviceUpdate {
                power_on: Some(true),
                ..Default::default()
            }]
        );
        assert!(worker.desired().power);
        assert!(worker.status.power_on());
    }

    #[tokio::test]
    async fn test_set_color_and_level() {
        let fake = FakeTransport::playbulb();
        let (mut worker, queue, sink) = setup(&fake, false);

        run_all(
            &mut worker,
            &queue,
            vec![
                Task::SetColor {
                    color: red(),
                    level: 100,
                },
                Task::SetLevel {
                    level: 50,
                    color: None,
                },
            ],
        )
        .await;

        assert_eq!(
            fake.writes(),
            vec![(COLOR, vec![0, 200, 0, 0]), (COLOR, vec![0, 100, 0, 0])]
        );
        let updates = sink.for_unit(Unit::Switch);
        assert_eq!(updates[0].color, Some(red()));
        assert_eq!(updates[0].level, Some(100));
        assert_eq!(updates[1].level, Some(50));
        assert_eq!(worker.desired().level, 50);
    }

    #[tokio::test]
    async fn test_invalid_color_mode_writes_nothing() {
        let fake = FakeTransport::playbulb();
        let (mut worker, queue, sink) = setup(&fake, false);

        let bad = ColorPayload { mode: 2, ..red() };
        run_all(
            &mut worker,
            &queue,
            vec![
                Task::SetColor {
                    color: bad,
                    level: 100,
                },
                Task::GetBattery,
            ],
        )
        .await;

        assert!(fake.writes().is_empty());
        assert!(sink
            .for_unit(Unit::Switch)
            .iter()
            .all(|u| u.color.is_none()));
        // the worker carried on with the next task
        assert!(fake.ops().contains(&Op::Read(BATTERY)));
    }

    #[tokio::test]
    async fn test_effect_and_speed_reports() {
        let fake = FakeTransport::playbulb();
        let (mut worker, queue, sink) = setup(&fake, false);

        run_all(
            &mut worker,
            &queue,
            vec![
                Task::SetEffect { effect: 3 },
                Task::SetSpeed {
                    speed: reconciler::speed_from_level(100),
                    level: 100,
                },
                Task::SetEffect {
                    effect: effects::OFF,
                },
            ],
        )
        .await;

        let effects_updates = sink.for_unit(Unit::Effects);
        assert_eq!(effects_updates[0].level, Some(40));
        assert_eq!(effects_updates[0].power_on, Some(true));
        assert_eq!(effects_updates[1].level, Some(0));
        assert_eq!(effects_updates[1].power_on, Some(false));

        let speed_updates = sink.for_unit(Unit::Speed);
        assert_eq!(speed_updates[0].level, Some(100));
        assert_eq!(
            fake.writes()[1],
            (EFFECTS, vec![0, 0, 0, 0, 3, 0, 1, 1])
        );
    }

    #[tokio::test]
    async fn test_battery_poll() {
        let fake = FakeTransport::playbulb();
        fake.set_value(BATTERY, vec![60]);
        let (mut worker, queue, sink) = setup(&fake, true);

        run_all(&mut worker, &queue, vec![Task::GetBattery, Task::GetBattery]).await;

        // forced, so the switch hears about it both times
        let switch = sink.for_unit(Unit::Switch);
        assert_eq!(switch.len(), 2);
        assert_eq!(switch[0].battery, Some(60));
        assert!(switch[1].forced);

        assert_eq!(
            sink.for_unit(Unit::Battery),
            vec![DeviceUpdate {
                level: Some(60),
                icon: Some(BatteryIcon::Ok),
                ..Default::default()
            }]
        );
    }

    #[tokio::test]
    async fn test_unknown_battery_leaves_icon() {
        let fake = FakeTransport::playbulb();
        fake.remove_characteristic(BATTERY);
        let (mut worker, queue, sink) = setup(&fake, true);

        run_all(&mut worker, &queue, vec![Task::GetBattery]).await;
        assert_eq!(sink.for_unit(Unit::Switch)[0].battery, Some(BATTERY_UNKNOWN));
        assert!(sink.for_unit(Unit::Battery).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_flag_timed_out_and_continue() {
        let fake = FakeTransport::unreachable();
        let (mut worker, queue, sink) = setup(&fake, true);
        let before = *worker.session().state();

        run_all(
            &mut worker,
            &queue,
            vec![
                Task::On,
                Task::SetEffect { effect: 1 },
                Task::GetBattery,
            ],
        )
        .await;

        assert_eq!(sink.for_unit(Unit::Switch), vec![DeviceUpdate::timed_out()]);
        assert_eq!(sink.for_unit(Unit::Effects), vec![DeviceUpdate::timed_out()]);
        assert_eq!(sink.for_unit(Unit::Battery), vec![DeviceUpdate::timed_out()]);
        assert_eq!(*worker.session().state(), before);
        assert!(!worker.desired().power);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_failure() {
        let fake = FakeTransport::playbulb();
        let (mut worker, queue, sink) = setup(&fake, false);
        let status = worker.status.clone();

        run_all(&mut worker, &queue, vec![Task::GetBattery]).await;
        assert!(!status.take_reconnected());

        // Each run gets a fresh queue, the session carries over.
        fake.set_fail_reads(true);
        let (queue, rx) = queue::channel();
        worker.rx = rx;
        run_all(&mut worker, &queue, vec![Task::GetBattery]).await;
        assert!(!status.take_reconnected());

        fake.set_fail_reads(false);
        let (queue, rx) = queue::channel();
        worker.rx = rx;
        run_all(&mut worker, &queue, vec![Task::GetBattery]).await;

        let switch = sink.for_unit(Unit::Switch);
        assert_eq!(switch.len(), 3);
        assert_eq!(switch[0].battery, Some(80));
        assert_eq!(switch[1], DeviceUpdate::timed_out());
        assert_eq!(switch[2].timed_out, Some(false));
        assert!(status.take_reconnected());
        assert!(!status.take_reconnected());
    }

    #[tokio::test]
    async fn test_init_replays_last_state() {
        let fake = FakeTransport::playbulb();
        fake.set_value(COLOR, vec![1, 1, 1, 1]);
        let (worker, queue, sink) = setup(&fake, false);
        let mut worker = worker.with_desired(Desired {
            power: true,
            color: Rgbw {
                white: 0,
                red: 10,
                green: 20,
                blue: 30,
            },
            level: 50,
            effect: 2,
            speed: 30,
        });

        run_all(&mut worker, &queue, vec![Task::Init]).await;

        assert_eq!(
            fake.writes(),
            vec![
                (EFFECTS, vec![1, 1, 1, 1, 2, 0, 30, 30]),
                (COLOR, vec![0, 10, 20, 30]),
            ]
        );
        assert_eq!(worker.session().timeout(), CONNECT_TIMEOUT);
        assert_eq!(
            sink.for_unit(Unit::Switch),
            Vec::<DeviceUpdate>::new(),
            "nothing changed for the host"
        );
        assert_eq!(fake.ops().last(), Some(&Op::Disconnect));
    }

    #[tokio::test(start_paused = true)]
    async fn test_init_unreachable() {
        let fake = FakeTransport::unreachable();
        let (mut worker, queue, sink) = setup(&fake, false);

        let start = Instant::now();
        run_all(&mut worker, &queue, vec![Task::Init]).await;
        assert!(start.elapsed() >= DISCOVERY_TIMEOUT);

        assert_eq!(sink.for_unit(Unit::Switch), vec![DeviceUpdate::timed_out()]);
        assert_eq!(worker.session().timeout(), DISCOVERY_TIMEOUT);
    }
}
