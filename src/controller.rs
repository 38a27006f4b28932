/*!
 # Host-facing lamp controller

 [`PlayBulb`] is what a host adapter drives. It owns the producer side of the
 task queue and the battery poll schedule; the [`Worker`] it spawns owns the
 Bluetooth link. Every call here returns as soon as the task is queued.
*/

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info, instrument, warn};

use crate::config::Config;
use crate::effects::{self, EFFECTS};
use crate::queue::{self, Task, TaskQueue};
use crate::reconciler;
use crate::report::{DeviceRecord, Reporter, StateSink, Unit};
use crate::schedule::PollSchedule;
use crate::session::DeviceSession;
use crate::state::{ColorPayload, Rgbw};
use crate::transport::Transport;
use crate::worker::{Desired, Worker, WorkerState, WorkerStatus};
use crate::{Error, Result};

/// How often `stop` reports while waiting for the worker
const STOP_REPORT_INTERVAL: Duration = Duration::from_secs(1);

/// A host command, in host units
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    On,
    Off,
    /// Writes zero color even if the lamp is believed off already
    ForceOff,
    SetColor {
        color: ColorPayload,
        /// Brightness percent
        level: u8,
    },
    SetLevel {
        level: u8,
        color: Option<ColorPayload>,
    },
    /// Selector level: 0 is off, 10 flash ... 50 candle
    SetEffect { selector: u8 },
    /// Dimmer level, 100 is fastest
    SetSpeed { level: u8 },
    GetBatteryNow,
}

/// What the host remembers about the lamp across restarts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoredState {
    #[serde(default)]
    pub power_on: bool,
    /// Brightness percent
    #[serde(default)]
    pub level: u8,
    pub effect_selector: Option<u8>,
    pub speed_level: Option<u8>,
    pub color: Option<ColorPayload>,
}

fn check_level(what: &str, level: u8) -> Result<()> {
    if level > 100 {
        return Err(Error::InvalidCommand(format!(
            "{what} must be between 0 and 100, got {level}"
        )));
    }
    Ok(())
}

pub struct PlayBulb<T, S> {
    config: Config,
    queue: TaskQueue,
    status: Arc<WorkerStatus>,
    schedule: PollSchedule,
    /// Built in `new`, moved onto the runtime by `start`
    pending: Option<Worker<T, S>>,
    handle: Option<JoinHandle<()>>,
}

impl<T: Transport, S: StateSink> PlayBulb<T, S> {
    pub fn new(config: Config, transport: T, sink: S) -> Self {
        let (queue, rx) = queue::channel();
        let mut session = DeviceSession::new(transport, config.interface, config.address.clone());
        session.set_strict(config.strict_device_check);

        let status = Arc::new(WorkerStatus::default());
        let worker = Worker::new(
            session,
            Reporter::new(sink, config.battery_device),
            rx,
            status.clone(),
        );
        let schedule = PollSchedule::new(Local::now(), config.battery_poll.as_delta());

        PlayBulb {
            config,
            queue,
            status,
            schedule,
            pending: Some(worker),
            handle: None,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn worker_state(&self) -> WorkerState {
        self.status.state()
    }

    /// Power state as last reported to the host
    pub fn power_on(&self) -> bool {
        self.status.power_on()
    }

    pub fn next_poll(&self) -> DateTime<Local> {
        self.schedule.next_poll()
    }

    /// Seeds what the lamp was last told to do. Must run before
    /// [`start`](Self::start) so `Init` replays it.
    pub fn restore(&mut self, state: &RestoredState) -> Result<()> {
        let worker = self
            .pending
            .as_mut()
            .ok_or_else(|| Error::InvalidCommand("cannot restore a running lamp".into()))?;

        let level = state.level.min(100);
        let color = match &state.color {
            Some(payload) => {
                payload.validate()?;
                reconciler::scale(payload.maxima(), level)
            }
            None => Rgbw::OFF,
        };
        let selector = state.effect_selector.unwrap_or(0);
        let effect = reconciler::effect_from_selector(selector);
        let speed = state.speed_level.map_or(1, reconciler::speed_from_level);

        let desired = Desired {
            power: state.power_on,
            color,
            level,
            effect,
            speed,
        };
        info!(
            "Restoring last state: power {}, level {}%, effect '{}', speed {}",
            desired.power,
            level,
            EFFECTS.name(effect),
            speed
        );

        let records = vec![
            (
                Unit::Switch,
                DeviceRecord {
                    power_on: state.power_on,
                    level,
                    color: state.color,
                    ..Default::default()
                },
            ),
            (
                Unit::Effects,
                DeviceRecord {
                    power_on: effect != effects::OFF,
                    level: reconciler::selector_from_effect(effect),
                    ..Default::default()
                },
            ),
            (
                Unit::Speed,
                DeviceRecord {
                    power_on: state.speed_level.is_some(),
                    level: state.speed_level.unwrap_or(0),
                    ..Default::default()
                },
            ),
        ];
        worker.restore(desired, records);
        self.schedule.power_changed(state.power_on);
        Ok(())
    }

    /// Spawns the worker and queues `Init`.
    #[instrument(skip(self), fields(address = %self.config.address))]
    pub fn start(&mut self) -> Result<()> {
        let mut worker = self
            .pending
            .take()
            .ok_or_else(|| Error::InvalidCommand("lamp already started".into()))?;

        info!("Starting worker for lamp {}", self.config.address);
        self.handle = Some(tokio::spawn(async move { worker.run().await }));
        self.queue.enqueue(Task::Init)
    }

    /// Validates `command` and queues the matching task.
    #[instrument(skip(self))]
    pub fn handle_command(&mut self, command: Command) -> Result<()> {
        let task = match command {
            Command::On => {
                self.schedule.power_changed(true);
                Task::On
            }
            Command::Off | Command::ForceOff => {
                self.schedule.power_changed(false);
                Task::Off {
                    forced: command == Command::ForceOff,
                }
            }
            Command::SetColor { color, level } => {
                color.validate()?;
                check_level("brightness", level)?;
                Task::SetColor { color, level }
            }
            Command::SetLevel { level, color } => {
                check_level("brightness", level)?;
                if let Some(color) = &color {
                    color.validate()?;
                }
                Task::SetLevel { level, color }
            }
            Command::SetEffect { selector } => {
                let highest = reconciler::selector_from_effect(EFFECTS.candle);
                if selector > highest {
                    return Err(Error::InvalidCommand(format!(
                        "effect selector must be between 0 and {highest}, got {selector}"
                    )));
                }
                Task::SetEffect {
                    effect: reconciler::effect_from_selector(selector),
                }
            }
            Command::SetSpeed { level } => {
                check_level("speed", level)?;
                Task::SetSpeed {
                    speed: reconciler::speed_from_level(level),
                    level,
                }
            }
            Command::GetBatteryNow => Task::GetBattery,
        };
        self.queue.enqueue(task)
    }

    /// Heartbeat. Queues a battery poll when one is due and returns whether
    /// it did. A reconnect since the last tick makes the poll due at once.
    pub fn on_tick(&mut self, now: DateTime<Local>) -> Result<bool> {
        if self.status.take_reconnected() {
            debug!("Lamp reconnected, polling battery now");
            self.schedule.reconnected(now);
        }
        if !self.schedule.due(now, self.status.power_on()) {
            return Ok(false);
        }
        self.queue.enqueue(Task::GetBattery)?;
        Ok(true)
    }

    pub fn get_battery_now(&mut self) -> Result<()> {
        self.handle_command(Command::GetBatteryNow)
    }

    /// Waits until every queued task has been handled.
    pub async fn drain(&self) {
        self.queue.join().await;
    }

    /// Queues a shutdown and waits for the worker to exit. An operation in
    /// flight is not interrupted; it ends on its own timeout.
    #[instrument(skip(self))]
    pub async fn stop(&mut self) {
        if let Err(e) = self.queue.enqueue(Task::Shutdown) {
            debug!("Shutdown already queued: {}", e);
        }

        let Some(mut handle) = self.handle.take() else {
            debug!("Worker never started");
            return;
        };

        let mut waited = 0u32;
        loop {
            match time::timeout(STOP_REPORT_INTERVAL, &mut handle).await {
                Ok(Ok(())) => break,
                Ok(Err(e)) => {
                    error!("Worker task ended abnormally: {}", e);
                    break;
                }
                Err(_) => {
                    waited += 1;
                    if waited <= 10 {
                        warn!(
                            "Worker still {:?} after {}s, {} task(s) pending",
                            self.status.state(),
                            waited,
                            self.queue.pending()
                        );
                    }
                }
            }
        }
        info!("Worker stopped");
    }
}
