/*!
 # Battery poll scheduling

 Battery drains faster while the lamp is lit, so the poll interval depends on
 the power state. A reconnect pulls the next poll forward to "now" once.
*/

use chrono::{DateTime, Local, TimeDelta};
use tracing::debug;

/// Poll interval while the lamp is on
pub const POLL_WHEN_ON: TimeDelta = TimeDelta::minutes(30);

/// Next-due battery poll
#[derive(Debug, Clone)]
pub struct PollSchedule {
    next: DateTime<Local>,
    last: DateTime<Local>,
    when_off: TimeDelta,
}

impl PollSchedule {
    /// A fresh schedule is due immediately.
    pub fn new(now: DateTime<Local>, when_off: TimeDelta) -> Self {
        PollSchedule {
            next: now,
            last: now,
            when_off,
        }
    }

    pub fn next_poll(&self) -> DateTime<Local> {
        self.next
    }

    fn interval(&self, power_on: bool) -> TimeDelta {
        if power_on {
            POLL_WHEN_ON
        } else {
            self.when_off
        }
    }

    /// Re-bases the next poll on the last one after the power state changed.
    pub fn power_changed(&mut self, power_on: bool) {
        self.next = self.last + self.interval(power_on);
        debug!("Next battery poll will be at {}", self.next);
    }

    /// Forces the next [`due`](Self::due) check to fire.
    pub fn reconnected(&mut self, now: DateTime<Local>) {
        self.next = now;
    }

    /// Returns true when a poll should run now, and schedules the following one.
    pub fn due(&mut self, now: DateTime<Local>, power_on: bool) -> bool {
        if self.next > now {
            return false;
        }
        self.last = now;
        self.next = now + self.interval(power_on);
        debug!("Next battery poll will be at {}", self.next);
        true
    }
}
