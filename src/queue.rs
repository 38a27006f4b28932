/*!
 # Task queue

 Unbounded FIFO between host-facing producers and the single worker. Every
 task is counted as pending until the worker acknowledges it, so a producer
 can wait for the queue to drain.
*/

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::trace;

use crate::state::ColorPayload;
use crate::{Error, Result};

/// One unit of work for the worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Task {
    /// Connect with the discovery timeout and replay the last known state
    Init,
    On,
    /// `forced` writes even when the lamp is already believed off
    Off { forced: bool },
    SetColor { color: ColorPayload, level: u8 },
    SetLevel {
        level: u8,
        color: Option<ColorPayload>,
    },
    /// Device effect code
    SetEffect { effect: u8 },
    /// Device speed plus the dimmer level it came from
    SetSpeed { speed: u8, level: u8 },
    GetBattery,
    /// Stops the worker once everything before it is done
    Shutdown,
}

impl Task {
    pub fn action(&self) -> &'static str {
        match self {
            Task::Init => "Init",
            Task::On => "On",
            Task::Off { .. } => "Off",
            Task::SetColor { .. } => "SetColor",
            Task::SetLevel { .. } => "SetLevel",
            Task::SetEffect { .. } => "SetEffect",
            Task::SetSpeed { .. } => "SetSpeed",
            Task::GetBattery => "GetBattery",
            Task::Shutdown => "Shutdown",
        }
    }
}

/// Creates a connected producer/consumer pair.
pub fn channel() -> (TaskQueue, TaskReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    let (pending, _) = watch::channel(0usize);
    let pending = Arc::new(pending);

    (
        TaskQueue {
            tx,
            pending: pending.clone(),
            closing: Arc::new(Mutex::new(false)),
        },
        TaskReceiver { rx, pending },
    )
}

/// Producer handle. Cheap to clone, never waits on the worker.
#[derive(Clone)]
pub struct TaskQueue {
    tx: mpsc::UnboundedSender<Task>,
    pending: Arc<watch::Sender<usize>>,
    /// Set once `Shutdown` is queued. Held across the send so nothing can
    /// slip in behind it.
    closing: Arc<Mutex<bool>>,
}

impl TaskQueue {
    /// Queues `task` behind everything already queued. Nothing is accepted
    /// after a [`Task::Shutdown`].
    pub fn enqueue(&self, task: Task) -> Result<()> {
        let mut closing = self.closing.lock();
        if *closing {
            return Err(Error::QueueClosed);
        }

        trace!("Queueing task '{}'", task.action());
        self.pending.send_modify(|n| *n += 1);
        let shutdown = task == Task::Shutdown;
        self.tx.send(task).map_err(|_| {
            self.pending.send_modify(|n| *n = n.saturating_sub(1));
            Error::QueueClosed
        })?;
        if shutdown {
            *closing = true;
        }
        Ok(())
    }

    /// Tasks queued or in flight
    pub fn pending(&self) -> usize {
        *self.pending.borrow()
    }

    pub fn is_closing(&self) -> bool {
        *self.closing.lock()
    }

    /// Waits until every queued task has been acknowledged.
    pub async fn join(&self) {
        let mut rx = self.pending.subscribe();
        // The sender lives in `self`, so this can't fail.
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}

/// Consumer side, owned by the worker
pub struct TaskReceiver {
    rx: mpsc::UnboundedReceiver<Task>,
    pending: Arc<watch::Sender<usize>>,
}

impl TaskReceiver {
    /// Next task in FIFO order, `None` once every producer is gone.
    pub async fn recv(&mut self) -> Option<Task> {
        self.rx.recv().await
    }

    /// Marks the task last returned by [`recv`](Self::recv) as done.
    pub fn task_done(&self) {
        self.pending.send_modify(|n| *n = n.saturating_sub(1));
    }
}
