//! Heartbeat timer and acknowledgement tracking.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Result of asking the scheduler whether a heartbeat may go out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Beat {
    /// Send a heartbeat now.
    Send,
    /// The previous heartbeat was never acknowledged; the connection is dead.
    Zombie,
}

/// A repeating heartbeat timer owned by the connection driver.
///
/// The timer runs in its own task and only signals ticks; the driver builds
/// and writes each heartbeat itself so it always carries the sequence number
/// current at send time. Dropping the scheduler cancels the timer.
#[derive(Debug)]
pub struct HeartbeatScheduler {
    interval: Duration,
    ticks: mpsc::Receiver<()>,
    task: JoinHandle<()>,
    stopped: bool,
    ack_pending: bool,
    last_sent: Option<Instant>,
    latency: Option<Duration>,
}

impl HeartbeatScheduler {
    /// Start a timer whose first tick is one full `interval` from now.
    ///
    /// The timer also stops when `shutdown` is cancelled.
    #[must_use]
    pub fn start(interval: Duration, shutdown: CancellationToken) -> Self {
        let interval = interval.max(Duration::from_millis(1));
        let (tx, ticks) = mpsc::channel(1);
        let task = tokio::spawn(run_timer(interval, tx, shutdown));

        Self {
            interval,
            ticks,
            task,
            stopped: false,
            ack_pending: false,
            last_sent: None,
            latency: None,
        }
    }

    /// Interval between ticks.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        self.interval
    }

    /// Check if the timer is still running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.stopped && !self.task.is_finished()
    }

    /// Whether the last heartbeat is still waiting for its ack.
    #[must_use]
    pub const fn ack_pending(&self) -> bool {
        self.ack_pending
    }

    /// Round-trip time of the most recently acknowledged heartbeat.
    #[must_use]
    pub const fn latency(&self) -> Option<Duration> {
        self.latency
    }

    /// Wait for the next tick. Returns `None` once the timer is stopped.
    pub async fn tick(&mut self) -> Option<()> {
        self.ticks.recv().await
    }

    /// Decide whether a timer-driven heartbeat may be sent.
    ///
    /// Marks the heartbeat as pending when it returns [`Beat::Send`].
    pub fn beat(&mut self) -> Beat {
        if self.ack_pending {
            return Beat::Zombie;
        }
        self.mark_sent();
        Beat::Send
    }

    /// Record a heartbeat sent outside the timer (server-requested).
    pub fn mark_sent(&mut self) {
        self.ack_pending = true;
        self.last_sent = Some(Instant::now());
    }

    /// Record a heartbeat acknowledgement.
    pub fn ack(&mut self) {
        self.ack_pending = false;
        if let Some(sent) = self.last_sent {
            self.latency = Some(sent.elapsed());
        }
    }

    /// Stop the timer. Queued ticks are discarded.
    pub fn stop(&mut self) {
        self.stopped = true;
        self.task.abort();
        self.ticks.close();
        while self.ticks.try_recv().is_ok() {}
    }
}

impl Drop for HeartbeatScheduler {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run_timer(period: Duration, tx: mpsc::Sender<()>, shutdown: CancellationToken) {
    let mut timer = tokio::time::interval_at(Instant::now() + period, period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = timer.tick() => {
                match tx.try_send(()) {
                    // A tick is already queued; the driver will send one heartbeat for both.
                    Ok(()) | Err(TrySendError::Full(())) => {}
                    Err(TrySendError::Closed(())) => break,
                }
            }
        }
    }
    trace!("heartbeat timer stopped");
}
