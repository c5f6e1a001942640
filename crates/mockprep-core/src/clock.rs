//! Attempt clock.
//!
//! A clock is a spawned tokio task that emits ticks for one timed window and
//! then exactly one expiry. Events go into a channel owned by whoever drives
//! the attempt; the clock knows nothing about rendering.
//!
//! Cancelling (or dropping) a [`ClockHandle`] aborts the task. An expiry that
//! was already buffered when the clock was cancelled still sits in the
//! channel, so consumers compare [`ClockEvent::clock`] against the clock they
//! armed and drop anything else. [`ClockSlot`] does that bookkeeping.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::error::ClockError;
use crate::model::AttemptId;

static NEXT_CLOCK_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique clock identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClockId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockEventKind {
    Tick,
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockEvent {
    pub clock: ClockId,
    pub kind: ClockEventKind,
    /// Time since the clock started.
    pub elapsed_ms: u64,
    pub remaining_ms: u64,
}

impl ClockEvent {
    pub fn is_expiry(&self) -> bool {
        self.kind == ClockEventKind::Expired
    }
}

/// Starts clocks that report into one channel.
#[derive(Debug, Clone)]
pub struct AttemptClock {
    tick_interval: Duration,
    tx: mpsc::UnboundedSender<ClockEvent>,
}

impl AttemptClock {
    pub fn new(tick_interval: Duration, tx: mpsc::UnboundedSender<ClockEvent>) -> Self {
        Self {
            tick_interval: tick_interval.max(Duration::from_millis(1)),
            tx,
        }
    }

    pub fn tick_interval(&self) -> Duration {
        self.tick_interval
    }

    /// Start a clock for `duration`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self, duration: Duration) -> ClockHandle {
        let id = ClockId(NEXT_CLOCK_ID.fetch_add(1, Ordering::Relaxed));
        let started = Instant::now();
        let tick = self.tick_interval;
        let tx = self.tx.clone();
        let total_ms = duration.as_millis() as u64;

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(started + tick, tick);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let expiry = tokio::time::sleep_until(started + duration);
            tokio::pin!(expiry);

            loop {
                tokio::select! {
                    // A tick that lands on the deadline is swallowed by the expiry.
                    biased;
                    _ = &mut expiry => {
                        let _ = tx.send(ClockEvent {
                            clock: id,
                            kind: ClockEventKind::Expired,
                            elapsed_ms: total_ms,
                            remaining_ms: 0,
                        });
                        break;
                    }
                    at = ticker.tick() => {
                        let elapsed = at.saturating_duration_since(started);
                        if elapsed >= duration {
                            continue;
                        }
                        let elapsed_ms = elapsed.as_millis() as u64;
                        let event = ClockEvent {
                            clock: id,
                            kind: ClockEventKind::Tick,
                            elapsed_ms,
                            remaining_ms: total_ms.saturating_sub(elapsed_ms),
                        };
                        if tx.send(event).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        tracing::debug!(clock = id.0, duration_ms = total_ms, "clock started");

        ClockHandle {
            id,
            started,
            duration,
            task,
        }
    }
}

/// Cancellable handle to a running clock. Dropping it cancels the clock.
#[derive(Debug)]
pub struct ClockHandle {
    id: ClockId,
    started: Instant,
    duration: Duration,
    task: JoinHandle<()>,
}

impl ClockHandle {
    pub fn id(&self) -> ClockId {
        self.id
    }

    pub fn remaining(&self) -> Duration {
        self.duration.saturating_sub(self.started.elapsed())
    }

    /// Time run so far, capped at the window.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed().min(self.duration)
    }

    pub fn cancel(self) {
        drop(self);
    }
}

impl Drop for ClockHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Holds at most one armed clock for one owner.
#[derive(Debug)]
pub struct ClockSlot {
    owner: AttemptId,
    armed: Option<ClockHandle>,
}

impl ClockSlot {
    pub fn new(owner: AttemptId) -> Self {
        Self { owner, armed: None }
    }

    /// Re-point the slot at a new owner. Disarms any running clock.
    pub fn reassign(&mut self, owner: AttemptId) {
        self.disarm();
        self.owner = owner;
    }

    /// Arm a clock for `duration`.
    ///
    /// Arming an occupied slot is a programming error.
    pub fn arm(&mut self, clock: &AttemptClock, duration: Duration) -> Result<ClockId, ClockError> {
        if self.armed.is_some() {
            tracing::error!(attempt_id = %self.owner, "second clock started for an armed attempt");
            return Err(ClockError::AlreadyRunning(self.owner.clone()));
        }
        let handle = clock.start(duration);
        let id = handle.id();
        self.armed = Some(handle);
        Ok(id)
    }

    pub fn disarm(&mut self) {
        if let Some(handle) = self.armed.take() {
            tracing::debug!(clock = handle.id().0, attempt_id = %self.owner, "clock cancelled");
            handle.cancel();
        }
    }

    pub fn is_armed(&self) -> bool {
        self.armed.is_some()
    }

    /// Whether `event` came from the currently armed clock.
    pub fn accepts(&self, event: &ClockEvent) -> bool {
        self.armed.as_ref().is_some_and(|h| h.id() == event.clock)
    }

    /// Record that the armed clock fired its expiry.
    pub fn expired(&mut self) {
        self.armed = None;
    }

    pub fn remaining_ms(&self) -> u64 {
        self.armed
            .as_ref()
            .map(|h| h.remaining().as_millis() as u64)
            .unwrap_or(0)
    }

    /// The armed clock and how long it has run, in milliseconds.
    pub fn reading(&self) -> Option<(ClockId, u64)> {
        self.armed
            .as_ref()
            .map(|h| (h.id(), h.elapsed().as_millis() as u64))
    }
}
