//! Events exposed to callers.
//!
//! Controllers, the submission queue and the orchestrator report through an
//! [`EventSink`]. The CLI prints them; tests collect them with
//! [`ChannelSink`].

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::model::{AttemptFailure, AttemptId, DeliveryStatus, Phase, SessionStatus, SubmitTrigger};

/// An attempt entered a phase, or its clock ticked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseEvent {
    pub attempt_id: AttemptId,
    pub question_id: String,
    pub phase: Phase,
    /// Time left in the current timed window (0 outside timed phases).
    pub remaining_ms: u64,
    #[serde(default)]
    pub trigger: Option<SubmitTrigger>,
    #[serde(default)]
    pub failure: Option<AttemptFailure>,
}

/// Delivery progress of one submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEvent {
    pub attempt_id: AttemptId,
    pub status: DeliveryStatus,
    pub retry_count: u32,
    #[serde(default)]
    pub detail: Option<String>,
}

/// Session navigation and timing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEvent {
    pub session_id: String,
    pub current_index: usize,
    pub status: SessionStatus,
    /// Name of the section `current_index` falls in.
    #[serde(default)]
    pub section: Option<String>,
    pub elapsed_ms: u64,
}

/// Receiver of phase, queue and session events.
pub trait EventSink: Send + Sync {
    fn on_phase(&self, event: &PhaseEvent);
    fn on_queue(&self, event: &QueueEvent);
    fn on_session(&self, event: &SessionEvent);
}

/// No-op event sink.
pub struct NoopSink;

impl EventSink for NoopSink {
    fn on_phase(&self, _: &PhaseEvent) {}
    fn on_queue(&self, _: &QueueEvent) {}
    fn on_session(&self, _: &SessionEvent) {}
}

/// Any event, as delivered by [`ChannelSink`].
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Phase(PhaseEvent),
    Queue(QueueEvent),
    Session(SessionEvent),
}

/// Forwards every event into an unbounded channel.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Event>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn on_phase(&self, event: &PhaseEvent) {
        let _ = self.tx.send(Event::Phase(event.clone()));
    }

    fn on_queue(&self, event: &QueueEvent) {
        let _ = self.tx.send(Event::Queue(event.clone()));
    }

    fn on_session(&self, event: &SessionEvent) {
        let _ = self.tx.send(Event::Session(event.clone()));
    }
}
