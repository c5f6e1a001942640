//! Per-question attempt state machine.
//!
//! An [`AttemptController`] walks one question through
//! `idle → preparing → answering → submitting → done | error`. Every phase
//! change goes through [`transition`], so the legal moves live in one table
//! that can be tested without a runtime. The controller owns the single clock
//! for its attempt and hands finished answers to the [`SubmissionQueue`];
//! delivery itself is the queue's business.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::clock::{AttemptClock, ClockEvent, ClockEventKind, ClockId, ClockSlot};
use crate::error::{AttemptError, RecorderError};
use crate::events::{EventSink, PhaseEvent};
use crate::model::{
    AttemptFailure, AttemptId, AttemptSpec, AttemptState, Payload, Phase, SubmissionRequest,
    SubmitTrigger,
};
use crate::queue::SubmissionQueue;
use crate::traits::Recorder;

/// Inputs accepted by the attempt state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptInput {
    /// The session armed this question.
    Activate { has_prep: bool },
    SkipPrep,
    PrepElapsed,
    /// Explicit submit by the test taker.
    Submit,
    AnswerElapsed,
    /// Outcome of collecting the answer after leaving `answering`.
    Handoff { has_payload: bool },
    /// The submission queue refused the request.
    HandoffFailed,
    /// The recorder could not start capturing.
    CaptureFailed,
    Reset,
}

impl AttemptInput {
    pub fn name(self) -> &'static str {
        match self {
            AttemptInput::Activate { .. } => "activate",
            AttemptInput::SkipPrep => "skip preparation",
            AttemptInput::PrepElapsed => "end preparation",
            AttemptInput::Submit => "submit",
            AttemptInput::AnswerElapsed => "expire",
            AttemptInput::Handoff { .. } => "hand off",
            AttemptInput::HandoffFailed => "fail handoff",
            AttemptInput::CaptureFailed => "fail capture",
            AttemptInput::Reset => "reset",
        }
    }
}

/// The attempt transition table. `None` means the move is illegal.
pub fn transition(from: Phase, input: AttemptInput) -> Option<Phase> {
    use AttemptInput::*;
    use Phase::*;

    match (from, input) {
        (_, Reset) => Some(Idle),
        (Idle, Activate { has_prep: true }) => Some(Preparing),
        (Idle, Activate { has_prep: false }) => Some(Answering),
        (Preparing, SkipPrep | PrepElapsed) => Some(Answering),
        (Answering, Submit | AnswerElapsed) => Some(Submitting),
        (Answering, CaptureFailed) => Some(Error),
        (Submitting, Handoff { has_payload: true }) => Some(Done),
        (Submitting, Handoff { has_payload: false } | HandoffFailed) => Some(Error),
        _ => None,
    }
}

/// Drives one question through its timed phases.
pub struct AttemptController {
    attempt_id: AttemptId,
    spec: AttemptSpec,
    session_id: String,
    state: AttemptState,
    trigger: Option<SubmitTrigger>,
    answer_started_at: Option<DateTime<Utc>>,
    clock: AttemptClock,
    slot: ClockSlot,
    recorder: Arc<dyn Recorder>,
    queue: SubmissionQueue,
    events: Arc<dyn EventSink>,
    recording: bool,
}

impl AttemptController {
    pub fn new(
        spec: AttemptSpec,
        session_id: impl Into<String>,
        clock: AttemptClock,
        recorder: Arc<dyn Recorder>,
        queue: SubmissionQueue,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let attempt_id = AttemptId::new();
        Self {
            slot: ClockSlot::new(attempt_id.clone()),
            attempt_id,
            spec,
            session_id: session_id.into(),
            state: AttemptState::idle(),
            trigger: None,
            answer_started_at: None,
            clock,
            recorder,
            queue,
            events,
            recording: false,
        }
    }

    pub fn attempt_id(&self) -> &AttemptId {
        &self.attempt_id
    }

    pub fn spec(&self) -> &AttemptSpec {
        &self.spec
    }

    pub fn state(&self) -> &AttemptState {
        &self.state
    }

    pub fn phase(&self) -> Phase {
        self.state.phase
    }

    pub fn trigger(&self) -> Option<SubmitTrigger> {
        self.trigger
    }

    pub fn is_live(&self) -> bool {
        self.state.phase.is_live()
    }

    /// Time left in the running window, or 0 when no clock is armed.
    pub fn remaining_ms(&self) -> u64 {
        self.slot.remaining_ms()
    }

    pub fn has_clock(&self) -> bool {
        self.slot.is_armed()
    }

    /// The running clock and its elapsed milliseconds, read between ticks.
    pub fn clock_reading(&self) -> Option<(ClockId, u64)> {
        self.slot.reading()
    }

    /// Whether `event` belongs to this attempt's armed clock.
    pub fn owns(&self, event: &ClockEvent) -> bool {
        self.slot.accepts(event)
    }

    /// Arm the question. Starts preparation, or answering when there is none.
    pub async fn activate(&mut self) -> Result<Phase, AttemptError> {
        let has_prep = self.spec.prep_duration_ms > 0;
        let next = self.check(AttemptInput::Activate { has_prep })?;

        if !self.recorder.supports(self.spec.payload_kind) {
            tracing::warn!(
                question_id = %self.spec.question_id,
                kind = %self.spec.payload_kind,
                "recorder cannot capture this question"
            );
            return Err(AttemptError::Unsupported(self.spec.payload_kind));
        }

        tracing::info!(
            attempt_id = %self.attempt_id,
            question_id = %self.spec.question_id,
            prep_ms = self.spec.prep_duration_ms,
            answer_ms = self.spec.answer_duration_ms,
            "attempt activated"
        );

        if next == Phase::Preparing {
            self.enter(Phase::Preparing, Some(self.spec.prep_duration()))?;
            Ok(Phase::Preparing)
        } else {
            self.enter_answering().await
        }
    }

    /// End preparation early.
    pub async fn skip_prep(&mut self) -> Result<Phase, AttemptError> {
        self.check(AttemptInput::SkipPrep)?;
        self.slot.disarm();
        self.enter_answering().await
    }

    /// Record an answer produced outside the recorder (typed text, form data).
    pub fn capture(&mut self, payload: Payload) -> Result<(), AttemptError> {
        if self.state.phase != Phase::Answering {
            return Err(AttemptError::InvalidTransition {
                from: self.state.phase,
                input: "capture",
            });
        }
        if payload.kind() != self.spec.payload_kind {
            return Err(AttemptError::PayloadKindMismatch {
                expected: self.spec.payload_kind,
                got: payload.kind(),
            });
        }
        self.state.captured_payload = Some(payload);
        Ok(())
    }

    /// Submit the answer now.
    pub async fn submit(&mut self) -> Result<Phase, AttemptError> {
        self.finish(SubmitTrigger::User).await
    }

    /// Feed a clock event. Returns `false` for events from other clocks.
    pub async fn on_clock(&mut self, event: ClockEvent) -> Result<bool, AttemptError> {
        if !self.slot.accepts(&event) {
            return Ok(false);
        }
        self.state.elapsed_ms = event.elapsed_ms;

        match event.kind {
            ClockEventKind::Tick => {
                self.emit(event.remaining_ms);
            }
            ClockEventKind::Expired => {
                self.slot.expired();
                match self.state.phase {
                    Phase::Preparing => {
                        self.check(AttemptInput::PrepElapsed)?;
                        self.enter_answering().await?;
                    }
                    Phase::Answering => {
                        self.finish(SubmitTrigger::AutoExpire).await?;
                    }
                    phase => {
                        tracing::debug!(%phase, "expiry outside a timed phase");
                    }
                }
            }
        }
        Ok(true)
    }

    /// Return to `idle` under a fresh attempt id, ready to be activated again.
    pub async fn reset(&mut self) -> Phase {
        self.slot.disarm();
        self.stop_recorder().await;

        let previous = std::mem::replace(&mut self.attempt_id, AttemptId::new());
        self.slot.reassign(self.attempt_id.clone());
        self.state = AttemptState::idle();
        self.trigger = None;
        self.answer_started_at = None;

        tracing::info!(
            previous = %previous,
            attempt_id = %self.attempt_id,
            question_id = %self.spec.question_id,
            "attempt reset"
        );
        self.emit(0);
        Phase::Idle
    }

    /// Stop the clock and the recorder. Used when the session navigates away.
    pub async fn cancel(&mut self) {
        self.slot.disarm();
        self.stop_recorder().await;
    }

    fn check(&self, input: AttemptInput) -> Result<Phase, AttemptError> {
        transition(self.state.phase, input).ok_or(AttemptError::InvalidTransition {
            from: self.state.phase,
            input: input.name(),
        })
    }

    fn enter(&mut self, phase: Phase, window: Option<Duration>) -> Result<(), AttemptError> {
        tracing::debug!(
            attempt_id = %self.attempt_id,
            from = %self.state.phase,
            to = %phase,
            "phase change"
        );
        self.state.phase = phase;
        self.state.phase_started_at = Utc::now();
        self.state.elapsed_ms = 0;

        let remaining = match window {
            Some(duration) => {
                self.slot.arm(&self.clock, duration)?;
                duration.as_millis() as u64
            }
            None => 0,
        };
        self.emit(remaining);
        Ok(())
    }

    async fn enter_answering(&mut self) -> Result<Phase, AttemptError> {
        self.answer_started_at = Some(Utc::now());
        self.enter(Phase::Answering, Some(self.spec.answer_duration()))?;

        match self
            .recorder
            .start(&self.attempt_id, self.spec.payload_kind)
            .await
        {
            Ok(()) => {
                self.recording = true;
                Ok(Phase::Answering)
            }
            Err(e) => {
                tracing::warn!(attempt_id = %self.attempt_id, "recorder failed to start: {e}");
                self.slot.disarm();
                let next = self.check(AttemptInput::CaptureFailed)?;
                self.state.last_error = Some(AttemptFailure::Recorder {
                    message: e.to_string(),
                });
                self.enter(next, None)?;
                Err(e.into())
            }
        }
    }

    async fn finish(&mut self, trigger: SubmitTrigger) -> Result<Phase, AttemptError> {
        let input = match trigger {
            SubmitTrigger::User => AttemptInput::Submit,
            SubmitTrigger::AutoExpire => AttemptInput::AnswerElapsed,
        };
        let next = self.check(input)?;
        self.slot.disarm();
        self.trigger = Some(trigger);
        self.enter(next, None)?;

        let (produced, stop_error) = self.stop_recorder().await;
        let kind = self.spec.payload_kind;
        let payload = produced
            .filter(|p| !p.is_empty() && p.kind() == kind)
            .or_else(|| self.state.captured_payload.take().filter(|p| !p.is_empty()));

        let Some(payload) = payload else {
            let next = self.check(AttemptInput::Handoff { has_payload: false })?;
            let (failure, error) = match stop_error {
                Some(e) => (
                    AttemptFailure::Recorder {
                        message: e.to_string(),
                    },
                    AttemptError::Recorder(e),
                ),
                None => (AttemptFailure::NoPayload { trigger }, AttemptError::NoPayload),
            };
            tracing::warn!(
                attempt_id = %self.attempt_id,
                question_id = %self.spec.question_id,
                %trigger,
                "attempt ended without an answer"
            );
            self.state.last_error = Some(failure);
            self.enter(next, None)?;
            return Err(error);
        };

        self.state.captured_payload = Some(payload.clone());
        let request = self.request(payload, trigger);

        match self.queue.enqueue(request).await {
            Ok(()) => {
                let next = self.check(AttemptInput::Handoff { has_payload: true })?;
                tracing::info!(
                    attempt_id = %self.attempt_id,
                    question_id = %self.spec.question_id,
                    %trigger,
                    "answer handed to submission queue"
                );
                self.enter(next, None)?;
                Ok(next)
            }
            Err(e) => {
                let next = self.check(AttemptInput::HandoffFailed)?;
                tracing::error!(attempt_id = %self.attempt_id, "submission handoff failed: {e}");
                self.state.last_error = Some(AttemptFailure::QueueUnavailable {
                    message: e.to_string(),
                });
                self.enter(next, None)?;
                Err(e.into())
            }
        }
    }

    fn request(&self, payload: Payload, trigger: SubmitTrigger) -> SubmissionRequest {
        let now = Utc::now();
        let answer_started_at = self.answer_started_at.unwrap_or(now);
        let window = chrono::Duration::milliseconds(self.spec.answer_duration_ms as i64);
        SubmissionRequest {
            attempt_id: self.attempt_id.clone(),
            question_id: self.spec.question_id.clone(),
            session_id: self.session_id.clone(),
            payload,
            created_at: now,
            retry_count: 0,
            submit_trigger: trigger,
            answer_started_at,
            answer_deadline: answer_started_at + window,
        }
    }

    async fn stop_recorder(&mut self) -> (Option<Payload>, Option<RecorderError>) {
        if !std::mem::take(&mut self.recording) {
            return (None, None);
        }
        match self.recorder.stop(&self.attempt_id).await {
            Ok(payload) => (payload, None),
            Err(e) => {
                tracing::warn!(attempt_id = %self.attempt_id, "recorder failed to stop: {e}");
                (None, Some(e))
            }
        }
    }

    fn emit(&self, remaining_ms: u64) {
        let failure = (self.state.phase == Phase::Error)
            .then(|| self.state.last_error.clone())
            .flatten();
        self.events.on_phase(&PhaseEvent {
            attempt_id: self.attempt_id.clone(),
            question_id: self.spec.question_id.clone(),
            phase: self.state.phase,
            remaining_ms,
            trigger: self.trigger,
            failure,
        });
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;
    use tokio::time::Instant;

    use super::*;
    use crate::events::{ChannelSink, Event};
    use crate::memory::{BufferedRecorder, DryRunScorer, MemorySpool};
    use crate::model::{PayloadKind, SectionKind};
    use crate::queue::QueueConfig;

    struct Harness {
        ctl: AttemptController,
        clock_rx: mpsc::UnboundedReceiver<ClockEvent>,
        events: mpsc::UnboundedReceiver<Event>,
        recorder: Arc<BufferedRecorder>,
        scorer: Arc<DryRunScorer>,
        queue: SubmissionQueue,
    }

    impl Harness {
        async fn new(prep_ms: u64, answer_ms: u64, kind: PayloadKind) -> Self {
            Self::with_recorder(prep_ms, answer_ms, kind, BufferedRecorder::all_kinds()).await
        }

        async fn with_recorder(
            prep_ms: u64,
            answer_ms: u64,
            kind: PayloadKind,
            recorder: BufferedRecorder,
        ) -> Self {
            let (sink, events) = ChannelSink::new();
            let sink: Arc<dyn EventSink> = Arc::new(sink);
            let scorer = Arc::new(DryRunScorer::new());
            let queue = SubmissionQueue::start(
                scorer.clone(),
                Arc::new(MemorySpool::new()),
                Arc::clone(&sink),
                QueueConfig::default(),
            )
            .await;
            let (tx, clock_rx) = mpsc::unbounded_channel();
            let recorder = Arc::new(recorder);
            let spec = AttemptSpec {
                question_id: "q1".into(),
                section_kind: SectionKind::Speaking,
                prep_duration_ms: prep_ms,
                answer_duration_ms: answer_ms,
                payload_kind: kind,
            };
            let ctl = AttemptController::new(
                spec,
                "s1",
                AttemptClock::new(Duration::from_secs(1), tx),
                recorder.clone(),
                queue.clone(),
                sink,
            );
            Self {
                ctl,
                clock_rx,
                events,
                recorder,
                scorer,
                queue,
            }
        }

        /// Feed clock events until the phase differs from `phase`.
        async fn run_while(&mut self, phase: Phase) -> Vec<ClockEvent> {
            let mut seen = Vec::new();
            while self.ctl.phase() == phase {
                let event = self.clock_rx.recv().await.unwrap();
                let _ = self.ctl.on_clock(event).await;
                seen.push(event);
            }
            seen
        }

        fn phases(&mut self) -> Vec<(Phase, Option<SubmitTrigger>)> {
            let mut out = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                if let Event::Phase(p) = event {
                    if out.last().map(|(ph, _)| *ph) != Some(p.phase) {
                        out.push((p.phase, p.trigger));
                    }
                }
            }
            out
        }
    }

    #[test]
    fn transitions_only_move_forward_except_reset() {
        fn rank(p: Phase) -> u8 {
            match p {
                Phase::Idle => 0,
                Phase::Preparing => 1,
                Phase::Answering => 2,
                Phase::Submitting => 3,
                Phase::Done | Phase::Error => 4,
            }
        }
        let phases = [
            Phase::Idle,
            Phase::Preparing,
            Phase::Answering,
            Phase::Submitting,
            Phase::Done,
            Phase::Error,
        ];
        let inputs = [
            AttemptInput::Activate { has_prep: true },
            AttemptInput::Activate { has_prep: false },
            AttemptInput::SkipPrep,
            AttemptInput::PrepElapsed,
            AttemptInput::Submit,
            AttemptInput::AnswerElapsed,
            AttemptInput::Handoff { has_payload: true },
            AttemptInput::Handoff { has_payload: false },
            AttemptInput::HandoffFailed,
            AttemptInput::CaptureFailed,
        ];
        for from in phases {
            for input in inputs {
                if let Some(to) = transition(from, input) {
                    assert!(rank(to) > rank(from), "{from} --{}--> {to}", input.name());
                }
            }
            assert_eq!(transition(from, AttemptInput::Reset), Some(Phase::Idle));
        }
        assert_eq!(transition(Phase::Done, AttemptInput::Submit), None);
        assert_eq!(
            transition(Phase::Idle, AttemptInput::Activate { has_prep: false }),
            Some(Phase::Answering)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn preparation_expires_into_answering() {
        let mut h = Harness::new(5000, 10_000, PayloadKind::Text).await;
        let start = Instant::now();

        assert_eq!(h.ctl.activate().await.unwrap(), Phase::Preparing);
        let seen = h.run_while(Phase::Preparing).await;

        assert_eq!(h.ctl.phase(), Phase::Answering);
        assert!(start.elapsed() >= Duration::from_millis(5000));
        assert!(start.elapsed() < Duration::from_millis(6000));
        assert_eq!(seen.iter().filter(|e| e.is_expiry()).count(), 1);
        assert_eq!(h.recorder.started(), vec![h.ctl.attempt_id().clone()]);
        assert!(h.ctl.has_clock());
        assert!(h.ctl.remaining_ms() > 9000);
    }

    #[tokio::test(start_paused = true)]
    async fn user_submit_stops_the_clock() {
        let mut h = Harness::new(0, 10_000, PayloadKind::Text).await;
        assert_eq!(h.ctl.activate().await.unwrap(), Phase::Answering);

        tokio::time::sleep(Duration::from_millis(3000)).await;
        while let Ok(event) = h.clock_rx.try_recv() {
            h.ctl.on_clock(event).await.unwrap();
        }
        h.ctl.capture(Payload::text("my answer")).unwrap();
        assert_eq!(h.ctl.submit().await.unwrap(), Phase::Done);
        assert_eq!(h.ctl.trigger(), Some(SubmitTrigger::User));
        assert!(!h.ctl.has_clock());

        let phases = h.phases();
        assert_eq!(
            phases,
            vec![
                (Phase::Answering, None),
                (Phase::Submitting, Some(SubmitTrigger::User)),
                (Phase::Done, Some(SubmitTrigger::User)),
            ]
        );

        // Nothing from the cancelled clock is acted on afterwards.
        tokio::time::sleep(Duration::from_secs(20)).await;
        while let Ok(event) = h.clock_rx.try_recv() {
            assert!(!h.ctl.on_clock(event).await.unwrap());
        }
        assert_eq!(h.ctl.phase(), Phase::Done);

        h.queue.wait_idle(Duration::from_secs(5)).await.unwrap();
        let applied = h.scorer.applied();
        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0].submit_trigger, SubmitTrigger::User);
        assert_eq!(applied[0].attempt_id, *h.ctl.attempt_id());
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_submits_within_one_tick() {
        let mut h = Harness::new(0, 2000, PayloadKind::Text).await;
        h.ctl.activate().await.unwrap();
        h.ctl.capture(Payload::text("partial answer")).unwrap();
        let start = Instant::now();

        h.run_while(Phase::Answering).await;

        assert_eq!(h.ctl.phase(), Phase::Done);
        assert_eq!(h.ctl.trigger(), Some(SubmitTrigger::AutoExpire));
        assert!(start.elapsed() < Duration::from_millis(3000));

        h.queue.wait_idle(Duration::from_secs(5)).await.unwrap();
        let request = &h.scorer.applied()[0];
        assert_eq!(request.submit_trigger, SubmitTrigger::AutoExpire);
        assert_eq!(
            request.answer_deadline - request.answer_started_at,
            chrono::Duration::milliseconds(2000)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_without_answer_is_a_visible_error() {
        let mut h = Harness::new(0, 1000, PayloadKind::Text).await;
        h.ctl.activate().await.unwrap();
        let first_id = h.ctl.attempt_id().clone();

        h.run_while(Phase::Answering).await;

        assert_eq!(h.ctl.phase(), Phase::Error);
        let failure = h.ctl.state().last_error.clone().unwrap();
        assert_eq!(
            failure,
            AttemptFailure::NoPayload {
                trigger: SubmitTrigger::AutoExpire
            }
        );
        assert!(failure.user_message().contains("Time ran out"));
        assert!(h.phases().iter().any(|(p, _)| *p == Phase::Submitting));
        assert_eq!(h.queue.pending(), 0);
        assert!(h.scorer.applied().is_empty());

        assert_eq!(h.ctl.reset().await, Phase::Idle);
        assert_ne!(*h.ctl.attempt_id(), first_id);
        assert!(h.ctl.state().last_error.is_none());
        assert_eq!(h.ctl.activate().await.unwrap(), Phase::Answering);
    }

    #[tokio::test(start_paused = true)]
    async fn blank_answer_counts_as_none() {
        let mut h = Harness::new(0, 10_000, PayloadKind::Text).await;
        h.ctl.activate().await.unwrap();
        h.ctl.capture(Payload::text("   ")).unwrap();

        let err = h.ctl.submit().await.unwrap_err();
        assert!(matches!(err, AttemptError::NoPayload));
        assert_eq!(
            h.ctl.state().last_error,
            Some(AttemptFailure::NoPayload {
                trigger: SubmitTrigger::User
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn recorder_output_is_submitted() {
        let mut h = Harness::new(0, 10_000, PayloadKind::Audio).await;
        h.ctl.activate().await.unwrap();
        h.recorder.produce(Payload::Audio {
            uri: "file:///tmp/a1.wav".into(),
            duration_ms: 4200,
        });

        assert_eq!(h.ctl.submit().await.unwrap(), Phase::Done);
        h.queue.wait_idle(Duration::from_secs(5)).await.unwrap();
        assert_eq!(h.scorer.applied()[0].payload.kind(), PayloadKind::Audio);
    }

    #[tokio::test(start_paused = true)]
    async fn skip_prep_starts_answer_window() {
        let mut h = Harness::new(30_000, 10_000, PayloadKind::Text).await;
        h.ctl.activate().await.unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;

        assert_eq!(h.ctl.skip_prep().await.unwrap(), Phase::Answering);

        // The prep tick already buffered is ignored.
        let stale = h.clock_rx.recv().await.unwrap();
        assert!(!h.ctl.on_clock(stale).await.unwrap());
        let fresh = h.clock_rx.recv().await.unwrap();
        assert!(h.ctl.on_clock(fresh).await.unwrap());
        assert_eq!(fresh.remaining_ms, 9000);
    }

    #[tokio::test(start_paused = true)]
    async fn out_of_order_calls_are_rejected() {
        let mut h = Harness::new(5000, 10_000, PayloadKind::Text).await;
        assert!(matches!(
            h.ctl.submit().await,
            Err(AttemptError::InvalidTransition {
                from: Phase::Idle,
                ..
            })
        ));
        h.ctl.activate().await.unwrap();
        assert!(h.ctl.activate().await.is_err());
        assert!(h.ctl.capture(Payload::text("early")).is_err());
        assert!(matches!(
            h.ctl.submit().await,
            Err(AttemptError::InvalidTransition {
                from: Phase::Preparing,
                ..
            })
        ));
        assert_eq!(h.ctl.phase(), Phase::Preparing);
    }

    #[tokio::test(start_paused = true)]
    async fn wrong_payload_kind_is_refused() {
        let mut h = Harness::new(0, 10_000, PayloadKind::Structured).await;
        h.ctl.activate().await.unwrap();
        let err = h.ctl.capture(Payload::text("not json")).unwrap_err();
        assert!(matches!(
            err,
            AttemptError::PayloadKindMismatch {
                expected: PayloadKind::Structured,
                got: PayloadKind::Text
            }
        ));
        assert!(h.ctl.state().captured_payload.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn unsupported_kind_stays_idle() {
        let mut h = Harness::with_recorder(
            0,
            10_000,
            PayloadKind::Audio,
            BufferedRecorder::new(vec![PayloadKind::Text]),
        )
        .await;
        let err = h.ctl.activate().await.unwrap_err();
        assert!(matches!(err, AttemptError::Unsupported(PayloadKind::Audio)));
        assert_eq!(h.ctl.phase(), Phase::Idle);
        assert!(!h.ctl.has_clock());
    }

    #[tokio::test(start_paused = true)]
    async fn recorder_start_failure_ends_in_error() {
        let recorder = BufferedRecorder::all_kinds();
        recorder.fail_start(true);
        let mut h = Harness::with_recorder(0, 10_000, PayloadKind::Audio, recorder).await;

        assert!(matches!(
            h.ctl.activate().await,
            Err(AttemptError::Recorder(_))
        ));
        assert_eq!(h.ctl.phase(), Phase::Error);
        assert!(matches!(
            h.ctl.state().last_error,
            Some(AttemptFailure::Recorder { .. })
        ));
        assert!(!h.ctl.has_clock());
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_queue_is_reported() {
        let mut h = Harness::new(0, 10_000, PayloadKind::Text).await;
        h.queue.stop().await;
        h.ctl.activate().await.unwrap();
        h.ctl.capture(Payload::text("answer")).unwrap();

        assert!(matches!(h.ctl.submit().await, Err(AttemptError::Queue(_))));
        assert_eq!(h.ctl.phase(), Phase::Error);
        assert!(matches!(
            h.ctl.state().last_error,
            Some(AttemptFailure::QueueUnavailable { .. })
        ));
    }
}
