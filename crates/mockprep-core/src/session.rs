//! Test-session orchestration.
//!
//! A [`SessionOrchestrator`] sequences the questions of one [`TestPlan`]:
//! it arms one [`AttemptController`] at a time, runs scheduled breaks between
//! sections, accrues active time per section, and checkpoints progress to the
//! [`ProgressStore`] whenever the index, status or live phase changes.
//!
//! All clocks of a session report into one channel. Front ends wait on
//! [`SessionOrchestrator::next_clock_event`] (cancel-safe, so it can sit in a
//! `select!` next to user input) and hand each event back through
//! [`SessionOrchestrator::handle_clock`].
//!
//! Delivery outcomes come back the same way through
//! [`SessionOrchestrator::next_delivery`] and
//! [`SessionOrchestrator::handle_delivery`]. A question whose submission the
//! scorer refused is no longer counted as answered and can be taken again
//! with [`SessionOrchestrator::reattempt`].

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc};

use crate::attempt::AttemptController;
use crate::clock::{AttemptClock, ClockEvent, ClockId, ClockSlot};
use crate::error::{AttemptError, SessionError};
use crate::events::{EventSink, SessionEvent};
use crate::model::{
    AttemptId, AttemptSpec, DeliveryStatus, Payload, Phase, SessionState, SessionStatus, TestPlan,
};
use crate::queue::{DeliveryOutcome, SubmissionQueue};
use crate::traits::{CompletionSink, ProgressStore, Recorder};

/// Collaborators a session runs against.
#[derive(Clone)]
pub struct SessionServices {
    pub store: Arc<dyn ProgressStore>,
    pub queue: SubmissionQueue,
    pub recorder: Arc<dyn Recorder>,
    pub completion: Arc<dyn CompletionSink>,
    pub events: Arc<dyn EventSink>,
    /// Clock tick interval for attempts and breaks.
    pub tick_interval: Duration,
}

/// Where a resumed session's state came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeSource {
    /// A checkpoint was found and matched the plan.
    Restored,
    /// No checkpoint existed.
    Fresh,
    /// The store failed or held an unusable checkpoint; started over.
    Degraded,
}

/// Result of [`SessionOrchestrator::activate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    /// The question was already handed off; show it without a clock.
    ReadOnly,
    Live(Phase),
}

/// The question at the current index.
#[derive(Debug, Clone, Copy)]
pub struct CurrentQuestion<'a> {
    pub index: usize,
    pub spec: &'a AttemptSpec,
    pub section: &'a str,
    pub read_only: bool,
}

pub struct SessionOrchestrator {
    state: SessionState,
    services: SessionServices,
    clock: AttemptClock,
    clock_rx: mpsc::UnboundedReceiver<ClockEvent>,
    live: Option<AttemptController>,
    break_slot: ClockSlot,
    /// Last elapsed reading per attempt clock, for accruing section time.
    accrued: Option<(ClockId, u64)>,
    outcomes: broadcast::Receiver<DeliveryOutcome>,
    /// Latest attempt handed off per question id.
    handed_off: HashMap<String, AttemptId>,
    finalized: bool,
    resume_source: ResumeSource,
}

impl SessionOrchestrator {
    /// Begin a new session at index 0.
    pub async fn start(session_id: &str, plan: TestPlan, services: SessionServices) -> Self {
        let state = SessionState::fresh(session_id, plan);
        tracing::info!(
            session_id,
            plan = %state.plan.id,
            questions = state.plan.len(),
            "session started"
        );
        let mut session = Self::with_state(state, services, ResumeSource::Fresh);
        session.persist().await;
        session.emit();
        session
    }

    /// Reload a session from its checkpoint.
    ///
    /// Never fails: storage problems and checkpoints that don't fit `plan`
    /// fall back to a fresh session and are logged.
    pub async fn resume(session_id: &str, plan: TestPlan, services: SessionServices) -> Self {
        let (state, source) = match services.store.get(session_id).await {
            Ok(Some(checkpoint)) => match SessionState::restore(plan.clone(), checkpoint) {
                Some(state) => (state, ResumeSource::Restored),
                None => {
                    tracing::warn!(session_id, "checkpoint does not match the plan, starting over");
                    (SessionState::fresh(session_id, plan), ResumeSource::Degraded)
                }
            },
            Ok(None) => {
                tracing::info!(session_id, "no checkpoint found, starting fresh");
                (SessionState::fresh(session_id, plan), ResumeSource::Fresh)
            }
            Err(e) => {
                tracing::warn!(session_id, "progress store unavailable, resume disabled: {e}");
                (SessionState::fresh(session_id, plan), ResumeSource::Degraded)
            }
        };

        tracing::info!(
            session_id,
            index = state.current_index,
            status = %state.status,
            source = ?source,
            "session resumed"
        );

        let mut session = Self::with_state(state, services, source);
        if session.state.status == SessionStatus::OnBreak {
            session.arm_break();
        }
        if source != ResumeSource::Restored {
            session.persist().await;
        }
        session.emit();
        session
    }

    fn with_state(state: SessionState, services: SessionServices, source: ResumeSource) -> Self {
        let (tx, clock_rx) = mpsc::unbounded_channel();
        let clock = AttemptClock::new(services.tick_interval, tx);
        let break_owner = AttemptId::from(format!("{}:break", state.session_id));
        let outcomes = services.queue.subscribe();
        Self {
            state,
            services,
            clock,
            clock_rx,
            live: None,
            break_slot: ClockSlot::new(break_owner),
            accrued: None,
            outcomes,
            handed_off: HashMap::new(),
            finalized: false,
            resume_source: source,
        }
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn session_id(&self) -> &str {
        &self.state.session_id
    }

    pub fn status(&self) -> SessionStatus {
        self.state.status
    }

    pub fn current_index(&self) -> usize {
        self.state.current_index
    }

    pub fn resume_source(&self) -> ResumeSource {
        self.resume_source
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn live(&self) -> Option<&AttemptController> {
        self.live.as_ref()
    }

    pub fn live_phase(&self) -> Option<Phase> {
        self.live.as_ref().map(|c| c.phase())
    }

    /// Questions already handed off are shown without a clock.
    pub fn is_read_only(&self, index: usize) -> bool {
        self.state.is_completed(index)
    }

    /// Question ids the scorer refused, waiting to be answered again.
    pub fn rejected_questions(&self) -> &BTreeSet<String> {
        &self.state.rejected_question_ids
    }

    /// The question being answered again, if the live attempt belongs to an
    /// earlier question than the current one.
    pub fn redo_question(&self) -> Option<&str> {
        let live = self.live.as_ref()?;
        let current = self.state.current_attempt();
        if current.is_some_and(|q| q.question_id == live.spec().question_id) {
            return None;
        }
        Some(live.spec().question_id.as_str())
    }

    pub fn current(&self) -> Option<CurrentQuestion<'_>> {
        let index = self.state.current_index;
        let spec = self.state.plan.attempt(index)?;
        Some(CurrentQuestion {
            index,
            spec,
            section: self.section_name(index).unwrap_or_default(),
            read_only: self.state.is_completed(index),
        })
    }

    pub fn break_remaining_ms(&self) -> u64 {
        self.break_slot.remaining_ms()
    }

    /// Whether any clock (attempt or break) is running.
    pub fn has_clock(&self) -> bool {
        self.break_slot.is_armed() || self.live.as_ref().is_some_and(|c| c.has_clock())
    }

    fn index_of(&self, question_id: &str) -> Option<usize> {
        self.state
            .plan
            .attempts()
            .position(|a| a.question_id == question_id)
    }

    fn section_name(&self, index: usize) -> Option<&str> {
        let section = self.state.plan.section_of(index)?;
        Some(self.state.plan.sections[section].name.as_str())
    }

    // -----------------------------------------------------------------------
    // Attempts
    // -----------------------------------------------------------------------

    /// Arm the question at the current index.
    ///
    /// Any controller left from another question is cancelled first. For the
    /// same question, a running attempt is left alone and its phase returned,
    /// an idle controller (after a reset) is re-armed under its new attempt
    /// id, and a failed one has to be reset before it can be armed again.
    pub async fn activate(&mut self) -> Result<Activation, SessionError> {
        self.ensure_active()?;
        self.sync_deliveries().await;
        let index = self.state.current_index;
        let Some(spec) = self.state.plan.attempt(index).cloned() else {
            return Err(SessionError::Closed(self.state.status));
        };
        if let Some(activation) = self.keep_live(&spec.question_id)? {
            return Ok(activation);
        }

        if self.state.is_completed(index) {
            self.cancel_live().await;
            tracing::debug!(index, question_id = %spec.question_id, "question already answered");
            return Ok(Activation::ReadOnly);
        }
        self.arm(spec).await
    }

    /// Answer a question again after the scorer refused its submission.
    ///
    /// The question may lie behind the current index; the index itself does
    /// not move. Once the new answer is handed off the front end goes back to
    /// the current question with [`activate`](Self::activate).
    pub async fn reattempt(&mut self, question_id: &str) -> Result<Activation, SessionError> {
        self.ensure_active()?;
        self.sync_deliveries().await;
        if !self.state.rejected_question_ids.contains(question_id) {
            return Err(SessionError::NothingToRedo(question_id.to_string()));
        }
        let Some(spec) = self
            .index_of(question_id)
            .and_then(|i| self.state.plan.attempt(i))
            .cloned()
        else {
            return Err(SessionError::NothingToRedo(question_id.to_string()));
        };
        if let Some(activation) = self.keep_live(question_id)? {
            return Ok(activation);
        }
        tracing::info!(
            session_id = %self.state.session_id,
            question_id,
            "answering rejected question again"
        );
        self.arm(spec).await
    }

    /// Decide what to do with a live controller for `question_id`.
    ///
    /// `Some` when the attempt is still running and must not be restarted.
    /// Controllers of other questions, or finished ones, are cancelled.
    fn keep_live(&self, question_id: &str) -> Result<Option<Activation>, SessionError> {
        let Some(controller) = self.live.as_ref() else {
            return Ok(None);
        };
        if controller.spec().question_id != question_id {
            return Ok(None);
        }
        match controller.phase() {
            phase if phase.is_live() => Ok(Some(Activation::Live(phase))),
            Phase::Error => Err(AttemptError::InvalidTransition {
                from: Phase::Error,
                input: "activate",
            }
            .into()),
            _ => Ok(None),
        }
    }

    /// Arm `spec`, reusing an idle controller for the same question.
    async fn arm(&mut self, spec: AttemptSpec) -> Result<Activation, SessionError> {
        let reusable = self
            .live
            .as_ref()
            .is_some_and(|c| c.phase() == Phase::Idle && c.spec().question_id == spec.question_id);
        if !reusable {
            self.cancel_live().await;
        }

        let mut controller = match self.live.take() {
            Some(controller) => controller,
            None => AttemptController::new(
                spec,
                self.state.session_id.clone(),
                self.clock.clone(),
                Arc::clone(&self.services.recorder),
                self.services.queue.clone(),
                Arc::clone(&self.services.events),
            ),
        };
        let result = controller.activate().await;
        self.live = Some(controller);
        self.after_attempt(Phase::Idle).await;
        Ok(Activation::Live(result?))
    }

    pub async fn skip_prep(&mut self) -> Result<Phase, SessionError> {
        self.accrue_live();
        let controller = self.live.as_mut().ok_or(SessionError::NoLiveAttempt)?;
        let before = controller.phase();
        let result = controller.skip_prep().await;
        self.after_attempt(before).await;
        Ok(result?)
    }

    pub fn capture(&mut self, payload: Payload) -> Result<(), SessionError> {
        let controller = self.live.as_mut().ok_or(SessionError::NoLiveAttempt)?;
        Ok(controller.capture(payload)?)
    }

    pub async fn submit(&mut self) -> Result<Phase, SessionError> {
        self.accrue_live();
        let controller = self.live.as_mut().ok_or(SessionError::NoLiveAttempt)?;
        let before = controller.phase();
        let result = controller.submit().await;
        self.after_attempt(before).await;
        Ok(result?)
    }

    /// Put the live attempt back to idle so it can be retried.
    pub async fn reset_attempt(&mut self) -> Result<Phase, SessionError> {
        self.accrue_live();
        let controller = self.live.as_mut().ok_or(SessionError::NoLiveAttempt)?;
        let before = controller.phase();
        let phase = controller.reset().await;
        self.after_attempt(before).await;
        Ok(phase)
    }

    // -----------------------------------------------------------------------
    // Clock events
    // -----------------------------------------------------------------------

    /// Wait for the next clock event. Cancel-safe.
    pub async fn next_clock_event(&mut self) -> Option<ClockEvent> {
        self.clock_rx.recv().await
    }

    /// Route a clock event to the live attempt or the running break.
    ///
    /// Returns `false` for events from clocks that are no longer armed.
    pub async fn handle_clock(&mut self, event: ClockEvent) -> bool {
        if self.break_slot.accepts(&event) {
            if event.is_expiry() {
                self.break_slot.expired();
                tracing::info!(session_id = %self.state.session_id, "break over");
                self.end_break().await;
            }
            return true;
        }

        let Some(controller) = self.live.as_mut() else {
            return false;
        };
        if !controller.owns(&event) {
            return false;
        }

        let before = controller.phase();
        self.accrue(event.clock, event.elapsed_ms);
        let Some(controller) = self.live.as_mut() else {
            return false;
        };
        if let Err(e) = controller.on_clock(event).await {
            tracing::debug!(attempt_id = %controller.attempt_id(), "attempt ended with error: {e}");
        }
        self.after_attempt(before).await;
        true
    }

    /// Wait for and handle one clock event. `None` when no clock is running.
    pub async fn pump(&mut self) -> Option<ClockEvent> {
        if !self.has_clock() {
            return None;
        }
        let event = self.next_clock_event().await?;
        self.handle_clock(event).await;
        Some(event)
    }

    /// Credit the live attempt's section with clock time since the last
    /// reading of `clock`.
    fn accrue(&mut self, clock: ClockId, elapsed_ms: u64) {
        if self.state.status != SessionStatus::Active {
            return;
        }
        let previous = match self.accrued {
            Some((id, ms)) if id == clock => ms,
            _ => 0,
        };
        let delta = elapsed_ms.saturating_sub(previous);
        self.accrued = Some((clock, elapsed_ms.max(previous)));

        let index = self
            .live
            .as_ref()
            .and_then(|c| self.index_of(&c.spec().question_id))
            .unwrap_or(self.state.current_index);
        let Some(section) = self.section_name(index).map(str::to_string) else {
            return;
        };
        *self.state.section_elapsed_ms.entry(section).or_insert(0) += delta;
    }

    /// Accrue the time the live clock has run since its last tick. Called
    /// before anything that stops the clock.
    fn accrue_live(&mut self) {
        let reading = self.live.as_ref().and_then(|c| c.clock_reading());
        if let Some((clock, elapsed_ms)) = reading {
            self.accrue(clock, elapsed_ms);
        }
    }

    // -----------------------------------------------------------------------
    // Delivery outcomes
    // -----------------------------------------------------------------------

    /// Wait for the next settled submission. Cancel-safe.
    pub async fn next_delivery(&mut self) -> Option<DeliveryOutcome> {
        loop {
            match self.outcomes.recv().await {
                Ok(outcome) => return Some(outcome),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "missed delivery outcomes");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Apply a delivery outcome. Returns `true` when it took an answered
    /// question back out of the completed set.
    pub async fn handle_delivery(&mut self, outcome: DeliveryOutcome) -> bool {
        if !self.note_delivery(&outcome) {
            return false;
        }
        self.persist().await;
        true
    }

    /// Apply every outcome that has already arrived. Returns how many
    /// questions were reopened.
    pub async fn sync_deliveries(&mut self) -> usize {
        let mut reopened = 0;
        loop {
            match self.outcomes.try_recv() {
                Ok(outcome) => {
                    if self.note_delivery(&outcome) {
                        reopened += 1;
                    }
                }
                Err(broadcast::error::TryRecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "missed delivery outcomes");
                }
                Err(_) => break,
            }
        }
        if reopened > 0 {
            self.persist().await;
        }
        reopened
    }

    fn note_delivery(&mut self, outcome: &DeliveryOutcome) -> bool {
        if outcome.session_id != self.state.session_id {
            return false;
        }
        let question_id = &outcome.question_id;
        // A newer answer for the same question supersedes this one.
        if self
            .handed_off
            .get(question_id)
            .is_some_and(|latest| *latest != outcome.attempt_id)
        {
            return false;
        }
        if outcome.status != DeliveryStatus::Failed {
            self.handed_off.remove(question_id);
            return false;
        }
        if !self.state.completed_attempt_ids.remove(question_id) {
            return false;
        }
        self.handed_off.remove(question_id);
        self.state.rejected_question_ids.insert(question_id.clone());
        tracing::warn!(
            session_id = %self.state.session_id,
            question_id = %question_id,
            attempt_id = %outcome.attempt_id,
            detail = outcome.detail.as_deref().unwrap_or_default(),
            "submission not accepted, question reopened"
        );
        true
    }

    // -----------------------------------------------------------------------
    // Navigation
    // -----------------------------------------------------------------------

    /// Move past the current question.
    ///
    /// At the end of a section with a scheduled break the session goes
    /// `on_break` and stays on the same index; advancing again (or the break
    /// clock running out) moves on to the next section. Past the last
    /// question the session is `completed`.
    pub async fn advance(&mut self) -> Result<SessionStatus, SessionError> {
        match self.state.status {
            SessionStatus::OnBreak => {
                self.end_break().await;
                return Ok(self.state.status);
            }
            SessionStatus::Active => {}
            status => return Err(SessionError::Closed(status)),
        }

        self.cancel_live().await;

        let index = self.state.current_index;
        let len = self.state.plan.len();
        let break_ms = self
            .state
            .plan
            .section_of(index)
            .filter(|&s| self.state.plan.section_range(s).end == index + 1)
            .and_then(|s| self.state.plan.sections[s].break_after_ms)
            .filter(|&ms| ms > 0);

        if index + 1 >= len {
            self.state.current_index = len;
            self.state.status = SessionStatus::Completed;
            tracing::info!(session_id = %self.state.session_id, "all questions visited");
        } else if let Some(break_ms) = break_ms {
            self.state.status = SessionStatus::OnBreak;
            self.arm_break();
            tracing::info!(
                session_id = %self.state.session_id,
                break_ms,
                "section finished, break started"
            );
        } else {
            self.state.current_index = index + 1;
        }

        self.emit();
        self.persist().await;
        Ok(self.state.status)
    }

    /// Stop the session for good. The checkpoint is removed.
    pub async fn abandon(&mut self) -> Result<(), SessionError> {
        if self.state.status.is_closed() {
            return Err(SessionError::Closed(self.state.status));
        }
        self.cancel_live().await;
        self.break_slot.disarm();
        self.state.status = SessionStatus::Abandoned;
        self.state.updated_at = Utc::now();
        tracing::info!(session_id = %self.state.session_id, "session abandoned");
        self.emit();
        self.remove_checkpoint().await;
        Ok(())
    }

    /// Cancel running clocks when the view goes away. Submissions already
    /// queued keep being delivered and the checkpoint stays for resume.
    pub async fn teardown(&mut self) {
        self.cancel_live().await;
        self.break_slot.disarm();
    }

    /// Notify the completion sink once the session is complete.
    ///
    /// Calling it again afterwards is a no-op.
    pub async fn finalize(&mut self) -> Result<(), SessionError> {
        if self.finalized {
            tracing::debug!(session_id = %self.state.session_id, "already finalized");
            return Ok(());
        }
        match self.state.status {
            SessionStatus::Completed => {}
            SessionStatus::Abandoned => return Err(SessionError::Closed(SessionStatus::Abandoned)),
            _ => return Err(SessionError::NotComplete),
        }
        self.sync_deliveries().await;

        self.services
            .completion
            .session_completed(&self.state)
            .await
            .map_err(|e| SessionError::Completion(format!("{e:#}")))?;
        self.finalized = true;
        tracing::info!(session_id = %self.state.session_id, "session finalized");
        self.remove_checkpoint().await;
        Ok(())
    }

    fn ensure_active(&self) -> Result<(), SessionError> {
        match self.state.status {
            SessionStatus::Active => Ok(()),
            SessionStatus::OnBreak => Err(SessionError::OnBreak),
            status => Err(SessionError::Closed(status)),
        }
    }

    fn arm_break(&mut self) {
        let Some(ms) = self
            .state
            .plan
            .section_of(self.state.current_index)
            .and_then(|s| self.state.plan.sections[s].break_after_ms)
        else {
            return;
        };
        self.break_slot.disarm();
        if let Err(e) = self.break_slot.arm(&self.clock, Duration::from_millis(ms)) {
            tracing::error!("failed to start break clock: {e}");
        }
    }

    async fn end_break(&mut self) {
        self.break_slot.disarm();
        self.state.status = SessionStatus::Active;
        self.state.current_index += 1;
        self.emit();
        self.persist().await;
    }

    async fn cancel_live(&mut self) {
        self.accrue_live();
        if let Some(mut controller) = self.live.take() {
            if controller.is_live() {
                tracing::debug!(
                    attempt_id = %controller.attempt_id(),
                    phase = %controller.phase(),
                    "cancelling attempt left behind by navigation"
                );
            }
            controller.cancel().await;
        }
        self.accrued = None;
    }

    /// Record a handed-off answer and checkpoint if the live phase moved.
    async fn after_attempt(&mut self, before: Phase) {
        let Some(controller) = self.live.as_ref() else {
            return;
        };
        let phase = controller.phase();
        if phase == before {
            return;
        }
        if phase == Phase::Done {
            let question_id = controller.spec().question_id.clone();
            let attempt_id = controller.attempt_id().clone();
            self.state.rejected_question_ids.remove(&question_id);
            self.state.completed_attempt_ids.insert(question_id.clone());
            self.handed_off.insert(question_id, attempt_id);
        }
        self.persist().await;
    }

    async fn persist(&mut self) {
        if self.finalized || self.state.status == SessionStatus::Abandoned {
            return;
        }
        self.state.updated_at = Utc::now();
        if let Err(e) = self.services.store.put(&self.state.checkpoint()).await {
            tracing::warn!(session_id = %self.state.session_id, "failed to save checkpoint: {e}");
        }
    }

    async fn remove_checkpoint(&self) {
        if let Err(e) = self.services.store.remove(&self.state.session_id).await {
            tracing::warn!(session_id = %self.state.session_id, "failed to remove checkpoint: {e}");
        }
    }

    fn emit(&self) {
        self.services.events.on_session(&SessionEvent {
            session_id: self.state.session_id.clone(),
            current_index: self.state.current_index,
            status: self.state.status,
            section: self
                .section_name(self.state.current_index)
                .map(str::to_string),
            elapsed_ms: self.state.elapsed_ms(),
        });
    }
}
