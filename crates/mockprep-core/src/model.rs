//! Core data model types for mockprep.
//!
//! These are the types shared by the attempt state machine, the submission
//! queue and the session orchestrator: attempt specs, captured payloads,
//! submission requests, test plans and session checkpoints.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::ops::Range;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Idempotency key for a single attempt.
///
/// A fresh id is minted every time a question is (re)armed, so a scorer that
/// sees the same id twice knows it is looking at a redelivery.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttemptId(String);

impl AttemptId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for AttemptId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AttemptId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for AttemptId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// ---------------------------------------------------------------------------
// Attempt specs and payloads
// ---------------------------------------------------------------------------

/// The shape of answer a question expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadKind {
    Text,
    Audio,
    Structured,
}

impl fmt::Display for PayloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PayloadKind::Text => write!(f, "text"),
            PayloadKind::Audio => write!(f, "audio"),
            PayloadKind::Structured => write!(f, "structured"),
        }
    }
}

impl FromStr for PayloadKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(PayloadKind::Text),
            "audio" | "speech" => Ok(PayloadKind::Audio),
            "structured" | "json" => Ok(PayloadKind::Structured),
            other => Err(format!("unknown payload kind: {other}")),
        }
    }
}

/// Skill category of a section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SectionKind {
    Speaking,
    Writing,
    Reading,
    Listening,
}

impl fmt::Display for SectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SectionKind::Speaking => write!(f, "speaking"),
            SectionKind::Writing => write!(f, "writing"),
            SectionKind::Reading => write!(f, "reading"),
            SectionKind::Listening => write!(f, "listening"),
        }
    }
}

impl FromStr for SectionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "speaking" => Ok(SectionKind::Speaking),
            "writing" => Ok(SectionKind::Writing),
            "reading" => Ok(SectionKind::Reading),
            "listening" => Ok(SectionKind::Listening),
            other => Err(format!("unknown section kind: {other}")),
        }
    }
}

/// Immutable description of one timed question.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptSpec {
    /// Question identifier from the question bank.
    pub question_id: String,
    /// Skill category this question belongs to.
    pub section_kind: SectionKind,
    /// Preparation window in milliseconds (0 skips preparation).
    #[serde(default)]
    pub prep_duration_ms: u64,
    /// Answer window in milliseconds.
    pub answer_duration_ms: u64,
    /// Expected answer shape.
    pub payload_kind: PayloadKind,
}

impl AttemptSpec {
    pub fn prep_duration(&self) -> Duration {
        Duration::from_millis(self.prep_duration_ms)
    }

    pub fn answer_duration(&self) -> Duration {
        Duration::from_millis(self.answer_duration_ms)
    }
}

/// A captured answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Payload {
    Text { text: String },
    Audio { uri: String, duration_ms: u64 },
    Structured { value: serde_json::Value },
}

impl Payload {
    pub fn text(text: impl Into<String>) -> Self {
        Payload::Text { text: text.into() }
    }

    pub fn kind(&self) -> PayloadKind {
        match self {
            Payload::Text { .. } => PayloadKind::Text,
            Payload::Audio { .. } => PayloadKind::Audio,
            Payload::Structured { .. } => PayloadKind::Structured,
        }
    }

    /// A payload with nothing in it counts as no answer at all.
    pub fn is_empty(&self) -> bool {
        match self {
            Payload::Text { text } => text.trim().is_empty(),
            Payload::Audio { uri, duration_ms } => uri.trim().is_empty() || *duration_ms == 0,
            Payload::Structured { value } => value.is_null(),
        }
    }
}

// ---------------------------------------------------------------------------
// Attempt state
// ---------------------------------------------------------------------------

/// Stage of a single attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Preparing,
    Answering,
    Submitting,
    Done,
    Error,
}

impl Phase {
    /// Preparing, answering and submitting hold the session's live slot.
    pub fn is_live(self) -> bool {
        matches!(self, Phase::Preparing | Phase::Answering | Phase::Submitting)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Done | Phase::Error)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Idle => write!(f, "idle"),
            Phase::Preparing => write!(f, "preparing"),
            Phase::Answering => write!(f, "answering"),
            Phase::Submitting => write!(f, "submitting"),
            Phase::Done => write!(f, "done"),
            Phase::Error => write!(f, "error"),
        }
    }
}

/// What made an attempt leave `answering`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SubmitTrigger {
    User,
    AutoExpire,
}

impl fmt::Display for SubmitTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubmitTrigger::User => write!(f, "user"),
            SubmitTrigger::AutoExpire => write!(f, "auto-expire"),
        }
    }
}

/// Attempt-level failure shown to the test taker.
///
/// Kept apart from scoring failures, which arrive later through queue events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum AttemptFailure {
    /// Nothing was captured before submit or expiry.
    NoPayload { trigger: SubmitTrigger },
    /// The recorder could not start or stop.
    Recorder { message: String },
    /// The submission queue refused the handoff.
    QueueUnavailable { message: String },
}

impl AttemptFailure {
    pub fn user_message(&self) -> String {
        match self {
            AttemptFailure::NoPayload {
                trigger: SubmitTrigger::AutoExpire,
            } => "Time ran out before an answer was recorded. Retry this question.".to_string(),
            AttemptFailure::NoPayload { .. } => {
                "No answer was recorded. Retry this question.".to_string()
            }
            AttemptFailure::Recorder { message } => format!("Recording failed: {message}"),
            AttemptFailure::QueueUnavailable { message } => {
                format!("Answer could not be saved for submission: {message}")
            }
        }
    }
}

/// Live state of one attempt, owned by its controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptState {
    pub phase: Phase,
    pub phase_started_at: DateTime<Utc>,
    /// Time spent in the current phase.
    pub elapsed_ms: u64,
    pub captured_payload: Option<Payload>,
    pub last_error: Option<AttemptFailure>,
}

impl AttemptState {
    pub fn idle() -> Self {
        Self {
            phase: Phase::Idle,
            phase_started_at: Utc::now(),
            elapsed_ms: 0,
            captured_payload: None,
            last_error: None,
        }
    }
}

impl Default for AttemptState {
    fn default() -> Self {
        Self::idle()
    }
}

// ---------------------------------------------------------------------------
// Submission requests
// ---------------------------------------------------------------------------

/// A captured answer on its way to the scorer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionRequest {
    /// Idempotency key.
    pub attempt_id: AttemptId,
    pub question_id: String,
    pub session_id: String,
    pub payload: Payload,
    pub created_at: DateTime<Utc>,
    /// Failed delivery attempts so far.
    #[serde(default)]
    pub retry_count: u32,
    pub submit_trigger: SubmitTrigger,
    /// When the answer window opened.
    pub answer_started_at: DateTime<Utc>,
    /// When the answer window closes; the server enforces it.
    pub answer_deadline: DateTime<Utc>,
}

/// Delivery status reported by the submission queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Queued,
    Delivered,
    Failed,
    Retrying,
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryStatus::Queued => write!(f, "queued"),
            DeliveryStatus::Delivered => write!(f, "delivered"),
            DeliveryStatus::Failed => write!(f, "failed"),
            DeliveryStatus::Retrying => write!(f, "retrying"),
        }
    }
}

/// Scorer acknowledgement of a delivered submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreReceipt {
    pub attempt_id: AttemptId,
    /// The scorer had already applied this attempt id.
    #[serde(default)]
    pub duplicate: bool,
}

// ---------------------------------------------------------------------------
// Test plans
// ---------------------------------------------------------------------------

/// A contiguous run of questions sharing a skill category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Section {
    pub name: String,
    pub kind: SectionKind,
    /// Scheduled break after this section, in milliseconds.
    #[serde(default)]
    pub break_after_ms: Option<u64>,
    #[serde(default)]
    pub attempts: Vec<AttemptSpec>,
}

/// An ordered sequence of sections for one test run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestPlan {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub sections: Vec<Section>,
}

impl TestPlan {
    /// Single-section plan without breaks, handy for practice runs.
    pub fn single(id: &str, kind: SectionKind, attempts: Vec<AttemptSpec>) -> Self {
        Self {
            id: id.to_string(),
            name: id.to_string(),
            description: String::new(),
            sections: vec![Section {
                name: kind.to_string(),
                kind,
                break_after_ms: None,
                attempts,
            }],
        }
    }

    /// Total number of questions across all sections.
    pub fn len(&self) -> usize {
        self.sections.iter().map(|s| s.attempts.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn attempts(&self) -> impl Iterator<Item = &AttemptSpec> {
        self.sections.iter().flat_map(|s| s.attempts.iter())
    }

    pub fn attempt(&self, index: usize) -> Option<&AttemptSpec> {
        self.attempts().nth(index)
    }

    /// Index of the section containing the flat question `index`.
    pub fn section_of(&self, index: usize) -> Option<usize> {
        let mut start = 0;
        for (i, section) in self.sections.iter().enumerate() {
            let end = start + section.attempts.len();
            if index < end {
                return Some(i);
            }
            start = end;
        }
        None
    }

    /// Flat index range covered by section `section`.
    pub fn section_range(&self, section: usize) -> Range<usize> {
        let start: usize = self.sections[..section.min(self.sections.len())]
            .iter()
            .map(|s| s.attempts.len())
            .sum();
        let len = self
            .sections
            .get(section)
            .map(|s| s.attempts.len())
            .unwrap_or(0);
        start..start + len
    }
}

// ---------------------------------------------------------------------------
// Session state
// ---------------------------------------------------------------------------

/// Lifecycle of a test run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    OnBreak,
    Completed,
    Abandoned,
}

impl SessionStatus {
    pub fn is_closed(self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Abandoned)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionStatus::Active => write!(f, "active"),
            SessionStatus::OnBreak => write!(f, "on_break"),
            SessionStatus::Completed => write!(f, "completed"),
            SessionStatus::Abandoned => write!(f, "abandoned"),
        }
    }
}

/// Progress of one test run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub session_id: String,
    pub plan: TestPlan,
    pub current_index: usize,
    /// Question ids whose attempt was handed to the submission queue.
    pub completed_attempt_ids: BTreeSet<String>,
    /// Question ids whose submission the scorer refused; they can be
    /// answered again.
    pub rejected_question_ids: BTreeSet<String>,
    /// Active time per section name.
    pub section_elapsed_ms: BTreeMap<String, u64>,
    pub status: SessionStatus,
    pub updated_at: DateTime<Utc>,
}

impl SessionState {
    pub fn fresh(session_id: &str, plan: TestPlan) -> Self {
        let status = if plan.is_empty() {
            SessionStatus::Completed
        } else {
            SessionStatus::Active
        };
        Self {
            session_id: session_id.to_string(),
            plan,
            current_index: 0,
            completed_attempt_ids: BTreeSet::new(),
            rejected_question_ids: BTreeSet::new(),
            section_elapsed_ms: BTreeMap::new(),
            status,
            updated_at: Utc::now(),
        }
    }

    /// Rebuild state from a checkpoint, or `None` if it doesn't fit `plan`.
    pub fn restore(plan: TestPlan, checkpoint: Checkpoint) -> Option<Self> {
        if checkpoint.current_index > plan.len() {
            return None;
        }
        if checkpoint.current_index == plan.len() && !checkpoint.status.is_closed() {
            return None;
        }
        let known: BTreeSet<&str> = plan.attempts().map(|a| a.question_id.as_str()).collect();
        if checkpoint
            .completed_attempt_ids
            .iter()
            .chain(&checkpoint.rejected_question_ids)
            .any(|id| !known.contains(id.as_str()))
        {
            return None;
        }
        Some(Self {
            session_id: checkpoint.session_id,
            plan,
            current_index: checkpoint.current_index,
            completed_attempt_ids: checkpoint.completed_attempt_ids.into_iter().collect(),
            rejected_question_ids: checkpoint.rejected_question_ids.into_iter().collect(),
            section_elapsed_ms: checkpoint.section_elapsed_ms,
            status: checkpoint.status,
            updated_at: checkpoint.updated_at,
        })
    }

    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            session_id: self.session_id.clone(),
            current_index: self.current_index,
            completed_attempt_ids: self.completed_attempt_ids.iter().cloned().collect(),
            rejected_question_ids: self.rejected_question_ids.iter().cloned().collect(),
            section_elapsed_ms: self.section_elapsed_ms.clone(),
            status: self.status,
            updated_at: self.updated_at,
        }
    }

    pub fn current_attempt(&self) -> Option<&AttemptSpec> {
        self.plan.attempt(self.current_index)
    }

    pub fn is_completed(&self, index: usize) -> bool {
        self.plan
            .attempt(index)
            .is_some_and(|a| self.completed_attempt_ids.contains(&a.question_id))
    }

    /// Total active time across all sections.
    pub fn elapsed_ms(&self) -> u64 {
        self.section_elapsed_ms.values().sum()
    }
}

/// Persisted layout of a session checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub session_id: String,
    pub current_index: usize,
    pub completed_attempt_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rejected_question_ids: Vec<String>,
    #[serde(default)]
    pub section_elapsed_ms: BTreeMap<String, u64>,
    pub status: SessionStatus,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(id: &str) -> AttemptSpec {
        AttemptSpec {
            question_id: id.into(),
            section_kind: SectionKind::Speaking,
            prep_duration_ms: 0,
            answer_duration_ms: 1000,
            payload_kind: PayloadKind::Text,
        }
    }

    fn two_sections() -> TestPlan {
        TestPlan {
            id: "plan".into(),
            name: "Plan".into(),
            description: String::new(),
            sections: vec![
                Section {
                    name: "one".into(),
                    kind: SectionKind::Speaking,
                    break_after_ms: Some(1000),
                    attempts: (0..5).map(|i| spec(&format!("q{i}"))).collect(),
                },
                Section {
                    name: "two".into(),
                    kind: SectionKind::Reading,
                    break_after_ms: None,
                    attempts: (5..8).map(|i| spec(&format!("q{i}"))).collect(),
                },
            ],
        }
    }

    #[test]
    fn payload_kind_display_and_parse() {
        assert_eq!(PayloadKind::Audio.to_string(), "audio");
        assert_eq!("TEXT".parse::<PayloadKind>().unwrap(), PayloadKind::Text);
        assert_eq!("json".parse::<PayloadKind>().unwrap(), PayloadKind::Structured);
        assert!("video".parse::<PayloadKind>().is_err());
    }

    #[test]
    fn empty_payloads() {
        assert!(Payload::text("   ").is_empty());
        assert!(!Payload::text("an answer").is_empty());
        assert!(Payload::Structured {
            value: serde_json::Value::Null
        }
        .is_empty());
        assert!(Payload::Audio {
            uri: "file:///a.wav".into(),
            duration_ms: 0
        }
        .is_empty());
    }

    #[test]
    fn submit_trigger_serializes_kebab_case() {
        let json = serde_json::to_string(&SubmitTrigger::AutoExpire).unwrap();
        assert_eq!(json, "\"auto-expire\"");
    }

    #[test]
    fn plan_indexing_across_sections() {
        let plan = two_sections();
        assert_eq!(plan.len(), 8);
        assert_eq!(plan.section_of(4), Some(0));
        assert_eq!(plan.section_of(5), Some(1));
        assert_eq!(plan.section_of(8), None);
        assert_eq!(plan.section_range(1), 5..8);
        assert_eq!(plan.attempt(5).unwrap().question_id, "q5");
    }

    #[test]
    fn checkpoint_restore_rejects_foreign_state() {
        let plan = two_sections();
        let mut state = SessionState::fresh("s1", plan.clone());
        state.current_index = 2;
        state.completed_attempt_ids.insert("q0".into());
        state.completed_attempt_ids.insert("q1".into());

        let restored = SessionState::restore(plan.clone(), state.checkpoint()).unwrap();
        assert_eq!(restored.current_index, 2);
        assert!(restored.is_completed(1));
        assert!(!restored.is_completed(2));

        let mut bad = state.checkpoint();
        bad.current_index = 42;
        assert!(SessionState::restore(plan.clone(), bad).is_none());

        let mut unknown = state.checkpoint();
        unknown.completed_attempt_ids.push("zz".into());
        assert!(SessionState::restore(plan.clone(), unknown).is_none());

        let mut unknown_rejection = state.checkpoint();
        unknown_rejection.rejected_question_ids.push("zz".into());
        assert!(SessionState::restore(plan, unknown_rejection).is_none());
    }

    #[test]
    fn checkpoint_layout() {
        let state = SessionState::fresh("s1", two_sections());
        let json = serde_json::to_value(state.checkpoint()).unwrap();
        assert_eq!(json["status"], "active");
        assert_eq!(json["current_index"], 0);
        assert!(json["completed_attempt_ids"].as_array().unwrap().is_empty());
        assert!(json.get("updated_at").is_some());
    }
}
