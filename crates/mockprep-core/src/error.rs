//! Error types.
//!
//! Scorer errors live here so the submission queue can classify failures
//! for retry decisions without string matching.

use thiserror::Error;

use crate::model::{AttemptId, PayloadKind, Phase};

/// Errors that can occur when delivering a submission to the scorer.
#[derive(Debug, Error)]
pub enum ScorerError {
    /// The scorer returned a 429 rate limit response.
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    /// The scorer rejected the submission (4xx).
    #[error("rejected (HTTP {status}): {message}")]
    Rejected { status: u16, message: String },

    /// The scorer is temporarily unavailable (5xx).
    #[error("scorer unavailable (HTTP {status}): {message}")]
    Unavailable { status: u16, message: String },

    /// The request timed out.
    #[error("request timed out after {0}s")]
    Timeout(u64),

    /// A network error occurred.
    #[error("network error: {0}")]
    NetworkError(String),
}

impl ScorerError {
    /// Returns `true` if this error is permanent and should not be retried.
    pub fn is_permanent(&self) -> bool {
        matches!(self, ScorerError::Rejected { .. })
    }

    /// Returns the retry-after delay in milliseconds, if applicable.
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            ScorerError::RateLimited { retry_after_ms } => Some(*retry_after_ms),
            _ => None,
        }
    }
}

/// Errors from an [`AttemptClock`](crate::clock::AttemptClock) slot.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ClockError {
    /// A second clock was started while one is still armed.
    #[error("a clock is already running for attempt {0}")]
    AlreadyRunning(AttemptId),
}

/// Errors from a recorder/input collaborator.
#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("recorder cannot capture {0} payloads")]
    Unsupported(PayloadKind),
    #[error("recorder failed: {0}")]
    Failed(String),
}

/// Errors surfaced by storage adapters.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    #[error("not found")]
    NotFound,

    #[error("io error: {0}")]
    Io(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// Errors from the submission queue.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("submission queue is not running")]
    Stopped,
    #[error("timed out waiting for {0} pending submission(s)")]
    DrainTimeout(usize),
}

/// Errors from an attempt controller.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AttemptError {
    #[error("cannot {input} while {from}")]
    InvalidTransition { from: Phase, input: &'static str },

    /// Submit or expiry happened with nothing captured.
    #[error("no answer was captured")]
    NoPayload,

    #[error("expected a {expected} payload, got {got}")]
    PayloadKindMismatch {
        expected: PayloadKind,
        got: PayloadKind,
    },

    #[error("recorder cannot capture {0} payloads")]
    Unsupported(PayloadKind),

    #[error(transparent)]
    Clock(#[from] ClockError),

    #[error(transparent)]
    Recorder(#[from] RecorderError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Errors from the session orchestrator.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SessionError {
    #[error("session is {0}")]
    Closed(crate::model::SessionStatus),

    #[error("session is on a break")]
    OnBreak,

    #[error("session is not complete yet")]
    NotComplete,

    #[error("no attempt is live")]
    NoLiveAttempt,

    #[error("question {0} has no rejected submission to answer again")]
    NothingToRedo(String),

    #[error(transparent)]
    Attempt(#[from] AttemptError),

    #[error("completion notification failed: {0}")]
    Completion(String),
}
