//! Collaborator trait definitions.
//!
//! The scorer, recorder, progress store, spool and completion sink are all
//! external to the timed-attempt core. `mockprep-scorer` and `mockprep-store`
//! provide the production implementations; [`crate::memory`] provides
//! in-process ones.

use async_trait::async_trait;

use crate::error::{RecorderError, ScorerError, StoreError};
use crate::model::{
    AttemptId, Checkpoint, Payload, PayloadKind, ScoreReceipt, SessionState, SubmissionRequest,
};

// ---------------------------------------------------------------------------
// Scorer
// ---------------------------------------------------------------------------

/// Backend that evaluates submitted answers.
///
/// Implementations must treat a repeated `attempt_id` as a no-op and still
/// answer with a receipt.
#[async_trait]
pub trait Scorer: Send + Sync {
    /// Human-readable scorer name (e.g. "http").
    fn name(&self) -> &str;

    /// Deliver one submission.
    async fn submit(&self, request: &SubmissionRequest) -> Result<ScoreReceipt, ScorerError>;
}

// ---------------------------------------------------------------------------
// Recorder / input
// ---------------------------------------------------------------------------

/// Captures the test taker's answer while an attempt is answering.
#[async_trait]
pub trait Recorder: Send + Sync {
    /// Whether this recorder can capture payloads of `kind`.
    fn supports(&self, kind: PayloadKind) -> bool;

    /// Begin capturing for an attempt entering `answering`.
    async fn start(&self, attempt_id: &AttemptId, kind: PayloadKind) -> Result<(), RecorderError>;

    /// Stop capturing and hand back whatever was produced.
    async fn stop(&self, attempt_id: &AttemptId) -> Result<Option<Payload>, RecorderError>;
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

/// Session checkpoint storage. Writes are last-write-wins per session id.
#[async_trait]
pub trait ProgressStore: Send + Sync {
    async fn get(&self, session_id: &str) -> Result<Option<Checkpoint>, StoreError>;

    async fn put(&self, checkpoint: &Checkpoint) -> Result<(), StoreError>;

    /// Drop a finished or abandoned session.
    async fn remove(&self, session_id: &str) -> Result<(), StoreError>;
}

/// Durable backlog for the submission queue.
#[async_trait]
pub trait SubmissionSpool: Send + Sync {
    async fn load_all(&self) -> Result<Vec<SubmissionRequest>, StoreError>;

    async fn put(&self, request: &SubmissionRequest) -> Result<(), StoreError>;

    async fn remove(&self, attempt_id: &AttemptId) -> Result<(), StoreError>;
}

// ---------------------------------------------------------------------------
// Completion
// ---------------------------------------------------------------------------

/// Receives the final snapshot of a completed session.
#[async_trait]
pub trait CompletionSink: Send + Sync {
    async fn session_completed(&self, state: &SessionState) -> anyhow::Result<()>;
}

/// Completion sink that only logs.
pub struct LogCompletion;

#[async_trait]
impl CompletionSink for LogCompletion {
    async fn session_completed(&self, state: &SessionState) -> anyhow::Result<()> {
        tracing::info!(
            session_id = %state.session_id,
            completed = state.completed_attempt_ids.len(),
            elapsed_ms = state.elapsed_ms(),
            "session completed"
        );
        Ok(())
    }
}
