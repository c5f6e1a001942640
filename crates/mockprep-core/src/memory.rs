//! In-memory collaborators for tests, demos and offline practice runs.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::error::{RecorderError, ScorerError, StoreError};
use crate::model::{
    AttemptId, Checkpoint, Payload, PayloadKind, ScoreReceipt, SubmissionRequest,
};
use crate::traits::{ProgressStore, Recorder, Scorer, SubmissionSpool};

fn poisoned<E: std::fmt::Display>(e: E) -> StoreError {
    StoreError::Io(e.to_string())
}

/// Checkpoints kept in a map.
#[derive(Clone, Default)]
pub struct MemoryProgressStore {
    checkpoints: Arc<Mutex<HashMap<String, Checkpoint>>>,
}

impl MemoryProgressStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest checkpoint for a session, read synchronously.
    pub fn snapshot(&self, session_id: &str) -> Option<Checkpoint> {
        self.checkpoints
            .lock()
            .ok()
            .and_then(|guard| guard.get(session_id).cloned())
    }
}

#[async_trait]
impl ProgressStore for MemoryProgressStore {
    async fn get(&self, session_id: &str) -> Result<Option<Checkpoint>, StoreError> {
        let guard = self.checkpoints.lock().map_err(poisoned)?;
        Ok(guard.get(session_id).cloned())
    }

    async fn put(&self, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        let mut guard = self.checkpoints.lock().map_err(poisoned)?;
        guard.insert(checkpoint.session_id.clone(), checkpoint.clone());
        Ok(())
    }

    async fn remove(&self, session_id: &str) -> Result<(), StoreError> {
        let mut guard = self.checkpoints.lock().map_err(poisoned)?;
        guard.remove(session_id);
        Ok(())
    }
}

/// Spool kept in a map, ordered by attempt id.
#[derive(Clone, Default)]
pub struct MemorySpool {
    requests: Arc<Mutex<BTreeMap<AttemptId, SubmissionRequest>>>,
}

impl MemorySpool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.requests.lock().map(|g| g.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, attempt_id: &AttemptId) -> Option<SubmissionRequest> {
        self.requests
            .lock()
            .ok()
            .and_then(|g| g.get(attempt_id).cloned())
    }
}

#[async_trait]
impl SubmissionSpool for MemorySpool {
    async fn load_all(&self) -> Result<Vec<SubmissionRequest>, StoreError> {
        let guard = self.requests.lock().map_err(poisoned)?;
        Ok(guard.values().cloned().collect())
    }

    async fn put(&self, request: &SubmissionRequest) -> Result<(), StoreError> {
        let mut guard = self.requests.lock().map_err(poisoned)?;
        guard.insert(request.attempt_id.clone(), request.clone());
        Ok(())
    }

    async fn remove(&self, attempt_id: &AttemptId) -> Result<(), StoreError> {
        let mut guard = self.requests.lock().map_err(poisoned)?;
        guard.remove(attempt_id);
        Ok(())
    }
}

/// Recorder whose output is pushed in from outside.
///
/// Whatever was last handed to [`BufferedRecorder::produce`] is returned by
/// the next `stop()`. Front ends that deliver typed answers through
/// `AttemptController::capture` can use it with nothing produced at all.
pub struct BufferedRecorder {
    kinds: Vec<PayloadKind>,
    produced: Mutex<Option<Payload>>,
    started: Mutex<Vec<AttemptId>>,
    fail_start: AtomicBool,
}

impl BufferedRecorder {
    pub fn new(kinds: Vec<PayloadKind>) -> Self {
        Self {
            kinds,
            produced: Mutex::new(None),
            started: Mutex::new(Vec::new()),
            fail_start: AtomicBool::new(false),
        }
    }

    pub fn all_kinds() -> Self {
        Self::new(vec![
            PayloadKind::Text,
            PayloadKind::Audio,
            PayloadKind::Structured,
        ])
    }

    pub fn produce(&self, payload: Payload) {
        if let Ok(mut guard) = self.produced.lock() {
            *guard = Some(payload);
        }
    }

    /// Make subsequent `start` calls fail.
    pub fn fail_start(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::Relaxed);
    }

    /// Attempts that started capture, in order.
    pub fn started(&self) -> Vec<AttemptId> {
        self.started.lock().map(|g| g.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Recorder for BufferedRecorder {
    fn supports(&self, kind: PayloadKind) -> bool {
        self.kinds.contains(&kind)
    }

    async fn start(&self, attempt_id: &AttemptId, kind: PayloadKind) -> Result<(), RecorderError> {
        if !self.supports(kind) {
            return Err(RecorderError::Unsupported(kind));
        }
        if self.fail_start.load(Ordering::Relaxed) {
            return Err(RecorderError::Failed("input device unavailable".into()));
        }
        if let Ok(mut guard) = self.produced.lock() {
            *guard = None;
        }
        if let Ok(mut guard) = self.started.lock() {
            guard.push(attempt_id.clone());
        }
        Ok(())
    }

    async fn stop(&self, _attempt_id: &AttemptId) -> Result<Option<Payload>, RecorderError> {
        let mut guard = self
            .produced
            .lock()
            .map_err(|e| RecorderError::Failed(e.to_string()))?;
        Ok(guard.take())
    }
}

/// Scorer that accepts everything locally and applies each attempt id once.
///
/// Used for offline practice, where nothing leaves the machine.
#[derive(Default)]
pub struct DryRunScorer {
    applied: Mutex<Vec<SubmissionRequest>>,
    seen: Mutex<HashSet<AttemptId>>,
}

impl DryRunScorer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests applied so far, one per attempt id.
    pub fn applied(&self) -> Vec<SubmissionRequest> {
        self.applied.lock().map(|g| g.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Scorer for DryRunScorer {
    fn name(&self) -> &str {
        "dry-run"
    }

    async fn submit(&self, request: &SubmissionRequest) -> Result<ScoreReceipt, ScorerError> {
        let first = self
            .seen
            .lock()
            .map_err(|e| ScorerError::NetworkError(e.to_string()))?
            .insert(request.attempt_id.clone());
        if first {
            tracing::debug!(attempt_id = %request.attempt_id, "dry-run scorer applied submission");
            if let Ok(mut guard) = self.applied.lock() {
                guard.push(request.clone());
            }
        }
        Ok(ScoreReceipt {
            attempt_id: request.attempt_id.clone(),
            duplicate: !first,
        })
    }
}
