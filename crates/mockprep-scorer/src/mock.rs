//! Mock scorer for testing and offline demos.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use mockprep_core::error::ScorerError;
use mockprep_core::model::{AttemptId, ScoreReceipt, SubmissionRequest};
use mockprep_core::traits::Scorer;

/// What the mock does with one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockOutcome {
    Accept,
    /// 503, retryable.
    Unavailable,
    /// 422, permanent.
    Reject,
    RateLimited { retry_after_ms: u64 },
}

/// A mock scorer that plays back scripted outcomes, then accepts.
///
/// Each attempt id is applied at most once; repeat deliveries are answered
/// with a duplicate receipt. It also tracks how many deliveries of the same
/// attempt were ever in flight at once.
pub struct MockScorer {
    script: Mutex<VecDeque<MockOutcome>>,
    latency: Duration,
    /// Number of calls made.
    call_count: AtomicU32,
    applied: Mutex<HashMap<AttemptId, SubmissionRequest>>,
    in_flight: Mutex<HashMap<AttemptId, u32>>,
    max_overlap: AtomicU32,
    last_request: Mutex<Option<SubmissionRequest>>,
}

fn locked<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl MockScorer {
    /// A mock that accepts everything.
    pub fn new() -> Self {
        Self::with_script(Vec::new())
    }

    pub fn with_script(script: Vec<MockOutcome>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            latency: Duration::ZERO,
            call_count: AtomicU32::new(0),
            applied: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            max_overlap: AtomicU32::new(0),
            last_request: Mutex::new(None),
        }
    }

    /// Fail the first `n` deliveries as unavailable.
    pub fn failing_first(n: usize) -> Self {
        Self::with_script(vec![MockOutcome::Unavailable; n])
    }

    /// Hold every delivery for `latency` before answering.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Get the number of calls made to this scorer.
    pub fn call_count(&self) -> u32 {
        self.call_count.load(Ordering::Relaxed)
    }

    /// Distinct attempts whose effect was applied.
    pub fn applied_count(&self) -> usize {
        locked(&self.applied).len()
    }

    pub fn applied(&self, attempt_id: &AttemptId) -> Option<SubmissionRequest> {
        locked(&self.applied).get(attempt_id).cloned()
    }

    /// Highest number of simultaneous deliveries seen for a single attempt.
    pub fn max_overlap(&self) -> u32 {
        self.max_overlap.load(Ordering::Relaxed)
    }

    /// Get the last request made to this scorer.
    pub fn last_request(&self) -> Option<SubmissionRequest> {
        locked(&self.last_request).clone()
    }
}

impl Default for MockScorer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Scorer for MockScorer {
    fn name(&self) -> &str {
        "mock"
    }

    async fn submit(&self, request: &SubmissionRequest) -> Result<ScoreReceipt, ScorerError> {
        self.call_count.fetch_add(1, Ordering::Relaxed);
        *locked(&self.last_request) = Some(request.clone());

        {
            let mut in_flight = locked(&self.in_flight);
            let n = in_flight.entry(request.attempt_id.clone()).or_insert(0);
            *n += 1;
            self.max_overlap.fetch_max(*n, Ordering::Relaxed);
        }

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        if let Some(n) = locked(&self.in_flight).get_mut(&request.attempt_id) {
            *n = n.saturating_sub(1);
        }

        let outcome = locked(&self.script)
            .pop_front()
            .unwrap_or(MockOutcome::Accept);

        match outcome {
            MockOutcome::Accept => {
                let mut applied = locked(&self.applied);
                let duplicate = applied.contains_key(&request.attempt_id);
                if !duplicate {
                    applied.insert(request.attempt_id.clone(), request.clone());
                }
                Ok(ScoreReceipt {
                    attempt_id: request.attempt_id.clone(),
                    duplicate,
                })
            }
            MockOutcome::Unavailable => Err(ScorerError::Unavailable {
                status: 503,
                message: "mock scorer unavailable".into(),
            }),
            MockOutcome::Reject => Err(ScorerError::Rejected {
                status: 422,
                message: "mock scorer rejected the submission".into(),
            }),
            MockOutcome::RateLimited { retry_after_ms } => {
                Err(ScorerError::RateLimited { retry_after_ms })
            }
        }
    }
}
