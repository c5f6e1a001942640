//! Submission queue.
//!
//! A single worker task owns the backlog and delivers requests to the scorer
//! with exponential backoff. Callers only ever append through
//! [`SubmissionQueue::enqueue`]; the worker is the only thing that edits or
//! removes entries.
//!
//! Guarantees:
//! - at most one delivery in flight per attempt id, several across attempts
//!   (capped by `max_in_flight`), with no ordering between attempts
//! - each request is reported `delivered` or `failed` exactly once
//! - every request is written to the spool before `enqueue` returns and is
//!   reloaded on the next start if it never settled
//!
//! Settled requests are also published as [`DeliveryOutcome`]s to every
//! [`SubmissionQueue::subscribe`]r, so a session can notice rejections.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::{QueueError, ScorerError};
use crate::events::{EventSink, QueueEvent};
use crate::model::{AttemptId, DeliveryStatus, ScoreReceipt, SubmissionRequest};
use crate::traits::{Scorer, SubmissionSpool};

/// Configuration for the submission queue.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound for any retry delay.
    pub max_delay: Duration,
    /// Retry horizon; `None` retries forever.
    pub max_retries: Option<u32>,
    /// Maximum concurrent deliveries across attempts.
    pub max_in_flight: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            max_retries: Some(8),
            max_in_flight: 4,
        }
    }
}

/// How many delivered attempt ids the worker remembers for deduplication.
const DELIVERED_MEMORY: usize = 1024;

const OUTCOME_CAPACITY: usize = 64;

/// Final result of one submission, as seen by subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryOutcome {
    pub attempt_id: AttemptId,
    pub session_id: String,
    pub question_id: String,
    /// `Delivered` or `Failed`.
    pub status: DeliveryStatus,
    pub detail: Option<String>,
}

/// Backoff before retry number `retry_count` (1-based).
pub fn backoff_delay(config: &QueueConfig, retry_count: u32) -> Duration {
    let exponent = retry_count.saturating_sub(1).min(16);
    config
        .base_delay
        .saturating_mul(1u32 << exponent)
        .min(config.max_delay)
}

enum Command {
    Enqueue(SubmissionRequest),
    Shutdown,
}

struct Shared {
    tx: mpsc::UnboundedSender<Command>,
    spool: Arc<dyn SubmissionSpool>,
    online: watch::Sender<bool>,
    pending: Arc<watch::Sender<usize>>,
    /// Enqueued but not yet picked up by the worker.
    inbox: Arc<AtomicUsize>,
    outcomes: broadcast::Sender<DeliveryOutcome>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to the running submission queue. Cheap to clone.
#[derive(Clone)]
pub struct SubmissionQueue {
    inner: Arc<Shared>,
}

impl SubmissionQueue {
    /// Load the spooled backlog and start the delivery worker.
    pub async fn start(
        scorer: Arc<dyn Scorer>,
        spool: Arc<dyn SubmissionSpool>,
        events: Arc<dyn EventSink>,
        config: QueueConfig,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (online_tx, online_rx) = watch::channel(true);
        let (pending_tx, _) = watch::channel(0usize);
        let pending = Arc::new(pending_tx);
        let inbox = Arc::new(AtomicUsize::new(0));
        let (outcomes, _) = broadcast::channel(OUTCOME_CAPACITY);

        let mut worker = Worker {
            scorer,
            spool: Arc::clone(&spool),
            events,
            config,
            backlog: HashMap::new(),
            delivered: RecentIds::new(DELIVERED_MEMORY),
            in_flight: FuturesUnordered::new(),
            pending: Arc::clone(&pending),
            inbox: Arc::clone(&inbox),
            outcomes: outcomes.clone(),
        };

        match spool.load_all().await {
            Ok(requests) => {
                if !requests.is_empty() {
                    tracing::info!("restored {} spooled submission(s)", requests.len());
                }
                for request in requests {
                    worker.insert(request);
                }
                worker.publish_pending();
            }
            Err(e) => tracing::warn!("failed to load submission spool: {e}"),
        }

        let handle = tokio::spawn(worker.run(rx, online_rx));

        Self {
            inner: Arc::new(Shared {
                tx,
                spool,
                online: online_tx,
                pending,
                inbox,
                outcomes,
                worker: Mutex::new(Some(handle)),
            }),
        }
    }

    /// Persist `request` and hand it to the worker. Does not wait for delivery.
    pub async fn enqueue(&self, request: SubmissionRequest) -> Result<(), QueueError> {
        if self.inner.tx.is_closed() {
            return Err(QueueError::Stopped);
        }
        if let Err(e) = self.inner.spool.put(&request).await {
            tracing::warn!(attempt_id = %request.attempt_id, "failed to spool submission: {e}");
        }
        self.inner.inbox.fetch_add(1, Ordering::SeqCst);
        self.inner.pending.send_modify(|n| *n += 1);
        if self.inner.tx.send(Command::Enqueue(request)).is_err() {
            self.inner.inbox.fetch_sub(1, Ordering::SeqCst);
            self.inner.pending.send_modify(|n| *n = n.saturating_sub(1));
            return Err(QueueError::Stopped);
        }
        Ok(())
    }

    /// Pause or resume dispatch. Going online makes every waiting request due.
    pub fn set_online(&self, online: bool) {
        let was = self.inner.online.send_replace(online);
        if was != online {
            tracing::info!(online, "connectivity changed");
        }
    }

    pub fn is_online(&self) -> bool {
        *self.inner.online.borrow()
    }

    /// Requests not yet delivered or failed.
    pub fn pending(&self) -> usize {
        *self.inner.pending.borrow()
    }

    pub fn is_running(&self) -> bool {
        !self.inner.tx.is_closed()
    }

    /// Receive the outcome of every request settled from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<DeliveryOutcome> {
        self.inner.outcomes.subscribe()
    }

    /// Wait until the backlog is empty.
    pub async fn wait_idle(&self, timeout: Duration) -> Result<(), QueueError> {
        if !self.is_running() {
            return match self.pending() {
                0 => Ok(()),
                _ => Err(QueueError::Stopped),
            };
        }
        let mut rx = self.inner.pending.subscribe();
        let drained = tokio::time::timeout(timeout, async {
            rx.wait_for(|n| *n == 0).await.map(|_| ())
        })
        .await;
        match drained {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(QueueError::Stopped),
            Err(_) => Err(QueueError::DrainTimeout(self.pending())),
        }
    }

    /// Stop the worker. Undelivered requests stay in the spool.
    pub async fn stop(&self) {
        let _ = self.inner.tx.send(Command::Shutdown);
        let handle = self
            .inner
            .worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

struct Entry {
    request: SubmissionRequest,
    due: Instant,
    in_flight: bool,
}

/// Bounded set of ids, forgetting the oldest first.
struct RecentIds {
    ids: HashSet<AttemptId>,
    order: VecDeque<AttemptId>,
    capacity: usize,
}

impl RecentIds {
    fn new(capacity: usize) -> Self {
        Self {
            ids: HashSet::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    fn contains(&self, id: &AttemptId) -> bool {
        self.ids.contains(id)
    }

    fn insert(&mut self, id: AttemptId) {
        if !self.ids.insert(id.clone()) {
            return;
        }
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
    }

    fn len(&self) -> usize {
        self.order.len()
    }
}

type Delivery = BoxFuture<'static, (AttemptId, Result<ScoreReceipt, ScorerError>)>;

struct Worker {
    scorer: Arc<dyn Scorer>,
    spool: Arc<dyn SubmissionSpool>,
    events: Arc<dyn EventSink>,
    config: QueueConfig,
    backlog: HashMap<AttemptId, Entry>,
    delivered: RecentIds,
    in_flight: FuturesUnordered<Delivery>,
    pending: Arc<watch::Sender<usize>>,
    inbox: Arc<AtomicUsize>,
    outcomes: broadcast::Sender<DeliveryOutcome>,
}

impl Worker {
    async fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<Command>,
        mut online: watch::Receiver<bool>,
    ) {
        let mut watching = true;
        let mut was_online = *online.borrow();
        loop {
            let is_online = *online.borrow_and_update();
            if is_online && !was_online {
                self.make_all_due();
            }
            was_online = is_online;
            if is_online {
                self.dispatch_due();
            }
            let next_due = if is_online && self.in_flight.len() < self.config.max_in_flight {
                self.next_due()
            } else {
                None
            };

            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(Command::Enqueue(request)) => self.accept(request).await,
                    Some(Command::Shutdown) | None => break,
                },
                Some((attempt_id, outcome)) = self.in_flight.next(), if !self.in_flight.is_empty() => {
                    self.settle(attempt_id, outcome).await;
                }
                _ = tokio::time::sleep_until(next_due.unwrap_or_else(Instant::now)), if next_due.is_some() => {}
                changed = online.changed(), if watching => {
                    if changed.is_err() {
                        watching = false;
                    }
                }
            }
        }

        tracing::debug!(
            pending = self.backlog.len(),
            remembered = self.delivered.len(),
            "submission queue stopped"
        );
    }

    fn insert(&mut self, request: SubmissionRequest) {
        self.backlog.insert(
            request.attempt_id.clone(),
            Entry {
                request,
                due: Instant::now(),
                in_flight: false,
            },
        );
    }

    async fn accept(&mut self, request: SubmissionRequest) {
        let attempt_id = request.attempt_id.clone();
        self.inbox.fetch_sub(1, Ordering::SeqCst);

        if self.delivered.contains(&attempt_id) {
            tracing::debug!(%attempt_id, "already delivered, ignoring");
            unspool(self.spool.clone(), &attempt_id).await;
            self.publish_pending();
            return;
        }
        if let Some(existing) = self.backlog.get(&attempt_id) {
            tracing::debug!(%attempt_id, "already queued, ignoring");
            let snapshot = existing.request.clone();
            respool(self.spool.clone(), &snapshot).await;
            self.publish_pending();
            return;
        }

        tracing::info!(%attempt_id, trigger = %request.submit_trigger, "submission queued");
        self.events.on_queue(&QueueEvent {
            attempt_id,
            status: DeliveryStatus::Queued,
            retry_count: request.retry_count,
            detail: None,
        });
        self.insert(request);
        self.publish_pending();
    }

    fn next_due(&self) -> Option<Instant> {
        self.backlog
            .values()
            .filter(|e| !e.in_flight)
            .map(|e| e.due)
            .min()
    }

    fn make_all_due(&mut self) {
        let now = Instant::now();
        for entry in self.backlog.values_mut().filter(|e| !e.in_flight) {
            entry.due = now;
        }
    }

    fn dispatch_due(&mut self) {
        let now = Instant::now();
        let mut due: Vec<(Instant, chrono::DateTime<chrono::Utc>, AttemptId)> = self
            .backlog
            .iter()
            .filter(|(_, e)| !e.in_flight && e.due <= now)
            .map(|(id, e)| (e.due, e.request.created_at, id.clone()))
            .collect();
        due.sort();

        for (_, _, attempt_id) in due {
            if self.in_flight.len() >= self.config.max_in_flight {
                break;
            }
            let Some(entry) = self.backlog.get_mut(&attempt_id) else {
                continue;
            };
            entry.in_flight = true;
            let request = entry.request.clone();
            let scorer = Arc::clone(&self.scorer);
            tracing::debug!(%attempt_id, retry = request.retry_count, "delivering submission");
            self.in_flight.push(Box::pin(async move {
                let outcome = scorer.submit(&request).await;
                (request.attempt_id, outcome)
            }));
        }
    }

    async fn settle(&mut self, attempt_id: AttemptId, outcome: Result<ScoreReceipt, ScorerError>) {
        let Some(entry) = self.backlog.get_mut(&attempt_id) else {
            return;
        };
        entry.in_flight = false;

        match outcome {
            Ok(receipt) => {
                let retry_count = entry.request.retry_count;
                let Some(entry) = self.backlog.remove(&attempt_id) else {
                    return;
                };
                self.delivered.insert(attempt_id.clone());
                unspool(self.spool.clone(), &attempt_id).await;
                tracing::info!(%attempt_id, retry_count, "submission delivered");
                let detail = receipt
                    .duplicate
                    .then(|| "scorer had already applied this attempt".to_string());
                self.finish(entry.request, DeliveryStatus::Delivered, detail);
            }
            Err(e) if e.is_permanent() => {
                let Some(entry) = self.backlog.remove(&attempt_id) else {
                    return;
                };
                unspool(self.spool.clone(), &attempt_id).await;
                tracing::warn!(%attempt_id, "submission rejected: {e}");
                self.finish(entry.request, DeliveryStatus::Failed, Some(e.to_string()));
            }
            Err(e) => {
                entry.request.retry_count += 1;
                let retry_count = entry.request.retry_count;

                if self.config.max_retries.is_some_and(|max| retry_count > max) {
                    let Some(entry) = self.backlog.remove(&attempt_id) else {
                        return;
                    };
                    unspool(self.spool.clone(), &attempt_id).await;
                    tracing::warn!(%attempt_id, retry_count, "giving up on submission: {e}");
                    let detail = format!("retries exhausted: {e}");
                    self.finish(entry.request, DeliveryStatus::Failed, Some(detail));
                } else {
                    let delay = e
                        .retry_after_ms()
                        .map(Duration::from_millis)
                        .unwrap_or_else(|| backoff_delay(&self.config, retry_count));
                    entry.due = Instant::now() + delay;
                    let snapshot = entry.request.clone();
                    respool(self.spool.clone(), &snapshot).await;
                    tracing::debug!(
                        %attempt_id,
                        retry_count,
                        delay_ms = delay.as_millis() as u64,
                        "delivery failed, will retry: {e}"
                    );
                    self.events.on_queue(&QueueEvent {
                        attempt_id,
                        status: DeliveryStatus::Retrying,
                        retry_count,
                        detail: Some(e.to_string()),
                    });
                }
            }
        }

        self.publish_pending();
    }

    /// Report a settled request to the event sink and to subscribers.
    fn finish(&self, request: SubmissionRequest, status: DeliveryStatus, detail: Option<String>) {
        self.events.on_queue(&QueueEvent {
            attempt_id: request.attempt_id.clone(),
            status,
            retry_count: request.retry_count,
            detail: detail.clone(),
        });
        // No subscribers is fine.
        let _ = self.outcomes.send(DeliveryOutcome {
            attempt_id: request.attempt_id,
            session_id: request.session_id,
            question_id: request.question_id,
            status,
            detail,
        });
    }

    fn publish_pending(&self) {
        self.pending
            .send_replace(self.backlog.len() + self.inbox.load(Ordering::SeqCst));
    }
}

// The worker is not `Sync` (its in-flight set holds boxed futures), so spool
// calls take an owned handle rather than borrowing the worker across an await.

async fn respool(spool: Arc<dyn SubmissionSpool>, request: &SubmissionRequest) {
    if let Err(e) = spool.put(request).await {
        tracing::warn!(attempt_id = %request.attempt_id, "failed to spool submission: {e}");
    }
}

async fn unspool(spool: Arc<dyn SubmissionSpool>, attempt_id: &AttemptId) {
    if let Err(e) = spool.remove(attempt_id).await {
        tracing::warn!(%attempt_id, "failed to drop spooled submission: {e}");
    }
}
