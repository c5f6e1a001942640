//! Delivery guarantees of the submission queue against the mock scorer.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;

use mockprep_core::events::{ChannelSink, Event, QueueEvent};
use mockprep_core::memory::MemorySpool;
use mockprep_core::model::{AttemptId, DeliveryStatus, Payload, SubmissionRequest, SubmitTrigger};
use mockprep_core::queue::{QueueConfig, SubmissionQueue};
use mockprep_core::traits::SubmissionSpool;
use mockprep_scorer::{MockOutcome, MockScorer};

fn request(id: &str) -> SubmissionRequest {
    let now = Utc::now();
    SubmissionRequest {
        attempt_id: AttemptId::from(id),
        question_id: format!("q-{id}"),
        session_id: "s1".into(),
        payload: Payload::text("answer"),
        created_at: now,
        retry_count: 0,
        submit_trigger: SubmitTrigger::User,
        answer_started_at: now,
        answer_deadline: now + chrono::Duration::seconds(60),
    }
}

async fn start(
    scorer: Arc<MockScorer>,
    spool: Arc<MemorySpool>,
) -> (SubmissionQueue, mpsc::UnboundedReceiver<Event>) {
    let (sink, rx) = ChannelSink::new();
    let queue = SubmissionQueue::start(scorer, spool, Arc::new(sink), QueueConfig::default()).await;
    (queue, rx)
}

fn settled(rx: &mut mpsc::UnboundedReceiver<Event>) -> Vec<QueueEvent> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let Event::Queue(q) = event {
            if matches!(q.status, DeliveryStatus::Delivered | DeliveryStatus::Failed) {
                out.push(q);
            }
        }
    }
    out
}

#[tokio::test(start_paused = true)]
async fn three_outages_then_one_delivery() {
    let scorer = Arc::new(MockScorer::failing_first(3));
    let (queue, mut rx) = start(scorer.clone(), Arc::new(MemorySpool::new())).await;

    queue.enqueue(request("a1")).await.unwrap();
    queue.wait_idle(Duration::from_secs(120)).await.unwrap();

    let settled = settled(&mut rx);
    assert_eq!(settled.len(), 1);
    assert_eq!(settled[0].status, DeliveryStatus::Delivered);
    assert_eq!(settled[0].retry_count, 3);
    assert_eq!(scorer.call_count(), 4);
    assert_eq!(scorer.applied_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn redelivery_has_one_effect() {
    let scorer = Arc::new(MockScorer::new());
    let spool = Arc::new(MemorySpool::new());
    let (queue, mut rx) = start(scorer.clone(), spool.clone()).await;

    queue.enqueue(request("a1")).await.unwrap();
    queue.enqueue(request("a1")).await.unwrap();
    queue.wait_idle(Duration::from_secs(10)).await.unwrap();
    assert_eq!(settled(&mut rx).len(), 1);
    queue.stop().await;

    // A crash between delivery and unspooling replays the request on restart.
    spool.put(&request("a1")).await.unwrap();
    let (restarted, mut rx) = start(scorer.clone(), spool.clone()).await;
    restarted.wait_idle(Duration::from_secs(10)).await.unwrap();

    let settled = settled(&mut rx);
    assert_eq!(settled.len(), 1);
    assert!(settled[0].detail.as_deref().unwrap_or_default().contains("already applied"));
    assert_eq!(scorer.call_count(), 2);
    assert_eq!(scorer.applied_count(), 1);
    assert!(spool.is_empty());
}

#[tokio::test(start_paused = true)]
async fn never_two_deliveries_in_flight_for_one_attempt() {
    let mut script = Vec::new();
    for _ in 0..3 {
        script.push(MockOutcome::Unavailable);
        script.push(MockOutcome::RateLimited { retry_after_ms: 10 });
    }
    let scorer = Arc::new(MockScorer::with_script(script).with_latency(Duration::from_millis(3000)));
    let (queue, mut rx) = start(scorer.clone(), Arc::new(MemorySpool::new())).await;

    for i in 0..5 {
        queue.enqueue(request(&format!("a{i}"))).await.unwrap();
        queue.enqueue(request(&format!("a{i}"))).await.unwrap();
    }
    queue.wait_idle(Duration::from_secs(600)).await.unwrap();

    assert_eq!(scorer.max_overlap(), 1);
    assert_eq!(scorer.applied_count(), 5);
    let settled = settled(&mut rx);
    assert_eq!(settled.len(), 5);
    assert!(settled.iter().all(|e| e.status == DeliveryStatus::Delivered));
}

#[tokio::test(start_paused = true)]
async fn rejection_is_reported_once_and_dropped() {
    let scorer = Arc::new(MockScorer::with_script(vec![MockOutcome::Reject]));
    let spool = Arc::new(MemorySpool::new());
    let (queue, mut rx) = start(scorer.clone(), spool.clone()).await;

    queue.enqueue(request("a1")).await.unwrap();
    queue.wait_idle(Duration::from_secs(10)).await.unwrap();
    tokio::time::sleep(Duration::from_secs(120)).await;

    let settled = settled(&mut rx);
    assert_eq!(settled.len(), 1);
    assert_eq!(settled[0].status, DeliveryStatus::Failed);
    assert_eq!(scorer.call_count(), 1);
    assert_eq!(scorer.applied_count(), 0);
    assert!(spool.is_empty());
}
