//! Terminal rendering of session events and typed answers.

use std::sync::Mutex;

use mockprep_core::events::{EventSink, PhaseEvent, QueueEvent, SessionEvent};
use mockprep_core::model::{AttemptId, DeliveryStatus, Payload, PayloadKind, Phase, SessionStatus};

/// Prints phase changes, countdown marks and delivery outcomes to stderr.
///
/// Ticks are thinned out: a countdown line every ten seconds, then every
/// second for the last five.
#[derive(Default)]
pub struct ConsoleSink {
    last: Mutex<Option<(AttemptId, Phase, u64)>>,
}

fn countdown_mark(secs: u64) -> bool {
    secs <= 5 || secs % 10 == 0
}

impl EventSink for ConsoleSink {
    fn on_phase(&self, event: &PhaseEvent) {
        let secs = event.remaining_ms.div_ceil(1000);
        let Ok(mut last) = self.last.lock() else {
            return;
        };
        let changed = !matches!(
            last.as_ref(),
            Some((id, phase, _)) if *id == event.attempt_id && *phase == event.phase
        );
        let repeated = matches!(last.as_ref(), Some((_, _, s)) if *s == secs);

        if changed {
            match event.phase {
                Phase::Preparing => eprintln!(
                    "  [{}] preparing, {secs}s. Press Enter to start answering.",
                    event.question_id
                ),
                Phase::Answering => eprintln!(
                    "  [{}] answering, {secs}s. Type your answer, `:s` to submit.",
                    event.question_id
                ),
                Phase::Submitting => eprintln!("  [{}] submitting...", event.question_id),
                Phase::Done => {
                    let how = match event.trigger {
                        Some(trigger) => format!(" ({trigger})"),
                        None => String::new(),
                    };
                    eprintln!("  [{}] answer handed off{how}", event.question_id);
                }
                Phase::Error => {
                    let message = event
                        .failure
                        .as_ref()
                        .map(|f| f.user_message())
                        .unwrap_or_else(|| "attempt failed".to_string());
                    eprintln!("  [{}] {message} (`:r` retry, `:n` skip)", event.question_id);
                }
                Phase::Idle => {}
            }
        } else if event.phase.is_live() && !repeated && secs > 0 && countdown_mark(secs) {
            eprintln!("  [{}] {secs}s left", event.question_id);
        }

        *last = Some((event.attempt_id.clone(), event.phase, secs));
    }

    fn on_queue(&self, event: &QueueEvent) {
        match event.status {
            DeliveryStatus::Queued => {
                tracing::debug!(attempt_id = %event.attempt_id, "submission queued");
            }
            DeliveryStatus::Retrying => tracing::info!(
                attempt_id = %event.attempt_id,
                retry = event.retry_count,
                "delivery failed, will retry: {}",
                event.detail.as_deref().unwrap_or("unknown error")
            ),
            DeliveryStatus::Delivered => {
                eprintln!("  submission {} delivered", short_id(&event.attempt_id));
            }
            DeliveryStatus::Failed => eprintln!(
                "  submission {} was not accepted: {}",
                short_id(&event.attempt_id),
                event.detail.as_deref().unwrap_or("unknown error")
            ),
        }
    }

    fn on_session(&self, event: &SessionEvent) {
        match event.status {
            SessionStatus::OnBreak => eprintln!(
                "\nBreak after {}. Press Enter to continue early.",
                event.section.as_deref().unwrap_or("this section")
            ),
            SessionStatus::Completed => eprintln!("\nAll questions done."),
            SessionStatus::Active | SessionStatus::Abandoned => {}
        }
    }
}

fn short_id(id: &AttemptId) -> &str {
    id.as_str().get(..8).unwrap_or(id.as_str())
}

/// Turn what the test taker typed into a payload of the expected kind.
///
/// Audio answers are given as a path or URI to an existing recording and
/// are credited with `answered_ms` of speech; structured answers as JSON,
/// falling back to a JSON string.
pub fn payload_from_input(kind: PayloadKind, input: &str, answered_ms: u64) -> Payload {
    match kind {
        PayloadKind::Text => Payload::text(input),
        PayloadKind::Audio => Payload::Audio {
            uri: input.trim().to_string(),
            duration_ms: answered_ms.max(1),
        },
        PayloadKind::Structured => Payload::Structured {
            value: serde_json::from_str(input)
                .unwrap_or_else(|_| serde_json::Value::String(input.to_string())),
        },
    }
}

/// `95_000` renders as `1m35s`.
pub fn format_ms(ms: u64) -> String {
    let secs = ms / 1000;
    match (secs / 3600, secs / 60 % 60, secs % 60) {
        (0, 0, s) => format!("{s}s"),
        (0, m, s) => format!("{m}m{s:02}s"),
        (h, m, s) => format!("{h}h{m:02}m{s:02}s"),
    }
}
