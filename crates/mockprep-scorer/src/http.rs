//! HTTP scoring service client.
//!
//! Submissions are POSTed as JSON to `{base_url}/v1/submissions` with the
//! attempt id in an `Idempotency-Key` header. The service enforces
//! `answer_deadline` against its own record of the attempt; the client's
//! clock only drives the UI.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::instrument;

use mockprep_core::error::ScorerError;
use mockprep_core::model::{ScoreReceipt, SubmissionRequest};
use mockprep_core::traits::Scorer;

const DEFAULT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_RETRY_AFTER_SECS: u64 = 5;

/// Scorer backed by a remote HTTP service.
pub struct HttpScorer {
    api_key: Option<String>,
    base_url: String,
    timeout_secs: u64,
    client: reqwest::Client,
}

impl HttpScorer {
    pub fn new(
        base_url: &str,
        api_key: Option<String>,
        timeout_secs: Option<u64>,
    ) -> Result<Self, ScorerError> {
        let timeout_secs = timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS);
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| ScorerError::NetworkError(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            api_key: api_key.filter(|k| !k.is_empty()),
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout_secs,
            client,
        })
    }
}

#[derive(Deserialize, Default)]
struct AcceptedBody {
    #[serde(default)]
    duplicate: bool,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Deserialize)]
struct ErrorDetail {
    message: String,
}

fn error_message(body: String) -> String {
    serde_json::from_str::<ErrorBody>(&body)
        .map(|e| e.error.message)
        .unwrap_or(body)
}

#[async_trait]
impl Scorer for HttpScorer {
    fn name(&self) -> &str {
        "http"
    }

    #[instrument(skip(self, request), fields(attempt_id = %request.attempt_id, retry = request.retry_count))]
    async fn submit(&self, request: &SubmissionRequest) -> Result<ScoreReceipt, ScorerError> {
        let mut builder = self
            .client
            .post(format!("{}/v1/submissions", self.base_url))
            .header("Idempotency-Key", request.attempt_id.as_str())
            .header("content-type", "application/json")
            .json(request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                ScorerError::Timeout(self.timeout_secs)
            } else {
                ScorerError::NetworkError(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        if status == 409 {
            tracing::debug!("scorer already holds this attempt");
            return Ok(ScoreReceipt {
                attempt_id: request.attempt_id.clone(),
                duplicate: true,
            });
        }
        if status == 429 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(DEFAULT_RETRY_AFTER_SECS)
                * 1000;
            return Err(ScorerError::RateLimited {
                retry_after_ms: retry_after,
            });
        }
        if status == 408 || status >= 500 {
            let body = response.text().await.unwrap_or_default();
            return Err(ScorerError::Unavailable {
                status,
                message: error_message(body),
            });
        }
        if status >= 400 {
            let body = response.text().await.unwrap_or_default();
            return Err(ScorerError::Rejected {
                status,
                message: error_message(body),
            });
        }

        // An empty 2xx body is a plain acceptance.
        let body = response.text().await.unwrap_or_default();
        let accepted = if body.trim().is_empty() {
            AcceptedBody::default()
        } else {
            serde_json::from_str(&body).unwrap_or_default()
        };

        Ok(ScoreReceipt {
            attempt_id: request.attempt_id.clone(),
            duplicate: accepted.duplicate,
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use mockprep_core::model::{AttemptId, Payload, SubmitTrigger};
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn request() -> SubmissionRequest {
        let started = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap();
        SubmissionRequest {
            attempt_id: AttemptId::from("att-1"),
            question_id: "q1".into(),
            session_id: "s1".into(),
            payload: Payload::text("my answer"),
            created_at: started,
            retry_count: 0,
            submit_trigger: SubmitTrigger::AutoExpire,
            answer_started_at: started,
            answer_deadline: started + chrono::Duration::seconds(40),
        }
    }

    #[tokio::test]
    async fn successful_submission() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v1/submissions"))
            .and(header("Idempotency-Key", "att-1"))
            .and(header("authorization", "Bearer test-key"))
            .and(body_partial_json(serde_json::json!({
                "question_id": "q1",
                "submit_trigger": "auto-expire",
                "answer_deadline": "2026-03-01T09:00:40Z",
                "payload": {"kind": "text", "text": "my answer"}
            })))
            .respond_with(ResponseTemplate::new(202).set_body_json(serde_json::json!({"status": "queued"})))
            .expect(1)
            .mount(&server)
            .await;

        let scorer = HttpScorer::new(&server.uri(), Some("test-key".into()), None).unwrap();
        let receipt = scorer.submit(&request()).await.unwrap();
        assert_eq!(receipt.attempt_id, AttemptId::from("att-1"));
        assert!(!receipt.duplicate);
    }

    #[tokio::test]
    async fn conflict_means_already_applied() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v1/submissions"))
            .respond_with(ResponseTemplate::new(409))
            .mount(&server)
            .await;

        let scorer = HttpScorer::new(&server.uri(), None, None).unwrap();
        assert!(scorer.submit(&request()).await.unwrap().duplicate);
    }

    #[tokio::test]
    async fn client_errors_are_permanent() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v1/submissions"))
            .respond_with(ResponseTemplate::new(422).set_body_json(
                serde_json::json!({"error": {"message": "answer deadline passed"}}),
            ))
            .mount(&server)
            .await;

        let scorer = HttpScorer::new(&server.uri(), None, None).unwrap();
        let err = scorer.submit(&request()).await.unwrap_err();
        assert!(err.is_permanent());
        assert!(err.to_string().contains("answer deadline passed"));
    }

    #[tokio::test]
    async fn server_errors_are_retryable() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v1/submissions"))
            .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
            .mount(&server)
            .await;

        let scorer = HttpScorer::new(&server.uri(), None, None).unwrap();
        let err = scorer.submit(&request()).await.unwrap_err();
        assert!(!err.is_permanent());
        assert!(matches!(err, ScorerError::Unavailable { status: 503, .. }));
    }

    #[tokio::test]
    async fn rate_limiting() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v1/submissions"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "7"))
            .mount(&server)
            .await;

        let scorer = HttpScorer::new(&server.uri(), None, None).unwrap();
        let err = scorer.submit(&request()).await.unwrap_err();
        assert_eq!(err.retry_after_ms(), Some(7000));
        assert!(err.to_string().contains("rate limited"));
    }

    #[tokio::test]
    async fn unreachable_server_is_a_network_error() {
        let scorer = HttpScorer::new("http://127.0.0.1:1", None, Some(2)).unwrap();
        let err = scorer.submit(&request()).await.unwrap_err();
        assert!(!err.is_permanent());
    }
}
