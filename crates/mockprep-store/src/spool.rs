//! Durable submission backlog.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use mockprep_core::error::StoreError;
use mockprep_core::model::{AttemptId, SubmissionRequest};
use mockprep_core::traits::SubmissionSpool;

use crate::{blocking, file_name, read_optional, remove_optional, write_atomic};

/// Pending submissions as one JSON file per attempt id.
///
/// Unreadable entries are moved aside with a `.corrupt` suffix on load so a
/// single bad file cannot block the rest of the backlog.
#[derive(Debug, Clone)]
pub struct FileSpool {
    dir: PathBuf,
}

impl FileSpool {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, attempt_id: &AttemptId) -> PathBuf {
        self.dir.join(file_name(attempt_id.as_str()))
    }
}

fn load_dir(dir: &Path) -> Result<Vec<SubmissionRequest>, StoreError> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut requests = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let Some(bytes) = read_optional(&path)? else {
            continue;
        };
        match serde_json::from_slice::<SubmissionRequest>(&bytes) {
            Ok(request) => requests.push(request),
            Err(e) => {
                tracing::warn!("quarantining spool entry {}: {e}", path.display());
                std::fs::rename(&path, path.with_extension("json.corrupt"))?;
            }
        }
    }

    // Oldest first, so a restored backlog is retried in submission order.
    requests.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.attempt_id.as_str().cmp(b.attempt_id.as_str()))
    });
    Ok(requests)
}

#[async_trait]
impl SubmissionSpool for FileSpool {
    async fn load_all(&self) -> Result<Vec<SubmissionRequest>, StoreError> {
        let dir = self.dir.clone();
        blocking(move || load_dir(&dir)).await
    }

    async fn put(&self, request: &SubmissionRequest) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(request)?;
        let dir = self.dir.clone();
        let name = file_name(request.attempt_id.as_str());
        blocking(move || write_atomic(&dir, &name, &bytes)).await
    }

    async fn remove(&self, attempt_id: &AttemptId) -> Result<(), StoreError> {
        let path = self.path_for(attempt_id);
        blocking(move || remove_optional(&path)).await
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use mockprep_core::model::{Payload, SubmitTrigger};

    use super::*;

    fn request(id: &str, age_secs: i64) -> SubmissionRequest {
        let created = Utc::now() - Duration::seconds(age_secs);
        SubmissionRequest {
            attempt_id: AttemptId::from(id),
            question_id: format!("q-{id}"),
            session_id: "s1".into(),
            payload: Payload::text("answer"),
            created_at: created,
            retry_count: 2,
            submit_trigger: SubmitTrigger::User,
            answer_started_at: created,
            answer_deadline: created + Duration::seconds(30),
        }
    }

    #[tokio::test]
    async fn backlog_survives_restart_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let spool = FileSpool::new(dir.path());
        spool.put(&request("newer", 5)).await.unwrap();
        spool.put(&request("older", 50)).await.unwrap();

        let reopened = FileSpool::new(dir.path());
        let loaded = reopened.load_all().await.unwrap();
        let ids: Vec<_> = loaded.iter().map(|r| r.attempt_id.as_str()).collect();
        assert_eq!(ids, ["older", "newer"]);
        assert_eq!(loaded[0].retry_count, 2);
    }

    #[tokio::test]
    async fn put_is_keyed_by_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let spool = FileSpool::new(dir.path());
        spool.put(&request("a1", 10)).await.unwrap();
        let mut again = request("a1", 10);
        again.retry_count = 5;
        spool.put(&again).await.unwrap();

        let loaded = spool.load_all().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].retry_count, 5);
    }

    #[tokio::test]
    async fn remove_drops_entry() {
        let dir = tempfile::tempdir().unwrap();
        let spool = FileSpool::new(dir.path());
        spool.put(&request("a1", 1)).await.unwrap();
        spool.remove(&AttemptId::from("a1")).await.unwrap();
        spool.remove(&AttemptId::from("a1")).await.unwrap();
        assert!(spool.load_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn corrupt_entries_are_set_aside() {
        let dir = tempfile::tempdir().unwrap();
        let spool = FileSpool::new(dir.path());
        spool.put(&request("good", 1)).await.unwrap();
        std::fs::write(dir.path().join("bad.json"), b"garbage").unwrap();

        let loaded = spool.load_all().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert!(dir.path().join("bad.json.corrupt").exists());
        assert!(!dir.path().join("bad.json").exists());
    }

    #[tokio::test]
    async fn missing_dir_is_an_empty_backlog() {
        let dir = tempfile::tempdir().unwrap();
        let spool = FileSpool::new(dir.path().join("spool"));
        assert!(spool.load_all().await.unwrap().is_empty());
    }
}
