//! Subcommand implementations.

pub mod flush;
pub mod init;
pub mod run;
pub mod status;
pub mod validate;

use std::sync::Arc;

use anyhow::Result;

use mockprep_core::events::EventSink;
use mockprep_core::queue::SubmissionQueue;
use mockprep_scorer::{create_scorer, MockprepConfig};
use mockprep_store::FileSpool;

/// Start a submission queue over the configured scorer and on-disk spool.
async fn open_queue(
    config: &MockprepConfig,
    events: Arc<dyn EventSink>,
    online: bool,
) -> Result<SubmissionQueue> {
    let scorer = create_scorer(&config.scorer)?;
    tracing::debug!(scorer = scorer.name(), "scorer ready");
    let spool = Arc::new(FileSpool::new(config.session.spool_dir()));
    let queue = SubmissionQueue::start(scorer, spool, events, config.queue.to_queue_config()).await;
    queue.set_online(online);
    Ok(queue)
}
