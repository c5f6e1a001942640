//! The `mockprep flush` command.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use mockprep_core::error::QueueError;
use mockprep_scorer::load_config_from;

use crate::console::ConsoleSink;

pub async fn execute(timeout_secs: u64, config_path: Option<PathBuf>) -> Result<()> {
    let config = load_config_from(config_path.as_deref())?;
    let queue = super::open_queue(&config, Arc::new(ConsoleSink::default()), true).await?;

    let pending = queue.pending();
    if pending == 0 {
        println!("Spool is empty.");
        queue.stop().await;
        return Ok(());
    }

    println!("Delivering {pending} spooled submission(s)...");
    let result = queue.wait_idle(Duration::from_secs(timeout_secs)).await;
    queue.stop().await;

    match result {
        Ok(()) => {
            println!("Spool is empty.");
            Ok(())
        }
        Err(QueueError::DrainTimeout(n)) => {
            anyhow::bail!("{n} submission(s) could not be delivered yet and remain spooled")
        }
        Err(e) => Err(e.into()),
    }
}
