//! The `mockprep status` command.

use std::path::PathBuf;

use anyhow::Result;
use comfy_table::{Cell, Table};

use mockprep_core::model::Checkpoint;
use mockprep_core::traits::{ProgressStore, SubmissionSpool};
use mockprep_scorer::load_config_from;
use mockprep_store::{FileProgressStore, FileSpool};

use crate::console::format_ms;

pub async fn execute(session: Option<String>, config_path: Option<PathBuf>) -> Result<()> {
    let config = load_config_from(config_path.as_deref())?;
    let store = FileProgressStore::new(config.session.checkpoint_dir());

    let ids = match session {
        Some(id) => vec![id],
        None => store.list().await?,
    };

    let mut checkpoints = Vec::new();
    for id in &ids {
        match store.get(id).await {
            Ok(Some(checkpoint)) => checkpoints.push(checkpoint),
            Ok(None) => println!("No saved progress for '{id}'."),
            Err(e) => println!("Saved progress for '{id}' is unreadable: {e}"),
        }
    }

    if checkpoints.is_empty() {
        if ids.is_empty() {
            println!("No saved sessions.");
        }
    } else {
        print_sessions(&checkpoints);
    }

    let spooled = FileSpool::new(config.session.spool_dir()).load_all().await?;
    if spooled.is_empty() {
        println!("Spool is empty.");
    } else {
        println!(
            "{} submission(s) waiting in the spool. Run `mockprep flush` to deliver them.",
            spooled.len()
        );
    }

    Ok(())
}

fn print_sessions(checkpoints: &[Checkpoint]) {
    let mut table = Table::new();
    table.set_header(vec!["Session", "Status", "Next question", "Answered", "Time", "Updated"]);

    for checkpoint in checkpoints {
        let elapsed: u64 = checkpoint.section_elapsed_ms.values().sum();
        table.add_row(vec![
            Cell::new(&checkpoint.session_id),
            Cell::new(checkpoint.status),
            Cell::new(checkpoint.current_index + 1),
            Cell::new(checkpoint.completed_attempt_ids.len()),
            Cell::new(format_ms(elapsed)),
            Cell::new(checkpoint.updated_at.format("%Y-%m-%d %H:%M:%S")),
        ]);
    }

    println!("{table}");
}
