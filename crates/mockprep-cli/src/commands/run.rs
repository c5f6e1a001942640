//! The `mockprep run` command.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};

use mockprep_core::error::QueueError;
use mockprep_core::memory::BufferedRecorder;
use mockprep_core::model::{Phase, SessionStatus};
use mockprep_core::parser;
use mockprep_core::session::{Activation, ResumeSource, SessionOrchestrator, SessionServices};
use mockprep_core::traits::{LogCompletion, ProgressStore};
use mockprep_scorer::load_config_from;
use mockprep_store::FileProgressStore;

use crate::console::{format_ms, payload_from_input, ConsoleSink};

pub struct RunOptions {
    pub plan: PathBuf,
    pub session: Option<String>,
    pub fresh: bool,
    pub offline: bool,
    pub drain_timeout: u64,
    pub config: Option<PathBuf>,
}

/// How the interactive loop ended.
#[derive(Debug, PartialEq, Eq)]
enum Exit {
    Completed,
    /// Stopped with progress saved for a later resume.
    Paused,
    Abandoned,
}

/// A line typed by the test taker.
#[derive(Debug, PartialEq, Eq)]
enum Input {
    Submit,
    Next,
    Retry,
    Quit,
    Abandon,
    Line(String),
}

fn parse_input(line: &str) -> Input {
    match line.trim() {
        ":s" | ":submit" => Input::Submit,
        ":n" | ":next" => Input::Next,
        ":r" | ":retry" => Input::Retry,
        ":q" | ":quit" => Input::Quit,
        ":abandon" => Input::Abandon,
        _ => Input::Line(line.to_string()),
    }
}

pub async fn execute(options: RunOptions) -> Result<()> {
    let config = load_config_from(options.config.as_deref())?;
    let plan = parser::parse_plan(&options.plan)?;
    for w in parser::validate_plan(&plan) {
        eprintln!("Warning: {}", w.message);
    }

    let session_id = options.session.unwrap_or_else(|| plan.id.clone());
    let store = Arc::new(FileProgressStore::new(config.session.checkpoint_dir()));
    if options.fresh {
        store.remove(&session_id).await?;
    }

    let events = Arc::new(ConsoleSink::default());
    let queue = super::open_queue(&config, events.clone(), !options.offline).await?;
    let services = SessionServices {
        store,
        queue: queue.clone(),
        recorder: Arc::new(BufferedRecorder::all_kinds()),
        completion: Arc::new(LogCompletion),
        events,
        tick_interval: config.session.tick_interval(),
    };

    let mut session = SessionOrchestrator::resume(&session_id, plan, services).await;
    let total = session.state().plan.len();
    match session.resume_source() {
        ResumeSource::Restored => eprintln!(
            "Resuming '{}' at question {}/{total}",
            session_id,
            (session.current_index() + 1).min(total)
        ),
        ResumeSource::Fresh => eprintln!(
            "Starting '{}': {total} question(s). Type `:q` to pause, `:n` to skip.",
            session.state().plan.name
        ),
        ResumeSource::Degraded => {
            eprintln!("Saved progress for '{session_id}' could not be used; starting over.")
        }
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let exit = drive(&mut session, &mut lines).await;
    session.teardown().await;
    let exit = exit?;

    match exit {
        Exit::Completed => {
            session.finalize().await?;
            print_summary(&session);
        }
        Exit::Paused => eprintln!(
            "\nProgress saved. Run the same command again to resume '{session_id}'."
        ),
        Exit::Abandoned => eprintln!("\nSession '{session_id}' abandoned."),
    }

    if options.offline {
        let pending = queue.pending();
        if pending > 0 {
            eprintln!("{pending} submission(s) spooled. Run `mockprep flush` when back online.");
        }
    } else {
        match queue
            .wait_idle(Duration::from_secs(options.drain_timeout))
            .await
        {
            Ok(()) => {}
            Err(QueueError::DrainTimeout(n)) => eprintln!(
                "{n} submission(s) still pending and kept in the spool. Run `mockprep flush` later."
            ),
            Err(e) => eprintln!("Submission queue: {e}"),
        }
    }
    queue.stop().await;

    Ok(())
}

/// Run the session until it completes, is abandoned, or the user leaves.
async fn drive<R>(session: &mut SessionOrchestrator, lines: &mut Lines<R>) -> Result<Exit>
where
    R: AsyncBufRead + Unpin,
{
    let mut answer = String::new();

    loop {
        match session.status() {
            SessionStatus::Completed => return Ok(Exit::Completed),
            SessionStatus::Abandoned => return Ok(Exit::Abandoned),
            SessionStatus::OnBreak => {}
            SessionStatus::Active => {
                let redo = session.redo_question().map(str::to_string);
                match (session.live_phase(), redo) {
                    (Some(Phase::Idle), Some(question_id)) => {
                        answer.clear();
                        session.reattempt(&question_id).await?;
                    }
                    (Some(Phase::Done), None) => {
                        session.advance().await?;
                        continue;
                    }
                    (None | Some(Phase::Idle) | Some(Phase::Done), _) => {
                        answer.clear();
                        present(session);
                        if session.activate().await? == Activation::ReadOnly {
                            eprintln!("  already answered, moving on");
                            session.advance().await?;
                            continue;
                        }
                    }
                    _ => {}
                }
            }
        }

        tokio::select! {
            Some(event) = session.next_clock_event() => {
                session.handle_clock(event).await;
            }
            Some(outcome) = session.next_delivery() => {
                let question_id = outcome.question_id.clone();
                if session.handle_delivery(outcome).await {
                    eprintln!("  type `:r` to answer {question_id} again");
                }
            }
            line = lines.next_line() => {
                let Some(line) = line? else {
                    return Ok(Exit::Paused);
                };
                if let Some(exit) = handle_input(session, parse_input(&line), &mut answer).await? {
                    return Ok(exit);
                }
            }
            _ = tokio::signal::ctrl_c() => return Ok(Exit::Paused),
        }
    }
}

async fn handle_input(
    session: &mut SessionOrchestrator,
    input: Input,
    answer: &mut String,
) -> Result<Option<Exit>> {
    let on_break = session.status() == SessionStatus::OnBreak;
    let phase = session.live_phase();

    match input {
        Input::Quit => return Ok(Some(Exit::Paused)),
        Input::Abandon => {
            session.abandon().await?;
            return Ok(Some(Exit::Abandoned));
        }
        Input::Next => {
            session.advance().await?;
        }
        Input::Retry if phase == Some(Phase::Error) => {
            session.reset_attempt().await?;
        }
        Input::Retry if !phase.is_some_and(Phase::is_live) && !on_break => {
            let Some(question_id) = session.rejected_questions().iter().next().cloned() else {
                eprintln!("  nothing to retry");
                return Ok(None);
            };
            answer.clear();
            eprintln!("\nAnswering {question_id} again");
            session.reattempt(&question_id).await?;
        }
        Input::Retry => eprintln!("  nothing to retry"),
        Input::Submit if phase == Some(Phase::Answering) => {
            if let Err(e) = session.submit().await {
                tracing::debug!("submit ended with error: {e}");
            }
        }
        Input::Submit => eprintln!("  not answering right now"),
        Input::Line(line) if on_break && line.trim().is_empty() => {
            session.advance().await?;
        }
        Input::Line(line) => match phase {
            Some(Phase::Preparing) if line.trim().is_empty() => {
                if let Err(e) = session.skip_prep().await {
                    eprintln!("  {e}");
                }
            }
            Some(Phase::Answering) => {
                if !answer.is_empty() {
                    answer.push('\n');
                }
                answer.push_str(&line);
                let kind = session.live().map(|c| c.spec().payload_kind);
                let answered_ms = session.live().map_or(0, |c| c.state().elapsed_ms);
                if let Some(kind) = kind {
                    if let Err(e) = session.capture(payload_from_input(kind, answer, answered_ms)) {
                        eprintln!("  {e}");
                    }
                }
            }
            _ => {}
        },
    }
    Ok(None)
}

fn present(session: &SessionOrchestrator) {
    let Some(question) = session.current() else {
        return;
    };
    eprintln!(
        "\nQuestion {}/{} [{}] {} ({})",
        question.index + 1,
        session.state().plan.len(),
        question.section,
        question.spec.question_id,
        question.spec.payload_kind,
    );
}

fn print_summary(session: &SessionOrchestrator) {
    use comfy_table::{Cell, Table};

    let state = session.state();
    let mut table = Table::new();
    table.set_header(vec!["Section", "Questions", "Answered", "Time"]);

    for section in &state.plan.sections {
        let answered = section
            .attempts
            .iter()
            .filter(|a| state.completed_attempt_ids.contains(&a.question_id))
            .count();
        let elapsed = state
            .section_elapsed_ms
            .get(&section.name)
            .copied()
            .unwrap_or(0);
        table.add_row(vec![
            Cell::new(&section.name),
            Cell::new(section.attempts.len()),
            Cell::new(answered),
            Cell::new(format_ms(elapsed)),
        ]);
    }

    println!("{table}");
    println!(
        "Session complete: {}/{} answered in {}",
        state.completed_attempt_ids.len(),
        state.plan.len(),
        format_ms(state.elapsed_ms())
    );
    if !state.rejected_question_ids.is_empty() {
        let rejected: Vec<&str> = state.rejected_question_ids.iter().map(String::as_str).collect();
        println!("Not accepted by the scorer: {}", rejected.join(", "));
    }
}
