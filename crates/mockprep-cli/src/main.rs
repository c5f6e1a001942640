//! mockprep CLI: run timed practice exams from the terminal.

use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};

mod commands;
mod console;

#[derive(Parser)]
#[command(name = "mockprep", version, about = "Timed practice-exam runner")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Take a test plan, resuming saved progress if there is any
    Run {
        /// Path to a .toml test plan
        #[arg(long)]
        plan: PathBuf,

        /// Session id (defaults to the plan id)
        #[arg(long)]
        session: Option<String>,

        /// Discard saved progress and start over
        #[arg(long)]
        fresh: bool,

        /// Keep answers in the local spool instead of delivering them
        #[arg(long)]
        offline: bool,

        /// Seconds to wait for deliveries after the last question
        #[arg(long, default_value = "30")]
        drain_timeout: u64,

        /// Config file path
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Deliver answers left in the local spool
    Flush {
        /// Seconds to wait before giving up
        #[arg(long, default_value = "60")]
        timeout: u64,

        /// Config file path
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Show saved sessions and spooled submissions
    Status {
        /// Only show this session
        #[arg(long)]
        session: Option<String>,

        /// Config file path
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Validate test plan TOML files
    Validate {
        /// Path to a plan file or directory
        #[arg(long)]
        plan: PathBuf,
    },

    /// Create a starter config and example plan
    Init,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("mockprep=info".parse().expect("static directive")),
        )
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run {
            plan,
            session,
            fresh,
            offline,
            drain_timeout,
            config,
        } => {
            commands::run::execute(commands::run::RunOptions {
                plan,
                session,
                fresh,
                offline,
                drain_timeout,
                config,
            })
            .await
        }
        Commands::Flush { timeout, config } => commands::flush::execute(timeout, config).await,
        Commands::Status { session, config } => commands::status::execute(session, config).await,
        Commands::Validate { plan } => commands::validate::execute(plan),
        Commands::Init => commands::init::execute(),
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}
