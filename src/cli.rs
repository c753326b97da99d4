use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "vrc-log-presence",
    version,
    about = "Tail VRChat client logs into a session feed and reconcile friend presence"
)]
pub struct Cli {
    /// Log directory to watch instead of the configured or detected one.
    #[arg(long, global = true, value_name = "DIR")]
    pub log_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Follow the log directory and print feed, presence and timeout lines.
    Watch {
        /// JSONL file of push notifications written by a network bridge.
        #[arg(long, value_name = "FILE")]
        notifications: Option<PathBuf>,
        /// JSONL file of session actor events written by a network bridge.
        #[arg(long, value_name = "FILE")]
        session_events: Option<PathBuf>,
        /// Skip log lines at or before this time (RFC 3339 or local `YYYY-MM-DD HH:MM:SS`).
        #[arg(long, value_name = "TIME")]
        since: Option<String>,
        /// Print every event as JSON instead of a readable line.
        #[arg(long)]
        json: bool,
    },
    /// Classify one log file and print its events.
    Replay {
        #[arg(value_name = "FILE")]
        file: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Print a one-shot operational status snapshot.
    Status,
    /// Run health diagnostics for setup and runtime requirements.
    Doctor,
}
