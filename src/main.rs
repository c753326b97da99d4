use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;

use vrc_log_presence::app::{self, WatchOptions};
use vrc_log_presence::cli::{Cli, Commands};
use vrc_log_presence::config::{self, TrackerConfig};
use vrc_log_presence::util::{parse_timestamp, setup_tracing};

fn main() -> ExitCode {
    match run() {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("vrc-log-presence error: {err:#}");
            ExitCode::from(1)
        }
    }
}

fn run() -> Result<u8> {
    setup_tracing();
    let cli = Cli::parse();
    let mut config = TrackerConfig::load_or_init()?;
    if let Some(dir) = cli.log_dir {
        config.log_dir = Some(dir.display().to_string());
    }

    match cli.command {
        Some(Commands::Status) => {
            app::print_status(&config)?;
            Ok(0)
        }
        Some(Commands::Doctor) => app::doctor(&config),
        Some(Commands::Replay { file, json }) => {
            app::replay(&file, json)?;
            Ok(0)
        }
        Some(Commands::Watch {
            notifications,
            session_events,
            since,
            json,
        }) => {
            let options = WatchOptions {
                notifications,
                session_events,
                since: since.as_deref().map(parse_timestamp).transpose()?,
                json,
            };
            app::watch(config, options, config::runtime_settings())?;
            Ok(0)
        }
        None => {
            app::watch(config, WatchOptions::default(), config::runtime_settings())?;
            Ok(0)
        }
    }
}
