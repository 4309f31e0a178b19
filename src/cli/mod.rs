pub mod report;
pub mod track;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use report::{process_report_command, ReportCommand};
use track::{process_track_command, TrackCommand};
use tracing::level_filters::LevelFilter;

use crate::utils::{
    dir::create_application_default_path,
    logging::{enable_logging, REPORT_PREFIX, TRACK_PREFIX},
};

#[derive(Parser, Debug)]
#[command(name = "worktrack", version, long_about = None)]
#[command(about = "Tracks work sessions, idle time and screenshots", long_about = None)]
struct Args {
    #[command(subcommand)]
    commands: Commands,
    #[arg(
        long,
        global = true,
        help = "Application directory. By default tries to save into $XDG_STATE_HOME or $HOME/.local/state"
    )]
    dir: Option<PathBuf>,
    #[arg(long, global = true, help = "Mirror logs to the console")]
    log_console: bool,
    #[arg(
        long,
        global = true,
        help = "Log level, for example debug or trace. Falls back to RUST_LOG and then to info"
    )]
    log_filter: Option<LevelFilter>,
}

#[derive(Subcommand, Debug)]
#[command(version, about, long_about = None)]
enum Commands {
    #[command(about = "Run a tracking session in the current console until ctrl-c")]
    Track {
        #[command(flatten)]
        command: TrackCommand,
    },
    #[command(about = "Summarize the activity reported for a day")]
    Report {
        #[command(flatten)]
        command: ReportCommand,
    },
}

pub async fn run_cli() -> Result<()> {
    let args = Args::parse();

    let dir = match args.dir {
        Some(dir) => {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create application directory {dir:?}"))?;
            dir
        }
        None => create_application_default_path()?,
    };

    let prefix = match args.commands {
        Commands::Track { .. } => TRACK_PREFIX,
        Commands::Report { .. } => REPORT_PREFIX,
    };
    enable_logging(prefix, &dir.join("logs"), args.log_filter, args.log_console)?;

    match args.commands {
        Commands::Track { command } => process_track_command(command, dir).await,
        Commands::Report { command } => process_report_command(command, dir).await,
    }
}
