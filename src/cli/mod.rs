pub mod report;

use std::{env, path::PathBuf};

use anyhow::Result;
use clap::{Parser, Subcommand};
use report::{process_day_command, process_range_command, DayCommand, RangeCommand};
use tokio::io;
use tracing::level_filters::LevelFilter;

use crate::{
    store::{day_file::DayFileStore, UsageStore},
    tracker::{probe::GenericFocusProbe, run_tracking},
    utils::{
        clock::SystemClock,
        logging::{enable_logging, CLI_PREFIX, TRACKER_PREFIX},
    },
};

#[derive(Parser, Debug)]
#[command(name = "Focustally", version, long_about = None)]
#[command(about = "Tracks how long each application holds input focus", long_about = None)]
struct Args {
    #[command(subcommand)]
    commands: Commands,
    #[arg(long, help = "Enable logging")]
    log: bool,
}

#[derive(Subcommand, Debug)]
#[command(version, about, long_about = None)]
enum Commands {
    #[command(about = "Show how long each application held focus on a day")]
    Day {
        #[command(flatten)]
        command: DayCommand,
    },
    #[command(about = "Show aggregated focus time over a date range")]
    Range {
        #[command(flatten)]
        command: RangeCommand,
    },
    #[command(about = "Run the focus tracker in the current console")]
    Track {
        #[arg(
            long,
            help = "Application directory. By default tries to save into $XDG_STATE_HOME or $HOME/.local/state"
        )]
        dir: Option<PathBuf>,
    },
    #[command(about = "Compact record files and drop superseded rows")]
    Maintain {},
}

pub async fn run_cli() -> Result<()> {
    let args = Args::parse();

    let logging_level = if args.log {
        Some(LevelFilter::TRACE)
    } else {
        None
    };

    match args.commands {
        Commands::Track { dir } => {
            let dir = dir.map_or_else(create_application_default_path, Ok)?;
            enable_logging(TRACKER_PREFIX, &dir, logging_level, args.log)?;
            run_tracking(dir, Box::new(GenericFocusProbe::new()?)).await
        }
        Commands::Day { command } => {
            enable_logging(
                CLI_PREFIX,
                &create_application_default_path()?,
                logging_level,
                args.log,
            )?;
            process_day_command(command).await
        }
        Commands::Range { command } => {
            enable_logging(
                CLI_PREFIX,
                &create_application_default_path()?,
                logging_level,
                args.log,
            )?;
            process_range_command(command).await
        }
        Commands::Maintain {} => {
            let dir = create_application_default_path()?;
            enable_logging(CLI_PREFIX, &dir, logging_level, args.log)?;
            process_maintain_command(dir).await
        }
    }
}

async fn process_maintain_command(dir: PathBuf) -> Result<()> {
    let store = DayFileStore::new(dir.join("records"), Box::new(SystemClock))?;
    let report = store.perform_maintenance().await?;
    println!(
        "Compacted {} files, removed {} superseded rows",
        report.files_compacted, report.rows_removed
    );
    Ok(())
}

pub fn create_application_default_path() -> Result<PathBuf> {
    let path = {
        #[cfg(windows)]
        {
            let mut path =
                PathBuf::from(env::var("APPDATA").expect("APPDATA should be present on Windows"));
            path.push("focustally");
            path
        }
        #[cfg(not(windows))]
        {
            let mut path = env::var("XDG_STATE_HOME")
                .map(PathBuf::from)
                .or_else(|_| {
                    env::var("HOME").map(|home| {
                        let mut path = PathBuf::from(home);
                        path.push(".local/state");
                        path
                    })
                })
                .expect("Couldn't find neither XDG_STATE_HOME nor HOME");
            path.push("focustally");
            path
        }
    };

    match std::fs::create_dir_all(&path) {
        Ok(_) => Ok(path),
        Err(v) if v.kind() == io::ErrorKind::AlreadyExists => Ok(path),
        Err(v) => Err(v.into()),
    }
}
