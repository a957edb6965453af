//! Trace-replay front end and live race-stream viewer for the detector core.

mod commands;
mod trace;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::{Parser, Subcommand};

use commands::replay::{self, ReplayArgs};
use commands::watch::{self, WatchArgs};

#[derive(Parser)]
#[command(name = "racewatch")]
#[command(about = "A happens-before dynamic data-race detector core, driven by a recorded trace")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a JSON-lines trace through the detector and report races
    Replay {
        /// Path to the JSON-lines trace file
        trace: PathBuf,

        /// Path to a TOML config file (defaults applied if absent)
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Replay a trace with a live TUI showing races as they are detected
    Watch {
        /// Path to the JSON-lines trace file
        trace: PathBuf,

        /// Path to a TOML config file (defaults applied if absent)
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Run the built-in scenario battery and report pass/fail
    Selftest,
}

fn main() {
    env_logger::init();

    let running = Arc::new(AtomicBool::new(true));
    let handler_flag = running.clone();
    let _ = ctrlc::set_handler(move || {
        handler_flag.store(false, Ordering::SeqCst);
        log::warn!("interrupted, finishing current operation");
    });

    let cli = Cli::parse();

    let exit_code = match cli.command {
        Commands::Replay { trace, config } => match replay::run(ReplayArgs {
            trace_path: trace,
            config_path: config,
            running: running.clone(),
        }) {
            Ok(outcome) => {
                println!(
                    "{} races reported ({} deduplicated, {} rate-limited, {} sink errors)",
                    outcome.summary.races_reported,
                    outcome.summary.races_deduplicated,
                    outcome.summary.races_rate_limited,
                    outcome.summary.sink_errors,
                );
                0
            }
            Err(e) => {
                e.log();
                1
            }
        },
        Commands::Watch { trace, config } => match watch::run(WatchArgs {
            trace_path: trace,
            config_path: config,
            running: running.clone(),
        }) {
            Ok(()) => 0,
            Err(e) => {
                e.log();
                1
            }
        },
        Commands::Selftest => {
            if commands::selftest::run() {
                0
            } else {
                1
            }
        }
    };

    if !running.load(Ordering::SeqCst) {
        log::info!("exiting after interrupt");
    }
    std::process::exit(exit_code);
}
