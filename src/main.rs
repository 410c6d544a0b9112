//! `snapstate` command-line entry point.
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use clap::Parser;

use snapstate::cli::{Cli, Command};
use snapstate::commands;
use snapstate::engine::Action;
use snapstate::logging::{self, Logger};

fn main() -> Result<()> {
    let _ = enable_ansi_support::enable_ansi_support();
    let args = Cli::parse();
    logging::init_subscriber(args.verbose, args.command.name());
    let log = Arc::new(Logger::new(args.command.name()));

    let cancel = Arc::new(AtomicBool::new(false));
    {
        let cancel = Arc::clone(&cancel);
        if let Err(e) = ctrlc::set_handler(move || cancel.store(true, Ordering::SeqCst)) {
            tracing::warn!("could not install Ctrl-C handler: {e}");
        }
    }

    match args.command {
        Command::Backup(opts) => {
            commands::execute::run(&args.global, &opts, Action::Backup, &log, cancel)
        }
        Command::Restore(opts) => {
            commands::execute::run(&args.global, &opts, Action::Restore, &log, cancel)
        }
        Command::Validate(opts) => commands::validate::run(&args.global, &opts, &log),
        Command::Analyze(opts) => commands::analyze::run(&args.global, &opts, &log),
        Command::Show(opts) => commands::show::run(&args.global, &opts, &log),
        Command::Records => commands::records::run(&args.global, &log),
        Command::Plan(opts) => commands::plan::run(&args.global, &opts, &log, cancel),
        Command::Version => {
            commands::version::run();
            Ok(())
        }
    }
}
