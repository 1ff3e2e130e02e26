use std::process::ExitCode;

use clap::Parser;
use log::error;

mod cli;
mod core;
mod helpers;

use crate::{cli::ProbehostCli, helpers::logger::Logger};

fn main() -> ExitCode {
    let cli = ProbehostCli::parse();

    let level = match cli.main_config.level_filter() {
        Ok(level) => level,
        Err(e) => {
            eprintln!("Invalid log level: {e}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = Logger::init(level) {
        eprintln!("Could not initialize the logger: {e}");
        return ExitCode::FAILURE;
    }

    match cli.run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            // Report the failing step and the underlying error in a single
            // line, then use a well-known exit code so scripts can react.
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}
