use causer::error::exit_code;
use causer_history::cli::{Cli, Command};
use causer_history::commands;
use clap::Parser;
use std::process::ExitCode;

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::from(exit_code::SUCCESS as u8),
        Err(e) => {
            eprintln!("Error: {e:#}");
            if let Some(causer_err) = e.downcast_ref::<causer::error::Error>() {
                ExitCode::from(causer_err.exit_code() as u8)
            } else {
                ExitCode::from(exit_code::GENERAL_ERROR as u8)
            }
        }
    }
}

fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Show {
            file,
            by_ratio,
            top,
            symbolicate,
        } => {
            commands::show::run(&file, by_ratio, top, symbolicate)?;
        }
        Command::List { dir } => {
            commands::list::run(dir.as_deref())?;
        }
    }

    Ok(())
}
