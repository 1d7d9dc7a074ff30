//! # tether-placeholder
//!
//! Runs unprivileged as PID 1 of the container. Listens on a rendezvous socket until the daemon
//! the dispatcher hands off to it exits.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use eyre::WrapErr;
use tracing::{error, info};

use tether::{logging, supervisor};

#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// Where to bind the rendezvous socket.
    #[arg(short, long)]
    socket_path: PathBuf,
}

fn main() -> ExitCode {
    // Usage errors exit 0; only setup failures are failures.
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            return ExitCode::SUCCESS;
        }
    };
    logging::configure_logging();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> eyre::Result<()> {
    supervisor::run(&cli.socket_path)
        .wrap_err("placeholder failed")?;
    info!("daemon exited, placeholder done");
    Ok(())
}
