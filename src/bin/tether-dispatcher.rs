//! # tether-dispatcher
//!
//! Runs privileged on the host. Joins the placeholder's cgroup and namespaces, then replaces
//! itself with the filesystem-sharing daemon, unless one is already running.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;
use eyre::WrapErr;
use tracing::{error, info};

use tether::{config, logging, DaemonCommand, Handoff, Target};

#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// Pid of the placeholder whose cgroup and namespaces the daemon runs in.
    #[arg(short, long, value_parser = clap::value_parser!(i32).range(1..))]
    pid: i32,

    /// Directory shared with the guest.
    #[arg(short, long)]
    shared_dir: PathBuf,

    /// Socket the daemon listens on.
    #[arg(short = 'f', long)]
    socket_path: PathBuf,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
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
    let target = Target::new(cli.pid)?;
    let daemon = DaemonCommand::virtiofsd(&cli.socket_path, &cli.shared_dir)
        .wrap_err("invalid daemon arguments")?;

    let joined = tether::join(target)
        .wrap_err_with(|| format!("failed to join the cgroup and namespaces of {target}"))?;
    info!(pid = target.pid(), entry = %joined.entry(), "joined placeholder");

    let lock_path = Path::new(config::LOCK_PATH);
    let handoff = tether::launch_once_and_exec(joined, lock_path, &daemon)
        .wrap_err("failed to launch daemon")?;
    match handoff {
        Handoff::AlreadyRunning => Ok(()),
    }
}
