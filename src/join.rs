use std::io;
use std::path::{Path, PathBuf};

use tracing::{info, span, Level};

use crate::namespace::{self, Entry, Namespace};
use crate::{cgroup, config, error, Target};

/// Failure to relocate into a target's cgroup or namespaces.
///
/// None of these are recoverable; the process may be partially relocated and should exit.
#[derive(Debug, thiserror::Error)]
pub enum JoinError {
    #[error("failed to read {}", .path.display())]
    ReadCgroup {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("pid {pid} has no cgroup v2 entry (cgroup v1 is not supported)")]
    NoV2Cgroup { pid: libc::pid_t },

    #[error("failed to add pid {pid} to {}", .path.display())]
    WriteCgroup {
        path: PathBuf,
        pid: u32,
        #[source]
        source: io::Error,
    },

    #[error("failed to open a pidfd for pid {pid}")]
    PidFd {
        pid: libc::pid_t,
        #[source]
        source: error::Error,
    },

    #[error("failed to enter the namespaces of pid {pid} through its pidfd")]
    EnterViaPidFd {
        pid: libc::pid_t,
        #[source]
        source: error::Error,
    },

    #[error("failed to open namespace handle {}", .path.display())]
    OpenNamespace {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to enter the {namespace} namespace of pid {pid}")]
    EnterNamespace {
        namespace: Namespace,
        pid: libc::pid_t,
        #[source]
        source: error::Error,
    },
}

/// Proof that the calling process has joined a target's cgroup and namespaces.
///
/// Only [`join`] creates one. Launching the daemon requires it, because a child is only born
/// into the target's PID namespace if it is forked after `setns(2)`.
#[derive(Debug)]
pub struct Joined {
    target: Target,
    entry: Entry,
}

impl Joined {
    pub fn target(&self) -> Target {
        self.target
    }

    pub fn entry(&self) -> Entry {
        self.entry
    }

    /// Pretend a join happened, for exercising the launcher without privileges.
    #[cfg(test)]
    pub(crate) fn assume(target: Target) -> Joined {
        Joined {
            target,
            entry: Entry::PidFd,
        }
    }
}

/// Move the calling process into the cgroup v2 group of `target`, then into its network, PID,
/// IPC, mount, cgroup and UTS namespaces. The user namespace is left alone.
pub fn join(target: Target) -> Result<Joined, JoinError> {
    join_with_roots(
        target,
        Path::new(config::PROC_ROOT),
        Path::new(config::CGROUP_ROOT),
    )
}

pub(crate) fn join_with_roots(
    target: Target,
    proc_root: &Path,
    cgroup_root: &Path,
) -> Result<Joined, JoinError> {
    let span = span!(Level::INFO, "join", pid = target.pid());
    let _span_guard = span.enter();

    // The cgroup path is resolved in our current mount namespace, so it goes first.
    let procs = cgroup::join_cgroup_of(target, proc_root, cgroup_root)?;
    info!(procs = %procs.display(), "joined cgroup");

    let entry = namespace::enter(target, proc_root)?;

    Ok(Joined { target, entry })
}
