//! Entering another process's namespaces with `setns(2)`.
//!
//! The user namespace is never entered: doing so would drop every capability the caller holds
//! in its own user namespace.

use std::ffi::c_int;
use std::fmt;
use std::fs::File;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::Error;
use crate::join::JoinError;
use crate::Target;

/// A kind of kernel namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Namespace {
    Cgroup,
    Ipc,
    Mount,
    Network,
    Pid,
    User,
    Uts,
}

impl Namespace {
    /// Namespaces the dispatcher joins, in the order they are entered one at a time.
    pub const JOINED: [Namespace; 6] = [
        Namespace::Cgroup,
        Namespace::Ipc,
        Namespace::Mount,
        Namespace::Network,
        Namespace::Pid,
        Namespace::Uts,
    ];

    /// Name of the namespace's entry under `/proc/<pid>/ns/`.
    pub fn proc_name(self) -> &'static str {
        match self {
            Namespace::Cgroup => "cgroup",
            Namespace::Ipc => "ipc",
            Namespace::Mount => "mnt",
            Namespace::Network => "net",
            Namespace::Pid => "pid",
            Namespace::User => "user",
            Namespace::Uts => "uts",
        }
    }

    /// The `CLONE_NEW*` flag selecting this namespace in `setns(2)`.
    pub fn clone_flag(self) -> c_int {
        match self {
            Namespace::Cgroup => libc::CLONE_NEWCGROUP,
            Namespace::Ipc => libc::CLONE_NEWIPC,
            Namespace::Mount => libc::CLONE_NEWNS,
            Namespace::Network => libc::CLONE_NEWNET,
            Namespace::Pid => libc::CLONE_NEWPID,
            Namespace::User => libc::CLONE_NEWUSER,
            Namespace::Uts => libc::CLONE_NEWUTS,
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.proc_name())
    }
}

/// The `setns(2)` flags for every namespace in [`Namespace::JOINED`].
pub fn joined_flags() -> c_int {
    Namespace::JOINED
        .iter()
        .fold(0, |flags, ns| flags | ns.clone_flag())
}

/// How the namespaces were entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entry {
    /// All at once, through a pidfd.
    PidFd,
    /// One `/proc/<pid>/ns/*` handle at a time, on kernels without pidfd support in `setns(2)`.
    PerNamespace,
}

impl fmt::Display for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Entry::PidFd => f.write_str("pidfd"),
            Entry::PerNamespace => f.write_str("/proc handles"),
        }
    }
}

/// The kernel's identity for a namespace of `pid`, e.g. `net:[4026531840]`.
///
/// `pid` of `None` inspects the calling process.
pub fn identity(
    proc_root: &Path,
    pid: Option<libc::pid_t>,
    ns: Namespace,
) -> std::io::Result<String> {
    let link = match pid {
        Some(pid) => proc_root.join(pid.to_string()),
        None => proc_root.join("self"),
    }
    .join("ns")
    .join(ns.proc_name());
    Ok(std::fs::read_link(link)?.to_string_lossy().into_owned())
}

/// Move the calling process into the joined namespaces of `target`.
///
/// Entering the PID namespace only affects children created afterwards.
///
/// On failure the process may be left in some of the target's namespaces and should exit.
pub fn enter(target: Target, proc_root: &Path) -> Result<Entry, JoinError> {
    let pid = target.pid();

    match pidfd_open(pid) {
        Ok(pidfd) => {
            let flags = joined_flags();
            if unsafe { libc::setns(pidfd.as_raw_fd(), flags) } == 0 {
                info!(pid, "entered namespaces through pidfd");
                return Ok(Entry::PidFd);
            }
            let err = Error::last_os_error().cause("setns(pidfd) failed");
            // Kernels before 5.8 reject a pidfd in setns(2) with EINVAL.
            if err.errno != libc::EINVAL {
                return Err(JoinError::EnterViaPidFd { pid, source: err });
            }
            debug!(pid, "setns rejects pidfds, using /proc handles");
        }
        Err(err) if err.errno == libc::ENOSYS => {
            debug!(pid, "no pidfd_open, using /proc handles");
        }
        Err(source) => return Err(JoinError::PidFd { pid, source }),
    }

    enter_per_namespace(target, proc_root)?;
    Ok(Entry::PerNamespace)
}

fn pidfd_open(pid: libc::pid_t) -> Result<OwnedFd, Error> {
    let fd = unsafe { libc::syscall(libc::SYS_pidfd_open, pid, 0) };
    if fd < 0 {
        return Err(Error::last_os_error().cause("pidfd_open failed"));
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd as c_int) })
}

fn enter_per_namespace(target: Target, proc_root: &Path) -> Result<(), JoinError> {
    let pid = target.pid();
    let ns_dir = proc_root.join(pid.to_string()).join("ns");

    // Open every handle before entering any: once inside the target's mount namespace, paths
    // under /proc no longer resolve against the host's procfs.
    let handles = Namespace::JOINED
        .iter()
        .map(|&ns| {
            let path: PathBuf = ns_dir.join(ns.proc_name());
            File::open(&path)
                .map(|file| (ns, file))
                .map_err(|source| JoinError::OpenNamespace { path, source })
        })
        .collect::<Result<Vec<_>, _>>()?;

    for (ns, handle) in handles {
        if unsafe { libc::setns(handle.as_raw_fd(), ns.clone_flag()) } != 0 {
            return Err(JoinError::EnterNamespace {
                namespace: ns,
                pid,
                source: Error::last_os_error().cause("setns failed"),
            });
        }
        debug!(pid, namespace = %ns, "entered namespace");
    }

    info!(pid, "entered namespaces through /proc handles");
    Ok(())
}
