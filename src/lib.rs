//! Run a privileged filesystem daemon inside the namespaces and cgroup of an unprivileged
//! container, without entering the container's user namespace.
//!
//! Two processes cooperate:
//!
//! - The **placeholder** ([`supervisor`]) runs unprivileged as the container's PID 1. It exposes
//!   a rendezvous socket so a controller can learn its pid, and exits when the daemon does.
//! - The **dispatcher** ([`join()`] then [`launch_once_and_exec`]) runs privileged outside the
//!   container. It joins the placeholder's cgroup and namespaces, takes a singleton lock, forks
//!   so the daemon is born in the container's PID namespace and re-parented onto the
//!   placeholder, and execs the daemon.

mod libc_util;

pub mod cgroup;
mod command;
pub mod config;
pub mod error;
pub mod join;
mod launch;
pub mod logging;
pub mod namespace;
pub mod rendezvous;
mod singleton;
pub mod supervisor;
mod target;

pub use command::DaemonCommand;
pub use join::{join, JoinError, Joined};
pub use launch::{launch_once_and_exec, Handoff};
pub use namespace::Namespace;
pub use singleton::SingletonLock;
pub use target::Target;
