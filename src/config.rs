//! Fixed paths and identities shared by the dispatcher and the placeholder.
//!
//! None of these are configurable at runtime.

/// Singleton lock file. Resolved inside the target's mount namespace, since the dispatcher only
/// takes the lock after joining it.
pub const LOCK_PATH: &str = "/tmp/virtiofsd-dispatcher.lock";

/// Mount point of the unified cgroup v2 hierarchy.
pub const CGROUP_ROOT: &str = "/sys/fs/cgroup";

/// Root of procfs.
pub const PROC_ROOT: &str = "/proc";

/// The filesystem-sharing daemon exec'd by the dispatcher.
pub const DAEMON_PATH: &str = "/usr/libexec/virtiofsd";

/// Every guest UID and GID is squashed to this unprivileged host identity.
pub const SQUASH_ID: u32 = 107;
