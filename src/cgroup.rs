//! cgroup v2 membership.
//!
//! Only the unified hierarchy is supported. A process's entry in it is the line of
//! `/proc/<pid>/cgroup` with hierarchy ID `0` and an empty controller list, e.g.
//! `0::/kubepods/burstable/pod1234/abcd`.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::join::JoinError;
use crate::Target;

/// Hierarchy ID of the cgroup v2 line.
const V2_HIERARCHY_ID: &str = "0";

/// Find the cgroup v2 path in the contents of a `/proc/<pid>/cgroup` file.
///
/// The result is relative to the cgroup root: `""` for the root cgroup, `"a/b"` for `0::/a/b`.
pub fn v2_relative_path(contents: &str) -> Option<&str> {
    contents.lines().find_map(|line| {
        let mut fields = line.splitn(3, ':');
        let hierarchy = fields.next()?;
        let _controllers = fields.next()?;
        let path = fields.next()?;
        if hierarchy != V2_HIERARCHY_ID {
            return None;
        }
        Some(path.trim_start_matches('/'))
    })
}

/// The `cgroup.procs` file of a cgroup, given its path relative to `cgroup_root`.
pub fn procs_file(cgroup_root: &Path, relative: &str) -> PathBuf {
    if relative.is_empty() {
        cgroup_root.join("cgroup.procs")
    } else {
        cgroup_root.join(relative).join("cgroup.procs")
    }
}

/// Move the calling process into the cgroup v2 group of `target`.
///
/// `proc_root` and `cgroup_root` are normally [`crate::config::PROC_ROOT`] and
/// [`crate::config::CGROUP_ROOT`]. Returns the `cgroup.procs` file that was written.
pub fn join_cgroup_of(
    target: Target,
    proc_root: &Path,
    cgroup_root: &Path,
) -> Result<PathBuf, JoinError> {
    let cgroup_file = proc_root.join(target.pid().to_string()).join("cgroup");
    let read = std::fs::read_to_string(&cgroup_file);
    let contents = read.map_err(|source| JoinError::ReadCgroup {
        path: cgroup_file.clone(),
        source,
    })?;

    let Some(relative) = v2_relative_path(&contents) else {
        return Err(JoinError::NoV2Cgroup { pid: target.pid() });
    };
    let procs = procs_file(cgroup_root, relative);

    let own_pid = std::process::id();
    debug!(pid = own_pid, procs = %procs.display(), "joining cgroup");

    // cgroup.procs is never created here: a missing file means a missing cgroup.
    OpenOptions::new()
        .append(true)
        .open(&procs)
        .and_then(|mut file| file.write_all(own_pid.to_string().as_bytes()))
        .map_err(|source| JoinError::WriteCgroup {
            path: procs.clone(),
            pid: own_pid,
            source,
        })?;

    Ok(procs)
}
