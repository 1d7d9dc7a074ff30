use std::os::fd::{AsRawFd, OwnedFd};
use std::path::Path;

use tracing::debug;

use crate::error::{Error, Result};
use crate::libc_util;

/// An exclusive `flock(2)` on a well-known file, held for as long as the descriptor is open.
///
/// The lock belongs to the open file description, so it survives `fork()` and `exec()` and is
/// released by the kernel when the last process holding the descriptor exits, however it exits.
#[derive(Debug)]
pub struct SingletonLock {
    fd: OwnedFd,
}

impl SingletonLock {
    /// Try to take the lock without blocking.
    ///
    /// Returns `Ok(None)` if another process already holds it. The lock file is created if it
    /// does not exist and is never removed.
    pub fn try_acquire(path: &Path) -> Result<Option<SingletonLock>> {
        let c_path = libc_util::path_to_cstring(path)?;
        let fd = libc_util::open(
            &c_path,
            libc::O_RDWR | libc::O_CREAT | libc::O_CLOEXEC,
            0o600,
        )
        .map_err(|e| e.context("failed to open singleton lock file"))?;

        if unsafe { libc::flock(fd.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) } != 0 {
            let err = Error::last_os_error();
            if err.errno == libc::EWOULDBLOCK {
                debug!(path = %path.display(), "singleton lock is held elsewhere");
                return Ok(None);
            }
            let err = err.cause("flock failed");
            return Err(err.context("failed to lock singleton lock file"));
        }

        debug!(path = %path.display(), fd = fd.as_raw_fd(), "acquired singleton lock");
        Ok(Some(SingletonLock { fd }))
    }

    /// Keep the lock's descriptor open across `execve(2)`, so the exec'd program holds the lock
    /// for the rest of its life.
    pub fn inherit_across_exec(&self) -> Result<()> {
        libc_util::set_cloexec(self.fd.as_raw_fd(), false)
            .map_err(|e| e.context("failed to clear FD_CLOEXEC on singleton lock"))
    }
}

impl AsRawFd for SingletonLock {
    fn as_raw_fd(&self) -> std::os::fd::RawFd {
        self.fd.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::CommandExt;
    use std::process::{Command, Stdio};

    #[test]
    fn second_acquire_sees_lock_held() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dispatcher.lock");

        let first = SingletonLock::try_acquire(&path).unwrap();
        assert!(first.is_some());
        assert!(path.exists());

        // flock() conflicts between separate opens, even within one process.
        assert!(SingletonLock::try_acquire(&path).unwrap().is_none());
        assert!(SingletonLock::try_acquire(&path).unwrap().is_none());

        drop(first);
        assert!(SingletonLock::try_acquire(&path).unwrap().is_some());
    }

    #[test]
    fn lock_file_is_kept_after_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dispatcher.lock");
        drop(SingletonLock::try_acquire(&path).unwrap());
        assert!(path.exists());
    }

    #[test]
    fn cloexec_until_inherited() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dispatcher.lock");
        let lock = SingletonLock::try_acquire(&path).unwrap().unwrap();
        assert!(libc_util::is_cloexec(lock.as_raw_fd()).unwrap());
        lock.inherit_across_exec().unwrap();
        assert!(!libc_util::is_cloexec(lock.as_raw_fd()).unwrap());
    }

    #[test]
    fn open_failure_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing/dir/lock");
        let err = SingletonLock::try_acquire(&path).unwrap_err();
        assert_eq!(err.errno, libc::ENOENT);
    }

    /// An exec'd process that inherited the descriptor keeps the lock after we close ours, and
    /// the kernel releases it when that process is killed.
    #[test]
    fn exec_inherits_lock_and_death_releases_it() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dispatcher.lock");
        let lock = SingletonLock::try_acquire(&path).unwrap().unwrap();

        // Only the spawned child gets the descriptor without FD_CLOEXEC; threads running other
        // tests never see it.
        let raw_fd = lock.as_raw_fd();
        let mut holder = unsafe {
            Command::new("sleep")
                .arg("30")
                .stdin(Stdio::null())
                .pre_exec(move || {
                    if libc::fcntl(raw_fd, libc::F_SETFD, 0) == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                })
                .spawn()
                .unwrap()
        };

        drop(lock);
        assert!(SingletonLock::try_acquire(&path).unwrap().is_none());

        holder.kill().unwrap();
        holder.wait().unwrap();
        assert!(SingletonLock::try_acquire(&path).unwrap().is_some());
    }
}
