use std::ffi::{c_int, CStr, CString};
use std::mem;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use crate::error::{bail, bail_errno, Error, Result};

/// Which side of a `fork()` we are on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fork {
    Parent { child: libc::pid_t },
    Child,
}

/// Convert a path to a NUL-terminated string for a raw syscall.
pub fn path_to_cstring(path: &Path) -> Result<CString> {
    let Ok(path) = CString::new(path.as_os_str().as_bytes()) else {
        bail!("path contains an interior NUL");
    };
    Ok(path)
}

/// Open a file, returning an owned descriptor.
///
/// Unlike `std::fs::File`, this does not add `O_CLOEXEC` on its own.
pub fn open(path: &CStr, flags: c_int, mode: libc::mode_t) -> Result<OwnedFd> {
    let fd @ 0.. = (unsafe { libc::open(path.as_ptr(), flags, mode as libc::c_uint) }) else {
        bail_errno!("open failed");
    };
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

#[cfg_attr(not(test), allow(dead_code))]
pub fn is_cloexec(fd: RawFd) -> Result<bool> {
    let flags @ 0.. = (unsafe { libc::fcntl(fd, libc::F_GETFD) }) else {
        bail_errno!("fcntl(F_GETFD) failed");
    };
    Ok(flags & libc::FD_CLOEXEC != 0)
}

/// Set or clear `FD_CLOEXEC` on a descriptor.
pub fn set_cloexec(fd: RawFd, cloexec: bool) -> Result<()> {
    let flags @ 0.. = (unsafe { libc::fcntl(fd, libc::F_GETFD) }) else {
        bail_errno!("fcntl(F_GETFD) failed");
    };
    let flags = if cloexec {
        flags | libc::FD_CLOEXEC
    } else {
        flags & !libc::FD_CLOEXEC
    };
    let 0.. = (unsafe { libc::fcntl(fd, libc::F_SETFD, flags) }) else {
        bail_errno!("fcntl(F_SETFD) failed");
    };
    Ok(())
}

pub fn dup2(fd: RawFd, target: RawFd) -> Result<()> {
    let 0.. = (unsafe { libc::dup2(fd, target) }) else {
        bail_errno!("dup2 failed");
    };
    Ok(())
}

/// Fork the calling process.
///
/// The caller must be single-threaded: only the calling thread survives in the child.
pub fn fork() -> Result<Fork> {
    match unsafe { libc::fork() } {
        -1 => bail_errno!("fork failed"),
        0 => Ok(Fork::Child),
        child => Ok(Fork::Parent { child }),
    }
}

/// Block `signal` for the calling thread, returning the set containing just that signal.
///
/// In a single-threaded process this is the process mask.
pub fn block_signal(signal: c_int) -> Result<libc::sigset_t> {
    let mut mask = mem::MaybeUninit::<libc::sigset_t>::uninit();
    let mask = unsafe {
        libc::sigemptyset(mask.as_mut_ptr());
        libc::sigaddset(mask.as_mut_ptr(), signal);
        mask.assume_init()
    };
    let 0 = (unsafe { libc::sigprocmask(libc::SIG_BLOCK, &mask, std::ptr::null_mut()) }) else {
        bail_errno!("sigprocmask failed");
    };
    Ok(mask)
}

/// Read the credentials of the peer of a connected Unix socket.
///
/// On the connecting side these are the credentials the listener had when it called `listen()`.
pub fn peer_credentials(fd: RawFd) -> Result<libc::ucred> {
    let mut cred = mem::MaybeUninit::<libc::ucred>::zeroed();
    let mut len = mem::size_of::<libc::ucred>() as libc::socklen_t;
    let 0 = (unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_PEERCRED,
            cred.as_mut_ptr().cast(),
            &mut len,
        )
    }) else {
        bail_errno!("getsockopt(SO_PEERCRED) failed");
    };
    if len as usize != mem::size_of::<libc::ucred>() {
        return Err(Error::new().cause("short SO_PEERCRED result"));
    }
    Ok(unsafe { cred.assume_init() })
}
