//! The placeholder's rendezvous socket.
//!
//! No bytes are ever exchanged. A peer learns the placeholder's pid from the connection's
//! `SO_PEERCRED` credentials, which the kernel records when the listener calls `listen()`.

use std::fs;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::FileTypeExt;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{bail, bail_errno, Error, Result};
use crate::libc_util;

/// Discovery clients connect and disconnect one at a time.
const BACKLOG: libc::c_int = 1;

/// A listening Unix stream socket bound to a path.
#[derive(Debug)]
pub struct Rendezvous {
    fd: OwnedFd,
    path: PathBuf,
}

impl Rendezvous {
    /// Bind and listen at `path`.
    ///
    /// A socket left at `path` by an earlier placeholder is removed first; any other kind of file
    /// makes the bind fail.
    pub fn bind(path: &Path) -> Result<Rendezvous> {
        remove_stale_socket(path)?;

        let addr = sockaddr_un(path)?;
        let fd @ 0.. =
            (unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) })
        else {
            bail_errno!("socket failed");
        };
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        let 0 = (unsafe {
            libc::bind(
                fd.as_raw_fd(),
                &addr as *const libc::sockaddr_un as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_un>() as libc::socklen_t,
            )
        }) else {
            bail_errno!("bind failed");
        };

        let 0 = (unsafe { libc::listen(fd.as_raw_fd(), BACKLOG) }) else {
            bail_errno!("listen failed");
        };

        debug!(path = %path.display(), "listening");
        Ok(Rendezvous {
            fd,
            path: path.to_owned(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept one pending connection.
    ///
    /// Returns `Ok(None)` if the connection vanished before we got to it.
    pub fn accept(&self) -> Result<Option<OwnedFd>> {
        let fd = unsafe {
            libc::accept4(
                self.fd.as_raw_fd(),
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                libc::SOCK_CLOEXEC,
            )
        };
        if fd < 0 {
            let err = Error::last_os_error();
            return match err.errno {
                libc::EAGAIN | libc::ECONNABORTED | libc::EINTR => {
                    warn!(err = %err, "accept returned no connection");
                    Ok(None)
                }
                _ => Err(err.cause("accept failed")),
            };
        }
        Ok(Some(unsafe { OwnedFd::from_raw_fd(fd) }))
    }
}

impl AsRawFd for Rendezvous {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// Connect to a rendezvous socket and return the pid of the process listening on it.
pub fn discover(path: &Path) -> Result<libc::pid_t> {
    let stream = UnixStream::connect(path)
        .map_err(Error::from)
        .map_err(|e| e.cause("connect failed"))?;
    let cred = libc_util::peer_credentials(stream.as_raw_fd())?;
    debug!(path = %path.display(), pid = cred.pid, uid = cred.uid, "discovered listener");
    Ok(cred.pid)
}

fn remove_stale_socket(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_socket() => {
            debug!(path = %path.display(), "removing stale socket");
            fs::remove_file(path)
                .map_err(Error::from)
                .map_err(|e| e.cause("failed to remove stale socket"))
        }
        _ => Ok(()),
    }
}

fn sockaddr_un(path: &Path) -> Result<libc::sockaddr_un> {
    let mut addr: libc::sockaddr_un = unsafe { mem::zeroed() };
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;

    let bytes = path.as_os_str().as_bytes();
    // Leave room for the terminating NUL.
    if bytes.len() >= addr.sun_path.len() {
        bail!("socket path is too long");
    }
    if bytes.contains(&0) {
        bail!("socket path contains an interior NUL");
    }
    for (dst, src) in addr.sun_path.iter_mut().zip(bytes) {
        *dst = *src as libc::c_char;
    }
    Ok(addr)
}
