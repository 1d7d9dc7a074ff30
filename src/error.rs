use std::ffi::{c_int, CStr};

/// Result type for our error type.
pub type Result<T> = std::result::Result<T, Error>;

/// An OS error which tracks cause (the call that failed) and context (what we were doing when it
/// failed) as static strings, so it stays `Copy` and can cross `fork()` freely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Error {
    pub errno: c_int,
    pub cause: Option<&'static str>,
    pub context: Option<&'static str>,
}

impl Default for Error {
    fn default() -> Self {
        Self::new()
    }
}

impl Error {
    /// Create an empty error.
    pub fn new() -> Error {
        Error {
            errno: 0,
            cause: None,
            context: None,
        }
    }

    /// Create an error from the last OS error.
    pub fn last_os_error() -> Error {
        Error {
            errno: unsafe { *libc::__errno_location() },
            cause: None,
            context: None,
        }
    }

    /// Create an error carrying a specific errno.
    pub fn from_errno(errno: c_int) -> Error {
        Error {
            errno,
            cause: None,
            context: None,
        }
    }

    /// Replace the cause of an error.
    pub fn cause(self, msg: &'static str) -> Error {
        Error {
            errno: self.errno,
            cause: Some(msg),
            context: self.context,
        }
    }

    /// Replace the context of an error.
    pub fn context(self, msg: &'static str) -> Error {
        Error {
            errno: self.errno,
            cause: self.cause,
            context: Some(msg),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Error {
        Error {
            errno: e.raw_os_error().unwrap_or(0),
            cause: None,
            context: None,
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let mut separator = "";
        for msg in [self.context, self.cause].into_iter().flatten() {
            write!(f, "{separator}{msg}")?;
            separator = ": ";
        }

        // Errors from bail!() have a message but no errno.
        if self.errno == 0 && !separator.is_empty() {
            return Ok(());
        }

        // strerror() never returns NULL on glibc or musl.
        let error_msg = unsafe { CStr::from_ptr(libc::strerror(self.errno)) };
        let error_msg = error_msg.to_string_lossy();
        write!(f, "{separator}{error_msg} (errno {})", self.errno)
    }
}

impl std::error::Error for Error {}

// Define a macro, bail!, which returns an error with no errno and a custom message.
macro_rules! bail {
    ($msg:expr) => {
        return Err(Error {
            errno: 0,
            cause: Some($msg),
            context: None,
        })
    };
}
pub(crate) use bail;

// Define a macro, bail_errno!, which returns an error with the last OS error:
//
// - `bail_errno!()` returns an error with the last OS error.
// - `bail_errno!(msg)` returns an error with the last OS error and a cause message.
macro_rules! bail_errno {
    () => {
        return Err(Error::last_os_error())
    };
    ($msg:expr) => {
        return Err(Error::last_os_error().cause($msg))
    };
}
pub(crate) use bail_errno;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_context_and_cause() {
        let err = Error::from_errno(libc::ENOENT)
            .cause("open failed")
            .context("opening lock file");
        let msg = err.to_string();
        let errno = format!("(errno {})", libc::ENOENT);
        assert!(msg.starts_with("opening lock file: open failed: "));
        assert!(msg.ends_with(&errno), "{msg}");
    }

    #[test]
    fn io_error_keeps_errno() {
        let io = std::io::Error::from_raw_os_error(libc::EACCES);
        assert_eq!(Error::from(io).errno, libc::EACCES);
    }

    #[test]
    fn bail_sets_cause_without_errno() {
        fn fails() -> Result<()> {
            bail!("nope");
        }
        let err = fails().unwrap_err();
        assert_eq!(err.errno, 0);
        assert_eq!(err.cause, Some("nope"));
        assert_eq!(err.to_string(), "nope");
        assert_eq!(err.context("checking").to_string(), "checking: nope");
    }

    #[test]
    fn bare_errno_uses_strerror() {
        let msg = Error::from_errno(libc::EPERM).to_string();
        let errno = format!("(errno {})", libc::EPERM);
        assert!(msg.ends_with(&errno), "{msg}");
        assert!(!msg.starts_with(": "), "{msg}");
    }
}
