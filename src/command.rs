use std::ffi::{c_char, CString};
use std::path::Path;
use std::ptr;

use crate::config;
use crate::error::{bail, Error, Result};

/// The filesystem-sharing daemon's program and fixed argument vector.
///
/// Only the socket path and shared directory vary; every hardening option is fixed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonCommand {
    program: CString,
    args: Vec<CString>,
}

impl DaemonCommand {
    /// The virtiofsd invocation for one shared directory served on `socket_path`.
    pub fn virtiofsd(socket_path: &Path, shared_dir: &Path) -> Result<DaemonCommand> {
        let squash = format!("squash-guest:0:{}:4294967295", config::SQUASH_ID);
        let args = [
            "--socket-path".to_owned(),
            path_arg(socket_path)?,
            "--shared-dir".to_owned(),
            path_arg(shared_dir)?,
            "--cache=auto".to_owned(),
            "--sandbox=chroot".to_owned(),
            "--modcaps=+dac_read_search:-mknod:-setfcap".to_owned(),
            "--inode-file-handles=prefer".to_owned(),
            "--migration-mode=file-handles".to_owned(),
            "--migration-on-error=guest-error".to_owned(),
            format!("--translate-uid={squash}"),
            format!("--translate-gid={squash}"),
        ];
        Self::new(config::DAEMON_PATH, args)
    }

    /// A daemon command with `argv[0]` set to the program path.
    pub fn new(
        program: impl AsRef<str>,
        args: impl IntoIterator<Item = impl AsRef<str>>,
    ) -> Result<DaemonCommand> {
        let Ok(program) = CString::new(program.as_ref()) else {
            bail!("program path contains an interior NUL");
        };
        let args = args
            .into_iter()
            .map(|arg| {
                CString::new(arg.as_ref())
                    .map_err(|_| Error::new().cause("argument contains an interior NUL"))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(DaemonCommand { program, args })
    }

    pub fn get_program(&self) -> &str {
        self.program.to_str().unwrap_or_default()
    }

    /// The full argument vector, starting with `argv[0]`.
    pub fn get_args(&self) -> impl Iterator<Item = &str> {
        std::iter::once(&self.program)
            .chain(self.args.iter())
            .map(|arg| arg.to_str().unwrap_or_default())
    }

    /// Replace the process image with the daemon, with an empty environment.
    ///
    /// Only returns on failure.
    pub fn exec(&self) -> Error {
        let mut argv: Vec<*const c_char> = Vec::with_capacity(self.args.len() + 2);
        argv.push(self.program.as_ptr());
        argv.extend(self.args.iter().map(|arg| arg.as_ptr()));
        argv.push(ptr::null());
        let envp: [*const c_char; 1] = [ptr::null()];

        unsafe { libc::execve(self.program.as_ptr(), argv.as_ptr(), envp.as_ptr()) };
        Error::last_os_error().cause("execve failed")
    }
}

/// Daemon paths are passed as UTF-8 arguments. NULs are rejected later, by [`DaemonCommand::new`].
fn path_arg(path: &Path) -> Result<String> {
    let Some(path) = path.to_str() else {
        bail!("path is not valid UTF-8");
    };
    Ok(path.to_owned())
}
