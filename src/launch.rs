use std::ffi::CStr;
use std::os::fd::AsRawFd;
use std::path::Path;

use c_str_macro::c_str;
use tracing::{debug, info, span, Level};

use crate::error::{bail_errno, Error, Result};
use crate::libc_util::{self, Fork};
use crate::{DaemonCommand, Joined, SingletonLock};

/// How [`launch_once_and_exec`] returned without replacing the process image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handoff {
    /// Another process holds the singleton lock, so a daemon is already running. Not an error:
    /// the dispatcher may be re-run by a restart policy at any time.
    AlreadyRunning,
}

/// Where the daemon's standard output and standard error are pointed.
#[derive(Debug, Clone, Copy)]
struct Stdio<'a> {
    stdout: &'a CStr,
    stderr: &'a CStr,
}

impl Stdio<'static> {
    /// PID 1's streams. After joining the target's mount namespace, `/proc` is the target's
    /// procfs, so these are the streams of the container's init.
    fn pid1() -> Stdio<'static> {
        Stdio {
            stdout: c_str!("/proc/1/fd/1"),
            stderr: c_str!("/proc/1/fd/2"),
        }
    }
}

/// Take the singleton lock, fork into the joined PID namespace, daemonize, and exec the daemon.
///
/// - If the lock is held elsewhere, returns [`Handoff::AlreadyRunning`] without forking.
/// - Every parent along the way exits with status 0 from inside this function.
/// - On success the final child becomes `daemon` and this function never returns.
/// - Any error is returned in whichever process hit it.
///
/// The lock's descriptor is inherited by the daemon, so the lock is released exactly when the
/// daemon exits, even if it crashes.
pub fn launch_once_and_exec(
    joined: Joined,
    lock_path: &Path,
    daemon: &DaemonCommand,
) -> Result<Handoff> {
    launch_with_stdio(joined, lock_path, Stdio::pid1(), daemon)
}

fn launch_with_stdio(
    joined: Joined,
    lock_path: &Path,
    stdio: Stdio<'_>,
    daemon: &DaemonCommand,
) -> Result<Handoff> {
    let span = span!(Level::INFO, "launch", placeholder = joined.target().pid());
    let _span_guard = span.enter();

    let Some(lock) = SingletonLock::try_acquire(lock_path)? else {
        info!(lock = %lock_path.display(), "daemon already running");
        return Ok(Handoff::AlreadyRunning);
    };

    // setns(2) does not move us into the target's PID namespace; this child is born there, and
    // once we exit it is re-parented to the target's init.
    let fork = libc_util::fork()
        .map_err(|e| e.context("failed to fork into target"))?;
    exit_in_parent(fork);

    daemonize().map_err(|e| e.context("failed to daemonize"))?;
    redirect_output(stdio)
        .map_err(|e| e.context("failed to redirect output"))?;
    lock.inherit_across_exec()?;

    info!(
        pid = std::process::id(),
        program = daemon.get_program(),
        "executing daemon"
    );
    let err = daemon.exec();
    drop(lock);
    Err(err.context("failed to exec daemon"))
}

/// Let the parent side of a fork exit successfully; only the child returns.
fn exit_in_parent(fork: Fork) {
    if let Fork::Parent { child } = fork {
        debug!(child, "handing off to child");
        unsafe { libc::_exit(0) };
    }
}

/// Detach from the controlling terminal the way `daemon(3)` does, without closing stdout or
/// stderr: fork again so we are not a process group leader, start a new session, and ignore the
/// job-control signals.
fn daemonize() -> Result<()> {
    exit_in_parent(libc_util::fork()?);

    let 0.. = (unsafe { libc::setsid() }) else {
        bail_errno!("setsid failed");
    };

    for signal in [libc::SIGHUP, libc::SIGTSTP, libc::SIGTTIN, libc::SIGTTOU] {
        if unsafe { libc::signal(signal, libc::SIG_IGN) } == libc::SIG_ERR {
            bail_errno!("failed to ignore job-control signal");
        }
    }

    let 0 = (unsafe { libc::chdir(c_str!("/").as_ptr()) }) else {
        bail_errno!("chdir to / failed");
    };

    let null = libc_util::open(c_str!("/dev/null"), libc::O_RDONLY | libc::O_CLOEXEC, 0)?;
    libc_util::dup2(null.as_raw_fd(), libc::STDIN_FILENO)?;

    debug!(pid = std::process::id(), "daemonized");
    Ok(())
}

fn redirect_output(stdio: Stdio<'_>) -> Result<()> {
    for (path, target) in [
        (stdio.stdout, libc::STDOUT_FILENO),
        (stdio.stderr, libc::STDERR_FILENO),
    ] {
        let fd = libc_util::open(path, libc::O_WRONLY | libc::O_CLOEXEC, 0)
            .map_err(|e: Error| e.context("failed to open output stream"))?;
        // dup2() clears FD_CLOEXEC on the copy.
        libc_util::dup2(fd.as_raw_fd(), target)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::join::join_with_roots;
    use crate::rendezvous::discover;
    use crate::{cgroup, config, Target};
    use std::path::PathBuf;
    use std::process::{self, Command};
    use std::time::{Duration, Instant};

    fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        cond()
    }

    fn lock_is_free(path: &Path) -> bool {
        SingletonLock::try_acquire(path).unwrap().is_some()
    }

    fn joined_self() -> Joined {
        Joined::assume(Target::new(std::process::id() as libc::pid_t).unwrap())
    }

    fn missing_daemon() -> DaemonCommand {
        let no_args: [&str; 0] = [];
        DaemonCommand::new("/nonexistent", no_args).unwrap()
    }

    /// A shell daemon that sleeps `delay` seconds, records `$$` and field `field` of its own
    /// `/proc/$$/stat` in `marker`, then holds the inherited lock for two more seconds.
    fn recording_daemon(marker: &Path, field: u32, delay: u32) -> DaemonCommand {
        let script = format!(
            "sleep {delay}; echo $$ $(cut -d' ' -f{field} /proc/$$/stat) > {0}.tmp; \
             mv {0}.tmp {0}; sleep 2",
            marker.display()
        );
        let argv = ["-c", script.as_str()];
        DaemonCommand::new("/bin/sh", argv).unwrap()
    }

    fn read_marker(marker: &Path) -> (libc::pid_t, libc::pid_t) {
        let contents = std::fs::read_to_string(marker).unwrap();
        let mut fields = contents.split_whitespace();
        let pid = fields.next().unwrap().parse().unwrap();
        let value = fields.next().unwrap().parse().unwrap();
        (pid, value)
    }

    #[test]
    fn held_lock_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join("dispatcher.lock");
        let _held = SingletonLock::try_acquire(&lock_path).unwrap().unwrap();

        let daemon = missing_daemon();
        let handoff = launch_once_and_exec(joined_self(), &lock_path, &daemon);
        assert_eq!(handoff.unwrap(), Handoff::AlreadyRunning);
    }

    #[test]
    fn unopenable_lock_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join("no/such/lock");
        let daemon = missing_daemon();
        let result = launch_once_and_exec(joined_self(), &lock_path, &daemon);
        assert_eq!(result.unwrap_err().errno, libc::ENOENT);
    }

    /// Runs the full fork/daemonize/exec sequence in a forked child. The daemon records its pid
    /// and session, then holds the inherited lock for a moment.
    #[test]
    fn daemon_holds_lock_until_it_exits() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join("dispatcher.lock");
        let marker = dir.path().join("daemon");
        let daemon = recording_daemon(&marker, 6, 0);
        let null = c_str!("/dev/null");
        let stdio = Stdio {
            stdout: null,
            stderr: null,
        };

        let dispatcher = match libc_util::fork().unwrap() {
            Fork::Child => {
                let result = launch_with_stdio(joined_self(), &lock_path, stdio, &daemon);
                unsafe { libc::_exit(if result.is_ok() { 3 } else { 4 }) };
            }
            Fork::Parent { child } => child,
        };

        // The dispatcher itself exits 0 right after the first fork.
        let mut status = 0;
        assert_eq!(
            unsafe { libc::waitpid(dispatcher, &mut status, 0) },
            dispatcher
        );
        assert!(libc::WIFEXITED(status));
        assert_eq!(libc::WEXITSTATUS(status), 0);

        let timeout = Duration::from_secs(10);
        assert!(wait_until(timeout, || marker.exists()));
        let (daemon_pid, session) = read_marker(&marker);
        assert_ne!(daemon_pid, dispatcher);
        // The daemon is the process that called setsid(), so it leads its own session.
        assert_eq!(session, daemon_pid);

        assert!(!lock_is_free(&lock_path));
        assert!(wait_until(timeout, || lock_is_free(&lock_path)));
    }

    /// The placeholder binary, built next to this test binary's `deps/` directory.
    fn placeholder_exe() -> PathBuf {
        let test_exe = std::env::current_exe().unwrap();
        let profile_dir = test_exe.parent().and_then(Path::parent).unwrap();
        let exe = profile_dir.join("tether-placeholder");
        assert!(exe.exists(), "{} is not built", exe.display());
        exe
    }

    /// Fork a dispatcher that joins `target` and launches `daemon` with PID 1's output.
    ///
    /// Returns its exit status: 0 once it handed off, 5 if a daemon was already running.
    fn dispatch(
        target: Target,
        cgroup_root: &Path,
        lock_path: &Path,
        daemon: &DaemonCommand,
    ) -> libc::c_int {
        let proc_root = Path::new(config::PROC_ROOT);
        match libc_util::fork().unwrap() {
            Fork::Child => {
                let Ok(joined) = join_with_roots(target, proc_root, cgroup_root) else {
                    unsafe { libc::_exit(3) };
                };
                let handoff = launch_with_stdio(joined, lock_path, Stdio::pid1(), daemon);
                let code = match handoff {
                    Ok(Handoff::AlreadyRunning) => 5,
                    Err(_) => 4,
                };
                unsafe { libc::_exit(code) };
            }
            Fork::Parent { child } => {
                let mut status = 0;
                assert_eq!(unsafe { libc::waitpid(child, &mut status, 0) }, child);
                assert!(libc::WIFEXITED(status));
                libc::WEXITSTATUS(status)
            }
        }
    }

    /// The whole handoff into a placeholder running as PID 1 of its own PID namespace: the
    /// daemon is re-parented onto the placeholder, a second dispatch finds it running, and the
    /// placeholder exits once the daemon does.
    #[test]
    #[ignore = "requires CAP_SYS_ADMIN"]
    fn daemon_is_reparented_onto_placeholder() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("placeholder.sock");
        let lock_path = dir.path().join("dispatcher.lock");
        let cgroup_root = dir.path().join("cgroup");
        let marker = dir.path().join("daemon");
        let timeout = Duration::from_secs(10);

        let mut placeholder = Command::new("unshare")
            .args(["-p", "-f", "--mount-proc"])
            .arg(placeholder_exe())
            .arg("--socket-path")
            .arg(&socket)
            .stdin(process::Stdio::null())
            .stdout(process::Stdio::null())
            .stderr(process::Stdio::null())
            .spawn()
            .unwrap();
        assert!(wait_until(timeout, || discover(&socket).is_ok()));
        let target = Target::new(discover(&socket).unwrap()).unwrap();

        // Stand-in cgroup tree with the placeholder's cgroup in it.
        let cgroup_file = format!("{}/{}/cgroup", config::PROC_ROOT, target.pid());
        let contents = std::fs::read_to_string(cgroup_file).unwrap();
        let relative = cgroup::v2_relative_path(&contents).unwrap();
        let cgroup_dir = cgroup_root.join(relative);
        std::fs::create_dir_all(&cgroup_dir).unwrap();
        let procs = cgroup::procs_file(&cgroup_root, relative);
        std::fs::write(&procs, "").unwrap();

        let daemon = recording_daemon(&marker, 4, 1);
        assert_eq!(dispatch(target, &cgroup_root, &lock_path, &daemon), 0);

        assert!(wait_until(timeout, || marker.exists()));
        let (daemon_pid, parent) = read_marker(&marker);
        assert_ne!(daemon_pid, 1);
        assert_eq!(parent, 1);

        assert_eq!(dispatch(target, &cgroup_root, &lock_path, &daemon), 5);

        let exited = wait_until(timeout, || placeholder.try_wait().unwrap().is_some());
        assert!(exited);
        assert!(placeholder.wait().unwrap().success());
        assert!(wait_until(timeout, || lock_is_free(&lock_path)));
    }
}
