//! The placeholder's supervision loop.
//!
//! The placeholder runs as PID 1 of an unprivileged container. It keeps a rendezvous socket open
//! so controllers can discover its pid, and exits once a child running as root exits: the
//! privileged daemon, which the dispatcher re-parented onto us.
//!
//! Everything happens on one thread, in one level-triggered `epoll` set holding the listening
//! socket, a `signalfd` for SIGCHLD, and every accepted connection.

use std::collections::HashMap;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::Path;

use tracing::{debug, info, span, Level};

use crate::error::{bail_errno, Error, Result};
use crate::libc_util;
use crate::rendezvous::Rendezvous;

/// Events handled per `epoll_wait()`.
const MAX_EVENTS: usize = 16;

/// Lifecycle of the placeholder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Starting,
    Listening,
    ShuttingDown,
    Terminated,
}

impl State {
    /// The state after observing a child's exit.
    ///
    /// Only a child running as the superuser is the daemon. The placeholder may have other,
    /// unrelated children.
    pub fn on_child_exit(self, exit: &ChildExit) -> State {
        match self {
            State::Listening if exit.is_superuser() => State::ShuttingDown,
            state => state,
        }
    }
}

/// A child exit, as reported by a SIGCHLD record or by reaping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildExit {
    pub pid: libc::pid_t,
    pub uid: libc::uid_t,
}

impl ChildExit {
    /// Interpret a `signalfd` record. Anything other than SIGCHLD is not a child exit.
    pub fn from_siginfo(info: &libc::signalfd_siginfo) -> Option<ChildExit> {
        if info.ssi_signo != libc::SIGCHLD as u32 {
            return None;
        }
        Some(ChildExit {
            pid: info.ssi_pid as libc::pid_t,
            uid: info.ssi_uid,
        })
    }

    pub fn is_superuser(&self) -> bool {
        self.uid == 0
    }
}

/// A non-blocking `signalfd` receiving SIGCHLD, which is blocked for normal delivery.
#[derive(Debug)]
struct SignalFd {
    fd: OwnedFd,
}

impl SignalFd {
    fn sigchld() -> Result<SignalFd> {
        let mask = libc_util::block_signal(libc::SIGCHLD)?;
        let fd @ 0.. =
            (unsafe { libc::signalfd(-1, &mask, libc::SFD_CLOEXEC | libc::SFD_NONBLOCK) })
        else {
            bail_errno!("signalfd failed");
        };
        Ok(SignalFd {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    /// Read one queued record, if a whole one is available.
    fn read(&self) -> Result<Option<libc::signalfd_siginfo>> {
        let size = mem::size_of::<libc::signalfd_siginfo>();
        let mut info = mem::MaybeUninit::<libc::signalfd_siginfo>::zeroed();
        let n = unsafe { libc::read(self.fd.as_raw_fd(), info.as_mut_ptr().cast(), size) };
        if n < 0 {
            let err = Error::last_os_error();
            return match err.errno {
                libc::EAGAIN | libc::EINTR => Ok(None),
                _ => Err(err.cause("read from signalfd failed")),
            };
        }
        if n as usize != size {
            return Ok(None);
        }
        Ok(Some(unsafe { info.assume_init() }))
    }
}

/// Reap every exited child without blocking.
///
/// SIGCHLD records coalesce, so one record may stand for several exits.
fn reap_children() -> Result<Vec<ChildExit>> {
    let mut exits = Vec::new();
    loop {
        let mut info = mem::MaybeUninit::<libc::siginfo_t>::zeroed();
        let ret = unsafe {
            libc::waitid(
                libc::P_ALL,
                0,
                info.as_mut_ptr(),
                libc::WEXITED | libc::WNOHANG,
            )
        };
        if ret == -1 {
            let err = Error::last_os_error();
            match err.errno {
                libc::ECHILD => break,
                libc::EINTR => continue,
                _ => return Err(err.cause("waitid failed")),
            }
        }
        let info = unsafe { info.assume_init() };
        let (pid, uid) = unsafe { (info.si_pid(), info.si_uid()) };
        // With WNOHANG, si_pid stays zero when no child has exited.
        if pid == 0 {
            break;
        }
        exits.push(ChildExit { pid, uid });
    }
    Ok(exits)
}

#[derive(Debug)]
struct Epoll {
    fd: OwnedFd,
}

impl Epoll {
    fn new() -> Result<Epoll> {
        let fd @ 0.. = (unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) }) else {
            bail_errno!("epoll_create1 failed");
        };
        Ok(Epoll {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    /// Watch `fd`, using the descriptor itself as the event token.
    fn add(&self, fd: RawFd, events: libc::c_int) -> Result<()> {
        let mut event = libc::epoll_event {
            events: events as u32,
            u64: fd as u64,
        };
        let epfd = self.fd.as_raw_fd();
        let 0 = (unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, fd, &mut event) }) else {
            bail_errno!("epoll_ctl(EPOLL_CTL_ADD) failed");
        };
        Ok(())
    }

    fn delete(&self, fd: RawFd) -> Result<()> {
        let epfd = self.fd.as_raw_fd();
        let mut event = libc::epoll_event { events: 0, u64: 0 };
        let 0 = (unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_DEL, fd, &mut event) }) else {
            bail_errno!("epoll_ctl(EPOLL_CTL_DEL) failed");
        };
        Ok(())
    }

    /// Wait indefinitely for events, retrying when interrupted.
    fn wait(&self, events: &mut [libc::epoll_event]) -> Result<usize> {
        loop {
            let n = unsafe {
                libc::epoll_wait(
                    self.fd.as_raw_fd(),
                    events.as_mut_ptr(),
                    events.len() as libc::c_int,
                    -1,
                )
            };
            if n >= 0 {
                return Ok(n as usize);
            }
            let err = Error::last_os_error();
            if err.errno != libc::EINTR {
                return Err(err.cause("epoll_wait failed"));
            }
        }
    }
}

/// The placeholder's supervisor: a rendezvous socket, SIGCHLD, and open discovery connections.
#[derive(Debug)]
pub struct Supervisor {
    rendezvous: Rendezvous,
    signals: SignalFd,
    epoll: Epoll,
    connections: HashMap<RawFd, OwnedFd>,
    state: State,
}

impl Supervisor {
    /// Block SIGCHLD into a signalfd, bind the rendezvous socket, and start listening.
    ///
    /// SIGCHLD is blocked for the calling thread, so the placeholder must call this before it
    /// spawns any threads.
    pub fn start(socket_path: &Path) -> Result<Supervisor> {
        let signals = SignalFd::sigchld()
            .map_err(|e| e.context("failed to set up signalfd"))?;
        let rendezvous = Rendezvous::bind(socket_path)
            .map_err(|e| e.context("failed to set up rendezvous socket"))?;
        let epoll = Epoll::new()
            .map_err(|e| e.context("failed to set up event loop"))?;

        epoll
            .add(rendezvous.as_raw_fd(), libc::EPOLLIN)
            .map_err(|e| e.context("failed to watch rendezvous socket"))?;
        epoll
            .add(signals.fd.as_raw_fd(), libc::EPOLLIN)
            .map_err(|e| e.context("failed to watch signalfd"))?;

        info!(path = %socket_path.display(), "listening for discovery connections");
        Ok(Supervisor {
            rendezvous,
            signals,
            epoll,
            connections: HashMap::new(),
            state: State::Listening,
        })
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Number of accepted connections whose peer has not hung up yet.
    pub fn open_connections(&self) -> usize {
        self.connections.len()
    }

    /// Wait for one batch of events and handle it.
    pub fn step(&mut self) -> Result<State> {
        let mut events = [libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];
        let n = self.epoll.wait(&mut events)?;

        for event in &events[..n] {
            let fd = event.u64 as RawFd;
            if fd == self.rendezvous.as_raw_fd() {
                self.accept()?;
            } else if fd == self.signals.fd.as_raw_fd() {
                self.handle_sigchld()?;
            } else {
                self.hang_up(fd)?;
            }
        }

        Ok(self.state)
    }

    /// Handle events until the daemon exits.
    pub fn run(mut self) -> Result<()> {
        let span = span!(Level::INFO, "supervise", pid = std::process::id());
        let _span_guard = span.enter();

        while self.state == State::Listening {
            self.step()?;
        }

        info!(connections = self.connections.len(), "shutting down");
        self.connections.clear();
        self.state = State::Terminated;
        Ok(())
    }

    fn accept(&mut self) -> Result<()> {
        let Some(conn) = self.rendezvous.accept()? else {
            return Ok(());
        };
        let fd = conn.as_raw_fd();
        // Hang-ups only. EPOLLHUP and EPOLLERR are always reported.
        self.epoll
            .add(fd, libc::EPOLLRDHUP)
            .map_err(|e| e.context("failed to watch accepted connection"))?;
        self.connections.insert(fd, conn);
        debug!(fd, open = self.connections.len(), "accepted connection");
        Ok(())
    }

    fn hang_up(&mut self, fd: RawFd) -> Result<()> {
        let Some(conn) = self.connections.remove(&fd) else {
            return Ok(());
        };
        self.epoll
            .delete(conn.as_raw_fd())
            .map_err(|e| e.context("failed to unwatch closed connection"))?;
        drop(conn);
        debug!(fd, open = self.connections.len(), "peer hung up");
        Ok(())
    }

    fn handle_sigchld(&mut self) -> Result<()> {
        let Some(info) = self.signals.read()? else {
            debug!("spurious signalfd wakeup");
            return Ok(());
        };
        if let Some(exit) = ChildExit::from_siginfo(&info) {
            self.observe(exit);
        }
        for exit in reap_children()? {
            self.observe(exit);
        }
        Ok(())
    }

    fn observe(&mut self, exit: ChildExit) {
        let next = self.state.on_child_exit(&exit);
        if next == State::ShuttingDown && self.state != State::ShuttingDown {
            info!(child = exit.pid, uid = exit.uid, "daemon exited");
        } else {
            debug!(child = exit.pid, uid = exit.uid, "ignoring child exit");
        }
        self.state = next;
    }
}

/// Run the placeholder until the daemon exits.
pub fn run(socket_path: &Path) -> Result<()> {
    Supervisor::start(socket_path)?.run()
}
