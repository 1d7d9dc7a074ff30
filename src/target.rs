use std::fmt;

use crate::error::{bail, Error, Result};

/// The process whose cgroup and namespaces the dispatcher moves into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Target {
    pid: libc::pid_t,
}

impl Target {
    /// Describe a target process. The pid must be positive.
    pub fn new(pid: libc::pid_t) -> Result<Target> {
        if pid <= 0 {
            bail!("target pid must be a positive integer");
        }
        Ok(Target { pid })
    }

    pub fn pid(&self) -> libc::pid_t {
        self.pid
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pid {}", self.pid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_positive_pids() {
        assert!(Target::new(0).is_err());
        assert!(Target::new(-1).is_err());
        assert_eq!(Target::new(1).unwrap().pid(), 1);
    }
}
