//! Lifecycle states and exit statuses.

use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};

use crate::error::{ProcessError, Result};

/// Exit code a child reports when it could not exec the requested program.
///
/// A program that exits with 127 on its own is indistinguishable from an
/// exec failure.
pub const EXEC_FAILURE_CODE: i32 = 127;

/// Observable state of a [`ProcessHandle`](super::ProcessHandle).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum State {
    /// No operating system resources acquired yet.
    Initial,
    /// Child forked, pipes open.
    Running,
    /// Pipes closed. The exit status is cached once the child is reaped.
    Stopped,
}

impl State {
    /// Lowercase name of the state.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::Running => "running",
            Self::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How a reaped child terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ExitStatus {
    /// The child called `exit` with this code.
    Exited { code: i32 },
    /// The child was killed by this signal number.
    Signaled { signal: i32 },
}

impl ExitStatus {
    /// Exit code in the conventional 0-255 range.
    ///
    /// Signal deaths map to `128 + signal`, as shells report them.
    pub const fn code(self) -> i32 {
        match self {
            Self::Exited { code } => code,
            Self::Signaled { signal } => 128 + signal,
        }
    }

    /// Whether the child exited with code 0.
    pub const fn success(self) -> bool {
        matches!(self, Self::Exited { code: 0 })
    }

    /// The terminating signal, if any.
    pub const fn signal(self) -> Option<i32> {
        match self {
            Self::Exited { .. } => None,
            Self::Signaled { signal } => Some(signal),
        }
    }

    /// Whether the status looks like the child failed to exec.
    pub const fn exec_failed(self) -> bool {
        matches!(self, Self::Exited { code: EXEC_FAILURE_CODE })
    }

    /// Decode a `waitpid` result. Returns `None` for non-terminal statuses.
    pub(crate) fn from_wait(status: WaitStatus) -> Option<Self> {
        match status {
            WaitStatus::Exited(_, code) => Some(Self::Exited { code }),
            WaitStatus::Signaled(_, signal, _) => Some(Self::Signaled {
                signal: signal as i32,
            }),
            _ => None,
        }
    }
}

impl std::fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exited { code } => write!(f, "exit code {code}"),
            Self::Signaled { signal } => write!(f, "signal {signal}"),
        }
    }
}

/// Internal lifecycle, carrying the data each state owns.
///
/// `Stopped` is split on whether the pid has been reaped: a drain closes
/// the pipes without waiting for the child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Lifecycle {
    Initial,
    Running { pid: Pid },
    Stopped { pid: Pid, exit: Option<ExitStatus> },
}

impl Lifecycle {
    pub(crate) const fn state(self) -> State {
        match self {
            Self::Initial => State::Initial,
            Self::Running { .. } => State::Running,
            Self::Stopped { .. } => State::Stopped,
        }
    }

    pub(crate) const fn exit(self) -> Option<ExitStatus> {
        match self {
            Self::Stopped { exit, .. } => exit,
            _ => None,
        }
    }

    /// Move to `next`, rejecting anything but the forward transitions.
    pub(crate) fn advance(&mut self, next: Self) -> Result<()> {
        let allowed = match (*self, next) {
            (Self::Initial, Self::Running { .. }) => true,
            (Self::Running { pid }, Self::Stopped { pid: next_pid, .. }) => pid == next_pid,
            (
                Self::Stopped { pid, exit: None },
                Self::Stopped {
                    pid: next_pid,
                    exit: Some(_),
                },
            ) => pid == next_pid,
            _ => false,
        };

        if !allowed {
            return Err(ProcessError::InvalidTransition {
                from: self.state(),
                to: next.state(),
            });
        }

        *self = next;
        Ok(())
    }
}
