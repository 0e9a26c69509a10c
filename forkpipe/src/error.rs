//! Error types for process spawning and lifecycle management.

use nix::errno::Errno;
use std::io;
use thiserror::Error;

use crate::process::State;

/// Process management errors.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// A pipe for one of the child's standard streams could not be created.
    #[error("Failed to create {stream} pipe: {source}")]
    PipeCreationFailed {
        stream: &'static str,
        #[source]
        source: Errno,
    },

    /// The process or system descriptor table is full.
    #[error("Descriptor limit reached while creating {stream} pipe: {source}")]
    ResourceExhausted {
        stream: &'static str,
        #[source]
        source: Errno,
    },

    /// `fork` could not create the child.
    #[error("Failed to spawn process {program}: {source}")]
    SpawnFailed {
        program: String,
        #[source]
        source: Errno,
    },

    /// The child could not replace its image with the requested program.
    ///
    /// Only observable through the child's exit status, see
    /// [`ExitStatus::exec_failed`](crate::ExitStatus::exec_failed).
    #[error("Failed to execute {program} (exit status {code})")]
    ExecFailed { program: String, code: i32 },

    /// A lifecycle call was made before `start`.
    #[error("Process has not been started")]
    NotStarted,

    /// `start` was called on a handle that already left the initial state.
    #[error("Process already started (state: {0})")]
    AlreadyStarted(State),

    /// The command cannot be turned into an argv.
    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    /// A state change that the lifecycle does not allow.
    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition { from: State, to: State },

    /// `waitpid` failed for the child.
    #[error("Failed to wait for process {pid}: {source}")]
    WaitFailed {
        pid: i32,
        #[source]
        source: Errno,
    },

    /// Reading or writing one of the pipes failed.
    #[error("Pipe I/O failed: {0}")]
    Io(#[from] io::Error),
}

impl ProcessError {
    /// Classify a failed `pipe` call.
    pub(crate) fn from_pipe(stream: &'static str, source: Errno) -> Self {
        match source {
            Errno::EMFILE | Errno::ENFILE => Self::ResourceExhausted { stream, source },
            _ => Self::PipeCreationFailed { stream, source },
        }
    }
}

/// Result type for process operations.
pub type Result<T> = std::result::Result<T, ProcessError>;
