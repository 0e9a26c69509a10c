//! forkpipe - spawn child processes over pipes and manage their lifecycle.
//!
//! Build a command with [`CommandBuilder`], spawn it, and drive the
//! resulting [`ProcessHandle`]:
//!
//! - [`ProcessHandle::wait`] drains pending output, reaps the child and
//!   caches its exit status
//! - [`ProcessHandle::flush`] discards output and closes the pipes
//! - [`ProcessHandle::is_running`] polls without blocking
//!
//! Handles are cheap to clone and safe to share between threads. Only
//! POSIX systems are supported.

pub mod command;
pub mod error;
pub mod process;

pub use command::{CommandBuilder, CommandRequest, DEFAULT_DRAIN_BUFFER_SIZE};
pub use error::{ProcessError, Result};
pub use process::{
    Endpoint, ExitStatus, ProcessHandle, ProcessOutput, State, Stream, EXEC_FAILURE_CODE,
};
