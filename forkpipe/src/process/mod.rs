//! Child processes with piped standard streams.
//!
//! A [`ProcessHandle`] owns one forked child and the parent-side ends of
//! three pipes wired to its stdin, stdout and stderr. The handle moves
//! through [`State::Initial`], [`State::Running`] and [`State::Stopped`]
//! exactly once, whichever clone or thread drives it.

#[cfg(test)]
mod fault;
mod handle;
mod output;
mod pipe;
mod spawn;
mod state;

pub use handle::ProcessHandle;
pub use output::ProcessOutput;
pub use pipe::{Endpoint, Stream};
pub use state::{ExitStatus, State, EXEC_FAILURE_CODE};
