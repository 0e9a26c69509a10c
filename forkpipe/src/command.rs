//! Command line construction.
//!
//! A [`CommandBuilder`] accumulates a program name and its arguments and
//! produces an immutable [`CommandRequest`]. Builders are plain values:
//! cloning one and appending to the clone never affects the original, so a
//! common prefix can be reused for many spawns.

use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::path::PathBuf;

use crate::error::Result;
use crate::process::{ProcessHandle, ProcessOutput};

/// Scratch buffer size used when draining the child's output.
pub const DEFAULT_DRAIN_BUFFER_SIZE: usize = 4096;

const fn default_drain_buffer_size() -> usize {
    DEFAULT_DRAIN_BUFFER_SIZE
}

/// Everything needed to spawn one child process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRequest {
    /// The program to execute, resolved through `PATH`.
    pub program: String,

    /// Arguments passed as `argv[1..]`, in order.
    #[serde(default)]
    pub args: Vec<String>,

    /// Directory the child changes into before exec.
    #[serde(default)]
    pub current_dir: Option<PathBuf>,

    /// Buffer size for discarding output during a drain.
    #[serde(default = "default_drain_buffer_size")]
    pub drain_buffer_size: usize,
}

impl CommandRequest {
    /// Create a request for `program` with no arguments.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            current_dir: None,
            drain_buffer_size: DEFAULT_DRAIN_BUFFER_SIZE,
        }
    }

    /// Create an unstarted handle for this request.
    ///
    /// Nothing touches the operating system until
    /// [`ProcessHandle::start`] is called.
    pub fn prepare(self) -> ProcessHandle {
        ProcessHandle::new(self)
    }

    /// Create a handle and start it.
    pub fn spawn(self) -> Result<ProcessHandle> {
        let handle = self.prepare();
        handle.start()?;
        Ok(handle)
    }
}

/// Builder for [`CommandRequest`]s.
///
/// # Example
///
/// ```rust,no_run
/// use forkpipe::CommandBuilder;
///
/// fn main() -> anyhow::Result<()> {
///     let output = CommandBuilder::new("seq").arg(1).arg(3).output()?;
///     assert_eq!(output.stdout_string(), "1\n2\n3\n");
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    request: CommandRequest,
}

impl CommandBuilder {
    /// Start a command for the given program.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            request: CommandRequest::new(program),
        }
    }

    /// Add an argument. Numbers and other `Display` values are appended in
    /// their textual form.
    #[must_use]
    pub fn arg(mut self, arg: impl Display) -> Self {
        self.request.args.push(arg.to_string());
        self
    }

    /// Add multiple arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Display,
    {
        self.request
            .args
            .extend(args.into_iter().map(|arg| arg.to_string()));
        self
    }

    /// Set the child's working directory.
    #[must_use]
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.request.current_dir = Some(dir.into());
        self
    }

    /// Set the scratch buffer size used while draining output.
    #[must_use]
    pub fn drain_buffer_size(mut self, size: usize) -> Self {
        self.request.drain_buffer_size = size.max(1);
        self
    }

    /// The request accumulated so far.
    pub const fn request(&self) -> &CommandRequest {
        &self.request
    }

    /// Consume the builder, returning its request.
    pub fn into_request(self) -> CommandRequest {
        self.request
    }

    /// Spawn the command. The builder is left untouched and can spawn again.
    pub fn spawn(&self) -> Result<ProcessHandle> {
        self.request.clone().spawn()
    }

    /// Spawn the command and collect all of its output.
    pub fn output(&self) -> Result<ProcessOutput> {
        self.spawn()?.output()
    }
}
