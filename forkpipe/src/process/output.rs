//! Collected output of a finished process.

use super::state::ExitStatus;

/// Result from a completed process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    /// Exit status of the process.
    pub status: ExitStatus,

    /// Everything the process wrote to stdout.
    pub stdout: Vec<u8>,

    /// Everything the process wrote to stderr.
    pub stderr: Vec<u8>,
}

impl ProcessOutput {
    /// Check if the process exited successfully.
    pub const fn success(&self) -> bool {
        self.status.success()
    }

    /// Get the exit code.
    pub const fn code(&self) -> i32 {
        self.status.code()
    }

    /// Get stdout as a string, replacing invalid UTF-8.
    pub fn stdout_string(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Get stderr as a string, replacing invalid UTF-8.
    pub fn stderr_string(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}
