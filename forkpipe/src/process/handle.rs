//! Shared handle on one child process.

use chrono::{DateTime, Utc};
use nix::errno::Errno;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::io::{self, Write};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::thread;
use tracing::{debug, warn};
use uuid::Uuid;

use super::output::ProcessOutput;
use super::pipe::{ChildPipes, Endpoint, Stream};
use super::spawn::{fork_exec, ExecPlan};
use super::state::{ExitStatus, Lifecycle, State};
use crate::command::CommandRequest;
use crate::error::{ProcessError, Result};

/// Handle to a child process and its three pipes.
///
/// Cloning is cheap; every clone refers to the same process and observes
/// the same state. Lifecycle calls (`start`, `wait`, `flush`, `output`,
/// `is_running`) are serialized by one lock per process, so exactly one
/// caller ever reaps the child and each pipe is closed once.
///
/// `wait` holds that lock while it blocks, so other lifecycle calls and
/// `state`/`exit_status` on any clone wait until the child has exited.
///
/// When the last clone is dropped the pipes are closed and the child is
/// reaped, on a background thread if it is still running.
///
/// # Example
///
/// ```rust,no_run
/// use std::io::Read;
/// use forkpipe::CommandBuilder;
///
/// fn main() -> anyhow::Result<()> {
///     let handle = CommandBuilder::new("echo").arg("hello").spawn()?;
///
///     let mut greeting = String::new();
///     handle.stdout().read_to_string(&mut greeting)?;
///     assert_eq!(greeting, "hello\n");
///
///     assert_eq!(handle.wait()?.code(), 0);
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    id: Uuid,
    request: CommandRequest,
    lifecycle: Mutex<Lifecycle>,
    pid: OnceLock<Pid>,
    started_at: OnceLock<DateTime<Utc>>,
    stopped_at: OnceLock<DateTime<Utc>>,
    stdin: Endpoint,
    stdout: Endpoint,
    stderr: Endpoint,
}

impl ProcessHandle {
    pub(crate) fn new(request: CommandRequest) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: Uuid::now_v7(),
                request,
                lifecycle: Mutex::new(Lifecycle::Initial),
                pid: OnceLock::new(),
                started_at: OnceLock::new(),
                stopped_at: OnceLock::new(),
                stdin: Endpoint::new(Stream::Stdin),
                stdout: Endpoint::new(Stream::Stdout),
                stderr: Endpoint::new(Stream::Stderr),
            }),
        }
    }

    /// Create the pipes, fork, and exec the requested program.
    ///
    /// Returns once the child is forked; it does not wait for the exec.
    /// If the exec fails the child exits with
    /// [`EXEC_FAILURE_CODE`](super::EXEC_FAILURE_CODE).
    ///
    /// On error nothing is left open and the handle stays `Initial`.
    pub fn start(&self) -> Result<()> {
        let inner = &*self.inner;
        let mut lifecycle = inner.lock();
        if *lifecycle != Lifecycle::Initial {
            return Err(ProcessError::AlreadyStarted(lifecycle.state()));
        }

        let spawned = ExecPlan::new(&inner.request)
            .and_then(|plan| fork_exec(&plan, ChildPipes::open()?))
            .inspect_err(|err| {
                warn!(handle = %inner.id, program = %inner.request.program, error = %err, "Failed to spawn process");
            })?;

        inner.stdin.attach(spawned.stdin);
        inner.stdout.attach(spawned.stdout);
        inner.stderr.attach(spawned.stderr);
        let _ = inner.pid.set(spawned.pid);
        let _ = inner.started_at.set(Utc::now());
        lifecycle.advance(Lifecycle::Running { pid: spawned.pid })?;

        debug!(handle = %inner.id, pid = %spawned.pid, program = %inner.request.program, "Spawned process");
        Ok(())
    }

    /// Wait for the process to exit and return its status.
    ///
    /// Output still pending in the pipes is drained first so the child can
    /// never block on a full pipe. Once the status is known, further calls
    /// return it without touching the operating system.
    pub fn wait(&self) -> Result<ExitStatus> {
        let mut lifecycle = self.inner.lock();
        match *lifecycle {
            Lifecycle::Initial => Err(ProcessError::NotStarted),
            Lifecycle::Stopped {
                exit: Some(status), ..
            } => Ok(status),
            Lifecycle::Running { .. } => {
                self.inner.drain(&mut lifecycle)?;
                self.inner.reap(&mut lifecycle)
            }
            Lifecycle::Stopped { exit: None, .. } => self.inner.reap(&mut lifecycle),
        }
    }

    /// Like [`wait`](Self::wait), but an exit with
    /// [`EXEC_FAILURE_CODE`](super::EXEC_FAILURE_CODE) is reported as
    /// [`ProcessError::ExecFailed`].
    pub fn wait_checked(&self) -> Result<ExitStatus> {
        let status = self.wait()?;
        if status.exec_failed() {
            return Err(ProcessError::ExecFailed {
                program: self.inner.request.program.clone(),
                code: status.code(),
            });
        }
        Ok(status)
    }

    /// Wait on tokio's blocking pool.
    pub async fn wait_async(&self) -> Result<ExitStatus> {
        let handle = self.clone();
        tokio::task::spawn_blocking(move || handle.wait())
            .await
            .map_err(|err| ProcessError::Io(io::Error::other(err)))?
    }

    /// Discard all remaining output and close the pipes.
    ///
    /// Closes stdin, reads stdout and stderr until both end, then moves the
    /// handle to `Stopped`. The child is not reaped here; `wait` still
    /// returns its real exit status afterwards.
    pub fn flush(&self) -> Result<()> {
        let mut lifecycle = self.inner.lock();
        match *lifecycle {
            Lifecycle::Initial => Err(ProcessError::NotStarted),
            Lifecycle::Running { .. } => self.inner.drain(&mut lifecycle),
            Lifecycle::Stopped { .. } => Ok(()),
        }
    }

    /// Read stdout and stderr to the end, then wait for the process.
    ///
    /// On a handle that is already stopped the streams are empty.
    pub fn output(&self) -> Result<ProcessOutput> {
        let mut lifecycle = self.inner.lock();
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();

        match *lifecycle {
            Lifecycle::Initial => return Err(ProcessError::NotStarted),
            Lifecycle::Running { pid } => {
                let collected = self.inner.pump(&mut stdout, &mut stderr);
                self.inner.close_pipes(&mut lifecycle, pid)?;
                collected?;
            }
            Lifecycle::Stopped { .. } => {}
        }

        let status = self.inner.reap(&mut lifecycle)?;
        Ok(ProcessOutput {
            status,
            stdout,
            stderr,
        })
    }

    /// Poll whether the process is still running, without blocking.
    ///
    /// Returns `false` unless the handle is `Running`. If the poll finds the
    /// child has exited, its status is cached and the handle moves to
    /// `Stopped`. If the child can no longer be polled at all (for example
    /// because `SIGCHLD` is ignored and it was reaped by the system), the
    /// pipes are closed and the handle moves to `Stopped` without a status.
    pub fn is_running(&self) -> bool {
        matches!(self.poll(), Poll::Running)
    }

    pub(crate) fn poll(&self) -> Poll {
        let inner = &*self.inner;
        let mut lifecycle = inner.lock();
        let Lifecycle::Running { pid } = *lifecycle else {
            return Poll::NotRunning;
        };

        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) | Err(Errno::EINTR) => Poll::Running,
            Ok(status) => match ExitStatus::from_wait(status) {
                Some(exit) => {
                    if let Err(err) = inner.settle(&mut lifecycle, pid, exit) {
                        warn!(handle = %inner.id, pid = %pid, error = %err, "Failed to record exit");
                    }
                    Poll::Reaped
                }
                None => Poll::Running,
            },
            Err(errno) => {
                warn!(handle = %inner.id, pid = %pid, error = %errno, "Failed to poll process");
                if let Err(err) = inner.close_pipes(&mut lifecycle, pid) {
                    warn!(handle = %inner.id, pid = %pid, error = %err, "Failed to stop process");
                }
                Poll::NotRunning
            }
        }
    }

    /// Close the stdin pipe early so the child sees end-of-input.
    ///
    /// Returns `true` if this call closed it.
    pub fn close_stdin(&self) -> bool {
        self.inner.stdin.close()
    }

    /// Write end of the child's stdin.
    pub fn stdin(&self) -> &Endpoint {
        &self.inner.stdin
    }

    /// Read end of the child's stdout.
    pub fn stdout(&self) -> &Endpoint {
        &self.inner.stdout
    }

    /// Read end of the child's stderr.
    pub fn stderr(&self) -> &Endpoint {
        &self.inner.stderr
    }

    /// Identifier used in log records for this handle.
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn request(&self) -> &CommandRequest {
        &self.inner.request
    }

    /// Process ID, once started.
    pub fn pid(&self) -> Option<u32> {
        self.inner
            .pid
            .get()
            .and_then(|pid| u32::try_from(pid.as_raw()).ok())
    }

    pub fn state(&self) -> State {
        self.inner.lock().state()
    }

    /// Cached exit status, once the child has been reaped.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.inner.lock().exit()
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.inner.started_at.get().copied()
    }

    /// When the pipes were closed.
    pub fn stopped_at(&self) -> Option<DateTime<Utc>> {
        self.inner.stopped_at.get().copied()
    }
}

/// Outcome of one non-blocking poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Poll {
    Running,
    /// This poll reaped the child.
    Reaped,
    /// Not started, already stopped, or no longer pollable.
    NotRunning,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Discard output until both streams end, then close the pipes.
    fn drain(&self, lifecycle: &mut Lifecycle) -> Result<()> {
        let Lifecycle::Running { pid } = *lifecycle else {
            return Ok(());
        };

        if let Err(err) = self.pump(&mut io::sink(), &mut io::sink()) {
            warn!(handle = %self.id, pid = %pid, error = %err, "Failed to drain process output");
        }
        self.close_pipes(lifecycle, pid)?;

        debug!(handle = %self.id, pid = %pid, "Drained process output");
        Ok(())
    }

    /// Close stdin and copy stdout and stderr into the sinks until both end.
    ///
    /// The streams are read concurrently; reading one to the end first
    /// would deadlock against a child blocked writing the other.
    fn pump<O, E>(&self, out: &mut O, err: &mut E) -> io::Result<()>
    where
        O: Write + Send,
        E: Write + Send,
    {
        let buffer_size = self.request.drain_buffer_size;

        thread::scope(|scope| {
            let stdout = scope.spawn(move || self.stdout.drain(buffer_size, out));
            let stderr = scope.spawn(move || self.stderr.drain(buffer_size, err));
            self.stdin.close();

            let stdout = stdout
                .join()
                .unwrap_or_else(|_| Err(io::Error::other("stdout reader panicked")));
            let stderr = stderr
                .join()
                .unwrap_or_else(|_| Err(io::Error::other("stderr reader panicked")));
            stdout.and(stderr).map(|_| ())
        })
    }

    fn close_endpoints(&self) {
        self.stdin.close();
        self.stdout.close();
        self.stderr.close();
    }

    /// Close the pipes without reaping.
    fn close_pipes(&self, lifecycle: &mut Lifecycle, pid: Pid) -> Result<()> {
        self.close_endpoints();
        lifecycle.advance(Lifecycle::Stopped { pid, exit: None })?;
        let _ = self.stopped_at.set(Utc::now());
        Ok(())
    }

    /// Block until the child exits and record its status.
    fn reap(&self, lifecycle: &mut Lifecycle) -> Result<ExitStatus> {
        let pid = match *lifecycle {
            Lifecycle::Initial => return Err(ProcessError::NotStarted),
            Lifecycle::Stopped {
                exit: Some(status), ..
            } => return Ok(status),
            Lifecycle::Running { pid } | Lifecycle::Stopped { pid, exit: None } => pid,
        };

        let exit = wait_blocking(pid).map_err(|source| ProcessError::WaitFailed {
            pid: pid.as_raw(),
            source,
        })?;
        self.settle(lifecycle, pid, exit)?;
        Ok(exit)
    }

    /// Terminal cleanup shared by every path that learns the exit status.
    fn settle(&self, lifecycle: &mut Lifecycle, pid: Pid, exit: ExitStatus) -> Result<()> {
        self.close_endpoints();
        lifecycle.advance(Lifecycle::Stopped {
            pid,
            exit: Some(exit),
        })?;
        let _ = self.stopped_at.set(Utc::now());

        debug!(handle = %self.id, pid = %pid, code = exit.code(), "Reaped process");
        Ok(())
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let lifecycle = *self
            .lifecycle
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        let pid = match lifecycle {
            Lifecycle::Running { pid } | Lifecycle::Stopped { pid, exit: None } => pid,
            _ => return,
        };

        self.close_endpoints();
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => {
                debug!(handle = %self.id, pid = %pid, "Handing unreaped process to reaper thread");
                let reaper = thread::Builder::new()
                    .name("forkpipe-reaper".to_string())
                    .spawn(move || wait_blocking(pid));
                if let Err(err) = reaper {
                    warn!(handle = %self.id, pid = %pid, error = %err, "Failed to start reaper thread");
                }
            }
            Ok(_) => debug!(handle = %self.id, pid = %pid, "Reaped process on drop"),
            Err(errno) => {
                warn!(handle = %self.id, pid = %pid, error = %errno, "Failed to reap process on drop");
            }
        }
    }
}

fn wait_blocking(pid: Pid) -> nix::Result<ExitStatus> {
    loop {
        match waitpid(pid, None) {
            Ok(status) => {
                if let Some(exit) = ExitStatus::from_wait(status) {
                    return Ok(exit);
                }
            }
            Err(Errno::EINTR) => {}
            Err(errno) => return Err(errno),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::fault::{self, Fault};
    use crate::CommandBuilder;
    use std::io::Read;
    use std::time::{Duration, Instant};

    fn init_tracing() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    }

    fn sh(script: &str) -> ProcessHandle {
        init_tracing();
        CommandBuilder::new("sh")
            .arg("-c")
            .arg(script)
            .spawn()
            .unwrap()
    }

    fn poll_until_stopped(handle: &ProcessHandle) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while handle.is_running() {
            assert!(Instant::now() < deadline, "process did not exit");
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_echo_hello() {
        init_tracing();
        let handle = CommandBuilder::new("echo").arg("hello").spawn().unwrap();
        assert_eq!(handle.state(), State::Running);
        assert!(handle.pid().is_some());

        let mut stdout = Vec::new();
        handle.stdout().read_to_end(&mut stdout).unwrap();
        assert_eq!(stdout, b"hello\n");

        assert_eq!(handle.wait().unwrap(), ExitStatus::Exited { code: 0 });
        assert_eq!(handle.state(), State::Stopped);
    }

    #[test]
    fn test_exit_code_is_reported() {
        for code in [0, 1, 42, 255] {
            let handle = sh(&format!("exit {code}"));
            assert_eq!(handle.wait().unwrap().code(), code);
        }
    }

    #[test]
    fn test_wait_is_idempotent() {
        let handle = sh("exit 9");

        let first = handle.wait().unwrap();
        let second = handle.wait().unwrap();
        assert_eq!(first, second);
        assert_eq!(handle.exit_status(), Some(first));
        assert!(!handle.is_running());
    }

    #[test]
    fn test_flush_then_wait() {
        let script = "echo out; echo err >&2; exit 3";
        let expected = sh(script).wait().unwrap();

        let handle = sh(script);
        handle.flush().unwrap();
        assert_eq!(handle.state(), State::Stopped);
        assert!(handle.stdout().is_closed());
        assert!(handle.stderr().is_closed());
        assert!(handle.stdin().is_closed());
        assert!(!handle.is_running());

        // Flushing a stopped handle is a no-op.
        handle.flush().unwrap();

        assert_eq!(handle.wait().unwrap(), expected);
        assert_eq!(handle.exit_status(), Some(ExitStatus::Exited { code: 3 }));
    }

    #[test]
    fn test_lifecycle_calls_before_start() {
        let handle = CommandBuilder::new("true").into_request().prepare();

        assert!(matches!(handle.wait(), Err(ProcessError::NotStarted)));
        assert!(matches!(handle.flush(), Err(ProcessError::NotStarted)));
        assert!(matches!(handle.output(), Err(ProcessError::NotStarted)));
        assert!(!handle.is_running());
        assert_eq!(handle.state(), State::Initial);
        assert_eq!(handle.pid(), None);
        assert_eq!(handle.started_at(), None);
        assert!(handle.stdout().is_closed());

        handle.start().unwrap();
        assert_eq!(handle.wait().unwrap().code(), 0);
    }

    #[test]
    fn test_start_twice() {
        let handle = sh("exit 0");

        assert!(matches!(
            handle.start(),
            Err(ProcessError::AlreadyStarted(State::Running))
        ));
        handle.wait().unwrap();
        assert!(matches!(
            handle.start(),
            Err(ProcessError::AlreadyStarted(State::Stopped))
        ));
    }

    #[test]
    fn test_failed_start_leaves_handle_initial() {
        let handle = CommandBuilder::new("echo").arg("nul\0byte").into_request().prepare();

        assert!(matches!(
            handle.start(),
            Err(ProcessError::InvalidCommand(_))
        ));
        assert_eq!(handle.state(), State::Initial);
        assert_eq!(handle.pid(), None);
        assert!(handle.stdin().is_closed());
    }

    /// Start a fresh handle with `injected` armed and return the error,
    /// after checking nothing was left open and a retry succeeds.
    fn start_with_fault(injected: Fault, pipes_opened: usize) -> ProcessError {
        init_tracing();
        let handle = CommandBuilder::new("true").into_request().prepare();

        fault::arm(Some(injected));
        let err = handle.start().unwrap_err();
        let opened = fault::opened();
        fault::arm(None);

        assert_eq!(opened.len(), pipes_opened);
        for (fd, ino) in opened {
            assert!(!fault::still_open(fd, ino), "descriptor {fd} leaked");
        }
        assert_eq!(handle.state(), State::Initial);
        assert_eq!(handle.pid(), None);
        assert_eq!(handle.started_at(), None);
        assert!(handle.stdin().is_closed());
        assert!(handle.stdout().is_closed());

        handle.start().unwrap();
        assert_eq!(handle.wait().unwrap().code(), 0);
        err
    }

    #[test]
    fn test_pipe_failure_rolls_back() {
        let err = start_with_fault(Fault::Pipe(Stream::Stdout), 2);
        assert!(matches!(
            err,
            ProcessError::ResourceExhausted {
                stream: "stdout",
                source: Errno::EMFILE
            }
        ));

        let err = start_with_fault(Fault::Pipe(Stream::Stderr), 4);
        assert!(matches!(
            err,
            ProcessError::ResourceExhausted {
                stream: "stderr",
                ..
            }
        ));
    }

    #[test]
    fn test_fork_failure_rolls_back() {
        let err = start_with_fault(Fault::Fork, 6);
        assert!(matches!(
            err,
            ProcessError::SpawnFailed {
                source: Errno::EAGAIN,
                ..
            }
        ));
        assert!(err.to_string().starts_with("Failed to spawn process true: "));
    }

    #[test]
    fn test_nonexistent_program() {
        init_tracing();
        let handle = CommandBuilder::new("forkpipe-no-such-program")
            .spawn()
            .unwrap();

        let mut stderr = String::new();
        handle.stderr().read_to_string(&mut stderr).unwrap();
        assert!(stderr.starts_with("forkpipe: forkpipe-no-such-program: exec failed: "));

        let status = handle.wait().unwrap();
        assert_eq!(status.code(), crate::EXEC_FAILURE_CODE);
        assert!(status.exec_failed());

        let err = handle.wait_checked().unwrap_err();
        assert_eq!(
            err.to_string(),
            "Failed to execute forkpipe-no-such-program (exit status 127)"
        );
        assert_eq!(sh("exit 0").wait_checked().unwrap().code(), 0);
    }

    #[test]
    fn test_non_executable_file() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("script.sh");
        std::fs::write(&script, "#!/bin/sh\nexit 0\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o644)).unwrap();

        let handle = CommandBuilder::new(script.to_str().unwrap()).spawn().unwrap();
        assert!(handle.wait().unwrap().exec_failed());
    }

    #[test]
    fn test_large_unread_output_does_not_deadlock() {
        let handle = sh("head -c 200000 /dev/zero; head -c 200000 /dev/zero >&2");
        assert_eq!(handle.wait().unwrap().code(), 0);
    }

    #[test]
    fn test_large_stderr_with_tiny_buffer() {
        init_tracing();
        let handle = CommandBuilder::new("sh")
            .arg("-c")
            .arg("head -c 100000 /dev/zero >&2; echo done")
            .drain_buffer_size(1)
            .spawn()
            .unwrap();
        assert_eq!(handle.wait().unwrap().code(), 0);
    }

    #[test]
    fn test_wait_closes_stdin() {
        init_tracing();
        let handle = CommandBuilder::new("cat").spawn().unwrap();
        assert_eq!(handle.wait().unwrap().code(), 0);
    }

    #[test]
    fn test_stdin_round_trip() {
        init_tracing();
        let handle = CommandBuilder::new("cat").spawn().unwrap();

        handle.stdin().write_all(b"ping\n").unwrap();
        assert!(handle.close_stdin());
        assert!(!handle.close_stdin());

        let mut echoed = String::new();
        handle.stdout().read_to_string(&mut echoed).unwrap();
        assert_eq!(echoed, "ping\n");
        assert_eq!(handle.wait().unwrap().code(), 0);
    }

    #[test]
    fn test_is_running_reaps_exited_child() {
        let handle = sh("exit 5");
        poll_until_stopped(&handle);

        assert_eq!(handle.state(), State::Stopped);
        assert_eq!(handle.exit_status(), Some(ExitStatus::Exited { code: 5 }));
        assert!(handle.stdout().is_closed());
        assert_eq!(handle.wait().unwrap().code(), 5);
    }

    #[test]
    fn test_concurrent_polls() {
        let handle = sh("sleep 0.2");

        let pollers: Vec<_> = (0..8)
            .map(|_| {
                let handle = handle.clone();
                thread::spawn(move || {
                    let deadline = Instant::now() + Duration::from_secs(10);
                    loop {
                        match handle.poll() {
                            Poll::Running => {
                                assert!(Instant::now() < deadline, "process did not exit");
                                thread::sleep(Duration::from_millis(5));
                            }
                            Poll::Reaped => return 1,
                            Poll::NotRunning => return 0,
                        }
                    }
                })
            })
            .collect();
        let reaped: usize = pollers.into_iter().map(|p| p.join().unwrap()).sum();

        assert_eq!(reaped, 1);
        assert_eq!(handle.state(), State::Stopped);
        assert_eq!(handle.exit_status(), Some(ExitStatus::Exited { code: 0 }));
        for _ in 0..3 {
            assert!(!handle.is_running());
        }
    }

    #[test]
    fn test_poll_does_not_wait_for_blocked_reader() {
        // The background sleep keeps stdout open after the shell exits.
        let handle = sh("sleep 2 &");
        let reader = handle.clone();
        let reading = thread::spawn(move || {
            let mut stdout = Vec::new();
            reader.stdout().read_to_end(&mut stdout).map(|_| stdout)
        });
        thread::sleep(Duration::from_millis(300));

        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let polled = Instant::now();
            let running = handle.is_running();
            assert!(polled.elapsed() < Duration::from_millis(500));
            if !running {
                break;
            }
            assert!(Instant::now() < deadline, "process did not exit");
            thread::sleep(Duration::from_millis(10));
        }

        assert_eq!(handle.state(), State::Stopped);
        assert_eq!(handle.exit_status(), Some(ExitStatus::Exited { code: 0 }));
        assert!(handle.stdout().is_closed());
        assert!(reading.join().unwrap().unwrap().is_empty());
    }

    #[test]
    fn test_poll_after_child_was_reaped_elsewhere() {
        let handle = sh("exit 4");
        let pid = Pid::from_raw(i32::try_from(handle.pid().unwrap()).unwrap());
        waitpid(pid, None).unwrap();

        assert!(!handle.is_running());
        assert_eq!(handle.state(), State::Stopped);
        assert_eq!(handle.exit_status(), None);
        assert!(handle.stdout().is_closed());
        assert!(handle.stopped_at().is_some());
        assert!(matches!(
            handle.wait(),
            Err(ProcessError::WaitFailed { .. })
        ));
    }

    #[test]
    fn test_wait_and_poll_on_clones() {
        let handle = sh("echo busy; sleep 0.2; exit 6");
        let waiter = handle.clone();

        let waiting = thread::spawn(move || {
            let status = waiter.wait().unwrap();
            (status, waiter.state())
        });
        poll_until_stopped(&handle);

        let (status, waiter_state) = waiting.join().unwrap();
        assert_eq!(status.code(), 6);
        assert_eq!(waiter_state, State::Stopped);
        assert_eq!(handle.state(), State::Stopped);
        assert_eq!(handle.exit_status(), Some(status));
        assert!(handle.stdout().is_closed());
    }

    #[test]
    fn test_signal_exit() {
        let handle = sh("kill -9 $$");

        let status = handle.wait().unwrap();
        assert_eq!(status, ExitStatus::Signaled { signal: 9 });
        assert_eq!(status.code(), 137);
    }

    #[test]
    fn test_output_after_stop_is_empty() {
        let handle = sh("echo gone; exit 2");
        handle.flush().unwrap();

        let output = handle.output().unwrap();
        assert_eq!(output.code(), 2);
        assert!(output.stdout.is_empty());
        assert!(output.stderr.is_empty());
    }

    #[test]
    fn test_current_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "marker").unwrap();

        let output = CommandBuilder::new("cat")
            .arg("marker.txt")
            .current_dir(dir.path())
            .output()
            .unwrap();
        assert!(output.success());
        assert_eq!(output.stdout_string(), "marker");
    }

    #[test]
    fn test_missing_current_dir() {
        let dir = tempfile::tempdir().unwrap();

        let output = CommandBuilder::new("true")
            .current_dir(dir.path().join("missing"))
            .output()
            .unwrap();
        assert!(output.status.exec_failed());
        assert!(output.stderr_string().contains("chdir failed"));
    }

    #[test]
    fn test_drop_does_not_block() {
        let handle = sh("sleep 5");
        let started = Instant::now();
        drop(handle);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_timestamps_and_ids() {
        let first = sh("exit 0");
        let second = sh("exit 0");
        assert_ne!(first.id(), second.id());

        let started = first.started_at().unwrap();
        assert_eq!(first.stopped_at(), None);
        first.wait().unwrap();
        assert!(first.stopped_at().unwrap() >= started);
        second.wait().unwrap();
    }

    #[tokio::test]
    async fn test_wait_async() {
        let handle = sh("exit 7");
        assert_eq!(handle.wait_async().await.unwrap().code(), 7);
        assert_eq!(handle.state(), State::Stopped);
    }
}
