//! The fork/exec step.
//!
//! Everything the child needs (argv and its pointer array, working
//! directory, the diagnostic prefix) is built before forking. Between
//! `fork` and `exec` the child makes no allocation and never returns into
//! the caller's code.

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg};
use nix::libc::c_char;
use nix::unistd::{chdir, close, dup2, fork, ForkResult, Pid};
use std::ffi::CString;
use std::os::fd::{IntoRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;

use super::pipe::ChildPipes;
use super::state::EXEC_FAILURE_CODE;
use crate::command::CommandRequest;
use crate::error::{ProcessError, Result};

/// A request converted into C strings, ready to exec.
#[derive(Debug)]
pub(crate) struct ExecPlan {
    argv: Vec<CString>,
    /// Null-terminated pointers into `argv`, as `execvp` takes them.
    argv_ptrs: Vec<*const c_char>,
    dir: Option<CString>,
    diagnostic_prefix: Vec<u8>,
}

impl ExecPlan {
    pub(crate) fn new(request: &CommandRequest) -> Result<Self> {
        if request.program.is_empty() {
            return Err(ProcessError::InvalidCommand(
                "program name is empty".to_string(),
            ));
        }

        let argv = std::iter::once(request.program.as_str())
            .chain(request.args.iter().map(String::as_str))
            .map(|arg| {
                CString::new(arg).map_err(|_| {
                    ProcessError::InvalidCommand(format!("argument contains a NUL byte: {arg:?}"))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let dir = request
            .current_dir
            .as_ref()
            .map(|dir| {
                CString::new(dir.as_os_str().as_bytes()).map_err(|_| {
                    ProcessError::InvalidCommand(format!(
                        "working directory contains a NUL byte: {}",
                        dir.display()
                    ))
                })
            })
            .transpose()?;

        let argv_ptrs = argv
            .iter()
            .map(|arg| arg.as_ptr())
            .chain(std::iter::once(std::ptr::null()))
            .collect();

        Ok(Self {
            argv,
            argv_ptrs,
            dir,
            diagnostic_prefix: format!("forkpipe: {}: ", request.program).into_bytes(),
        })
    }

    fn program(&self) -> &str {
        self.argv[0].to_str().unwrap_or("<program>")
    }
}

/// Parent-side result of a successful fork.
#[derive(Debug)]
pub(crate) struct Spawned {
    pub(crate) pid: Pid,
    pub(crate) stdin: OwnedFd,
    pub(crate) stdout: OwnedFd,
    pub(crate) stderr: OwnedFd,
}

/// Fork and exec `plan` with its standard streams wired to `pipes`.
///
/// On failure every descriptor in `pipes` is closed when it drops.
pub(crate) fn fork_exec(plan: &ExecPlan, pipes: ChildPipes) -> Result<Spawned> {
    let ChildPipes {
        stdin,
        stdout,
        stderr,
    } = pipes;

    match fork_child() {
        Err(source) => Err(ProcessError::SpawnFailed {
            program: plan.program().to_string(),
            source,
        }),
        Ok(ForkResult::Parent { child }) => {
            drop(stdin.read);
            drop(stdout.write);
            drop(stderr.write);
            Ok(Spawned {
                pid: child,
                stdin: stdin.write,
                stdout: stdout.read,
                stderr: stderr.read,
            })
        }
        Ok(ForkResult::Child) => {
            drop(stdin.write);
            drop(stdout.read);
            drop(stderr.read);
            exec_child(plan, [stdin.read, stdout.write, stderr.write])
        }
    }
}

#[allow(unsafe_code)]
fn fork_child() -> nix::Result<ForkResult> {
    #[cfg(test)]
    super::fault::check(super::fault::Fault::Fork)?;

    // SAFETY: the child only makes raw system calls on data prepared before
    // the fork, without allocating or taking locks, and ends in either a
    // successful exec or `_exit`.
    unsafe { fork() }
}

/// Child side: redirect descriptors 0, 1 and 2, then exec.
#[allow(unsafe_code)]
fn exec_child(plan: &ExecPlan, ends: [OwnedFd; 3]) -> ! {
    let mut fds: [RawFd; 3] = ends.map(IntoRawFd::into_raw_fd);

    // A pipe end sitting on 0-2 would be clobbered by an earlier dup2.
    for fd in &mut fds {
        if *fd < 3 {
            match fcntl(*fd, FcntlArg::F_DUPFD_CLOEXEC(3)) {
                Ok(lifted) => *fd = lifted,
                Err(errno) => child_abort(plan, b"redirect", errno),
            }
        }
    }

    for (fd, target) in fds.into_iter().zip([0, 1, 2]) {
        if let Err(errno) = dup2(fd, target) {
            child_abort(plan, b"redirect", errno);
        }
    }
    for fd in fds {
        let _ = close(fd);
    }

    if let Some(dir) = &plan.dir {
        if let Err(errno) = chdir(dir.as_c_str()) {
            child_abort(plan, b"chdir", errno);
        }
    }

    // SAFETY: `argv_ptrs` points into `argv`, which outlives the call, and
    // ends with a null pointer. `execvp` only returns on failure.
    unsafe {
        nix::libc::execvp(plan.argv[0].as_ptr(), plan.argv_ptrs.as_ptr());
    }
    child_abort(plan, b"exec", Errno::last())
}

/// Report a setup failure on the (redirected) stderr and exit.
#[allow(unsafe_code)]
fn child_abort(plan: &ExecPlan, stage: &[u8], errno: Errno) -> ! {
    let parts: [&[u8]; 5] = [
        &plan.diagnostic_prefix,
        stage,
        b" failed: ",
        errno.desc().as_bytes(),
        b"\n",
    ];

    // SAFETY: plain writes of live buffers to descriptor 2, then `_exit`,
    // which skips the parent's atexit handlers and stdio buffers.
    unsafe {
        for part in parts {
            let _ = nix::libc::write(2, part.as_ptr().cast(), part.len());
        }
        nix::libc::_exit(EXEC_FAILURE_CODE)
    }
}
