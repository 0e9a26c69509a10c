//! Test-only failure injection for `start`.
//!
//! Faults are armed per thread, so a test only affects the `start` calls it
//! makes itself.

use nix::errno::Errno;
use nix::libc::ino_t;
use nix::sys::stat::fstat;
use std::cell::{Cell, RefCell};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use super::pipe::Stream;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Fault {
    /// Creating the pipe for this stream fails with `EMFILE`.
    Pipe(Stream),
    /// `fork` fails with `EAGAIN`.
    Fork,
}

thread_local! {
    static ARMED: Cell<Option<Fault>> = const { Cell::new(None) };
    static OPENED: RefCell<Vec<(RawFd, ino_t)>> = const { RefCell::new(Vec::new()) };
}

/// Arm `fault` (or disarm with `None`) and forget previously opened pipes.
pub(crate) fn arm(fault: Option<Fault>) {
    ARMED.with(|armed| armed.set(fault));
    OPENED.with(|opened| opened.borrow_mut().clear());
}

/// Descriptors and inodes of every pipe end opened on this thread since the
/// last [`arm`].
pub(crate) fn opened() -> Vec<(RawFd, ino_t)> {
    OPENED.with(|opened| opened.borrow().clone())
}

/// Whether `fd` still refers to the pipe end it did when it was opened.
pub(crate) fn still_open(fd: RawFd, ino: ino_t) -> bool {
    fstat(fd).is_ok_and(|stat| stat.st_ino == ino)
}

pub(super) fn check(fault: Fault) -> nix::Result<()> {
    if ARMED.with(Cell::get) != Some(fault) {
        return Ok(());
    }
    match fault {
        Fault::Pipe(_) => Err(Errno::EMFILE),
        Fault::Fork => Err(Errno::EAGAIN),
    }
}

pub(super) fn record(ends: [&OwnedFd; 2]) {
    for end in ends {
        if let Ok(stat) = fstat(end.as_raw_fd()) {
            OPENED.with(|opened| opened.borrow_mut().push((end.as_raw_fd(), stat.st_ino)));
        }
    }
}
