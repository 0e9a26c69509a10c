//! Pipe endpoints wired to the child's standard streams.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard};

use crate::error::{ProcessError, Result};

/// One of the child's standard streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdin,
    Stdout,
    Stderr,
}

impl Stream {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stdin => "stdin",
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

impl std::fmt::Display for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Parent-side end of one pipe.
///
/// The endpoint gives up its descriptor exactly once, either through the
/// handle's lifecycle or when it is dropped. Reads and writes go through
/// `&Endpoint`, so several threads can use the same endpoint. The lock is
/// only held to pick up the descriptor: a close never waits for an
/// in-flight read or write, and the descriptor itself is released when the
/// last of them returns.
///
/// Using an endpoint after it was closed yields an
/// [`io::ErrorKind::BrokenPipe`] error rather than touching a stale
/// descriptor.
#[derive(Debug)]
pub struct Endpoint {
    stream: Stream,
    file: RwLock<Option<Arc<File>>>,
}

impl Endpoint {
    pub(crate) const fn new(stream: Stream) -> Self {
        Self {
            stream,
            file: RwLock::new(None),
        }
    }

    /// Which stream this endpoint belongs to.
    pub const fn stream(&self) -> Stream {
        self.stream
    }

    /// The raw descriptor while the endpoint is open.
    pub fn as_raw_fd(&self) -> Option<RawFd> {
        self.read_guard().as_deref().map(AsRawFd::as_raw_fd)
    }

    /// Whether the endpoint has no open descriptor.
    pub fn is_closed(&self) -> bool {
        self.read_guard().is_none()
    }

    pub(crate) fn attach(&self, fd: OwnedFd) {
        *self.file.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(File::from(fd)));
    }

    /// Close the endpoint. Returns `true` if this call closed it.
    ///
    /// Never blocks: an operation already in flight keeps its own reference
    /// to the descriptor until it returns.
    pub(crate) fn close(&self) -> bool {
        self.file
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some()
    }

    /// Read until end-of-stream, copying everything into `sink`.
    ///
    /// A closed endpoint counts as already drained.
    pub(crate) fn drain(&self, buffer_size: usize, sink: &mut impl Write) -> io::Result<u64> {
        let Some(file) = self.current() else {
            return Ok(0);
        };
        let mut file = &*file;

        let mut buffer = vec![0; buffer_size.max(1)];
        let mut total = 0;
        loop {
            match file.read(&mut buffer) {
                Ok(0) => return Ok(total),
                Ok(n) => {
                    sink.write_all(&buffer[..n])?;
                    total += n as u64;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }

    fn read_guard(&self) -> RwLockReadGuard<'_, Option<Arc<File>>> {
        self.file.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn current(&self) -> Option<Arc<File>> {
        self.read_guard().clone()
    }

    fn with_file<T>(&self, op: impl FnOnce(&File) -> io::Result<T>) -> io::Result<T> {
        match self.current() {
            Some(file) => op(&file),
            None => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                format!("{} pipe is closed", self.stream),
            )),
        }
    }
}

impl Read for &Endpoint {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.with_file(|mut file| file.read(buf))
    }
}

impl Write for &Endpoint {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.with_file(|mut file| file.write(buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        self.with_file(|mut file| file.flush())
    }
}

/// Both ends of a freshly created pipe.
#[derive(Debug)]
pub(crate) struct PipePair {
    pub(crate) read: OwnedFd,
    pub(crate) write: OwnedFd,
}

impl PipePair {
    /// Create a close-on-exec pipe, so children forked concurrently by
    /// other threads never inherit it.
    pub(crate) fn open(stream: Stream) -> Result<Self> {
        let to_error = |source| ProcessError::from_pipe(stream.as_str(), source);

        #[cfg(test)]
        super::fault::check(super::fault::Fault::Pipe(stream)).map_err(to_error)?;

        let (read, write) = cloexec_pipe().map_err(to_error)?;

        #[cfg(test)]
        super::fault::record([&read, &write]);

        Ok(Self { read, write })
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn cloexec_pipe() -> nix::Result<(OwnedFd, OwnedFd)> {
    nix::unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC)
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn cloexec_pipe() -> nix::Result<(OwnedFd, OwnedFd)> {
    use nix::fcntl::{fcntl, FcntlArg, FdFlag};

    let (read, write) = nix::unistd::pipe()?;
    fcntl(read.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
    fcntl(write.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
    Ok((read, write))
}

/// The three pipes for one child. Dropping this closes every descriptor,
/// which is how a failed spawn rolls back.
#[derive(Debug)]
pub(crate) struct ChildPipes {
    pub(crate) stdin: PipePair,
    pub(crate) stdout: PipePair,
    pub(crate) stderr: PipePair,
}

impl ChildPipes {
    pub(crate) fn open() -> Result<Self> {
        Ok(Self {
            stdin: PipePair::open(Stream::Stdin)?,
            stdout: PipePair::open(Stream::Stdout)?,
            stderr: PipePair::open(Stream::Stderr)?,
        })
    }
}
