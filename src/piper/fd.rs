//! EINTR-safe pipe descriptor with bounded readiness polling.

use std::io::{self, Read, Write};
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use nix::poll::{PollFd, PollFlags, PollTimeout, poll};

use crate::error::{Error, Result};

/// A file descriptor wrapper that implements Read/Write with EINTR handling.
pub struct PipeFd {
    fd: OwnedFd,
}

impl PipeFd {
    /// Create from an owned file descriptor.
    pub fn new(fd: OwnedFd) -> Self {
        Self { fd }
    }

    /// Create from a raw file descriptor (takes ownership).
    ///
    /// # Safety
    /// The caller must ensure `fd` is a valid file descriptor that can be owned.
    pub unsafe fn from_raw(fd: RawFd) -> Self {
        Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        }
    }

    /// Bounded wait until one non-blocking read would succeed.
    ///
    /// `None` waits without bound. Returns `Err(Error::Interrupted)` when a
    /// signal cuts the wait short, so callers can check their signal flags.
    pub fn poll_readable(&self, timeout: Option<Duration>) -> Result<bool> {
        self.poll_ready(PollFlags::POLLIN, timeout)
    }

    /// Bounded wait until one non-blocking write would succeed.
    pub fn poll_writable(&self, timeout: Option<Duration>) -> Result<bool> {
        self.poll_ready(PollFlags::POLLOUT, timeout)
    }

    fn poll_ready(&self, flags: PollFlags, timeout: Option<Duration>) -> Result<bool> {
        let mut fds = [PollFd::new(self.fd.as_fd(), flags)];
        match poll(&mut fds, poll_timeout(timeout)) {
            Ok(0) => Ok(false),
            // POLLHUP/POLLERR also count as ready: the following read observes
            // EOF and the following write observes EPIPE, which the caller
            // maps to its closed-descriptor sentinel.
            Ok(_) => Ok(fds[0].revents().is_some_and(|r| !r.is_empty())),
            Err(nix::errno::Errno::EINTR) => Err(Error::Interrupted),
            Err(e) => Err(e.into()),
        }
    }
}

/// Convert an optional duration into a poll(2) timeout argument.
fn poll_timeout(timeout: Option<Duration>) -> PollTimeout {
    match timeout {
        None => PollTimeout::NONE,
        Some(d) => {
            let millis = d.as_millis().min(i32::MAX as u128) as i32;
            PollTimeout::try_from(millis).unwrap_or(PollTimeout::MAX)
        }
    }
}

impl AsFd for PipeFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl AsRawFd for PipeFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl Read for PipeFd {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match nix::unistd::read(self.fd.as_raw_fd(), buf) {
                Ok(n) => return Ok(n),
                Err(nix::errno::Errno::EINTR) => continue, // Retry on interrupt
                Err(e) => return Err(io::Error::from_raw_os_error(e as i32)),
            }
        }
    }
}

impl Write for PipeFd {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        loop {
            match nix::unistd::write(&self.fd, buf) {
                Ok(n) => return Ok(n),
                Err(nix::errno::Errno::EINTR) => continue, // Retry on interrupt
                Err(e) => return Err(io::Error::from_raw_os_error(e as i32)),
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(()) // Pipes don't need flushing at the fd level
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_pipe() -> (PipeFd, PipeFd) {
        let (read_fd, write_fd) = nix::unistd::pipe().expect("Failed to create pipe");
        (PipeFd::new(read_fd), PipeFd::new(write_fd))
    }

    #[test]
    fn test_read_write_roundtrip() {
        let (mut r, mut w) = create_pipe();
        w.write_all(b"hello").unwrap();
        drop(w);

        let mut buf = Vec::new();
        r.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"hello");
    }

    #[test]
    fn test_poll_readable_times_out_when_empty() {
        let (r, _w) = create_pipe();
        let ready = r.poll_readable(Some(Duration::from_millis(20))).unwrap();
        assert!(!ready);
    }

    #[test]
    fn test_poll_readable_sees_pending_data() {
        let (r, mut w) = create_pipe();
        w.write_all(b"x").unwrap();
        let ready = r.poll_readable(Some(Duration::from_millis(100))).unwrap();
        assert!(ready);
    }

    #[test]
    fn test_poll_readable_sees_hangup() {
        let (r, w) = create_pipe();
        drop(w);
        // Closed write end: POLLHUP counts as ready so the read observes EOF.
        let ready = r.poll_readable(Some(Duration::from_millis(100))).unwrap();
        assert!(ready);
    }

    #[test]
    fn test_poll_writable_on_fresh_pipe() {
        let (_r, w) = create_pipe();
        let ready = w.poll_writable(Some(Duration::from_millis(100))).unwrap();
        assert!(ready);
    }
}
