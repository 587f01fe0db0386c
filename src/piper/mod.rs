//! Bidirectional, framed, timeout-aware IPC channel across a fork boundary.
//!
//! A [`Piper`] forks the calling process and leaves each side holding its half
//! of a pipe pair. Frames are newline-delimited (see [`frame`]); every blocking
//! operation is bounded by the channel's suspend timeout.

mod fd;
mod frame;

pub use frame::{Frame, WireError};

use fd::PipeFd;

use std::io::{Read, Write};
use std::marker::PhantomData;
use std::str::FromStr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use nix::sys::signal::{Signal, kill};
use nix::unistd::{ForkResult, Pid, fork, pipe};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::trace;

use crate::error::{Error, Result};

/// Which directions the parent keeps after the fork.
///
/// | Mode | Parent keeps | Child keeps |
/// |------|--------------|-------------|
/// | R    | read         | write       |
/// | W    | write        | read        |
/// | RW   | read+write   | read+write  |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Read,
    Write,
    ReadWrite,
}

impl FromStr for Mode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "r" => Ok(Mode::Read),
            "w" => Ok(Mode::Write),
            "rw" => Ok(Mode::ReadWrite),
            other => Err(Error::Argument(format!(
                "unknown pipe mode '{other}' (expected r, w, or rw)"
            ))),
        }
    }
}

/// Conversion into a POSIX signal from a `Signal`, a number, or a name.
pub trait IntoSignal {
    fn into_signal(self) -> Result<Signal>;
}

impl IntoSignal for Signal {
    fn into_signal(self) -> Result<Signal> {
        Ok(self)
    }
}

impl IntoSignal for i32 {
    fn into_signal(self) -> Result<Signal> {
        Signal::try_from(self).map_err(|_| Error::Argument(format!("unknown signal number {self}")))
    }
}

impl IntoSignal for &str {
    fn into_signal(self) -> Result<Signal> {
        let upper = self.to_uppercase();
        let name = if upper.starts_with("SIG") {
            upper
        } else {
            format!("SIG{upper}")
        };
        Signal::from_str(&name).map_err(|_| Error::Argument(format!("unknown signal '{self}'")))
    }
}

/// Buffered reader that assembles newline-delimited frames under a deadline.
struct FrameReader {
    fd: PipeFd,
    buf: Vec<u8>,
    eof: bool,
}

impl FrameReader {
    fn new(fd: PipeFd) -> Self {
        Self {
            fd,
            buf: Vec::with_capacity(4096),
            eof: false,
        }
    }

    /// Read one complete frame, waiting at most `timeout` overall.
    ///
    /// `Ok(None)` means the deadline passed or the other end is gone (EOF).
    fn read_frame<T>(&mut self, timeout: Option<Duration>) -> Result<Option<Frame<T>>>
    where
        T: DeserializeOwned,
    {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = self.buf.drain(..=pos).collect();
                return Frame::decode(&line[..pos]).map(Some);
            }

            let remaining = match deadline {
                None => None,
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        return Ok(None);
                    }
                    Some(d - now)
                }
            };
            if !self.fd.poll_readable(remaining)? {
                return Ok(None);
            }

            let mut chunk = [0u8; 4096];
            match self.fd.read(&mut chunk) {
                Ok(0) => {
                    // EOF: the other end closed. Folded into the no-data
                    // sentinel; `at_eof` tells the cases apart.
                    self.eof = true;
                    return Ok(None);
                }
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Framed object transport across a fork.
///
/// Construction forks the process; both sides get a `Piper`, each holding only
/// the descriptor directions its [`Mode`] allows. The type parameter is the
/// application payload carried by [`Frame::Value`] frames; control tags and
/// structured errors move regardless of `T`.
///
/// The channel is internally synchronized: a worker's control path and its
/// supervisor thread may share one `Piper` behind an `Arc`.
pub struct Piper<T> {
    reader: Mutex<Option<FrameReader>>,
    writer: Mutex<Option<PipeFd>>,
    closed: AtomicBool,
    child: Option<Pid>,
    timeout: Option<Duration>,
    _payload: PhantomData<fn(T) -> T>,
}

impl<T> Piper<T> {
    /// Create a pipe pair and fork. Returns in both processes.
    ///
    /// `timeout` bounds every blocking send/receive/readiness operation;
    /// `None` waits without bound.
    pub fn new(mode: Mode, timeout: Option<Duration>) -> Result<Self> {
        // down: parent writes -> child reads; up: child writes -> parent reads
        let (down_r, down_w) = pipe()?;
        let (up_r, up_w) = pipe()?;

        match unsafe { fork() }? {
            ForkResult::Parent { child } => {
                drop(down_r);
                drop(up_w);
                let reader = matches!(mode, Mode::Read | Mode::ReadWrite)
                    .then(|| FrameReader::new(PipeFd::new(up_r)));
                let writer = matches!(mode, Mode::Write | Mode::ReadWrite)
                    .then(|| PipeFd::new(down_w));
                Ok(Self {
                    reader: Mutex::new(reader),
                    writer: Mutex::new(writer),
                    closed: AtomicBool::new(false),
                    child: Some(child),
                    timeout,
                    _payload: PhantomData,
                })
            }
            ForkResult::Child => {
                drop(down_w);
                drop(up_r);
                let reader = matches!(mode, Mode::Write | Mode::ReadWrite)
                    .then(|| FrameReader::new(PipeFd::new(down_r)));
                let writer = matches!(mode, Mode::Read | Mode::ReadWrite)
                    .then(|| PipeFd::new(up_w));
                Ok(Self {
                    reader: Mutex::new(reader),
                    writer: Mutex::new(writer),
                    closed: AtomicBool::new(false),
                    child: None,
                    timeout,
                    _payload: PhantomData,
                })
            }
        }
    }

    /// Parse the mode from a string (`"r"`, `"w"`, `"rw"`), then fork.
    pub fn open(mode: &str, timeout: Option<Duration>) -> Result<Self> {
        Self::new(mode.parse()?, timeout)
    }

    /// The child's PID on the parent side; `None` inside the child.
    pub fn pid(&self) -> Option<Pid> {
        self.child
    }

    /// True on the child side of the fork.
    pub fn is_child(&self) -> bool {
        self.child.is_none()
    }

    /// True on the parent side of the fork.
    pub fn is_parent(&self) -> bool {
        self.child.is_some()
    }

    /// The configured suspend timeout.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Bounded check whether one receive would succeed without blocking.
    pub fn readable(&self) -> Result<bool> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(false);
        }
        let guard = self.reader.lock().expect("piper reader poisoned");
        match guard.as_ref() {
            Some(r) if !r.buf.is_empty() => Ok(true),
            Some(r) => r.fd.poll_readable(self.timeout),
            None => Ok(false),
        }
    }

    /// Bounded check whether one send would succeed without blocking.
    pub fn writable(&self) -> Result<bool> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(false);
        }
        let guard = self.writer.lock().expect("piper writer poisoned");
        match guard.as_ref() {
            Some(w) => w.poll_writable(self.timeout),
            None => Ok(false),
        }
    }

    /// Deliver a POSIX signal to the child. No-op on the child side; delivery
    /// to a process that no longer exists is swallowed.
    pub fn signal<S: IntoSignal>(&self, sig: S) -> Result<()> {
        let Some(pid) = self.child else {
            return Ok(());
        };
        let sig = sig.into_signal()?;
        match kill(pid, sig) {
            Ok(()) => Ok(()),
            Err(nix::errno::Errno::ESRCH) => {
                trace!(pid = pid.as_raw(), ?sig, "signal target already gone");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Close both ends. Idempotent; concurrent blocked receives observe the
    /// closed flag once their bounded wait returns.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        if let Ok(mut w) = self.writer.try_lock() {
            w.take();
        }
        if let Ok(mut r) = self.reader.try_lock() {
            r.take();
        }
    }

    /// True once [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Whether the read side has observed end-of-file. Distinguishes a
    /// no-data sentinel caused by the other side going away from one caused
    /// by an elapsed timeout.
    pub fn at_eof(&self) -> bool {
        match self.reader.lock().expect("piper reader poisoned").as_ref() {
            Some(r) => r.eof,
            None => true,
        }
    }

    /// Announce readiness (parent) or request a restart (child).
    pub fn send_start(&self) -> Result<usize> {
        self.send_control(&Frame::Start)
    }

    /// Ask the child driver to wind down.
    pub fn send_halt(&self) -> Result<usize> {
        self.send_control(&Frame::Halt)
    }

    /// One liveness round-trip step.
    pub fn send_heartbeat(&self) -> Result<usize> {
        self.send_control(&Frame::Heartbeat)
    }

    /// Bare error tag.
    pub fn send_error_tag(&self) -> Result<usize> {
        self.send_control(&Frame::Error)
    }

    /// Marshal an error to the other side, kind and message intact.
    pub fn send_fault(&self, error: &Error) -> Result<usize> {
        self.send_control(&Frame::Fault(WireError::from(error)))
    }

    fn send_control(&self, frame: &Frame<()>) -> Result<usize> {
        let line = frame.encode()?;
        self.write_line(&line, self.timeout)
    }

    fn write_line(&self, line: &[u8], timeout: Option<Duration>) -> Result<usize> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(0);
        }
        let mut guard = self.writer.lock().expect("piper writer poisoned");
        let Some(w) = guard.as_mut() else {
            return Ok(0);
        };

        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let remaining = match deadline {
                None => None,
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        return Ok(0);
                    }
                    Some(d - now)
                }
            };
            match w.poll_writable(remaining) {
                Ok(true) => break,
                Ok(false) => return Ok(0),
                Err(Error::Interrupted) => continue,
                Err(e) => return Err(e),
            }
        }

        match w.write_all(line) {
            Ok(()) => Ok(line.len()),
            Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                guard.take();
                Ok(0)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Best-effort HALT bounded by `limit`, then close. Used to tear a child
    /// channel down cleanly without waiting a full suspend timeout.
    pub fn shutdown(&self, limit: Duration) {
        if !self.closed.load(Ordering::Acquire) {
            if let Ok(line) = Frame::<()>::Halt.encode() {
                let _ = self.write_line(&line, Some(limit));
            }
        }
        self.close();
    }

    /// Receive one frame, waiting at most the suspend timeout.
    ///
    /// `Ok(None)` is the no-data sentinel: the wait elapsed or the other end
    /// is closed. `Err(Error::Interrupted)` surfaces a signal delivered during
    /// the wait so drivers can consult their signal flags.
    pub fn receive(&self) -> Result<Option<Frame<T>>>
    where
        T: DeserializeOwned,
    {
        self.receive_within(self.timeout)
    }

    /// Receive with an explicit bound instead of the configured timeout.
    pub fn receive_within(&self, timeout: Option<Duration>) -> Result<Option<Frame<T>>>
    where
        T: DeserializeOwned,
    {
        if self.closed.load(Ordering::Acquire) {
            return Ok(None);
        }
        let mut guard = self.reader.lock().expect("piper reader poisoned");
        let Some(r) = guard.as_mut() else {
            return Ok(None);
        };
        r.read_frame(timeout)
    }

    /// Send one application value. Returns the number of bytes written, or
    /// `0` if the other end is closed or the write would block past the
    /// suspend timeout. A value is never partially delivered.
    pub fn send(&self, value: &T) -> Result<usize>
    where
        T: Serialize,
    {
        let line = frame::encode_value(value)?;
        self.write_line(&line, self.timeout)
    }

    /// Fork a detached grandchild and return a channel to it.
    ///
    /// The intermediate child becomes a session leader, forks again, and
    /// exits, orphaning the grandchild to init. The grandchild zeroes its
    /// umask, optionally changes directory to `/` (unless `nochdir`),
    /// optionally reopens stdio on `/dev/null` (unless `noclose`), and sends
    /// its own PID back; the parent records it as the channel's child PID.
    pub fn daemon(nochdir: bool, noclose: bool) -> Result<Piper<T>> {
        let mut piper: Piper<T> = Piper::new(Mode::Read, Some(Duration::from_secs(1)))?;
        if piper.is_child() {
            // A failure on this side must never fall back into caller code:
            // that would leave two copies of the program running. Marshal
            // the fault and leave.
            match daemon_child_setup(&piper, nochdir, noclose) {
                Ok(()) => return Ok(piper),
                Err(e) => {
                    let _ = piper.send_fault(&e);
                    piper.close();
                    std::process::exit(1);
                }
            }
        }

        // The intermediate child exits immediately; reap it so no zombie is
        // left behind, then collect the grandchild's PID.
        let intermediate = piper.child.take().expect("parent side has a child pid");
        let _ = nix::sys::wait::waitpid(intermediate, None);
        match piper.receive_as_raw_pid()? {
            Some(pid) => {
                piper.child = Some(Pid::from_raw(pid));
                Ok(piper)
            }
            None => Err(Error::Timeout {
                what: "daemon grandchild pid".into(),
                timeout: Duration::from_secs(1),
            }),
        }
    }

    fn receive_as_raw_pid(&self) -> Result<Option<i32>> {
        let mut guard = self.reader.lock().expect("piper reader poisoned");
        let Some(r) = guard.as_mut() else {
            return Ok(None);
        };
        match r.read_frame::<i32>(self.timeout)? {
            Some(Frame::Value(pid)) => Ok(Some(pid)),
            Some(Frame::Fault(w)) => Err(w.into()),
            Some(other) => Err(Error::UnknownResponse(other.kind_name().into())),
            None => Ok(None),
        }
    }
}

/// Intermediate-and-grandchild side of [`Piper::daemon`]: new session,
/// second fork (the intermediate exits), zeroed umask, optional chdir and
/// stdio redirection, then the grandchild reports its PID.
fn daemon_child_setup<T>(piper: &Piper<T>, nochdir: bool, noclose: bool) -> Result<()> {
    nix::unistd::setsid()?;
    match unsafe { fork() }? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }
    nix::sys::stat::umask(nix::sys::stat::Mode::empty());
    if !nochdir {
        nix::unistd::chdir("/")?;
    }
    if !noclose {
        redirect_stdio_to_null()?;
    }
    let pid = nix::unistd::getpid();
    let line = Frame::<i32>::Value(pid.as_raw()).encode()?;
    piper.write_line(&line, Some(Duration::from_secs(1)))?;
    Ok(())
}

/// Reopen fds 0, 1, 2 on `/dev/null`.
fn redirect_stdio_to_null() -> Result<()> {
    use std::os::unix::io::AsRawFd;
    let null = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")?;
    for fd in 0..=2 {
        nix::unistd::dup2(null.as_raw_fd(), fd)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_parsing() {
        assert_eq!("r".parse::<Mode>().unwrap(), Mode::Read);
        assert_eq!("W".parse::<Mode>().unwrap(), Mode::Write);
        assert_eq!("rw".parse::<Mode>().unwrap(), Mode::ReadWrite);
        let err = "rx".parse::<Mode>().unwrap_err();
        assert!(err.to_string().contains("rx"), "error must name the value");
    }

    #[test]
    fn test_into_signal_forms() {
        assert_eq!(Signal::SIGHUP.into_signal().unwrap(), Signal::SIGHUP);
        assert_eq!(15.into_signal().unwrap(), Signal::SIGTERM);
        assert_eq!("HUP".into_signal().unwrap(), Signal::SIGHUP);
        assert_eq!("sigterm".into_signal().unwrap(), Signal::SIGTERM);
        assert!(0.into_signal().is_err());
        assert!("NOPE".into_signal().is_err());
    }

    #[test]
    fn test_roundtrip_across_fork() {
        let piper: Piper<Vec<String>> =
            Piper::new(Mode::ReadWrite, Some(Duration::from_secs(5))).unwrap();
        if piper.is_child() {
            // Echo one payload back, then leave without returning to the
            // test harness.
            let code = match piper.receive() {
                Ok(Some(Frame::Value(v))) => match piper.send(&v) {
                    Ok(n) if n > 0 => 0,
                    _ => 1,
                },
                _ => 1,
            };
            piper.close();
            std::process::exit(code);
        }

        let payload = vec!["alpha".to_string(), "beta gamma".to_string()];
        let n = piper.send(&payload).unwrap();
        assert!(n > 0);
        match piper.receive().unwrap() {
            Some(Frame::Value(v)) => assert_eq!(v, payload),
            other => panic!("expected echoed payload, got {:?}", other.map(|f| f.kind_name())),
        }
        piper.close();
        let _ = nix::sys::wait::waitpid(piper.pid().unwrap(), None);
    }

    #[test]
    fn test_receive_times_out_with_sentinel() {
        let piper: Piper<u32> =
            Piper::new(Mode::ReadWrite, Some(Duration::from_millis(50))).unwrap();
        if piper.is_child() {
            // Send nothing; wait long enough for the parent to observe the
            // timeout, then exit.
            std::thread::sleep(Duration::from_millis(300));
            piper.close();
            std::process::exit(0);
        }

        let got = piper.receive().unwrap();
        assert!(got.is_none(), "no data within the timeout yields the sentinel");
        piper.close();
        let _ = nix::sys::wait::waitpid(piper.pid().unwrap(), None);
    }

    #[test]
    fn test_send_after_close_returns_zero() {
        let piper: Piper<u32> =
            Piper::new(Mode::ReadWrite, Some(Duration::from_millis(100))).unwrap();
        if piper.is_child() {
            piper.close();
            std::process::exit(0);
        }

        piper.close();
        assert_eq!(piper.send(&7).unwrap(), 0);
        assert!(piper.receive().unwrap().is_none());
        piper.close(); // idempotent
        let _ = nix::sys::wait::waitpid(piper.pid().unwrap(), None);
    }

    #[test]
    fn test_pid_sides() {
        let piper: Piper<u32> =
            Piper::new(Mode::ReadWrite, Some(Duration::from_millis(100))).unwrap();
        if piper.is_child() {
            let ok = piper.pid().is_none() && piper.is_child();
            std::process::exit(if ok { 0 } else { 1 });
        }

        assert!(piper.is_parent());
        let pid = piper.pid().expect("parent sees the child pid");
        let status = nix::sys::wait::waitpid(pid, None).unwrap();
        assert!(matches!(
            status,
            nix::sys::wait::WaitStatus::Exited(_, 0)
        ));
    }

    #[test]
    fn test_signal_to_dead_child_is_swallowed() {
        let piper: Piper<u32> =
            Piper::new(Mode::ReadWrite, Some(Duration::from_millis(100))).unwrap();
        if piper.is_child() {
            std::process::exit(0);
        }

        let pid = piper.pid().unwrap();
        let _ = nix::sys::wait::waitpid(pid, None);
        // The child is reaped; ESRCH must be swallowed.
        piper.signal(Signal::SIGTERM).unwrap();
        piper.signal("TERM").unwrap();
    }
}
