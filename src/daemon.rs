//! Detach a process from the terminal and confirm it came up.
//!
//! [`Daemon`] uses the Piper's daemonize primitive to fork a detached
//! grandchild, then waits for evidence of a successful start: either the
//! child staying alive (signal 0 probe) or a watched log file growing past
//! the offset recorded before the fork, optionally matching a phrase.
//! Errors the child marshals through the pipe are reconstructed and raised
//! as startup errors; on timeout the child is escalated away with TERM then
//! KILL.

use std::ffi::CString;
use std::fs;
use std::path::PathBuf;
use std::time::{Duration, Instant, SystemTime};

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::pidfile::PidFile;
use crate::piper::{Frame, Piper};

/// Poll cadence while waiting for startup evidence.
const STARTUP_POLL: Duration = Duration::from_millis(250);

/// Grace between TERM and KILL during escalation.
const ESCALATE_GRACE: Duration = Duration::from_secs(2);

/// What to look for in the watched log file.
pub enum Phrase {
    /// Substring match.
    Literal(String),
    /// Regular expression match, applied per appended line.
    Pattern(Regex),
}

impl Phrase {
    fn matches(&self, line: &str) -> bool {
        match self {
            Phrase::Literal(s) => line.contains(s.as_str()),
            Phrase::Pattern(re) => re.is_match(line),
        }
    }
}

/// Watches a log file for growth past the offset recorded at creation.
///
/// With a phrase configured, only content appended after the recorded offset
/// counts; pre-existing lines can never satisfy the watch.
pub struct LogfileReader {
    path: PathBuf,
    offset: u64,
    size: u64,
    mtime: Option<SystemTime>,
    phrase: Option<Phrase>,
}

impl LogfileReader {
    pub fn new(path: impl Into<PathBuf>, phrase: Option<Phrase>) -> Self {
        let path = path.into();
        let (size, mtime) = match fs::metadata(&path) {
            Ok(meta) => (meta.len(), meta.modified().ok()),
            Err(_) => (0, None),
        };
        Self {
            offset: size,
            path,
            size,
            mtime,
            phrase,
        }
    }

    /// Whether the file shows startup evidence since the last check.
    pub fn updated(&mut self) -> Result<bool> {
        let meta = match fs::metadata(&self.path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };

        match &self.phrase {
            None => {
                let grown = meta.len() != self.size || meta.modified().ok() != self.mtime;
                self.size = meta.len();
                self.mtime = meta.modified().ok();
                Ok(grown)
            }
            Some(phrase) => {
                if meta.len() <= self.offset {
                    return Ok(false);
                }
                use std::io::{Read, Seek, SeekFrom};
                let mut file = fs::File::open(&self.path)?;
                file.seek(SeekFrom::Start(self.offset))?;
                let mut appended = String::new();
                file.read_to_string(&mut appended)?;
                self.offset = meta.len();
                Ok(appended.lines().any(|line| phrase.matches(line)))
            }
        }
    }
}

/// What the detached grandchild runs.
pub enum StartupCommand {
    /// Replace the grandchild's image with this program and arguments.
    Program(Vec<String>),
    /// Run this callback in the grandchild; it is the server's main.
    Callback(Box<dyn FnOnce() -> Result<()> + Send>),
}

/// Daemon identity, watch configuration, and bounds.
pub struct DaemonConfig {
    /// Program name; derives the PID file name.
    pub name: String,
    /// Directory for the PID file.
    pub pid_dir: PathBuf,
    /// Log file to watch for startup evidence instead of the alive probe.
    pub logfile: Option<PathBuf>,
    /// Phrase that must appear in the watched log after the recorded offset.
    pub look_for: Option<Phrase>,
    /// How long to wait for startup evidence.
    pub timeout: Duration,
    /// Skip the `chdir("/")` step of detaching.
    pub nochdir: bool,
    /// Keep stdio instead of reopening it on `/dev/null`.
    pub noclose: bool,
}

impl DaemonConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pid_dir: PathBuf::from("."),
            logfile: None,
            look_for: None,
            timeout: Duration::from_secs(30),
            nochdir: false,
            noclose: false,
        }
    }

    pub fn with_pid_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.pid_dir = dir.into();
        self
    }

    pub fn with_logfile(mut self, path: impl Into<PathBuf>) -> Self {
        self.logfile = Some(path.into());
        self
    }

    pub fn with_look_for(mut self, phrase: Phrase) -> Self {
        self.look_for = Some(phrase);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_nochdir(mut self, nochdir: bool) -> Self {
        self.nochdir = nochdir;
        self
    }

    pub fn with_noclose(mut self, noclose: bool) -> Self {
        self.noclose = noclose;
        self
    }
}

/// Detaches a startup command into the background and supervises its launch.
pub struct Daemon {
    config: DaemonConfig,
    pidfile: PidFile,
    command: Option<StartupCommand>,
    piper: Option<Piper<i32>>,
}

impl Daemon {
    pub fn new(config: DaemonConfig, command: StartupCommand) -> Result<Self> {
        if let StartupCommand::Program(args) = &command {
            if args.is_empty() {
                return Err(Error::Argument(
                    "startup command needs a program to run".into(),
                ));
            }
        }
        let pidfile = PidFile::new(&config.name).with_dir(&config.pid_dir);
        Ok(Self {
            config,
            pidfile,
            command: Some(command),
            piper: None,
        })
    }

    /// Detach and wait for startup evidence.
    ///
    /// Never returns in the detached grandchild. In the parent, returns once
    /// the daemon is considered up, or with the child's marshalled error, or
    /// with a timeout after signal escalation.
    pub fn startup(&mut self) -> Result<()> {
        if self.pidfile.alive() {
            return Err(Error::AlreadyStarted {
                pid: self.pidfile.pid().map(Pid::as_raw).unwrap_or_default(),
            });
        }
        let command = self
            .command
            .take()
            .ok_or_else(|| Error::Argument("daemon already started once".into()))?;

        // Record the log offset before the fork so only evidence produced by
        // the new child counts.
        let look_for = self.config.look_for.take();
        let mut watcher = self
            .config
            .logfile
            .as_ref()
            .map(|path| LogfileReader::new(path, look_for));

        let piper = Piper::<i32>::daemon(self.config.nochdir, self.config.noclose)?;
        if piper.is_child() {
            run_startup_command(command, &piper);
        }

        let pid = piper.pid().expect("parent side has the grandchild pid");
        info!(daemon = %self.config.name, pid = pid.as_raw(), "daemon detached");
        self.piper = Some(piper);
        let outcome = self.wait_for_startup(pid, watcher.as_mut());
        if outcome.is_err() {
            escalate_kill(pid);
        }
        outcome
    }

    /// The detached daemon's PID.
    pub fn pid(&self) -> Option<Pid> {
        self.piper.as_ref().and_then(Piper::pid)
    }

    /// Whether the detached daemon responds to a signal 0 probe.
    pub fn alive(&self) -> bool {
        match self.pid() {
            Some(pid) => kill(pid, None).is_ok(),
            None => self.pidfile.alive(),
        }
    }

    /// TERM the daemon, escalating to KILL if it lingers.
    pub fn shutdown(&mut self) -> Result<()> {
        let Some(pid) = self.pid().or_else(|| self.pidfile.pid()) else {
            return Ok(());
        };
        escalate_kill(pid);
        if let Some(piper) = &self.piper {
            piper.close();
        }
        Ok(())
    }

    fn wait_for_startup(
        &mut self,
        pid: Pid,
        mut watcher: Option<&mut LogfileReader>,
    ) -> Result<()> {
        let piper = self.piper.as_ref().expect("startup stores the piper");
        let deadline = Instant::now() + self.config.timeout;

        loop {
            // A marshalled child error trumps every other signal.
            match piper.receive_within(Some(STARTUP_POLL)) {
                Ok(Some(Frame::Fault(wire))) => return Err(wire.into()),
                Ok(Some(_)) | Ok(None) | Err(Error::Interrupted) => {}
                Err(e) => return Err(e),
            }

            let started = match watcher.as_deref_mut() {
                Some(reader) => reader.updated()?,
                None => kill(pid, None).is_ok(),
            };
            if started {
                debug!(daemon = %self.config.name, "startup confirmed");
                return Ok(());
            }

            if watcher.is_none() || piper.at_eof() {
                // Without a log watcher the alive probe just failed; with
                // one, EOF means the child is gone. Either way the daemon
                // died before producing startup evidence.
                if kill(pid, None).is_err() {
                    return Err(Error::Io(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "daemon exited before startup completed",
                    )));
                }
            }

            if Instant::now() >= deadline {
                return Err(Error::Timeout {
                    what: "daemon startup".into(),
                    timeout: self.config.timeout,
                });
            }
        }
    }
}

/// Grandchild body: run the command, marshal any failure back, and leave.
fn run_startup_command(command: StartupCommand, piper: &Piper<i32>) -> ! {
    let error = match command {
        StartupCommand::Program(args) => exec_program(&args),
        StartupCommand::Callback(f) => match f() {
            Ok(()) => {
                piper.close();
                std::process::exit(0);
            }
            Err(e) => e,
        },
    };
    let _ = piper.send_fault(&error);
    piper.close();
    std::process::exit(1);
}

/// Replace this process with the program; only returns on failure.
fn exec_program(args: &[String]) -> Error {
    let cstrings: Vec<CString> = match args
        .iter()
        .map(|a| CString::new(a.as_str()))
        .collect::<std::result::Result<_, _>>()
    {
        Ok(v) => v,
        Err(e) => return Error::Argument(format!("startup command has a NUL byte: {e}")),
    };
    match nix::unistd::execvp(&cstrings[0], &cstrings) {
        Ok(infallible) => match infallible {},
        Err(e) => Error::Sys(e),
    }
}

/// TERM, a grace period, then KILL; gives up once the process is gone.
fn escalate_kill(pid: Pid) {
    if kill(pid, Signal::SIGTERM).is_err() {
        return; // already gone
    }
    let deadline = Instant::now() + ESCALATE_GRACE;
    while Instant::now() < deadline {
        if kill(pid, None).is_err() {
            return;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    warn!(pid = pid.as_raw(), "daemon ignored TERM, killing");
    let _ = kill(pid, Signal::SIGKILL);
}
