//! External command runner with wall-clock timeout and kill escalation.

use std::process::{Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::piper::IntoSignal;

/// Escalation behavior for a [`Child`].
#[derive(Debug, Clone)]
pub struct ChildConfig {
    /// Wall-clock bound on the command; `None` waits forever.
    pub timeout: Option<Duration>,
    /// Signals tried in order when the timeout hits.
    pub signals: Vec<Signal>,
    /// Pause between escalation steps.
    pub suspend: Duration,
}

impl Default for ChildConfig {
    fn default() -> Self {
        Self {
            timeout: None,
            signals: vec![Signal::SIGTERM, Signal::SIGQUIT, Signal::SIGKILL],
            suspend: Duration::from_secs(4),
        }
    }
}

impl ChildConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_signals(mut self, signals: Vec<Signal>) -> Self {
        self.signals = signals;
        self
    }

    pub fn with_suspend(mut self, suspend: Duration) -> Self {
        self.suspend = suspend;
        self
    }
}

/// Runs one external command, escalating through the configured signal
/// sequence when it overruns its timeout.
pub struct Child {
    program: String,
    args: Vec<String>,
    config: ChildConfig,
    child: Option<std::process::Child>,
    timed_out: bool,
}

impl Child {
    pub fn new(
        program: impl Into<String>,
        args: impl IntoIterator<Item = String>,
        config: ChildConfig,
    ) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().collect(),
            config,
            child: None,
            timed_out: false,
        }
    }

    /// Spawn the command. Starting an already-running child is an error.
    pub fn start(&mut self) -> Result<()> {
        if self.alive() {
            return Err(Error::AlreadyStarted {
                pid: self.pid().map(Pid::as_raw).unwrap_or_default(),
            });
        }
        self.timed_out = false;
        let child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .spawn()?;
        debug!(program = %self.program, pid = child.id(), "spawned child command");
        self.child = Some(child);
        Ok(())
    }

    /// The child's PID while it runs.
    pub fn pid(&self) -> Option<Pid> {
        self.child.as_ref().map(|c| Pid::from_raw(c.id() as i32))
    }

    /// Whether the process is still running.
    pub fn alive(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Whether the last wait ended in the escalation path.
    pub fn timed_out(&self) -> bool {
        self.timed_out
    }

    /// Deliver a signal to the running child.
    pub fn signal<S: IntoSignal>(&self, sig: S) -> Result<()> {
        if let Some(pid) = self.pid() {
            match kill(pid, sig.into_signal()?) {
                Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Wait for the command to finish. When the configured timeout elapses
    /// first, walk the signal sequence until the process is gone, then
    /// report the exit status.
    pub fn wait(&mut self) -> Result<ExitStatus> {
        let deadline = self.config.timeout.map(|t| Instant::now() + t);
        loop {
            let child = self
                .child
                .as_mut()
                .ok_or_else(|| Error::Argument("child was never started".into()))?;
            if let Some(status) = child.try_wait()? {
                self.child = None;
                return Ok(status);
            }
            if let Some(d) = deadline {
                if Instant::now() >= d {
                    self.timed_out = true;
                    return self.stop();
                }
            }
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    /// Escalate through the signal sequence until the process exits, then
    /// return its status. Gives up a step early whenever the process is
    /// already gone.
    pub fn stop(&mut self) -> Result<ExitStatus> {
        let Some(mut child) = self.child.take() else {
            return Err(Error::Argument("child was never started".into()));
        };
        let pid = Pid::from_raw(child.id() as i32);
        let signals = self.config.signals.clone();

        for (step, &sig) in signals.iter().enumerate() {
            if let Some(status) = child.try_wait()? {
                return Ok(status);
            }
            warn!(pid = pid.as_raw(), ?sig, step, "escalating child command");
            match kill(pid, sig) {
                Ok(()) => {}
                Err(nix::errno::Errno::ESRCH) => break,
                Err(e) => return Err(e.into()),
            }

            let deadline = Instant::now() + self.config.suspend;
            while Instant::now() < deadline {
                if let Some(status) = child.try_wait()? {
                    return Ok(status);
                }
                std::thread::sleep(Duration::from_millis(20));
            }
        }

        // Out of escalation steps; collect whatever is left.
        Ok(child.wait()?)
    }
}

impl Drop for Child {
    fn drop(&mut self) {
        if self.child.is_some() {
            let _ = self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick_config() -> ChildConfig {
        ChildConfig::new().with_suspend(Duration::from_millis(100))
    }

    #[test]
    fn test_command_runs_to_completion() {
        let mut child = Child::new("true", Vec::new(), quick_config());
        child.start().unwrap();
        let status = child.wait().unwrap();
        assert!(status.success());
        assert!(!child.timed_out());
    }

    #[test]
    fn test_timeout_escalates_and_reports() {
        let config = quick_config().with_timeout(Duration::from_millis(100));
        let mut child = Child::new("sleep", ["30".to_string()], config);
        child.start().unwrap();

        let started = Instant::now();
        let status = child.wait().unwrap();
        assert!(child.timed_out());
        assert!(!status.success());
        assert!(
            started.elapsed() < Duration::from_secs(5),
            "escalation must not wait out the full sleep"
        );
    }

    #[test]
    fn test_stop_gives_up_when_process_is_gone() {
        let mut child = Child::new("true", Vec::new(), quick_config());
        child.start().unwrap();
        // Let it finish on its own, then stop must return the status
        // without escalating.
        std::thread::sleep(Duration::from_millis(200));
        let status = child.stop().unwrap();
        assert!(status.success());
    }

    #[test]
    fn test_restart_after_exit() {
        let mut child = Child::new("true", Vec::new(), quick_config());
        child.start().unwrap();
        child.wait().unwrap();
        child.start().unwrap();
        assert!(child.wait().unwrap().success());
    }

    #[test]
    fn test_start_while_running_is_rejected() {
        let config = quick_config().with_timeout(Duration::from_millis(200));
        let mut child = Child::new("sleep", ["30".to_string()], config);
        child.start().unwrap();
        assert!(matches!(child.start(), Err(Error::AlreadyStarted { .. })));
        let _ = child.wait();
    }
}
