//! Single-process long-running service built on the activity loop.
//!
//! A [`Server`] owns a PID file for its lifetime and dispatches the classic
//! daemon signals to same-named hooks: HUP/USR1/USR2 reach user code when
//! supplied, INT and TERM default to a graceful shutdown.

use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use nix::sys::signal::Signal;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::pidfile::PidFile;
use crate::runner::{Activity, Flow, LoopConfig, ThreadedRunner};
use crate::signals;

/// The hooks a service supplies.
///
/// Only `run` does work. The signal hooks fire on the loop thread between
/// iterations, after the corresponding POSIX signal has been delivered.
/// `int` and `term` decide whether the loop survives the signal; both
/// default to winding the service down.
pub trait ServerHooks: Send + 'static {
    /// One iteration of service work.
    fn run(&mut self) -> Result<Flow>;

    fn before_starting(&mut self) {}
    fn after_starting(&mut self) {}
    fn before_stopping(&mut self) {}
    fn after_stopping(&mut self) {}

    /// SIGHUP arrived.
    fn hup(&mut self) {}

    /// SIGUSR1 arrived.
    fn usr1(&mut self) {}

    /// SIGUSR2 arrived.
    fn usr2(&mut self) {}

    /// SIGINT arrived; `Flow::Break` shuts the service down.
    fn int(&mut self) -> Flow {
        Flow::Break
    }

    /// SIGTERM arrived; `Flow::Break` shuts the service down.
    fn term(&mut self) -> Flow {
        Flow::Break
    }
}

/// Server identity and pacing.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Program name; also derives the PID file name.
    pub name: String,
    /// Pause between `run` iterations.
    pub interval: Duration,
    /// Directory for the PID file.
    pub pid_dir: PathBuf,
    /// PID file permission bits.
    pub pid_mode: u32,
    /// Keep looping when `run` errors instead of terminating.
    pub continue_on_error: bool,
}

impl ServerConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            interval: Duration::from_secs(1),
            pid_dir: PathBuf::from("."),
            pid_mode: 0o640,
            continue_on_error: false,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_pid_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.pid_dir = dir.into();
        self
    }

    pub fn with_pid_mode(mut self, mode: u32) -> Self {
        self.pid_mode = mode;
        self
    }

    pub fn with_continue_on_error(mut self, cont: bool) -> Self {
        self.continue_on_error = cont;
        self
    }
}

/// Signals the completion of a full shutdown, `after_stopping` included.
struct Completion {
    done: Mutex<bool>,
    cond: Condvar,
}

impl Completion {
    fn new() -> Self {
        Self {
            done: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    fn reset(&self) {
        *self.done.lock().expect("completion poisoned") = false;
    }

    fn finish(&self) {
        *self.done.lock().expect("completion poisoned") = true;
        self.cond.notify_all();
    }

    fn wait(&self) {
        let mut done = self.done.lock().expect("completion poisoned");
        while !*done {
            done = self
                .cond
                .wait_timeout(done, Duration::from_millis(100))
                .expect("completion poisoned")
                .0;
        }
    }
}

/// Bridges the hooks into the activity loop: owns the PID file, installs the
/// signal handlers, and dispatches pending signals before each iteration.
struct ServerActivity<H: ServerHooks> {
    hooks: H,
    name: String,
    pidfile: PidFile,
    completion: Arc<Completion>,
}

impl<H: ServerHooks> Activity for ServerActivity<H> {
    fn name(&self) -> &str {
        &self.name
    }

    fn before_starting(&mut self) {
        if let Err(e) = self.pidfile.write() {
            warn!(error = %e, "could not write pid file");
        }
        if let Err(e) = signals::install(&[
            Signal::SIGHUP,
            Signal::SIGINT,
            Signal::SIGTERM,
            Signal::SIGUSR1,
            Signal::SIGUSR2,
        ]) {
            warn!(error = %e, "could not install signal handlers");
        }
        self.hooks.before_starting();
    }

    fn after_starting(&mut self) {
        info!(server = %self.name, "server started");
        self.hooks.after_starting();
    }

    fn before_stopping(&mut self) {
        self.hooks.before_stopping();
    }

    fn after_stopping(&mut self) {
        self.hooks.after_stopping();
        if let Err(e) = self.pidfile.delete() {
            warn!(error = %e, "could not delete pid file");
        }
        info!(server = %self.name, "server stopped");
        self.completion.finish();
    }

    fn run(&mut self) -> Result<Flow> {
        if signals::take(Signal::SIGINT) {
            debug!(server = %self.name, "SIGINT");
            if self.hooks.int() == Flow::Break {
                return Ok(Flow::Break);
            }
        }
        if signals::take(Signal::SIGTERM) {
            debug!(server = %self.name, "SIGTERM");
            if self.hooks.term() == Flow::Break {
                return Ok(Flow::Break);
            }
        }
        if signals::take(Signal::SIGHUP) {
            debug!(server = %self.name, "SIGHUP");
            self.hooks.hup();
        }
        if signals::take(Signal::SIGUSR1) {
            self.hooks.usr1();
        }
        if signals::take(Signal::SIGUSR2) {
            self.hooks.usr2();
        }
        self.hooks.run()
    }
}

/// A long-running single-process service.
pub struct Server<H: ServerHooks> {
    runner: ThreadedRunner<ServerActivity<H>>,
    completion: Arc<Completion>,
}

impl<H: ServerHooks> Server<H> {
    pub fn new(config: ServerConfig, hooks: H) -> Result<Self> {
        let completion = Arc::new(Completion::new());
        let pidfile = PidFile::new(&config.name)
            .with_dir(&config.pid_dir)
            .with_mode(config.pid_mode);
        let activity = ServerActivity {
            hooks,
            name: config.name.clone(),
            pidfile,
            completion: Arc::clone(&completion),
        };
        let loop_config = LoopConfig::new()
            .with_interval(config.interval)
            .with_continue_on_error(config.continue_on_error);
        Ok(Self {
            runner: ThreadedRunner::new(loop_config, activity)?,
            completion,
        })
    }

    /// Start the service loop. With `wait` set, block until [`shutdown`]
    /// (triggered here, from another thread, or by a signal) has fully
    /// completed, `after_stopping` included.
    ///
    /// [`shutdown`]: Self::shutdown
    pub fn startup(&mut self, wait: bool) -> Result<()> {
        self.completion.reset();
        self.runner.start();
        if wait {
            // Wait for the loop itself first: it may end on its own (signal
            // or Flow::Break) and a fatal run error must not be lost.
            let outcome = self.runner.join(None);
            self.shutdown();
            self.completion.wait();
            outcome?;
        }
        Ok(())
    }

    /// Wind the service down and deliver the stopping hooks. Idempotent.
    pub fn shutdown(&mut self) {
        self.runner.stop(None);
    }

    /// Wake the loop out of its interval sleep.
    pub fn wake(&self) {
        self.runner.wake();
    }

    /// Whether the service loop is running.
    pub fn running(&self) -> bool {
        self.runner.running()
    }

    /// Block until the loop terminates; re-raises a fatal `run` error.
    pub fn join(&mut self, limit: Option<Duration>) -> Result<bool> {
        self.runner.join(limit)
    }
}
