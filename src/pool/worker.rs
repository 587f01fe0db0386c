//! One supervised child process: the forked child driver and the parent-side
//! heartbeat supervisor.
//!
//! The supervisor is an [`Activity`] whose `run` is one heartbeat round. A
//! restart requested by the child (START frame) is serviced inside the same
//! supervisor thread: the old child is harvested and a fresh one is forked
//! into the same slot, so the worker keeps its position in the pool.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use nix::sys::signal::{Signal, kill};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::piper::{Frame, IntoSignal, Mode, Piper};
use crate::pool::Harvest;
use crate::pool::duties::WorkerDuties;
use crate::runner::{Activity, Flow, LoopConfig, ThreadedRunner};
use crate::signals;

/// Heartbeat frames carry no application payload.
type ControlPiper = Piper<()>;

/// Bound for best-effort teardown writes (the HALT that doubles as the
/// restart acknowledgement).
const TEARDOWN_WRITE_LIMIT: Duration = Duration::from_millis(250);

/// Grace between TERM and KILL when a misbehaving child must go.
const KILL_GRACE: Duration = Duration::from_millis(500);

/// Bound for joining the supervisor during a cooperative stop.
const SUPERVISOR_JOIN_LIMIT: Duration = Duration::from_secs(5);

/// State shared between a worker handle and its supervisor thread.
struct WorkerState {
    piper: Mutex<Option<Arc<ControlPiper>>>,
    stop: AtomicBool,
    error: Mutex<Option<Error>>,
}

impl WorkerState {
    fn new() -> Self {
        Self {
            piper: Mutex::new(None),
            stop: AtomicBool::new(false),
            error: Mutex::new(None),
        }
    }

    fn piper(&self) -> Option<Arc<ControlPiper>> {
        self.piper.lock().expect("worker piper slot poisoned").clone()
    }

    fn set_piper(&self, piper: Option<Arc<ControlPiper>>) {
        *self.piper.lock().expect("worker piper slot poisoned") = piper;
    }

    fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    fn record_error(&self, error: Error) {
        let mut slot = self.error.lock().expect("worker error slot poisoned");
        // First failure of a lifecycle wins; later teardown noise is dropped.
        if slot.is_none() {
            *slot = Some(error);
        }
    }
}

/// One child process plus the supervisor that exchanges heartbeats with it.
pub struct Worker<D: WorkerDuties> {
    id: usize,
    duties: D,
    timeout: Option<Duration>,
    harvest: Arc<Harvest>,
    state: Arc<WorkerState>,
    runner: Option<ThreadedRunner<Supervisor<D>>>,
}

impl<D: WorkerDuties> Worker<D> {
    pub(crate) fn new(
        id: usize,
        duties: D,
        timeout: Option<Duration>,
        harvest: Arc<Harvest>,
    ) -> Self {
        Self {
            id,
            duties,
            timeout,
            harvest,
            state: Arc::new(WorkerState::new()),
            runner: None,
        }
    }

    /// Fork a child and launch (or relaunch) the supervisor.
    ///
    /// Never returns in the child: the forked process enters the driver loop
    /// and terminates from inside it. A no-op while the worker is already
    /// supervising a live child.
    pub fn start(&mut self) -> Result<()> {
        if self.runner.as_ref().is_some_and(ThreadedRunner::running) && self.alive() {
            return Ok(());
        }
        self.state.stop.store(false, Ordering::Release);
        *self.state.error.lock().expect("worker error slot poisoned") = None;

        // The parent writes into pipes whose child may already be gone;
        // those writes must surface as EPIPE, not kill the process.
        let _ = signals::ignore_sigpipe();

        let piper = spawn_child(self.id, &self.duties, self.timeout)?;
        self.state.set_piper(Some(piper));

        match &mut self.runner {
            Some(runner) => runner.start(),
            None => {
                let supervisor = Supervisor::new(
                    self.id,
                    self.duties.clone(),
                    self.timeout,
                    Arc::clone(&self.harvest),
                    Arc::clone(&self.state),
                );
                let mut runner = ThreadedRunner::new(LoopConfig::default(), supervisor)?;
                runner.start();
                self.runner = Some(runner);
            }
        }
        Ok(())
    }

    /// Cooperative stop: flag, wake, best-effort HALT, close, SIGTERM, join.
    pub fn stop(&mut self) {
        self.state.stop.store(true, Ordering::Release);
        if let Some(runner) = &self.runner {
            runner.wake();
        }

        let piper = self.state.piper();
        if let Some(p) = &piper {
            p.shutdown(TEARDOWN_WRITE_LIMIT);
            let _ = p.signal(Signal::SIGTERM);
        }
        if let Some(runner) = &mut self.runner {
            runner.stop(Some(SUPERVISOR_JOIN_LIMIT));
        }
        // The supervisor harvests on exit; cover the case where the join
        // limit expired before it got there. The harvest dedups.
        if let Some(pid) = piper.and_then(|p| p.pid()) {
            self.harvest.push(pid);
        }
    }

    /// The current child PID, if a child has been forked.
    pub fn pid(&self) -> Option<Pid> {
        self.state.piper().and_then(|p| p.pid())
    }

    /// Whether the child PID is reachable by signal 0.
    pub fn alive(&self) -> bool {
        match self.pid() {
            Some(pid) => kill(pid, None).is_ok(),
            None => false,
        }
    }

    /// Non-blocking reap of the child. `None` while it is still running or
    /// when there is nothing to reap.
    pub fn wait(&self) -> Option<WaitStatus> {
        let pid = self.pid()?;
        match waitpid(pid, Some(WaitPidFlag::WNOHANG | WaitPidFlag::WUNTRACED)) {
            Ok(WaitStatus::StillAlive) => None,
            Ok(status) => Some(status),
            Err(_) => None,
        }
    }

    /// Forward a signal to the child through the piper.
    pub fn signal<S: IntoSignal>(&self, sig: S) -> Result<()> {
        match self.state.piper() {
            Some(p) => p.signal(sig),
            None => Ok(()),
        }
    }

    /// Whether this worker has a recorded supervision error.
    pub fn has_error(&self) -> bool {
        self.state
            .error
            .lock()
            .expect("worker error slot poisoned")
            .is_some()
    }

    /// Stable label of the recorded error, if any.
    pub fn error_label(&self) -> Option<&'static str> {
        self.state
            .error
            .lock()
            .expect("worker error slot poisoned")
            .as_ref()
            .map(Error::label)
    }

    /// Rendered message of the recorded error, if any.
    pub fn last_error(&self) -> Option<String> {
        self.state
            .error
            .lock()
            .expect("worker error slot poisoned")
            .as_ref()
            .map(ToString::to_string)
    }

    /// Remove and return the recorded error.
    pub fn take_error(&self) -> Option<Error> {
        self.state
            .error
            .lock()
            .expect("worker error slot poisoned")
            .take()
    }

    /// Slot index inside the pool, stable across restarts.
    pub fn id(&self) -> usize {
        self.id
    }
}

impl<D: WorkerDuties> Drop for Worker<D> {
    fn drop(&mut self) {
        if !self.state.stop_requested() {
            self.stop();
        }
    }
}

/// Parent-side heartbeat supervisor for one worker slot.
struct Supervisor<D: WorkerDuties> {
    id: usize,
    name: String,
    duties: D,
    timeout: Option<Duration>,
    harvest: Arc<Harvest>,
    state: Arc<WorkerState>,
}

/// Why the supervisor is tearing its channel down.
#[derive(PartialEq)]
enum Teardown {
    /// Cooperative stop; the worker handle already signalled the child.
    Stop,
    /// Protocol failure; the child may be wedged and is escalated away.
    Failure,
}

impl<D: WorkerDuties> Supervisor<D> {
    fn new(
        id: usize,
        duties: D,
        timeout: Option<Duration>,
        harvest: Arc<Harvest>,
        state: Arc<WorkerState>,
    ) -> Self {
        Self {
            id,
            name: format!("supervisor-{id}"),
            duties,
            timeout,
            harvest,
            state,
        }
    }

    fn stop_requested(&self) -> bool {
        self.state.stop_requested()
    }

    fn teardown(&self, piper: &ControlPiper, reason: Teardown) -> Result<Flow> {
        if let Some(pid) = piper.pid() {
            self.harvest.push(pid);
        }
        piper.shutdown(TEARDOWN_WRITE_LIMIT);
        if reason == Teardown::Failure {
            self.escalate_kill(piper);
        }
        Ok(Flow::Break)
    }

    /// TERM, a short grace, then KILL. Used when the child broke protocol or
    /// overran its heartbeat timeout and cannot be trusted to leave.
    fn escalate_kill(&self, piper: &ControlPiper) {
        let Some(pid) = piper.pid() else { return };
        let _ = piper.signal(Signal::SIGTERM);
        let deadline = Instant::now() + KILL_GRACE;
        while Instant::now() < deadline {
            match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => {
                    std::thread::sleep(Duration::from_millis(20))
                }
                // Reaped here or by someone else; the harvest pass swallows
                // the resulting ECHILD.
                _ => return,
            }
        }
        warn!(worker_id = self.id, pid = pid.as_raw(), "child ignored TERM, killing");
        let _ = piper.signal(Signal::SIGKILL);
        let _ = waitpid(pid, None);
    }

    /// Service a child-initiated restart: harvest and release the old child,
    /// fork a replacement into this slot, and announce readiness to it.
    fn respawn(&mut self, old: &ControlPiper) -> Result<Flow> {
        if self.stop_requested() {
            return self.teardown(old, Teardown::Stop);
        }
        debug!(
            worker_id = self.id,
            old_pid = old.pid().map(Pid::as_raw),
            "child requested replacement"
        );
        if let Some(pid) = old.pid() {
            self.harvest.push(pid);
        }
        // The HALT written here is the acknowledgement the outgoing child
        // reads before it exits.
        old.shutdown(TEARDOWN_WRITE_LIMIT);

        match spawn_child(self.id, &self.duties, self.timeout) {
            Ok(piper) => {
                self.state.set_piper(Some(Arc::clone(&piper)));
                if piper.send_start().unwrap_or(0) == 0 {
                    warn!(worker_id = self.id, "replacement child unreachable at start");
                }
                Ok(Flow::Continue)
            }
            Err(e) => {
                self.state.record_error(e);
                Ok(Flow::Break)
            }
        }
    }

    fn fail(&self, piper: &ControlPiper, error: Error) -> Result<Flow> {
        warn!(worker_id = self.id, error = %error, "supervision round failed");
        self.state.record_error(error);
        self.teardown(piper, Teardown::Failure)
    }
}

impl<D: WorkerDuties> Activity for Supervisor<D> {
    fn name(&self) -> &str {
        &self.name
    }

    fn before_starting(&mut self) {
        // Announce readiness; the child driver gates on this frame.
        if let Some(piper) = self.state.piper() {
            match piper.send_start() {
                Ok(n) if n > 0 => trace!(worker_id = self.id, "announced start"),
                Ok(_) => warn!(worker_id = self.id, "child unreachable at start"),
                Err(e) => warn!(worker_id = self.id, error = %e, "start announcement failed"),
            }
        }
    }

    /// One heartbeat round.
    fn run(&mut self) -> Result<Flow> {
        let Some(piper) = self.state.piper() else {
            return Ok(Flow::Break);
        };
        if self.stop_requested() {
            return self.teardown(&piper, Teardown::Stop);
        }

        if let Err(e) = piper.send_heartbeat() {
            return self.fail(&piper, e);
        }

        let frame = match piper.receive() {
            Ok(frame) => frame,
            // A signal interrupted the bounded wait; re-check state and go
            // around.
            Err(Error::Interrupted) => return Ok(Flow::Continue),
            Err(e) => return self.fail(&piper, e),
        };

        if self.stop_requested() {
            return self.teardown(&piper, Teardown::Stop);
        }

        match frame {
            Some(Frame::Heartbeat) => Ok(Flow::Continue),
            Some(Frame::Start) => self.respawn(&piper),
            Some(Frame::Fault(wire)) => self.fail(&piper, wire.into()),
            Some(other) => {
                self.fail(&piper, Error::UnknownResponse(other.kind_name().into()))
            }
            None => self.fail(
                &piper,
                Error::Timeout {
                    what: "heartbeat".into(),
                    timeout: self.timeout.unwrap_or_default(),
                },
            ),
        }
    }
}

/// Clone the duties and fork. The parent gets the channel; the child enters
/// its driver and never returns.
fn spawn_child<D: WorkerDuties>(
    id: usize,
    duties: &D,
    timeout: Option<Duration>,
) -> Result<Arc<ControlPiper>> {
    let duties = duties.clone();
    let piper: ControlPiper = Piper::new(Mode::ReadWrite, timeout)?;
    if piper.is_child() {
        child_main(duties, piper);
    }
    trace!(
        worker_id = id,
        pid = piper.pid().map(Pid::as_raw),
        "forked worker child"
    );
    Ok(Arc::new(piper))
}

/// Child-process entry: install signal handling, drive the protocol, and
/// leave without running destructors so resources shared with the parent are
/// not double-released.
fn child_main<D: WorkerDuties>(mut duties: D, piper: ControlPiper) -> ! {
    let _ = signals::reset();
    let _ = signals::install(&[Signal::SIGHUP, Signal::SIGTERM]);
    let _ = signals::ignore_sigpipe();

    match child_drive(&mut duties, &piper) {
        Ok(()) => {
            if let Err(e) = duties.after_executing() {
                warn!(error = %e, "after_executing failed");
            }
            piper.close();
            std::process::exit(0);
        }
        Err(e) => {
            // Marshal the failure to the parent as a single error frame.
            let _ = piper.send_fault(&e);
            piper.close();
            std::process::exit(1);
        }
    }
}

/// The request/response loop the child obeys.
fn child_drive<D: WorkerDuties>(duties: &mut D, piper: &ControlPiper) -> Result<()> {
    if let Err(e) = duties.before_executing() {
        warn!(error = %e, "before_executing failed");
    }

    // Gate on the parent's readiness announcement.
    loop {
        check_child_signals(duties, piper);
        match piper.receive() {
            Ok(Some(Frame::Start)) => break,
            Ok(Some(other)) => {
                return Err(Error::UnknownSignal(other.kind_name().into()));
            }
            Ok(None) if piper.at_eof() => {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "pipe closed before start",
                )));
            }
            Ok(None) | Err(Error::Interrupted) => continue,
            Err(e) => return Err(e),
        }
    }

    loop {
        check_child_signals(duties, piper);
        match piper.receive() {
            Ok(Some(Frame::Heartbeat)) => {
                duties.execute()?;
                piper.send_heartbeat()?;
            }
            Ok(Some(Frame::Halt)) => return Ok(()),
            Ok(Some(other)) => {
                return Err(Error::UnknownSignal(other.kind_name().into()));
            }
            Ok(None) => {
                return Err(Error::Timeout {
                    what: "heartbeat".into(),
                    timeout: piper.timeout().unwrap_or_default(),
                });
            }
            Err(Error::Interrupted) => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Observe pending HUP/TERM deliveries; both sequences leave the process.
fn check_child_signals<D: WorkerDuties>(duties: &mut D, piper: &ControlPiper) {
    if signals::take(Signal::SIGHUP) {
        hup_sequence(duties, piper);
    }
    if signals::take(Signal::SIGTERM) {
        term_sequence(duties, piper);
    }
}

/// Ask the parent for a replacement, wait for the acknowledgement, and exit.
fn hup_sequence<D: WorkerDuties>(duties: &mut D, piper: &ControlPiper) -> ! {
    let _ = piper.send_start();
    let _ = piper.receive(); // one frame of acknowledgement, content discarded
    piper.close();
    duties.hup();
    std::process::exit(0);
}

/// Graceful exit on SIGTERM.
fn term_sequence<D: WorkerDuties>(duties: &mut D, piper: &ControlPiper) -> ! {
    piper.close();
    duties.term();
    std::process::exit(0);
}
