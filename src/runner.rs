//! Cooperative activity loop with lifecycle hooks.
//!
//! A [`ThreadedRunner`] owns one background thread that repeatedly invokes an
//! [`Activity`]'s `run` until the activity breaks its own loop, a fatal error
//! occurs, an iteration bound is reached, or [`stop`](ThreadedRunner::stop)
//! is called.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{error, warn};

use crate::error::{Error, Result};

/// What the loop should do after one iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Keep iterating.
    Continue,
    /// End the loop cleanly.
    Break,
}

/// An object driven by a [`ThreadedRunner`].
///
/// Only `run` does work; the lifecycle hooks default to no-ops and are each
/// invoked exactly once per lifecycle transition. `run` itself defaults to a
/// fatal `NotImplemented` error, so an activity that forgets to supply one
/// terminates its loop on the first iteration.
pub trait Activity: Send + 'static {
    /// One iteration of work.
    fn run(&mut self) -> Result<Flow> {
        Err(Error::NotImplemented("run"))
    }

    /// Invoked by `start` before the activity thread exists.
    fn before_starting(&mut self) {}

    /// Invoked by `start` after the thread is created; no ordering is
    /// guaranteed against the first iteration.
    fn after_starting(&mut self) {}

    /// Invoked by `stop` before the loop is asked to wind down.
    fn before_stopping(&mut self) {}

    /// Invoked by `stop` once the thread has terminated.
    fn after_stopping(&mut self) {}

    /// Thread name for diagnostics.
    fn name(&self) -> &str {
        "activity"
    }
}

/// Loop pacing and bounds.
#[derive(Debug, Clone)]
pub struct LoopConfig {
    /// Pause between iterations; zero means back-to-back.
    pub interval: Duration,
    /// Warn when one iteration overruns the interval.
    pub strict_interval: bool,
    /// Stop after this many iterations; must be at least 1 when set.
    pub max_iterations: Option<u64>,
    /// Log `run` errors and keep looping instead of terminating.
    pub continue_on_error: bool,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            interval: Duration::ZERO,
            strict_interval: false,
            max_iterations: None,
            continue_on_error: false,
        }
    }
}

impl LoopConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_strict_interval(mut self, strict: bool) -> Self {
        self.strict_interval = strict;
        self
    }

    pub fn with_max_iterations(mut self, max: u64) -> Self {
        self.max_iterations = Some(max);
        self
    }

    pub fn with_continue_on_error(mut self, cont: bool) -> Self {
        self.continue_on_error = cont;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.max_iterations == Some(0) {
            return Err(Error::Argument(
                "max_iterations must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// State shared between the runner handle and its activity thread.
struct Shared {
    running: AtomicBool,
    iterations: AtomicU64,
    state: Mutex<State>,
    cond: Condvar,
    error: Mutex<Option<Error>>,
}

struct State {
    finished: bool,
    wake_epoch: u64,
}

impl Shared {
    fn new() -> Self {
        Self {
            running: AtomicBool::new(false),
            iterations: AtomicU64::new(0),
            state: Mutex::new(State {
                finished: true,
                wake_epoch: 0,
            }),
            cond: Condvar::new(),
            error: Mutex::new(None),
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn iterations(&self) -> u64 {
        self.iterations.load(Ordering::Acquire)
    }

    /// Interruptible sleep: returns early on [`wake`](Self::wake) or when the
    /// loop is asked to stop.
    fn sleep(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        let mut st = self.state.lock().expect("runner state poisoned");
        let epoch = st.wake_epoch;
        while self.is_running() && st.wake_epoch == epoch {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let (guard, _) = self
                .cond
                .wait_timeout(st, deadline - now)
                .expect("runner state poisoned");
            st = guard;
        }
    }

    fn wake(&self) {
        let mut st = self.state.lock().expect("runner state poisoned");
        st.wake_epoch += 1;
        self.cond.notify_all();
    }

    fn mark_started(&self) {
        let mut st = self.state.lock().expect("runner state poisoned");
        st.finished = false;
    }

    fn mark_finished(&self) {
        let mut st = self.state.lock().expect("runner state poisoned");
        st.finished = true;
        self.cond.notify_all();
    }

    fn is_finished(&self) -> bool {
        self.state.lock().expect("runner state poisoned").finished
    }

    /// Wait until the thread terminates, bounded by `limit` if given.
    /// Returns whether the thread has terminated.
    fn wait_finished(&self, limit: Option<Duration>) -> bool {
        let deadline = limit.map(|l| Instant::now() + l);
        let mut st = self.state.lock().expect("runner state poisoned");
        while !st.finished {
            let wait = match deadline {
                None => Duration::from_millis(100),
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        return false;
                    }
                    (d - now).min(Duration::from_millis(100))
                }
            };
            let (guard, _) = self
                .cond
                .wait_timeout(st, wait)
                .expect("runner state poisoned");
            st = guard;
        }
        true
    }
}

/// Hosts the lifecycle of one activity loop; the concrete server or
/// supervisor embeds one and supplies the activity.
pub struct ThreadedRunner<A: Activity> {
    activity: Arc<Mutex<A>>,
    shared: Arc<Shared>,
    config: LoopConfig,
    handle: Option<JoinHandle<()>>,
    launched: bool,
    stop_hooks_delivered: bool,
}

impl<A: Activity> ThreadedRunner<A> {
    /// Validate the configuration and wrap the activity.
    pub fn new(config: LoopConfig, activity: A) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            activity: Arc::new(Mutex::new(activity)),
            shared: Arc::new(Shared::new()),
            config,
            handle: None,
            launched: false,
            stop_hooks_delivered: false,
        })
    }

    /// Launch the activity thread. A no-op while the loop is running.
    pub fn start(&mut self) {
        if self.shared.is_running() {
            return;
        }
        // Collect a thread that ended on its own before relaunching.
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }

        self.shared.iterations.store(0, Ordering::Release);
        *self.shared.error.lock().expect("runner error slot poisoned") = None;
        self.shared.running.store(true, Ordering::Release);
        self.shared.mark_started();
        self.launched = true;
        self.stop_hooks_delivered = false;

        let name = {
            let mut activity = self.activity.lock().expect("activity poisoned");
            activity.before_starting();
            activity.name().to_string()
        };

        let activity = Arc::clone(&self.activity);
        let shared = Arc::clone(&self.shared);
        let config = self.config.clone();
        let handle = std::thread::Builder::new()
            .name(name)
            .spawn(move || activity_loop(activity, shared, config))
            .expect("failed to spawn activity thread");
        self.handle = Some(handle);

        self.activity
            .lock()
            .expect("activity poisoned")
            .after_starting();
    }

    /// Wind the loop down and join it, bounded by `limit` if given.
    /// A no-op from the idle state.
    ///
    /// When the loop already ended on its own (`Flow::Break`, iteration
    /// bound, or fatal error), this still delivers `after_stopping` exactly
    /// once so the lifecycle always completes.
    pub fn stop(&mut self, limit: Option<Duration>) {
        let was_running = self.shared.running.swap(false, Ordering::AcqRel);
        if !was_running && !self.launched {
            return;
        }
        if was_running {
            self.activity
                .lock()
                .expect("activity poisoned")
                .before_stopping();
        }
        self.shared.wake();

        if self.shared.wait_finished(limit) {
            if let Some(handle) = self.handle.take() {
                let _ = handle.join();
            }
            if !self.stop_hooks_delivered {
                self.activity
                    .lock()
                    .expect("activity poisoned")
                    .after_stopping();
                self.stop_hooks_delivered = true;
            }
        }
    }

    /// Block until the activity thread terminates or `limit` expires; returns
    /// immediately when the thread never started. A fatal error stored by the
    /// loop is re-raised here, once.
    pub fn join(&mut self, limit: Option<Duration>) -> Result<bool> {
        if self.handle.is_none() && self.shared.is_finished() {
            return Ok(true);
        }
        if !self.shared.wait_finished(limit) {
            return Ok(false);
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        if let Some(err) = self
            .shared
            .error
            .lock()
            .expect("runner error slot poisoned")
            .take()
        {
            return Err(err);
        }
        Ok(true)
    }

    /// Block until the loop stops running, or until `iterations` further
    /// iterations past this call have completed.
    pub fn wait(&self, iterations: Option<u64>) {
        let target = iterations.map(|n| self.shared.iterations().saturating_add(n));
        loop {
            if !self.shared.is_running() {
                return;
            }
            if let Some(t) = target {
                if self.shared.iterations() >= t {
                    return;
                }
            }
            let st = self.shared.state.lock().expect("runner state poisoned");
            let _ = self
                .shared
                .cond
                .wait_timeout(st, Duration::from_millis(50))
                .expect("runner state poisoned");
        }
    }

    /// Interrupt the interval sleep so the loop re-checks its state.
    pub fn wake(&self) {
        self.shared.wake();
    }

    /// Whether the loop is currently running.
    pub fn running(&self) -> bool {
        self.shared.is_running()
    }

    /// Iterations completed since the last `start`.
    pub fn iterations(&self) -> u64 {
        self.shared.iterations()
    }

    /// Shared access to the wrapped activity.
    pub fn activity(&self) -> Arc<Mutex<A>> {
        Arc::clone(&self.activity)
    }
}

impl<A: Activity> Drop for ThreadedRunner<A> {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        self.shared.wake();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn activity_loop<A: Activity>(activity: Arc<Mutex<A>>, shared: Arc<Shared>, config: LoopConfig) {
    loop {
        if !config.interval.is_zero() && shared.is_running() {
            shared.sleep(config.interval);
        }
        if !shared.is_running() {
            break;
        }

        let started = Instant::now();
        let outcome = activity.lock().expect("activity poisoned").run();
        let iterations = shared.iterations.fetch_add(1, Ordering::AcqRel) + 1;
        shared.cond.notify_all();

        match outcome {
            Ok(Flow::Continue) => {}
            Ok(Flow::Break) => break,
            Err(e) if config.continue_on_error => {
                error!(error = %e, "activity iteration failed, continuing");
            }
            Err(e) => {
                error!(error = %e, fatal = true, "activity failed, terminating loop");
                *shared.error.lock().expect("runner error slot poisoned") = Some(e);
                break;
            }
        }

        if let Some(max) = config.max_iterations {
            if iterations >= max {
                break;
            }
        }
        if config.strict_interval
            && !config.interval.is_zero()
            && started.elapsed() > config.interval
        {
            warn!(
                interval_ms = config.interval.as_millis() as u64,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "iteration overran the strict interval"
            );
        }
    }

    shared.running.store(false, Ordering::Release);
    shared.mark_finished();
}
