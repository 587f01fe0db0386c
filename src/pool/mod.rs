//! Prefork worker pool with heartbeat supervision.
//!
//! A [`PreforkPool`] owns an ordered list of [`Worker`]s. Each worker forks
//! one child process that runs the pool's capability set under a heartbeat
//! protocol; a per-worker supervisor thread in the parent enforces timeouts,
//! records failures, and replaces children that ask to be restarted.

pub mod duties;
mod worker;

pub use duties::{DutiesFn, WorkerDuties};
pub use worker::Worker;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::wait::waitpid;
use nix::unistd::Pid;
use tracing::{debug, info, trace};

use crate::error::{Error, Result};

/// PIDs of departed children awaiting a blocking `waitpid`.
///
/// Appended by any supervisor on exit, drained by the pool owner. The drain
/// swaps the whole list out under the lock so no `waitpid` runs while it is
/// held.
pub(crate) struct Harvest {
    pids: Mutex<Vec<Pid>>,
}

impl Harvest {
    fn new() -> Self {
        Self {
            pids: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn push(&self, pid: Pid) {
        let mut pids = self.pids.lock().expect("harvest poisoned");
        // A worker stop and its supervisor teardown may both report the same
        // child.
        if !pids.contains(&pid) {
            pids.push(pid);
        }
    }

    fn drain(&self) -> Vec<Pid> {
        std::mem::take(&mut *self.pids.lock().expect("harvest poisoned"))
    }

    fn len(&self) -> usize {
        self.pids.lock().expect("harvest poisoned").len()
    }
}

/// Pool sizing and supervision bounds.
#[derive(Debug, Clone, Default)]
pub struct PoolConfig {
    /// Heartbeat timeout for every worker channel; `None` waits without
    /// bound.
    pub timeout: Option<Duration>,
    /// Floor enforced by [`PreforkPool::ensure_worker_pool_size`].
    pub min_workers: Option<usize>,
    /// Ceiling enforced by [`PreforkPool::add_workers`].
    pub max_workers: Option<usize>,
}

impl PoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_min_workers(mut self, min: usize) -> Self {
        self.min_workers = Some(min);
        self
    }

    pub fn with_max_workers(mut self, max: usize) -> Self {
        self.max_workers = Some(max);
        self
    }

    fn validate(&self) -> Result<()> {
        if let (Some(min), Some(max)) = (self.min_workers, self.max_workers) {
            if min > max {
                return Err(Error::Argument(format!(
                    "min_workers ({min}) exceeds max_workers ({max})"
                )));
            }
        }
        Ok(())
    }
}

/// A pool of forked worker processes sharing one capability set.
pub struct PreforkPool<D: WorkerDuties> {
    workers: Vec<Worker<D>>,
    duties: D,
    config: PoolConfig,
    harvest: Arc<Harvest>,
    next_id: usize,
}

impl<D: WorkerDuties> PreforkPool<D> {
    /// Build a pool around a capability set.
    pub fn new(config: PoolConfig, duties: D) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            workers: Vec::new(),
            duties,
            config,
            harvest: Arc::new(Harvest::new()),
            next_id: 0,
        })
    }

    /// Replace the worker list with `n` fresh workers and start each one.
    pub fn start(&mut self, n: usize) -> Result<()> {
        info!(workers = n, "starting worker pool");
        self.stop_workers();
        self.workers.clear();
        self.reap();
        for _ in 0..n {
            self.spawn_worker()?;
        }
        Ok(())
    }

    /// Stop every worker in order, then reap all departed children.
    /// Returns after all children have been awaited.
    pub fn stop(&mut self) {
        self.stop_workers();
        self.reap();
    }

    /// Blocking-wait every harvested PID, clearing zombies. A no-op when the
    /// harvest is empty.
    pub fn reap(&self) {
        for pid in self.harvest.drain() {
            match waitpid(pid, None) {
                Ok(status) => trace!(pid = pid.as_raw(), ?status, "reaped child"),
                // Already reaped (kill escalation got there first).
                Err(Errno::ECHILD) => {}
                Err(e) => debug!(pid = pid.as_raw(), error = %e, "waitpid failed"),
            }
        }
    }

    /// Append and start up to `k` workers, bounded by `max_workers` when the
    /// cap is set. Returns how many were added.
    pub fn add_workers(&mut self, k: usize) -> Result<usize> {
        let allowed = match self.config.max_workers {
            Some(max) => max.saturating_sub(self.workers.len()),
            None => k,
        };
        let n = k.min(allowed);
        for _ in 0..n {
            self.spawn_worker()?;
        }
        if n < k {
            debug!(requested = k, added = n, "worker cap reached");
        }
        Ok(n)
    }

    /// Drop workers whose child is no longer alive.
    pub fn prune_workers(&mut self) {
        self.workers.retain(Worker::alive);
    }

    /// Grow the pool until at least `min_workers` children are alive,
    /// subject to the max cap. Returns how many workers were added.
    pub fn ensure_worker_pool_size(&mut self) -> Result<usize> {
        let Some(min) = self.config.min_workers else {
            return Ok(0);
        };
        let alive = self.workers.iter().filter(|w| w.alive()).count();
        let deficit = min.saturating_sub(alive);
        if deficit == 0 {
            return Ok(0);
        }
        self.add_workers(deficit)
    }

    /// Invoke `f` for every worker, in slot order.
    pub fn each_worker(&self, mut f: impl FnMut(&Worker<D>)) {
        for worker in &self.workers {
            f(worker);
        }
    }

    /// Invoke `f` only for workers with a recorded error.
    pub fn errors(&self, mut f: impl FnMut(&Worker<D>)) {
        for worker in &self.workers {
            if worker.has_error() {
                f(worker);
            }
        }
    }

    /// The ordered worker list.
    pub fn workers(&self) -> &[Worker<D>] {
        &self.workers
    }

    /// Number of workers currently in the list, dead or alive.
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Departed children not yet waited on.
    pub fn pending_harvest(&self) -> usize {
        self.harvest.len()
    }

    fn stop_workers(&mut self) {
        for worker in &mut self.workers {
            worker.stop();
        }
    }

    fn spawn_worker(&mut self) -> Result<()> {
        let id = self.next_id;
        self.next_id += 1;
        let mut worker = Worker::new(
            id,
            self.duties.clone(),
            self.config.timeout,
            Arc::clone(&self.harvest),
        );
        worker.start()?;
        self.workers.push(worker);
        Ok(())
    }
}

impl<F> PreforkPool<DutiesFn<F>>
where
    F: FnMut() -> Result<()> + Clone + Send + 'static,
{
    /// Build a pool whose capability set is a single `execute` function.
    pub fn with_execute(config: PoolConfig, execute: F) -> Result<Self> {
        Self::new(config, DutiesFn::new(execute))
    }
}

impl<D: WorkerDuties> Drop for PreforkPool<D> {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_rejects_inverted_caps() {
        let config = PoolConfig::new().with_min_workers(5).with_max_workers(2);
        let err = PreforkPool::with_execute(config, || Ok(())).err();
        assert!(matches!(err, Some(Error::Argument(_))));
    }

    #[test]
    fn test_config_defaults() {
        let config = PoolConfig::default();
        assert!(config.timeout.is_none());
        assert!(config.min_workers.is_none());
        assert!(config.max_workers.is_none());
    }

    #[test]
    fn test_harvest_dedups_and_drains() {
        let harvest = Harvest::new();
        let pid = Pid::from_raw(4242);
        harvest.push(pid);
        harvest.push(pid);
        assert_eq!(harvest.len(), 1);
        assert_eq!(harvest.drain(), vec![pid]);
        assert!(harvest.drain().is_empty(), "drain is idempotent when empty");
    }

    #[test]
    fn test_reap_with_empty_harvest_is_noop() {
        let pool =
            PreforkPool::with_execute(PoolConfig::default(), || Ok(())).unwrap();
        pool.reap();
        pool.reap();
        assert_eq!(pool.pending_harvest(), 0);
    }
}
