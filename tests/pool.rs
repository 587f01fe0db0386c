//! End-to-end scenarios for the prefork pool.
//!
//! Every test forks real children from this process, so the scenarios are
//! serialized behind one lock and each one works inside its own scratch
//! directory.

use std::collections::BTreeSet;
use std::fs;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use nix::sys::signal::kill;
use nix::unistd::getpid;

use prefork::{PoolConfig, PreforkPool, Result, Worker, WorkerDuties};

fn scenario_guard() -> MutexGuard<'static, ()> {
    static LOCK: Mutex<()> = Mutex::new(());
    LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Poll until `check` passes or the bound elapses.
fn eventually(bound: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + bound;
    loop {
        if check() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(25));
    }
}

/// Each child drops a `<pid>.txt` marker in the scratch directory on its
/// first unit of work and removes it on the way out.
#[derive(Clone)]
struct PidMarker {
    dir: PathBuf,
    work: Duration,
}

impl PidMarker {
    fn marker(&self) -> PathBuf {
        self.dir.join(format!("{}.txt", getpid().as_raw()))
    }

    fn cleanup(&self) {
        let _ = fs::remove_file(self.marker());
    }
}

impl WorkerDuties for PidMarker {
    fn execute(&mut self) -> Result<()> {
        let marker = self.marker();
        if !marker.exists() {
            fs::write(&marker, b"alive\n")?;
        }
        std::thread::sleep(self.work);
        Ok(())
    }

    fn after_executing(&mut self) -> Result<()> {
        self.cleanup();
        Ok(())
    }

    fn hup(&mut self) {
        self.cleanup();
    }

    fn term(&mut self) {
        self.cleanup();
    }
}

fn marker_pids(dir: &std::path::Path) -> BTreeSet<i32> {
    fs::read_dir(dir)
        .map(|entries| {
            entries
                .flatten()
                .filter_map(|e| {
                    let name = e.file_name();
                    let name = name.to_string_lossy();
                    name.strip_suffix(".txt")?.parse().ok()
                })
                .collect()
        })
        .unwrap_or_default()
}

fn worker_pids<D: WorkerDuties>(pool: &PreforkPool<D>) -> BTreeSet<i32> {
    let mut pids = BTreeSet::new();
    pool.each_worker(|w| {
        if let Some(pid) = w.pid() {
            pids.insert(pid.as_raw());
        }
    });
    pids
}

#[test]
fn test_start_runs_one_child_per_slot_and_stop_clears_them() {
    let _guard = scenario_guard();
    let dir = tempfile::tempdir().unwrap();
    let duties = PidMarker {
        dir: dir.path().to_path_buf(),
        work: Duration::from_millis(200),
    };
    let config = PoolConfig::new().with_timeout(Duration::from_secs(10));
    let mut pool = PreforkPool::new(config, duties).unwrap();
    pool.start(4).unwrap();
    assert_eq!(pool.worker_count(), 4);

    // Every slot produces a marker named after its child pid.
    assert!(
        eventually(Duration::from_secs(5), || marker_pids(dir.path()).len() == 4),
        "expected 4 marker files, saw {:?}",
        marker_pids(dir.path())
    );
    assert_eq!(marker_pids(dir.path()), worker_pids(&pool));
    pool.each_worker(|w| assert!(w.alive()));

    pool.stop();

    // Children clean their markers up on the way out and none survives.
    assert!(
        eventually(Duration::from_secs(5), || marker_pids(dir.path()).is_empty()),
        "markers left behind: {:?}",
        marker_pids(dir.path())
    );
    pool.each_worker(|w| assert!(!w.alive()));
    assert_eq!(pool.pending_harvest(), 0);
}

#[test]
fn test_hup_replaces_the_child_in_its_slot() {
    let _guard = scenario_guard();
    let dir = tempfile::tempdir().unwrap();
    let duties = PidMarker {
        dir: dir.path().to_path_buf(),
        work: Duration::from_millis(50),
    };
    let config = PoolConfig::new().with_timeout(Duration::from_secs(10));
    let mut pool = PreforkPool::new(config, duties).unwrap();
    pool.start(2).unwrap();

    assert!(eventually(Duration::from_secs(5), || {
        pool.workers().iter().all(Worker::alive)
    }));
    let original = pool.workers()[1].pid().expect("slot 1 has a child");

    pool.workers()[1].signal("HUP").unwrap();

    // The slot gets a fresh child with a different pid.
    assert!(
        eventually(Duration::from_secs(10), || {
            pool.reap();
            pool.workers()[1].pid().is_some_and(|pid| pid != original)
        }),
        "slot 1 kept pid {original}"
    );
    assert_eq!(pool.worker_count(), 2, "replacement must not change the size");
    assert!(eventually(Duration::from_secs(5), || {
        pool.workers()[1].alive()
    }));

    // The original child is fully gone once reaped.
    assert!(eventually(Duration::from_secs(5), || {
        pool.reap();
        kill(original, None).is_err()
    }));

    pool.stop();
}

#[test]
fn test_add_workers_respects_the_cap() {
    let _guard = scenario_guard();
    let dir = tempfile::tempdir().unwrap();
    let duties = PidMarker {
        dir: dir.path().to_path_buf(),
        work: Duration::from_millis(100),
    };
    let config = PoolConfig::new()
        .with_timeout(Duration::from_secs(10))
        .with_max_workers(3);
    let mut pool = PreforkPool::new(config, duties).unwrap();
    pool.start(2).unwrap();

    let added = pool.add_workers(2).unwrap();
    assert_eq!(added, 1);
    assert_eq!(pool.worker_count(), 3);

    assert_eq!(pool.add_workers(5).unwrap(), 0);
    assert_eq!(pool.worker_count(), 3);

    pool.stop();
}

#[test]
fn test_ensure_pool_size_reaches_the_floor() {
    let _guard = scenario_guard();
    let dir = tempfile::tempdir().unwrap();
    let duties = PidMarker {
        dir: dir.path().to_path_buf(),
        work: Duration::from_millis(100),
    };
    let config = PoolConfig::new()
        .with_timeout(Duration::from_secs(10))
        .with_min_workers(3);
    let mut pool = PreforkPool::new(config, duties).unwrap();
    pool.start(1).unwrap();
    assert_eq!(pool.worker_count(), 1);

    let added = pool.ensure_worker_pool_size().unwrap();
    assert_eq!(added, 2);
    assert_eq!(pool.worker_count(), 3);
    assert!(eventually(Duration::from_secs(5), || {
        pool.workers().iter().filter(|w| w.alive()).count() == 3
    }));

    // Already at the floor: nothing more to do.
    assert_eq!(pool.ensure_worker_pool_size().unwrap(), 0);

    pool.stop();
}

#[test]
fn test_slow_execute_records_timeout_and_child_is_removed() {
    let _guard = scenario_guard();
    let dir = tempfile::tempdir().unwrap();
    let duties = PidMarker {
        dir: dir.path().to_path_buf(),
        // Far beyond the heartbeat timeout below.
        work: Duration::from_secs(30),
    };
    let config = PoolConfig::new().with_timeout(Duration::from_secs(1));
    let mut pool = PreforkPool::new(config, duties).unwrap();
    pool.start(2).unwrap();

    // Every worker records a timeout visible through the error iterator.
    assert!(
        eventually(Duration::from_secs(5), || {
            let mut labels = Vec::new();
            pool.errors(|w| labels.extend(w.error_label()));
            labels.len() == 2 && labels.iter().all(|&l| l == "timeout")
        }),
        "expected two timeout errors"
    );

    // The wedged children are escalated away.
    assert!(eventually(Duration::from_secs(5), || {
        pool.workers().iter().all(|w| !w.alive())
    }));

    pool.stop();
    assert_eq!(pool.pending_harvest(), 0);
}

#[test]
fn test_prune_drops_dead_workers() {
    let _guard = scenario_guard();
    let dir = tempfile::tempdir().unwrap();
    let duties = PidMarker {
        dir: dir.path().to_path_buf(),
        work: Duration::from_secs(30),
    };
    let config = PoolConfig::new().with_timeout(Duration::from_millis(500));
    let mut pool = PreforkPool::new(config, duties).unwrap();
    pool.start(2).unwrap();

    // Wait for supervision to give up on both, then prune the corpses.
    assert!(eventually(Duration::from_secs(5), || {
        pool.reap();
        pool.workers().iter().all(|w| !w.alive())
    }));
    pool.prune_workers();
    assert_eq!(pool.worker_count(), 0);

    pool.stop();
}

#[test]
fn test_pool_from_single_execute_function() {
    let _guard = scenario_guard();
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("ran.txt");
    let config = PoolConfig::new().with_timeout(Duration::from_secs(10));
    let mut pool = PreforkPool::with_execute(config, move || {
        if !marker.exists() {
            fs::write(&marker, b"x")?;
        }
        std::thread::sleep(Duration::from_millis(100));
        Ok(())
    })
    .unwrap();
    pool.start(1).unwrap();

    assert!(eventually(Duration::from_secs(5), || {
        dir.path().join("ran.txt").exists()
    }));

    pool.stop();
    pool.each_worker(|w| assert!(!w.alive()));
}
