//! Detach-and-confirm scenarios for the daemon front end.
//!
//! These fork real (grand)children out of the test process; keep them
//! serialized and bounded.

use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use nix::sys::signal::kill;

use prefork::{Daemon, DaemonConfig, Error, Phrase, StartupCommand};

fn scenario_guard() -> MutexGuard<'static, ()> {
    static LOCK: Mutex<()> = Mutex::new(());
    LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

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

#[test]
fn test_daemon_detaches_and_shuts_down() {
    let _guard = scenario_guard();
    let dir = tempfile::tempdir().unwrap();
    let config = DaemonConfig::new("long runner")
        .with_pid_dir(dir.path())
        .with_timeout(Duration::from_secs(5))
        .with_nochdir(true)
        .with_noclose(true);
    let command = StartupCommand::Callback(Box::new(|| {
        std::thread::sleep(Duration::from_secs(30));
        Ok(())
    }));

    let mut daemon = Daemon::new(config, command).unwrap();
    daemon.startup().unwrap();

    let pid = daemon.pid().expect("detached daemon has a pid");
    assert!(daemon.alive());
    assert_ne!(
        pid,
        nix::unistd::getpid(),
        "the daemon runs in a different process"
    );

    daemon.shutdown().unwrap();
    assert!(
        eventually(Duration::from_secs(5), || kill(pid, None).is_err()),
        "daemon must be gone after shutdown"
    );
}

#[test]
fn test_daemon_startup_error_is_marshalled_back() {
    let _guard = scenario_guard();
    let dir = tempfile::tempdir().unwrap();
    let logfile = dir.path().join("svc.log");
    // The phrase never appears, so only the child's error frame or the
    // timeout can end the wait.
    let config = DaemonConfig::new("failing")
        .with_pid_dir(dir.path())
        .with_logfile(&logfile)
        .with_look_for(Phrase::Literal("ready".into()))
        .with_timeout(Duration::from_secs(10))
        .with_nochdir(true)
        .with_noclose(true);
    let command = StartupCommand::Callback(Box::new(|| {
        Err(Error::Argument("refusing to start".into()))
    }));

    let mut daemon = Daemon::new(config, command).unwrap();
    let err = daemon.startup().expect_err("startup must surface the failure");
    match err {
        Error::ChildRaised { kind, message } => {
            assert_eq!(kind, "argument");
            assert!(message.contains("refusing to start"));
        }
        other => panic!("expected a reconstructed child error, got {other}"),
    }
}

#[test]
fn test_daemon_startup_times_out_without_evidence() {
    let _guard = scenario_guard();
    let dir = tempfile::tempdir().unwrap();
    let logfile = dir.path().join("quiet.log");
    let config = DaemonConfig::new("quiet")
        .with_pid_dir(dir.path())
        .with_logfile(&logfile)
        .with_look_for(Phrase::Literal("up and listening".into()))
        .with_timeout(Duration::from_secs(1))
        .with_nochdir(true)
        .with_noclose(true);
    // Healthy but silent: it never writes the phrase.
    let command = StartupCommand::Callback(Box::new(|| {
        std::thread::sleep(Duration::from_secs(30));
        Ok(())
    }));

    let mut daemon = Daemon::new(config, command).unwrap();
    let err = daemon.startup().expect_err("no evidence means no startup");
    assert!(matches!(err, Error::Timeout { .. }));

    // The timeout path escalates the silent child away.
    let pid = daemon.pid().expect("pid was recorded before the timeout");
    assert!(eventually(Duration::from_secs(5), || kill(pid, None).is_err()));
}
