//! Process-wide signal dispatch.
//!
//! Signal handlers are a shared process resource, so one handler per signal
//! is installed for the whole process; it only sets an atomic flag. Run
//! loops consume the flags between iterations (or when a bounded wait
//! returns `Error::Interrupted`). `reset` clears flags and restores default
//! dispositions so test scenarios stay isolated.

use std::sync::atomic::{AtomicBool, Ordering};

use nix::libc::c_int;
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};

use crate::error::{Error, Result};

static HUP_PENDING: AtomicBool = AtomicBool::new(false);
static INT_PENDING: AtomicBool = AtomicBool::new(false);
static TERM_PENDING: AtomicBool = AtomicBool::new(false);
static USR1_PENDING: AtomicBool = AtomicBool::new(false);
static USR2_PENDING: AtomicBool = AtomicBool::new(false);

fn flag_for(signal: Signal) -> Result<&'static AtomicBool> {
    match signal {
        Signal::SIGHUP => Ok(&HUP_PENDING),
        Signal::SIGINT => Ok(&INT_PENDING),
        Signal::SIGTERM => Ok(&TERM_PENDING),
        Signal::SIGUSR1 => Ok(&USR1_PENDING),
        Signal::SIGUSR2 => Ok(&USR2_PENDING),
        other => Err(Error::Argument(format!(
            "no flag registered for signal {other:?}"
        ))),
    }
}

extern "C" fn note_signal(signo: c_int) {
    // Async-signal-safe: a store into a static atomic, nothing else.
    match Signal::try_from(signo) {
        Ok(Signal::SIGHUP) => HUP_PENDING.store(true, Ordering::Release),
        Ok(Signal::SIGINT) => INT_PENDING.store(true, Ordering::Release),
        Ok(Signal::SIGTERM) => TERM_PENDING.store(true, Ordering::Release),
        Ok(Signal::SIGUSR1) => USR1_PENDING.store(true, Ordering::Release),
        Ok(Signal::SIGUSR2) => USR2_PENDING.store(true, Ordering::Release),
        _ => {}
    }
}

/// Install flag-setting handlers for the given signals.
///
/// SA_RESTART is deliberately not set: a pending signal interrupts bounded
/// waits (EINTR) so the observing loop notices promptly.
pub fn install(signals: &[Signal]) -> Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(note_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    for &sig in signals {
        flag_for(sig)?;
        unsafe { sigaction(sig, &action) }?;
    }
    Ok(())
}

/// Ignore SIGPIPE so pipe errors surface as `EPIPE` from the write instead.
pub fn ignore_sigpipe() -> Result<()> {
    let action = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
    unsafe { sigaction(Signal::SIGPIPE, &action) }?;
    Ok(())
}

/// Whether the signal has fired since the flag was last taken.
pub fn pending(signal: Signal) -> bool {
    flag_for(signal).map(|f| f.load(Ordering::Acquire)).unwrap_or(false)
}

/// Consume the flag: true exactly once per delivery burst.
pub fn take(signal: Signal) -> bool {
    flag_for(signal)
        .map(|f| f.swap(false, Ordering::AcqRel))
        .unwrap_or(false)
}

/// Clear all flags and restore default dispositions for the managed signals.
pub fn reset() -> Result<()> {
    for flag in [
        &HUP_PENDING,
        &INT_PENDING,
        &TERM_PENDING,
        &USR1_PENDING,
        &USR2_PENDING,
    ] {
        flag.store(false, Ordering::Release);
    }
    let default = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
    for sig in [
        Signal::SIGHUP,
        Signal::SIGINT,
        Signal::SIGTERM,
        Signal::SIGUSR1,
        Signal::SIGUSR2,
    ] {
        unsafe { sigaction(sig, &default) }?;
    }
    Ok(())
}

/// Serializes tests that touch process-wide signal dispositions.
#[cfg(test)]
pub(crate) fn test_guard() -> std::sync::MutexGuard<'static, ()> {
    static LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
    LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::signal::kill;
    use nix::unistd::getpid;

    #[test]
    fn test_flag_set_and_taken_once() {
        let _guard = test_guard();
        install(&[Signal::SIGUSR2]).unwrap();
        assert!(!pending(Signal::SIGUSR2));

        kill(getpid(), Signal::SIGUSR2).unwrap();
        // Delivery is to this process; give the kernel a beat.
        for _ in 0..100 {
            if pending(Signal::SIGUSR2) {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        assert!(take(Signal::SIGUSR2));
        assert!(!take(Signal::SIGUSR2), "the flag is consumed exactly once");
        reset().unwrap();
    }

    #[test]
    fn test_unmanaged_signal_rejected() {
        let err = install(&[Signal::SIGALRM]).unwrap_err();
        assert!(matches!(err, Error::Argument(_)));
    }
}
