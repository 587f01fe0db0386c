//! PID-file management for long-running processes.

use std::fs;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use nix::sys::signal::kill;
use nix::unistd::Pid;
use tracing::{debug, warn};

use crate::error::Result;
use crate::piper::IntoSignal;

/// Default permission bits for the PID file.
const DEFAULT_MODE: u32 = 0o640;

/// Writes the current PID to a file derived from a program name.
///
/// The file name is the program name lowercased with spaces turned into
/// underscores plus a `.pid` suffix, joined to the configured directory.
pub struct PidFile {
    name: String,
    dir: PathBuf,
    mode: u32,
    written: Option<Pid>,
}

impl PidFile {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dir: PathBuf::from("."),
            mode: DEFAULT_MODE,
            written: None,
        }
    }

    /// Directory the PID file lives in. Defaults to the current directory.
    pub fn with_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = dir.into();
        self
    }

    /// Permission bits for the file. Defaults to `0o640`.
    pub fn with_mode(mut self, mode: u32) -> Self {
        self.mode = mode;
        self
    }

    /// Full path of the PID file.
    pub fn path(&self) -> PathBuf {
        let file = format!("{}.pid", self.name.to_lowercase().replace(' ', "_"));
        self.dir.join(file)
    }

    /// Write the current process's PID.
    pub fn write(&mut self) -> Result<()> {
        let pid = nix::unistd::getpid();
        let path = self.path();
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(self.mode)
            .open(&path)?;
        writeln!(file, "{}", pid.as_raw())?;
        self.written = Some(pid);
        debug!(path = %path.display(), pid = pid.as_raw(), "wrote pid file");
        Ok(())
    }

    /// The recorded PID, or the one read back from disk.
    pub fn pid(&self) -> Option<Pid> {
        self.written.or_else(|| read_pid(&self.path()))
    }

    /// Remove the file only if it still holds this process's PID; another
    /// process's file is left intact.
    pub fn delete(&mut self) -> Result<()> {
        let mine = nix::unistd::getpid();
        match read_pid(&self.path()) {
            Some(on_disk) if on_disk == mine => self.delete_unchecked(),
            Some(on_disk) => {
                warn!(
                    path = %self.path().display(),
                    on_disk = on_disk.as_raw(),
                    "pid file belongs to another process, leaving it"
                );
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Remove the file unconditionally.
    pub fn delete_unchecked(&mut self) -> Result<()> {
        match fs::remove_file(self.path()) {
            Ok(()) => {
                self.written = None;
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Whether the recorded process exists (signal 0 probe).
    pub fn alive(&self) -> bool {
        match self.pid() {
            Some(pid) => kill(pid, None).is_ok(),
            None => false,
        }
    }

    /// Deliver a signal to the recorded PID.
    pub fn kill<S: IntoSignal>(&self, sig: S) -> Result<()> {
        if let Some(pid) = self.pid() {
            kill(pid, sig.into_signal()?)?;
        }
        Ok(())
    }

    /// Whether the file exists on disk.
    pub fn exists(&self) -> bool {
        self.path().exists()
    }
}

fn read_pid(path: &Path) -> Option<Pid> {
    let contents = fs::read_to_string(path).ok()?;
    let raw: i32 = contents.trim().parse().ok()?;
    Some(Pid::from_raw(raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filename_derivation() {
        let pf = PidFile::new("My Daemon Name").with_dir("/var/run");
        assert_eq!(pf.path(), PathBuf::from("/var/run/my_daemon_name.pid"));
    }

    #[test]
    fn test_write_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut pf = PidFile::new("roundtrip").with_dir(dir.path());
        pf.write().unwrap();
        assert!(pf.exists());
        assert_eq!(pf.pid(), Some(nix::unistd::getpid()));

        // A second reader sees the same pid from disk.
        let other = PidFile::new("roundtrip").with_dir(dir.path());
        assert_eq!(other.pid(), Some(nix::unistd::getpid()));
        assert!(other.alive());
    }

    #[test]
    fn test_delete_removes_own_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut pf = PidFile::new("mine").with_dir(dir.path());
        pf.write().unwrap();
        pf.delete().unwrap();
        assert!(!pf.exists());
    }

    #[test]
    fn test_delete_leaves_foreign_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut pf = PidFile::new("foreign").with_dir(dir.path());
        // Simulate another process's file.
        fs::write(pf.path(), "1\n").unwrap();
        pf.delete().unwrap();
        assert!(pf.exists(), "a foreign pid file must survive delete");
        pf.delete_unchecked().unwrap();
        assert!(!pf.exists());
    }

    #[test]
    fn test_mode_is_applied() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let mut pf = PidFile::new("moded").with_dir(dir.path()).with_mode(0o600);
        pf.write().unwrap();
        let mode = fs::metadata(pf.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_missing_file_reports_no_pid() {
        let dir = tempfile::tempdir().unwrap();
        let pf = PidFile::new("absent").with_dir(dir.path());
        assert!(pf.pid().is_none());
        assert!(!pf.alive());
    }
}
