//! The capability set a pool installs into each worker's child process.

use crate::error::Result;

/// What a worker's child process does.
///
/// `execute` is the unit of work driven by the heartbeat protocol; the other
/// hooks are optional lifecycle extensions. The set is cloned into every
/// worker before its fork, so state mutated inside the hooks is private to
/// that worker's child.
pub trait WorkerDuties: Clone + Send + 'static {
    /// One unit of work, invoked once per heartbeat.
    fn execute(&mut self) -> Result<()>;

    /// Invoked exactly once in the child before the first heartbeat.
    /// Errors are logged and swallowed.
    fn before_executing(&mut self) -> Result<()> {
        Ok(())
    }

    /// Invoked once in the child after the driver loop ends.
    /// Errors are logged and swallowed.
    fn after_executing(&mut self) -> Result<()> {
        Ok(())
    }

    /// Invoked in the child while it winds down after requesting a restart.
    fn hup(&mut self) {}

    /// Invoked in the child while it winds down after SIGTERM.
    fn term(&mut self) {}
}

/// Adapts a single function into a capability set whose sole member is
/// `execute`.
#[derive(Clone)]
pub struct DutiesFn<F> {
    f: F,
}

impl<F> DutiesFn<F>
where
    F: FnMut() -> Result<()> + Clone + Send + 'static,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> WorkerDuties for DutiesFn<F>
where
    F: FnMut() -> Result<()> + Clone + Send + 'static,
{
    fn execute(&mut self) -> Result<()> {
        (self.f)()
    }
}
