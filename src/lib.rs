//! prefork - building blocks for UNIX service processes.
//!
//! The core is a prefork worker pool with heartbeat supervision
//! ([`PreforkPool`]) and the two substrates it stands on: the [`Piper`], a
//! framed object channel across a fork boundary, and the [`ThreadedRunner`],
//! a cooperative run loop with lifecycle hooks. Around them sit the usual
//! daemon mechanics: [`PidFile`], [`Server`], [`Daemon`], and the
//! kill-escalating [`Child`] command runner.
//!
//! # Architecture
//!
//! ```text
//!                   ┌──────────────────┐
//!                   │  Parent Process  │
//!                   │  (PreforkPool)   │
//!                   └────────┬─────────┘
//!            supervisor thread per worker slot
//!            ┌───────────────┼───────────────┐
//!      ┌─────▼─────┐   ┌─────▼─────┐   ┌─────▼─────┐
//!      │ Worker 0  │   │ Worker 1  │   │ Worker N  │
//!      │ (process) │   │ (process) │   │ (process) │
//!      └───────────┘   └───────────┘   └───────────┘
//! ```
//!
//! Each worker slot holds one forked child running the pool's capability set
//! ([`WorkerDuties`]) under a heartbeat protocol. A child that receives
//! SIGHUP asks its supervisor for a replacement; a child that overruns the
//! heartbeat timeout is recorded as failed and escalated away. The pool only
//! ever reports worker failures through [`PreforkPool::errors`]; it never
//! raises for them.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use prefork::{PoolConfig, PreforkPool};
//!
//! let config = PoolConfig::new()
//!     .with_timeout(Duration::from_secs(30))
//!     .with_max_workers(8);
//! let mut pool = PreforkPool::with_execute(config, || {
//!     // one unit of work per heartbeat, inside the child process
//!     Ok(())
//! })?;
//! pool.start(4)?;
//! // ...
//! pool.stop();
//! # Ok::<(), prefork::Error>(())
//! ```
//!
//! POSIX only: everything here assumes `fork` and signals.

mod child;
mod daemon;
mod error;
pub mod logging;
mod pidfile;
mod piper;
mod pool;
mod runner;
mod server;
pub mod signals;

pub use child::{Child, ChildConfig};
pub use daemon::{Daemon, DaemonConfig, LogfileReader, Phrase, StartupCommand};
pub use error::{Error, Result};
pub use pidfile::PidFile;
pub use piper::{Frame, IntoSignal, Mode, Piper, WireError};
pub use pool::{DutiesFn, PoolConfig, PreforkPool, Worker, WorkerDuties};
pub use runner::{Activity, Flow, LoopConfig, ThreadedRunner};
pub use server::{Server, ServerConfig, ServerHooks};

/// Whether this platform supports `fork`. Every fork-dependent constructor
/// fails early on platforms where this is false.
pub const fn fork_supported() -> bool {
    cfg!(unix)
}
