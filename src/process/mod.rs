//! Process Supervisor: lifecycle of the optional external command.
//!
//! The supervisor owns the child process handle. Other components interact
//! with the child only through a [`SupervisorHandle`].

mod signal;
mod spawn;
mod supervisor;

use std::io;

pub use signal::{OsSignalSender, Signal, SignalSender};
pub use spawn::{ChildProcess, CommandSpec, Spawner, TokioSpawner, WaitFuture};
pub use supervisor::{ProcessState, ProcessSupervisor, SupervisorExit, SupervisorHandle};

/// Errors produced by the Process Supervisor and signal delivery.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ProcessError {
    /// The command could not be started.
    #[error("failed to start command {program}: {source}")]
    SpawnFailed {
        /// Program that failed to start.
        program: String,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// Waiting on the child failed.
    #[error("failed to wait on command: {0}")]
    WaitFailed(#[source] io::Error),

    /// No child is currently running.
    #[error("no supervised process is running")]
    NotRunning,

    /// Signals are not supported on this platform.
    #[error("signal {0} is not supported on this platform")]
    UnsupportedSignal(Signal),

    /// `kill(2)` failed.
    #[error("failed to deliver {signal} to pid {pid}: {source}")]
    SignalDeliveryFailed {
        /// Target process.
        pid: u32,
        /// Signal being delivered.
        signal: Signal,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },

    /// A signal name did not match any known signal.
    #[error("invalid signal name: {0}")]
    InvalidSignal(String),
}
