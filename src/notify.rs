//! Reload Notifier: tells the consuming process that new credentials landed.
//!
//! Two mutually exclusive mechanisms exist: signaling the supervised child
//! directly, or signaling whatever PID an external PID file names. With
//! neither configured, notification is a successful no-op.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::RotationConfig;
use crate::credential::CredentialKind;
use crate::prelude::debug;
use crate::process::{OsSignalSender, ProcessError, Signal, SignalSender, SupervisorHandle};

/// Errors reading a PID file.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum PidFileError {
    /// The file could not be read.
    #[error("failed to read pid file {}: {source}", path.display())]
    Read {
        /// PID file path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// The file does not hold a positive process id.
    #[error("pid file {} does not contain a valid pid: {contents:?}", path.display())]
    Malformed {
        /// PID file path.
        path: PathBuf,
        /// What the file contained, trimmed.
        contents: String,
    },
}

/// Errors delivering a reload notification. Never fatal.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum NotifyError {
    /// The PID file could not be used.
    #[error(transparent)]
    PidFile(#[from] PidFileError),

    /// The signal could not be delivered.
    #[error(transparent)]
    Signal(#[from] ProcessError),
}

/// Capability to signal a process discovered through a PID file.
pub trait PidSignaler: Send + Sync + fmt::Debug {
    /// Reads the current PID.
    ///
    /// # Errors
    ///
    /// Returns [`PidFileError`] if the file is unreadable or malformed.
    fn read_pid(&self) -> Result<u32, PidFileError>;

    /// Delivers `signal` to `pid`.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessError`] if delivery fails or is unsupported.
    fn signal(&self, pid: u32, signal: Signal) -> Result<(), ProcessError>;
}

/// Reads the PID from a file on every call and signals it through the OS.
#[derive(Debug, Clone)]
pub struct PidFileSignaler {
    path: PathBuf,
    sender: Arc<dyn SignalSender>,
}

impl PidFileSignaler {
    /// Signals through [`OsSignalSender`].
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_sender(path, Arc::new(OsSignalSender))
    }

    /// Signals through `sender`.
    pub fn with_sender(path: impl Into<PathBuf>, sender: Arc<dyn SignalSender>) -> Self {
        Self {
            path: path.into(),
            sender,
        }
    }

    /// The PID file path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl PidSignaler for PidFileSignaler {
    fn read_pid(&self) -> Result<u32, PidFileError> {
        let raw = fs::read_to_string(&self.path).map_err(|source| PidFileError::Read {
            path: self.path.clone(),
            source,
        })?;
        parse_pid(&raw).ok_or_else(|| PidFileError::Malformed {
            path: self.path.clone(),
            contents: raw.trim().to_owned(),
        })
    }

    fn signal(&self, pid: u32, signal: Signal) -> Result<(), ProcessError> {
        self.sender.send(pid, signal)
    }
}

fn parse_pid(raw: &str) -> Option<u32> {
    raw.trim().parse::<u32>().ok().filter(|pid| *pid > 0)
}

/// How renewals are announced.
#[derive(Debug, Clone)]
pub enum ReloadMechanism {
    /// Write-only mode; consumers watch the filesystem.
    Disabled,
    /// Signal the supervised child.
    ChildSignal(Signal),
    /// Signal the PID named by a PID file.
    PidFile {
        /// Reads the PID and delivers the signal.
        signaler: Arc<dyn PidSignaler>,
        /// Signal to deliver.
        signal: Signal,
    },
}

impl ReloadMechanism {
    /// Picks the mechanism for `config`.
    ///
    /// A PID file wins over the supervised child. Without a renew signal
    /// there is nothing to deliver.
    pub fn from_config(config: &RotationConfig) -> Self {
        Self::from_config_with(config, |path| Arc::new(PidFileSignaler::new(path)))
    }

    /// Like [`from_config`](Self::from_config) with a custom PID signaler.
    pub fn from_config_with<F>(config: &RotationConfig, make_signaler: F) -> Self
    where
        F: FnOnce(&Path) -> Arc<dyn PidSignaler>,
    {
        let Some(signal) = config.renew_signal else {
            return Self::Disabled;
        };
        match (&config.pid_file_name, &config.command) {
            (Some(path), _) => Self::PidFile {
                signaler: make_signaler(path),
                signal,
            },
            (None, Some(_)) => Self::ChildSignal(signal),
            (None, None) => Self::Disabled,
        }
    }
}

/// Result of a notification attempt that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyOutcome {
    /// Nothing was signaled.
    Skipped,
    /// The signal was delivered to `pid`.
    Signaled {
        /// Receiving process.
        pid: u32,
    },
}

/// Delivers the configured reload notification after a successful write.
#[derive(Debug, Clone)]
pub struct ReloadNotifier {
    mechanism: ReloadMechanism,
    child: Option<SupervisorHandle>,
}

impl ReloadNotifier {
    /// Creates a notifier. `child` is the supervised command, if any.
    pub fn new(mechanism: ReloadMechanism, child: Option<SupervisorHandle>) -> Self {
        Self { mechanism, child }
    }

    /// A notifier that never signals.
    pub fn disabled() -> Self {
        Self::new(ReloadMechanism::Disabled, None)
    }

    /// The configured mechanism.
    pub fn mechanism(&self) -> &ReloadMechanism {
        &self.mechanism
    }

    /// Announces that `kind` was rewritten.
    ///
    /// A child that is not running and platforms without signals yield
    /// [`NotifyOutcome::Skipped`].
    ///
    /// # Errors
    ///
    /// Returns [`NotifyError`] if the PID file is unusable or delivery fails.
    pub fn notify(&self, kind: CredentialKind) -> Result<NotifyOutcome, NotifyError> {
        let outcome = match &self.mechanism {
            ReloadMechanism::Disabled => Ok(NotifyOutcome::Skipped),
            ReloadMechanism::ChildSignal(signal) => self.signal_child(*signal),
            ReloadMechanism::PidFile { signaler, signal } => {
                let pid = signaler.read_pid()?;
                skip_unsupported(signaler.signal(pid, *signal).map(|()| pid))
            }
        }?;

        if let NotifyOutcome::Signaled { pid } = outcome {
            debug!("Sent renew signal: kind={kind}, pid={pid}");
        }
        Ok(outcome)
    }

    fn signal_child(&self, signal: Signal) -> Result<NotifyOutcome, NotifyError> {
        let Some(child) = &self.child else {
            return Ok(NotifyOutcome::Skipped);
        };
        match child.signal(signal) {
            Err(ProcessError::NotRunning) => Ok(NotifyOutcome::Skipped),
            other => skip_unsupported(other),
        }
    }
}

fn skip_unsupported(result: Result<u32, ProcessError>) -> Result<NotifyOutcome, NotifyError> {
    match result {
        Ok(pid) => Ok(NotifyOutcome::Signaled { pid }),
        Err(ProcessError::UnsupportedSignal(signal)) => {
            debug!("Renew signal unsupported on this platform; skipping: signal={signal}");
            Ok(NotifyOutcome::Skipped)
        }
        Err(e) => Err(e.into()),
    }
}
