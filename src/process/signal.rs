//! OS signals sent to the supervised command or to a PID-file process.

use std::fmt;
use std::str::FromStr;

use super::ProcessError;

/// A POSIX signal the helper knows how to deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Signal {
    /// `SIGHUP`
    Hup,
    /// `SIGINT`
    Int,
    /// `SIGQUIT`
    Quit,
    /// `SIGABRT`
    Abrt,
    /// `SIGKILL`
    Kill,
    /// `SIGUSR1`
    Usr1,
    /// `SIGUSR2`
    Usr2,
    /// `SIGPIPE`
    Pipe,
    /// `SIGALRM`
    Alrm,
    /// `SIGTERM`
    Term,
    /// `SIGCONT`
    Cont,
    /// `SIGSTOP`
    Stop,
    /// `SIGWINCH`
    Winch,
}

const ALL: [Signal; 13] = [
    Signal::Hup,
    Signal::Int,
    Signal::Quit,
    Signal::Abrt,
    Signal::Kill,
    Signal::Usr1,
    Signal::Usr2,
    Signal::Pipe,
    Signal::Alrm,
    Signal::Term,
    Signal::Cont,
    Signal::Stop,
    Signal::Winch,
];

impl Signal {
    /// Canonical name, e.g. `SIGHUP`.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Hup => "SIGHUP",
            Self::Int => "SIGINT",
            Self::Quit => "SIGQUIT",
            Self::Abrt => "SIGABRT",
            Self::Kill => "SIGKILL",
            Self::Usr1 => "SIGUSR1",
            Self::Usr2 => "SIGUSR2",
            Self::Pipe => "SIGPIPE",
            Self::Alrm => "SIGALRM",
            Self::Term => "SIGTERM",
            Self::Cont => "SIGCONT",
            Self::Stop => "SIGSTOP",
            Self::Winch => "SIGWINCH",
        }
    }

    /// Platform signal number, or `None` where signals are not supported.
    #[cfg(unix)]
    pub fn number(self) -> Option<i32> {
        Some(match self {
            Self::Hup => libc::SIGHUP,
            Self::Int => libc::SIGINT,
            Self::Quit => libc::SIGQUIT,
            Self::Abrt => libc::SIGABRT,
            Self::Kill => libc::SIGKILL,
            Self::Usr1 => libc::SIGUSR1,
            Self::Usr2 => libc::SIGUSR2,
            Self::Pipe => libc::SIGPIPE,
            Self::Alrm => libc::SIGALRM,
            Self::Term => libc::SIGTERM,
            Self::Cont => libc::SIGCONT,
            Self::Stop => libc::SIGSTOP,
            Self::Winch => libc::SIGWINCH,
        })
    }

    /// Platform signal number, or `None` where signals are not supported.
    #[cfg(not(unix))]
    pub fn number(self) -> Option<i32> {
        None
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Signal {
    type Err = ProcessError;

    /// Parses `SIGHUP`, `sighup` or `HUP`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        let name = upper.strip_prefix("SIG").unwrap_or(&upper);

        ALL.into_iter()
            .find(|signal| &signal.as_str()[3..] == name)
            .ok_or_else(|| ProcessError::InvalidSignal(s.to_owned()))
    }
}

/// Capability to deliver a signal to an arbitrary PID.
pub trait SignalSender: Send + Sync + fmt::Debug {
    /// Delivers `signal` to `pid`.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessError::UnsupportedSignal`] on platforms without
    /// signals and [`ProcessError::SignalDeliveryFailed`] if delivery fails.
    fn send(&self, pid: u32, signal: Signal) -> Result<(), ProcessError>;
}

/// Delivers signals with `kill(2)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsSignalSender;

impl SignalSender for OsSignalSender {
    #[cfg(unix)]
    fn send(&self, pid: u32, signal: Signal) -> Result<(), ProcessError> {
        let signo = signal
            .number()
            .ok_or(ProcessError::UnsupportedSignal(signal))?;

        // 0 and negative values address process groups.
        let target = i32::try_from(pid)
            .ok()
            .filter(|p| *p > 0)
            .ok_or_else(|| ProcessError::SignalDeliveryFailed {
                pid,
                signal,
                source: std::io::Error::from(std::io::ErrorKind::InvalidInput),
            })?;

        // SAFETY: kill(2) has no memory-safety preconditions.
        let rc = unsafe { libc::kill(target, signo) };
        if rc == 0 {
            Ok(())
        } else {
            Err(ProcessError::SignalDeliveryFailed {
                pid,
                signal,
                source: std::io::Error::last_os_error(),
            })
        }
    }

    #[cfg(not(unix))]
    fn send(&self, _pid: u32, signal: Signal) -> Result<(), ProcessError> {
        Err(ProcessError::UnsupportedSignal(signal))
    }
}
