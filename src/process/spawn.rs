//! Process spawning capability.

use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::process::{ExitStatus, Stdio};

use tokio::process::{Child, Command};

/// Boxed future returned by [`ChildProcess::wait`].
pub type WaitFuture<'a> = Pin<Box<dyn Future<Output = io::Result<i32>> + Send + 'a>>;

/// What to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    /// Executable path or name resolved through `PATH`.
    pub program: String,
    /// Argument vector, excluding the program.
    pub args: Vec<String>,
    /// Whether the child inherits the helper's standard input.
    ///
    /// When unset the child's standard input is empty.
    pub attach_stdin: bool,
}

/// Launches child processes.
pub trait Spawner: Send + Sync + fmt::Debug {
    /// Starts `spec`.
    ///
    /// # Errors
    ///
    /// Returns the I/O error if the executable cannot be found or launched.
    fn spawn(&self, spec: &CommandSpec) -> io::Result<Box<dyn ChildProcess>>;
}

/// A running child process.
pub trait ChildProcess: Send + fmt::Debug {
    /// OS process identifier.
    fn pid(&self) -> u32;

    /// Waits for the child to exit and returns its exit code.
    ///
    /// A child terminated by a signal reports `128 + signal number`.
    fn wait(&mut self) -> WaitFuture<'_>;

    /// Forcibly terminates the child without waiting.
    ///
    /// # Errors
    ///
    /// Returns the I/O error if the kill request fails.
    fn start_kill(&mut self) -> io::Result<()>;
}

/// Spawns real processes with `tokio::process`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSpawner;

impl Spawner for TokioSpawner {
    fn spawn(&self, spec: &CommandSpec) -> io::Result<Box<dyn ChildProcess>> {
        let stdin = if spec.attach_stdin {
            Stdio::inherit()
        } else {
            Stdio::null()
        };

        let child = Command::new(&spec.program)
            .args(&spec.args)
            .stdin(stdin)
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;

        let pid = child.id().unwrap_or_default();
        Ok(Box::new(TokioChild { child, pid }))
    }
}

#[derive(Debug)]
struct TokioChild {
    child: Child,
    pid: u32,
}

impl ChildProcess for TokioChild {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn wait(&mut self) -> WaitFuture<'_> {
        Box::pin(async move {
            let status = self.child.wait().await?;
            Ok(exit_code(status))
        })
    }

    fn start_kill(&mut self) -> io::Result<()> {
        self.child.start_kill()
    }
}

/// Maps an exit status to a shell-style exit code.
pub(crate) fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt as _;
        if let Some(signo) = status.signal() {
            return 128 + signo;
        }
    }

    1
}

#[cfg(all(test, unix))]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn sh(script: &str) -> CommandSpec {
        CommandSpec {
            program: "sh".into(),
            args: vec!["-c".into(), script.into()],
            attach_stdin: false,
        }
    }

    #[tokio::test]
    async fn reports_exit_code() {
        let mut child = TokioSpawner.spawn(&sh("exit 7")).unwrap();
        assert!(child.pid() > 0);
        assert_eq!(child.wait().await.unwrap(), 7);
    }

    #[tokio::test]
    async fn reports_signal_as_128_plus_signo() {
        let mut child = TokioSpawner.spawn(&sh("kill -TERM $$")).unwrap();
        assert_eq!(child.wait().await.unwrap(), 128 + libc::SIGTERM);
    }

    #[tokio::test]
    async fn stdin_is_empty_when_not_attached() {
        let mut child = TokioSpawner
            .spawn(&sh("if read line; then exit 1; else exit 0; fi"))
            .unwrap();
        assert_eq!(child.wait().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn missing_executable_fails_to_spawn() {
        let spec = CommandSpec {
            program: "/nonexistent/spiffe-helper-test-binary".into(),
            args: vec![],
            attach_stdin: false,
        };
        assert!(TokioSpawner.spawn(&spec).is_err());
    }
}
