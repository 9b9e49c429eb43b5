use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;

use super::signal::{Signal, SignalSender};
use super::spawn::{ChildProcess, CommandSpec, Spawner};
use super::ProcessError;
use crate::backoff::{
    self, BackoffConfig, BackoffStrategy, ErrorKey, ErrorTracker, MAX_CONSECUTIVE_SAME_ERROR,
};
use crate::config::CommandConfig;
use crate::prelude::{debug, info, warn};
use crate::writer::{write_atomic, WriteTarget};

const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);
const TRANSITION_CAPACITY: usize = 64;
const PID_FILE_MODE: u32 = 0o644;

/// Lifecycle state of the supervised command.
///
/// `NotStarted -> Starting -> Running -> Exited -> (Restarting -> Starting | Terminated)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// The supervisor has not run yet.
    NotStarted,
    /// A spawn is in progress.
    Starting,
    /// The child is alive.
    Running {
        /// OS process identifier of the child.
        pid: u32,
    },
    /// The child exited.
    Exited {
        /// Exit code, `128 + signal` if the child was killed by a signal.
        code: i32,
    },
    /// Waiting out the restart backoff.
    Restarting {
        /// Number of restarts so far, starting at 1.
        attempt: u32,
    },
    /// The supervisor stopped and will not restart the child.
    Terminated,
}

impl ProcessState {
    /// The child's PID when running.
    pub fn pid(self) -> Option<u32> {
        match self {
            Self::Running { pid } => Some(pid),
            _ => None,
        }
    }
}

/// How the supervisor loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorExit {
    /// The child exited and its exit code must become the helper's exit code.
    ForwardExitCode(i32),
    /// The supervisor was cancelled and shut the child down.
    Terminated,
}

/// Read access to the supervisor state plus signal delivery to the child.
#[derive(Debug, Clone)]
pub struct SupervisorHandle {
    state: watch::Receiver<ProcessState>,
    signals: Arc<dyn SignalSender>,
}

impl SupervisorHandle {
    /// Current state.
    pub fn state(&self) -> ProcessState {
        *self.state.borrow()
    }

    /// PID of the running child.
    pub fn pid(&self) -> Option<u32> {
        self.state().pid()
    }

    /// A receiver that observes every state change.
    pub fn subscribe(&self) -> watch::Receiver<ProcessState> {
        self.state.clone()
    }

    /// Delivers `signal` to the running child and returns its PID.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessError::NotRunning`] if no child is alive, otherwise
    /// whatever the [`SignalSender`] reports.
    pub fn signal(&self, signal: Signal) -> Result<u32, ProcessError> {
        let pid = self.pid().ok_or(ProcessError::NotRunning)?;
        self.signals.send(pid, signal)?;
        Ok(pid)
    }
}

/// Runs one external command, restarting it on exit or forwarding its exit code.
#[derive(Debug)]
pub struct ProcessSupervisor {
    spec: CommandSpec,
    forward_exit_code: bool,
    pid_file: Option<PathBuf>,
    shutdown_grace: Duration,
    spawner: Arc<dyn Spawner>,
    signals: Arc<dyn SignalSender>,
    backoff: Box<dyn BackoffStrategy>,
    state_tx: watch::Sender<ProcessState>,
    transitions: broadcast::Sender<ProcessState>,
}

impl ProcessSupervisor {
    /// Creates a supervisor that restarts `spec` with the default restart backoff.
    pub fn new(
        spec: CommandSpec,
        spawner: Arc<dyn Spawner>,
        signals: Arc<dyn SignalSender>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ProcessState::NotStarted);
        let (transitions, _) = broadcast::channel(TRANSITION_CAPACITY);
        Self {
            spec,
            forward_exit_code: false,
            pid_file: None,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            spawner,
            signals,
            backoff: backoff::restart_strategy(BackoffConfig::RESTART),
            state_tx,
            transitions,
        }
    }

    /// Creates a supervisor from the command section of the configuration.
    pub fn from_config(
        command: &CommandConfig,
        spawner: Arc<dyn Spawner>,
        signals: Arc<dyn SignalSender>,
    ) -> Self {
        Self::new(command.spec(), spawner, signals)
            .forward_exit_code(command.forward_exit_code)
            .pid_file(command.pid_file.clone())
            .shutdown_grace(command.shutdown_grace)
            .backoff(backoff::restart_strategy(command.restart_backoff))
    }

    /// Stop after the first exit and report the child's exit code.
    #[must_use]
    pub fn forward_exit_code(mut self, forward: bool) -> Self {
        self.forward_exit_code = forward;
        self
    }

    /// Write the child's PID to this file after every start.
    #[must_use]
    pub fn pid_file(mut self, path: Option<PathBuf>) -> Self {
        self.pid_file = path;
        self
    }

    /// Time the child gets to exit after `SIGTERM` before it is killed.
    #[must_use]
    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Replaces the restart backoff policy.
    #[must_use]
    pub fn backoff(mut self, backoff: Box<dyn BackoffStrategy>) -> Self {
        self.backoff = backoff;
        self
    }

    /// A handle for reading state and signaling the child.
    pub fn handle(&self) -> SupervisorHandle {
        SupervisorHandle {
            state: self.state_tx.subscribe(),
            signals: Arc::clone(&self.signals),
        }
    }

    /// Receives every state transition in order.
    pub fn transitions(&self) -> broadcast::Receiver<ProcessState> {
        self.transitions.subscribe()
    }

    /// Runs the command until it must stop.
    ///
    /// Returns when the child exits under exit-code forwarding or when
    /// `cancel` fires. On cancellation the child receives `SIGTERM`, then
    /// `SIGKILL` once the shutdown grace period has elapsed.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessError::SpawnFailed`] if the first start fails, or if a
    /// restart fails under an unthrottled restart policy.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<SupervisorExit, ProcessError> {
        let result = self.supervise(&cancel).await;

        self.remove_pid_file();
        if !matches!(result, Ok(SupervisorExit::ForwardExitCode(_))) {
            self.transition(ProcessState::Terminated);
        }
        result
    }

    async fn supervise(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<SupervisorExit, ProcessError> {
        let mut attempt: u32 = 0;
        let mut tracker = ErrorTracker::new(MAX_CONSECUTIVE_SAME_ERROR);

        loop {
            if cancel.is_cancelled() {
                return Ok(SupervisorExit::Terminated);
            }

            self.transition(ProcessState::Starting);
            let mut child = match self.spawner.spawn(&self.spec) {
                Ok(child) => child,
                Err(source) => {
                    let err = ProcessError::SpawnFailed {
                        program: self.spec.program.clone(),
                        source,
                    };
                    if attempt == 0 || !self.backoff.is_throttled() {
                        return Err(err);
                    }
                    if tracker.record_error(ErrorKey::Spawn) {
                        warn!("Failed to restart command; retrying: error={}", err);
                    } else {
                        debug!(
                            "Failed to restart command (repeated); retrying: error={}, consecutive_failures={}",
                            err,
                            tracker.consecutive_count()
                        );
                    }
                    attempt += 1;
                    if self.wait_before_restart(attempt, cancel).await {
                        return Ok(SupervisorExit::Terminated);
                    }
                    continue;
                }
            };

            let pid = child.pid();
            let started = Instant::now();
            info!(
                "Started command: program={}, pid={}",
                self.spec.program, pid
            );
            self.write_pid_file(pid);
            self.transition(ProcessState::Running { pid });

            let exited = tokio::select! {
                res = child.wait() => Some(res),
                () = cancel.cancelled() => None,
            };

            let code = match exited {
                Some(Ok(code)) => code,
                Some(Err(e)) => return Err(ProcessError::WaitFailed(e)),
                None => {
                    self.shutdown_child(child.as_mut(), pid).await;
                    return Ok(SupervisorExit::Terminated);
                }
            };

            self.transition(ProcessState::Exited { code });
            self.remove_pid_file();

            if self.forward_exit_code {
                info!("Command exited; forwarding exit code: pid={}, code={}", pid, code);
                return Ok(SupervisorExit::ForwardExitCode(code));
            }

            if let Some(reset_after) = self.backoff.reset_after() {
                if started.elapsed() >= reset_after {
                    self.backoff.reset();
                    tracker.reset();
                }
            }

            if tracker.record_error(ErrorKey::ChildExit) {
                warn!("Command exited; restarting: pid={}, code={}", pid, code);
            } else {
                debug!(
                    "Command exited (repeated); restarting: pid={}, code={}, consecutive_exits={}",
                    pid,
                    code,
                    tracker.consecutive_count()
                );
            }

            attempt += 1;
            if self.wait_before_restart(attempt, cancel).await {
                return Ok(SupervisorExit::Terminated);
            }
        }
    }

    /// Returns `true` if cancelled while waiting.
    async fn wait_before_restart(&mut self, attempt: u32, cancel: &CancellationToken) -> bool {
        self.transition(ProcessState::Restarting { attempt });
        let delay = self.backoff.next_delay();
        if delay.is_zero() {
            return cancel.is_cancelled();
        }
        debug!(
            "Waiting before restarting command: attempt={}, backoff_ms={}",
            attempt,
            delay.as_millis()
        );
        backoff::sleep_or_cancel(cancel, delay).await
    }

    async fn shutdown_child(&self, child: &mut dyn ChildProcess, pid: u32) {
        info!("Stopping command: pid={}", pid);

        if let Err(e) = self.signals.send(pid, Signal::Term) {
            debug!("Failed to send SIGTERM; killing command: pid={}, error={}", pid, e);
            kill_and_reap(child, pid).await;
            return;
        }

        match tokio::time::timeout(self.shutdown_grace, child.wait()).await {
            Ok(Ok(code)) => info!("Command stopped: pid={}, code={}", pid, code),
            Ok(Err(e)) => warn!("Failed to wait on command during shutdown: pid={}, error={}", pid, e),
            Err(_) => {
                warn!(
                    "Command did not exit within grace period; killing: pid={}, grace_ms={}",
                    pid,
                    self.shutdown_grace.as_millis()
                );
                kill_and_reap(child, pid).await;
            }
        }
    }

    fn transition(&self, state: ProcessState) {
        self.state_tx.send_replace(state);
        let _ = self.transitions.send(state);
    }

    fn write_pid_file(&self, pid: u32) {
        let Some(path) = &self.pid_file else {
            return;
        };
        let target = WriteTarget::new(path, pid.to_string().into_bytes(), PID_FILE_MODE);
        if let Err(e) = write_atomic(&target) {
            warn!("Failed to write command PID file: error={}", e);
        }
    }

    fn remove_pid_file(&self) {
        let Some(path) = &self.pid_file else {
            return;
        };
        match std::fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                "Failed to remove command PID file: path={}, error={}",
                path.display(),
                e
            ),
        }
    }
}

async fn kill_and_reap(child: &mut dyn ChildProcess, pid: u32) {
    if let Err(e) = child.start_kill() {
        warn!("Failed to kill command: pid={}, error={}", pid, e);
        return;
    }
    if let Err(e) = child.wait().await {
        warn!("Failed to reap command: pid={}, error={}", pid, e);
    }
}
