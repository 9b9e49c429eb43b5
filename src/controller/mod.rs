//! Rotation Controller: drives writes, notifications and supervision.
//!
//! In one-shot mode the controller waits for one update of every configured
//! credential, writes each, notifies and returns. In daemon mode it runs one
//! intake task and one writer task per credential stream next to the
//! Process Supervisor until cancelled. Writes on a stream are serialized and
//! a newer update supersedes a pending one for the same files.

mod queue;

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::backoff::{BackoffStrategy, ErrorKey, ErrorTracker, MAX_CONSECUTIVE_SAME_ERROR};
use crate::config::{RotationConfig, RunMode};
use crate::credential::{AudienceKey, CredentialKind, CredentialUpdate};
use crate::health::HealthReporter;
use crate::notify::{PidSignaler, ReloadMechanism, ReloadNotifier};
use crate::prelude::{debug, error, info, warn};
use crate::process::{
    OsSignalSender, ProcessError, ProcessSupervisor, SignalSender, Spawner, SupervisorExit,
    TokioSpawner,
};
use crate::source::{CredentialSource, SourceError, SubscriptionRequest};
use crate::writer::{CredentialWriter, WriteError};

use queue::LatestQueue;

/// Errors that stop the controller.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum RotationError {
    /// The source failed before the first complete update (one-shot).
    #[error("credential source failed: {0}")]
    Source(#[from] SourceError),

    /// A credential stream ended.
    #[error("{stream} credential stream closed")]
    SourceClosed {
        /// Stream name, `x509` or `jwt`.
        stream: &'static str,
    },

    /// Writing credentials failed (one-shot).
    #[error(transparent)]
    Write(#[from] WriteError),

    /// The supervised command could not be run.
    #[error(transparent)]
    Process(#[from] ProcessError),

    /// Cancelled before completion (one-shot).
    #[error("cancelled before all credentials were written")]
    Cancelled,

    /// A controller task failed unexpectedly.
    #[error("internal controller error: {0}")]
    Internal(String),
}

/// How a successful run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// One-shot completed or the daemon was cancelled.
    Completed,
    /// The supervised command exited under exit-code forwarding.
    ChildExited(i32),
}

impl Termination {
    /// Process exit code for this termination.
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Completed => 0,
            Self::ChildExited(code) => code,
        }
    }
}

/// Builder for [`RotationController`]. Every capability has an OS default.
#[derive(Debug)]
pub struct RotationControllerBuilder {
    config: Arc<RotationConfig>,
    source: Box<dyn CredentialSource>,
    spawner: Option<Arc<dyn Spawner>>,
    signals: Option<Arc<dyn SignalSender>>,
    pid_signaler: Option<Arc<dyn PidSignaler>>,
    restart_backoff: Option<Box<dyn BackoffStrategy>>,
    health: Option<HealthReporter>,
}

impl RotationControllerBuilder {
    /// Spawns the supervised command through `spawner`.
    #[must_use]
    pub fn spawner(mut self, spawner: Arc<dyn Spawner>) -> Self {
        self.spawner = Some(spawner);
        self
    }

    /// Delivers signals to the supervised command through `signals`.
    #[must_use]
    pub fn signal_sender(mut self, signals: Arc<dyn SignalSender>) -> Self {
        self.signals = Some(signals);
        self
    }

    /// Uses `signaler` for PID-file notifications.
    #[must_use]
    pub fn pid_signaler(mut self, signaler: Arc<dyn PidSignaler>) -> Self {
        self.pid_signaler = Some(signaler);
        self
    }

    /// Overrides the restart policy of the supervised command.
    #[must_use]
    pub fn restart_backoff(mut self, backoff: Box<dyn BackoffStrategy>) -> Self {
        self.restart_backoff = Some(backoff);
        self
    }

    /// Reports readiness through `health` instead of a private reporter.
    #[must_use]
    pub fn health(mut self, health: HealthReporter) -> Self {
        self.health = Some(health);
        self
    }

    /// Finishes the builder.
    pub fn build(self) -> RotationController {
        let config = self.config;
        let mechanism = match self.pid_signaler {
            Some(signaler) => ReloadMechanism::from_config_with(&config, |_| signaler),
            None => ReloadMechanism::from_config(&config),
        };
        let health = self
            .health
            .unwrap_or_else(|| HealthReporter::new(config.configured_slots()));

        RotationController {
            writer: CredentialWriter::new(Arc::clone(&config)),
            config,
            source: self.source,
            spawner: self.spawner.unwrap_or_else(|| Arc::new(TokioSpawner)),
            signals: self.signals.unwrap_or_else(|| Arc::new(OsSignalSender)),
            mechanism,
            restart_backoff: self.restart_backoff,
            health,
        }
    }
}

/// Orchestrates the credential streams, the writer, the notifier and the
/// supervised command.
#[derive(Debug)]
pub struct RotationController {
    config: Arc<RotationConfig>,
    source: Box<dyn CredentialSource>,
    writer: CredentialWriter,
    spawner: Arc<dyn Spawner>,
    signals: Arc<dyn SignalSender>,
    mechanism: ReloadMechanism,
    restart_backoff: Option<Box<dyn BackoffStrategy>>,
    health: HealthReporter,
}

impl RotationController {
    /// Starts building a controller for `config` fed by `source`.
    pub fn builder(
        config: Arc<RotationConfig>,
        source: impl CredentialSource,
    ) -> RotationControllerBuilder {
        RotationControllerBuilder {
            config,
            source: Box::new(source),
            spawner: None,
            signals: None,
            pid_signaler: None,
            restart_backoff: None,
            health: None,
        }
    }

    /// The reporter updated by this controller.
    pub fn health(&self) -> HealthReporter {
        self.health.clone()
    }

    /// Runs in the configured [`RunMode`] until done or cancelled.
    ///
    /// # Errors
    ///
    /// Returns [`RotationError`] for fatal failures: any failure before the
    /// first complete write in one-shot mode; a closed stream, a failed
    /// command start or an internal task failure in daemon mode.
    pub async fn run(self, cancel: CancellationToken) -> Result<Termination, RotationError> {
        let mode = self.config.mode();
        info!("Starting rotation controller: mode={mode:?}");

        let health = self.health.clone();
        let result = match mode {
            RunMode::OneShot => self.run_one_shot(cancel).await,
            RunMode::Daemon => self.run_daemon(cancel).await,
        };

        if let Err(e) = &result {
            health.set_live(false);
            error!("Rotation controller stopped: error={e}");
        }
        result
    }

    async fn run_one_shot(self, cancel: CancellationToken) -> Result<Termination, RotationError> {
        let request = SubscriptionRequest::from_config(&self.config);
        let mut outstanding = Outstanding::new(&request);
        let notifier = ReloadNotifier::new(self.mechanism, None);

        let source_cancel = cancel.child_token();
        let _stop_source = source_cancel.clone().drop_guard();
        let subscription = self.source.subscribe(&request, source_cancel);
        let mut x509 = subscription.x509;
        let mut jwt = subscription.jwt;

        while !outstanding.is_empty() {
            let (stream, item) = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(RotationError::Cancelled),
                item = recv(&mut x509) => ("x509", item.map(|r| r.map(CredentialUpdate::from))),
                item = recv(&mut jwt) => ("jwt", item.map(|r| r.map(CredentialUpdate::from))),
            };

            let update = match item {
                Some(Ok(update)) => update,
                Some(Err(e)) => return Err(RotationError::Source(e)),
                None => return Err(RotationError::SourceClosed { stream }),
            };

            if !outstanding.accept(&update) {
                debug!("Ignoring update already written: kind={}", update.kind());
                continue;
            }
            let slot = update.slot();
            write_update(&self.writer, update).await?;
            self.health.mark_written(&slot);
            notify(&notifier, slot.kind());

            if !outstanding.x509 {
                x509 = None;
            }
            if !outstanding.wants_jwt() {
                jwt = None;
            }
        }

        info!("All configured credentials written; exiting");
        Ok(Termination::Completed)
    }

    async fn run_daemon(self, cancel: CancellationToken) -> Result<Termination, RotationError> {
        let shutdown = cancel.child_token();
        let request = SubscriptionRequest::from_config(&self.config);

        let supervisor = self.config.command.as_ref().map(|command| {
            let supervisor = ProcessSupervisor::from_config(
                command,
                Arc::clone(&self.spawner),
                Arc::clone(&self.signals),
            );
            match self.restart_backoff {
                Some(backoff) => supervisor.backoff(backoff),
                None => supervisor,
            }
        });
        let notifier = ReloadNotifier::new(
            self.mechanism,
            supervisor.as_ref().map(ProcessSupervisor::handle),
        );

        let mut tasks: JoinSet<TaskExit> = JoinSet::new();
        if let Some(supervisor) = supervisor {
            let token = shutdown.clone();
            tasks.spawn(async move { TaskExit::Supervisor(supervisor.run(token).await) });
        }

        let subscription = self.source.subscribe(&request, shutdown.clone());
        let worker = |queue: &Arc<LatestQueue>| Worker {
            writer: self.writer.clone(),
            notifier: notifier.clone(),
            health: self.health.clone(),
            queue: Arc::clone(queue),
        };
        if let Some(rx) = subscription.x509 {
            let queue = Arc::new(LatestQueue::new());
            tasks.spawn(worker(&queue).run());
            tasks.spawn(Stream::new("x509", rx).intake(queue, shutdown.clone()));
        }
        if let Some(rx) = subscription.jwt {
            let queue = Arc::new(LatestQueue::new());
            tasks.spawn(worker(&queue).run());
            tasks.spawn(Stream::new("jwt", rx).intake(queue, shutdown.clone()));
        }

        if tasks.is_empty() {
            shutdown.cancelled().await;
            return Ok(Termination::Completed);
        }

        let mut outcome: Result<Termination, RotationError> = Ok(Termination::Completed);
        let fail = |outcome: &mut Result<Termination, RotationError>, err: RotationError| {
            if outcome.is_ok() {
                *outcome = Err(err);
            }
            shutdown.cancel();
        };

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(TaskExit::Stopped | TaskExit::Supervisor(Ok(SupervisorExit::Terminated))) => {}
                Ok(TaskExit::Supervisor(Ok(SupervisorExit::ForwardExitCode(code)))) => {
                    info!("Supervised command exited; forwarding exit code: code={code}");
                    if matches!(outcome, Ok(Termination::Completed)) {
                        outcome = Ok(Termination::ChildExited(code));
                    }
                    shutdown.cancel();
                }
                Ok(TaskExit::Supervisor(Err(e))) => fail(&mut outcome, e.into()),
                Ok(TaskExit::Failed(e)) => fail(&mut outcome, e),
                Ok(TaskExit::SourceClosed(stream)) => {
                    if !shutdown.is_cancelled() {
                        fail(&mut outcome, RotationError::SourceClosed { stream });
                    }
                }
                Err(e) => fail(&mut outcome, RotationError::Internal(e.to_string())),
            }
        }

        outcome
    }
}

/// Why a daemon task returned.
enum TaskExit {
    Stopped,
    Failed(RotationError),
    SourceClosed(&'static str),
    Supervisor(Result<SupervisorExit, ProcessError>),
}

/// One credential stream feeding a write queue.
struct Stream<T> {
    name: &'static str,
    rx: mpsc::Receiver<Result<T, SourceError>>,
}

impl<T> Stream<T>
where
    T: Into<CredentialUpdate> + Send + 'static,
{
    fn new(name: &'static str, rx: mpsc::Receiver<Result<T, SourceError>>) -> Self {
        Self { name, rx }
    }

    async fn intake(mut self, queue: Arc<LatestQueue>, shutdown: CancellationToken) -> TaskExit {
        let mut tracker = ErrorTracker::new(MAX_CONSECUTIVE_SAME_ERROR);

        let exit = loop {
            let item = tokio::select! {
                biased;
                () = shutdown.cancelled() => break TaskExit::Stopped,
                item = self.rx.recv() => item,
            };

            match item {
                Some(Ok(update)) => {
                    tracker.reset();
                    let update: CredentialUpdate = update.into();
                    let kind = update.kind();
                    if queue.push(update) {
                        debug!("Superseded pending update: stream={}, kind={kind}", self.name);
                    }
                }
                Some(Err(e)) => {
                    if tracker.record_error(ErrorKey::Stream) {
                        warn!(
                            "Credential stream error; keeping current credentials: stream={}, error={}",
                            self.name, e
                        );
                    } else {
                        debug!(
                            "Credential stream error (repeated): stream={}, error={}, consecutive_failures={}",
                            self.name,
                            e,
                            tracker.consecutive_count()
                        );
                    }
                }
                None => break TaskExit::SourceClosed(self.name),
            }
        };

        queue.close();
        exit
    }
}

/// Serializes writes for one stream.
struct Worker {
    writer: CredentialWriter,
    notifier: ReloadNotifier,
    health: HealthReporter,
    queue: Arc<LatestQueue>,
}

impl Worker {
    async fn run(self) -> TaskExit {
        while let Some(update) = self.queue.pop().await {
            let slot = update.slot();
            let kind = slot.kind();
            match write_update(&self.writer, update).await {
                Ok(()) => {
                    info!("Credentials rotated: kind={kind}");
                    self.health.mark_written(&slot);
                    notify(&self.notifier, kind);
                }
                Err(RotationError::Write(e)) => warn!(
                    "Failed to write credentials; will retry on next update: kind={}, error={}",
                    kind, e
                ),
                Err(e) => return TaskExit::Failed(e),
            }
        }
        TaskExit::Stopped
    }
}

/// Tracks what one-shot mode still waits for.
#[derive(Debug)]
struct Outstanding {
    x509: bool,
    audiences: BTreeSet<AudienceKey>,
    jwt_bundle: bool,
}

impl Outstanding {
    fn new(request: &SubscriptionRequest) -> Self {
        Self {
            x509: request.x509,
            audiences: request.jwt_audiences.iter().cloned().collect(),
            jwt_bundle: request.jwt_bundle,
        }
    }

    /// Marks `update` received. Returns `false` if it was not awaited.
    fn accept(&mut self, update: &CredentialUpdate) -> bool {
        match update {
            CredentialUpdate::X509(_) => std::mem::take(&mut self.x509),
            CredentialUpdate::JwtSvid(u) => self.audiences.remove(&u.audience),
            CredentialUpdate::JwtBundle(_) => std::mem::take(&mut self.jwt_bundle),
        }
    }

    fn wants_jwt(&self) -> bool {
        !self.audiences.is_empty() || self.jwt_bundle
    }

    fn is_empty(&self) -> bool {
        !self.x509 && !self.wants_jwt()
    }
}

async fn recv<T>(rx: &mut Option<mpsc::Receiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn write_update(
    writer: &CredentialWriter,
    update: CredentialUpdate,
) -> Result<(), RotationError> {
    let writer = writer.clone();
    tokio::task::spawn_blocking(move || writer.write(&update))
        .await
        .map_err(|e| RotationError::Internal(e.to_string()))?
        .map_err(RotationError::Write)
}

fn notify(notifier: &ReloadNotifier, kind: CredentialKind) {
    if let Err(e) = notifier.notify(kind) {
        warn!("Failed to send renew signal: kind={kind}, error={e}");
    }
}
