use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{
    CredentialSource, SourceError, Subscription, SubscriptionRequest, UPDATE_BUFFER,
};
use crate::backoff::{
    next_backoff, next_backoff_for_no_identity, sleep_or_cancel, BackoffConfig, ErrorKey,
    ErrorTracker, MAX_CONSECUTIVE_SAME_ERROR,
};
use crate::config::RotationConfig;
use crate::credential::{AudienceKey, JwtSvidUpdate, JwtToken, JwtUpdate, X509Update};
use crate::prelude::{debug, info, warn};
use crate::workload_api::{Endpoint, WorkloadApiClient, WorkloadApiError};

/// Refresh interval used when a JWT SVID carries no readable `exp` claim.
const DEFAULT_JWT_REFRESH: Duration = Duration::from_secs(30);

type X509Sender = mpsc::Sender<Result<X509Update, SourceError>>;
type JwtSender = mpsc::Sender<Result<JwtUpdate, SourceError>>;

/// Credential source backed by the SPIFFE Workload API.
///
/// Each requested stream runs in its own task that reconnects with
/// exponential backoff until the cancellation token fires. Every failure is
/// also forwarded to the subscriber as an `Err` item.
#[derive(Debug, Clone)]
pub struct WorkloadApiSource {
    endpoint: Endpoint,
    reconnect: BackoffConfig,
}

impl WorkloadApiSource {
    /// Creates a source for `endpoint` with the default reconnect bounds.
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            reconnect: BackoffConfig::RECONNECT,
        }
    }

    /// Creates a source for the configured agent address.
    ///
    /// # Errors
    ///
    /// Returns [`WorkloadApiError::Endpoint`] if the address does not parse.
    pub fn from_config(config: &RotationConfig) -> Result<Self, WorkloadApiError> {
        Ok(Self::new(Endpoint::parse(&config.agent_address)?))
    }

    /// Overrides the reconnect backoff bounds.
    #[must_use]
    pub fn with_reconnect(mut self, reconnect: BackoffConfig) -> Self {
        self.reconnect = reconnect.normalize();
        self
    }

    /// Endpoint this source connects to.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}

impl CredentialSource for WorkloadApiSource {
    fn subscribe(
        self: Box<Self>,
        request: &SubscriptionRequest,
        cancel: CancellationToken,
    ) -> Subscription {
        let mut subscription = Subscription::default();

        if request.x509 {
            let (tx, rx) = mpsc::channel(UPDATE_BUFFER);
            tokio::spawn(run_x509_stream(
                self.endpoint.clone(),
                self.reconnect,
                tx,
                cancel.clone(),
            ));
            subscription.x509 = Some(rx);
        }

        if request.wants_jwt() {
            let (tx, rx) = mpsc::channel(UPDATE_BUFFER);
            if request.jwt_bundle {
                tokio::spawn(run_jwt_bundle_stream(
                    self.endpoint.clone(),
                    self.reconnect,
                    tx.clone(),
                    cancel.clone(),
                ));
            }
            for audience in &request.jwt_audiences {
                tokio::spawn(run_jwt_svid_refresh(
                    self.endpoint.clone(),
                    self.reconnect,
                    audience.clone(),
                    tx.clone(),
                    cancel.clone(),
                ));
            }
            subscription.jwt = Some(rx);
        }

        subscription
    }
}

/// How a single connection attempt ended.
enum Attempt {
    /// Cancelled, or the subscriber went away.
    Stop,
    /// Failed; reconnect after backoff.
    Failed(ErrorKey, WorkloadApiError),
}

/// Per-stream retry state shared by the reconnect loops.
struct Retry {
    stream: &'static str,
    config: BackoffConfig,
    backoff: Duration,
    tracker: ErrorTracker,
}

impl Retry {
    fn new(stream: &'static str, config: BackoffConfig) -> Self {
        Self {
            stream,
            config,
            backoff: config.min_backoff,
            tracker: ErrorTracker::new(MAX_CONSECUTIVE_SAME_ERROR),
        }
    }

    fn succeeded(&mut self) {
        if self.tracker.consecutive_count() > 0 {
            info!(
                "Workload API {} recovered after {} consecutive failures",
                self.stream,
                self.tracker.consecutive_count()
            );
        }
        self.tracker.reset();
        self.backoff = self.config.min_backoff;
    }

    fn failed(&mut self, key: ErrorKey, error: &WorkloadApiError) {
        let key = if matches!(error, WorkloadApiError::NoIdentityIssued) {
            ErrorKey::NoIdentityIssued
        } else {
            key
        };

        if self.tracker.record_error(key) {
            warn!(
                "Workload API {} failed; retrying: error={}, backoff_ms={}",
                self.stream,
                error,
                self.backoff.as_millis()
            );
        } else {
            debug!(
                "Workload API {} failed (repeated); retrying: error={}, backoff_ms={}, consecutive_failures={}",
                self.stream,
                error,
                self.backoff.as_millis(),
                self.tracker.consecutive_count()
            );
        }
    }

    /// Sleeps for the current backoff and advances it. Returns `true` on cancellation.
    async fn wait(&mut self, cancel: &CancellationToken) -> bool {
        if sleep_or_cancel(cancel, self.backoff).await {
            return true;
        }
        self.backoff = if self.tracker.last_error_kind() == Some(ErrorKey::NoIdentityIssued) {
            next_backoff_for_no_identity(self.backoff)
        } else {
            next_backoff(self.backoff, self.config.max_backoff)
        };
        false
    }
}

async fn run_x509_stream(
    endpoint: Endpoint,
    reconnect: BackoffConfig,
    tx: X509Sender,
    cancel: CancellationToken,
) {
    let mut retry = Retry::new("X.509 SVID stream", reconnect);

    loop {
        let (key, error) = match pump_x509(&endpoint, &tx, &cancel, &mut retry).await {
            Attempt::Stop => return,
            Attempt::Failed(key, error) => (key, error),
        };
        retry.failed(key, &error);
        if tx.send(Err(error.into())).await.is_err() || retry.wait(&cancel).await {
            return;
        }
    }
}

async fn pump_x509(
    endpoint: &Endpoint,
    tx: &X509Sender,
    cancel: &CancellationToken,
    retry: &mut Retry,
) -> Attempt {
    let client = tokio::select! {
        () = cancel.cancelled() => return Attempt::Stop,
        r = WorkloadApiClient::connect(endpoint) => match r {
            Ok(c) => c,
            Err(e) => return Attempt::Failed(ErrorKey::Connect, e),
        },
    };
    let mut stream = tokio::select! {
        () = cancel.cancelled() => return Attempt::Stop,
        r = client.stream_x509_svids() => match r {
            Ok(s) => s,
            Err(e) => return Attempt::Failed(ErrorKey::Stream, e),
        },
    };
    info!("Connected to Workload API X.509 SVID stream: endpoint={endpoint}");

    loop {
        let next = tokio::select! {
            () = cancel.cancelled() => return Attempt::Stop,
            r = stream.next() => r,
        };
        match next {
            Ok(Some(update)) => {
                retry.succeeded();
                debug!(
                    "Received X.509 SVID update: chain_len={}, bundle_len={}",
                    update.chain.len(),
                    update.bundle.len()
                );
                if tx.send(Ok(update)).await.is_err() {
                    return Attempt::Stop;
                }
            }
            Ok(None) => return Attempt::Failed(ErrorKey::Stream, WorkloadApiError::EmptyResponse),
            Err(e) => return Attempt::Failed(ErrorKey::Stream, e),
        }
    }
}

async fn run_jwt_bundle_stream(
    endpoint: Endpoint,
    reconnect: BackoffConfig,
    tx: JwtSender,
    cancel: CancellationToken,
) {
    let mut retry = Retry::new("JWT bundle stream", reconnect);

    loop {
        let (key, error) = match pump_jwt_bundles(&endpoint, &tx, &cancel, &mut retry).await {
            Attempt::Stop => return,
            Attempt::Failed(key, error) => (key, error),
        };
        retry.failed(key, &error);
        if tx.send(Err(error.into())).await.is_err() || retry.wait(&cancel).await {
            return;
        }
    }
}

async fn pump_jwt_bundles(
    endpoint: &Endpoint,
    tx: &JwtSender,
    cancel: &CancellationToken,
    retry: &mut Retry,
) -> Attempt {
    let client = tokio::select! {
        () = cancel.cancelled() => return Attempt::Stop,
        r = WorkloadApiClient::connect(endpoint) => match r {
            Ok(c) => c,
            Err(e) => return Attempt::Failed(ErrorKey::Connect, e),
        },
    };
    let mut stream = tokio::select! {
        () = cancel.cancelled() => return Attempt::Stop,
        r = client.stream_jwt_bundles() => match r {
            Ok(s) => s,
            Err(e) => return Attempt::Failed(ErrorKey::Stream, e),
        },
    };
    info!("Connected to Workload API JWT bundle stream: endpoint={endpoint}");

    loop {
        let next = tokio::select! {
            () = cancel.cancelled() => return Attempt::Stop,
            r = stream.next() => r,
        };
        match next {
            Ok(Some(update)) => {
                retry.succeeded();
                debug!("Received JWT bundle update: trust_domains={}", update.bundles.len());
                if tx.send(Ok(JwtUpdate::Bundle(update))).await.is_err() {
                    return Attempt::Stop;
                }
            }
            Ok(None) => return Attempt::Failed(ErrorKey::Stream, WorkloadApiError::EmptyResponse),
            Err(e) => return Attempt::Failed(ErrorKey::Stream, e),
        }
    }
}

async fn run_jwt_svid_refresh(
    endpoint: Endpoint,
    reconnect: BackoffConfig,
    audience: AudienceKey,
    tx: JwtSender,
    cancel: CancellationToken,
) {
    let mut retry = Retry::new("JWT SVID fetch", reconnect);
    let mut client: Option<WorkloadApiClient> = None;

    loop {
        let fetched = tokio::select! {
            () = cancel.cancelled() => return,
            r = fetch_jwt_svid(&endpoint, &mut client, &audience) => r,
        };

        match fetched {
            Ok(token) => {
                retry.succeeded();
                let refresh = refresh_delay(token.as_str(), SystemTime::now());
                debug!(
                    "Fetched JWT SVID: audience={}, refresh_in_ms={}",
                    audience,
                    refresh.as_millis()
                );
                let update = JwtSvidUpdate {
                    audience: audience.clone(),
                    token,
                };
                if tx.send(Ok(JwtUpdate::Svid(update))).await.is_err()
                    || sleep_or_cancel(&cancel, refresh).await
                {
                    return;
                }
            }
            Err((key, error)) => {
                retry.failed(key, &error);
                if tx.send(Err(error.into())).await.is_err() || retry.wait(&cancel).await {
                    return;
                }
            }
        }
    }
}

/// Fetches one token, reusing `client` across calls and dropping it on failure.
async fn fetch_jwt_svid(
    endpoint: &Endpoint,
    client: &mut Option<WorkloadApiClient>,
    audience: &AudienceKey,
) -> Result<JwtToken, (ErrorKey, WorkloadApiError)> {
    let connected = match client.take() {
        Some(c) => c,
        None => WorkloadApiClient::connect(endpoint)
            .await
            .map_err(|e| (ErrorKey::Connect, e))?,
    };
    let token = connected
        .fetch_jwt_svid(audience)
        .await
        .map_err(|e| (ErrorKey::Stream, e))?;
    *client = Some(connected);
    Ok(token)
}

#[derive(Deserialize)]
struct Claims {
    exp: Option<u64>,
}

/// Delay until a token should be re-fetched: half its remaining lifetime plus one second.
pub(crate) fn refresh_delay(token: &str, now: SystemTime) -> Duration {
    let Some(expiry) = token_expiry(token) else {
        return DEFAULT_JWT_REFRESH;
    };
    let remaining = expiry.duration_since(now).unwrap_or_default();
    remaining / 2 + Duration::from_secs(1)
}

fn token_expiry(token: &str) -> Option<SystemTime> {
    let payload = token.split('.').nth(1)?;
    let decoded = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .ok()?;
    let claims: Claims = serde_json::from_slice(&decoded).ok()?;
    Some(UNIX_EPOCH + Duration::from_secs(claims.exp?))
}
