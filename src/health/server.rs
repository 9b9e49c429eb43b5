use std::io;
use std::net::SocketAddr;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use super::HealthReporter;
use crate::config::HealthConfig;
use crate::prelude::info;

/// Errors running the health listener.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum HealthServerError {
    /// The listener could not bind.
    #[error("failed to bind health listener on {addr}: {source}")]
    Bind {
        /// Requested address.
        addr: SocketAddr,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// The server stopped with an error.
    #[error("health listener failed: {0}")]
    Serve(#[source] io::Error),
}

/// Routes for the configured liveness and readiness paths.
///
/// Both answer `200` when the flag holds and `503` otherwise, with the
/// [`HealthSnapshot`](super::HealthSnapshot) as JSON body. If both paths are
/// equal the route requires both flags.
pub fn router(config: &HealthConfig, reporter: HealthReporter) -> Router {
    let live = route_path(&config.liveness_path);
    let ready = route_path(&config.readiness_path);

    if live == ready {
        return Router::new()
            .route(&live, get(combined_handler))
            .with_state(reporter);
    }

    Router::new()
        .route(&live, get(live_handler))
        .route(&ready, get(ready_handler))
        .with_state(reporter)
}

/// Serves the health routes on `0.0.0.0:<bind_port>` until `cancel` fires.
///
/// # Errors
///
/// Returns [`HealthServerError`] if binding or serving fails.
pub async fn serve(
    config: &HealthConfig,
    reporter: HealthReporter,
    cancel: CancellationToken,
) -> Result<(), HealthServerError> {
    let addr = SocketAddr::from(([0, 0, 0, 0], config.bind_port));
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| HealthServerError::Bind { addr, source })?;
    info!(
        "Health listener started: addr={}, liveness_path={}, readiness_path={}",
        addr, config.liveness_path, config.readiness_path
    );

    axum::serve(listener, router(config, reporter))
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
        .map_err(HealthServerError::Serve)
}

fn route_path(path: &str) -> String {
    if path.starts_with('/') {
        path.to_owned()
    } else {
        format!("/{path}")
    }
}

fn respond(ok: bool, reporter: &HealthReporter) -> impl IntoResponse {
    let status = if ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(reporter.snapshot()))
}

async fn live_handler(State(reporter): State<HealthReporter>) -> impl IntoResponse {
    respond(reporter.is_live(), &reporter)
}

async fn ready_handler(State(reporter): State<HealthReporter>) -> impl IntoResponse {
    respond(reporter.is_ready(), &reporter)
}

async fn combined_handler(State(reporter): State<HealthReporter>) -> impl IntoResponse {
    respond(reporter.is_live() && reporter.is_ready(), &reporter)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;
    use crate::credential::UpdateSlot;

    async fn get_status(app: Router, path: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(Request::builder().uri(path).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn readiness_flips_after_write() {
        let reporter = HealthReporter::new([UpdateSlot::X509]);
        let config = HealthConfig::default();

        let (status, body) = get_status(router(&config, reporter.clone()), "/ready").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["ready"], false);

        reporter.mark_written(&UpdateSlot::X509);
        let (status, body) = get_status(router(&config, reporter.clone()), "/ready").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["credentials"][0]["kind"], "x509_svid");
    }

    #[tokio::test]
    async fn liveness_reports_flag() {
        let reporter = HealthReporter::new([UpdateSlot::JwtBundle]);
        let config = HealthConfig::default();

        let (status, _) = get_status(router(&config, reporter.clone()), "/live").await;
        assert_eq!(status, StatusCode::OK);

        reporter.set_live(false);
        let (status, body) = get_status(router(&config, reporter), "/live").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["live"], false);
    }

    #[tokio::test]
    async fn shared_path_requires_both_flags() {
        let reporter = HealthReporter::new([UpdateSlot::JwtBundle]);
        let config = HealthConfig {
            liveness_path: "health".into(),
            readiness_path: "/health".into(),
            ..HealthConfig::default()
        };

        let (status, _) = get_status(router(&config, reporter.clone()), "/health").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        reporter.mark_written(&UpdateSlot::JwtBundle);
        let (status, _) = get_status(router(&config, reporter), "/health").await;
        assert_eq!(status, StatusCode::OK);
    }
}
