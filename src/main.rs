use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use spiffe_helper::config::{CliArgs, FileConfig, SPIFFE_ENDPOINT_SOCKET};
use spiffe_helper::{
    health, HealthReporter, RotationConfig, RotationController, RunMode, WorkloadApiSource,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_LEVEL: &str = "info";

#[tokio::main]
async fn main() -> ExitCode {
    let cli = CliArgs::parse();

    let file = match FileConfig::load(&cli.config_file) {
        Ok(file) => file,
        Err(e) => {
            eprintln!("spiffe-helper: {e}");
            return ExitCode::FAILURE;
        }
    };

    let level = file
        .log_level
        .clone()
        .filter(|l| !l.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .init();

    let config = match RotationConfig::resolve(file, &cli, std::env::var(SPIFFE_ENDPOINT_SOCKET).ok())
    {
        Ok(config) => Arc::new(config),
        Err(e) => {
            error!("Invalid configuration: error={e}");
            return ExitCode::FAILURE;
        }
    };

    let source = match WorkloadApiSource::from_config(&config) {
        Ok(source) => source,
        Err(e) => {
            error!("Invalid agent address: error={e}");
            return ExitCode::FAILURE;
        }
    };
    info!(
        "Using Workload API: endpoint={}, cert_dir={}",
        source.endpoint(),
        config.cert_dir.display()
    );

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_on_signal(cancel.clone()));

    let reporter = HealthReporter::new(config.configured_slots());
    if config.mode() == RunMode::Daemon && config.health.listener_enabled {
        let health_config = config.health.clone();
        let reporter = reporter.clone();
        let token = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = health::serve(&health_config, reporter, token).await {
                error!("Health listener stopped: error={e}");
            }
        });
    }

    let controller = RotationController::builder(Arc::clone(&config), source)
        .health(reporter)
        .build();

    match controller.run(cancel).await {
        Ok(termination) => exit_code(termination.exit_code()),
        Err(e) => {
            error!("spiffe-helper failed: error={e}");
            ExitCode::FAILURE
        }
    }
}

fn exit_code(code: i32) -> ExitCode {
    // Codes outside 0..=255 are truncated by the OS anyway.
    ExitCode::from(u8::try_from(code & 0xff).unwrap_or(1))
}

async fn shutdown_on_signal(cancel: CancellationToken) {
    wait_for_shutdown().await;
    info!("Shutdown requested; stopping");
    cancel.cancel();
}

#[cfg(unix)]
async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            warn!("Failed to install SIGTERM handler: error={e}");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown() {
    let _ = tokio::signal::ctrl_c().await;
}
