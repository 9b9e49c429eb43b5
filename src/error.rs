//! Crate-level error type.

use crate::config::ConfigError;
use crate::controller::RotationError;
use crate::health::HealthServerError;
use crate::notify::NotifyError;
use crate::process::ProcessError;
use crate::source::SourceError;
use crate::workload_api::WorkloadApiError;
use crate::writer::WriteError;

/// Any error the helper can report.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Invalid configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Credential files could not be written.
    #[error(transparent)]
    Write(#[from] WriteError),

    /// The supervised command failed.
    #[error(transparent)]
    Process(#[from] ProcessError),

    /// A reload notification failed.
    #[error(transparent)]
    Notify(#[from] NotifyError),

    /// The credential source failed.
    #[error(transparent)]
    Source(#[from] SourceError),

    /// The Workload API could not be used.
    #[error(transparent)]
    WorkloadApi(#[from] WorkloadApiError),

    /// The health listener failed.
    #[error(transparent)]
    Health(#[from] HealthServerError),

    /// The rotation controller stopped.
    #[error(transparent)]
    Rotation(#[from] RotationError),
}
