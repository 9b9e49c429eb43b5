#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

//! A sidecar that keeps SPIFFE credentials on disk for workloads that cannot
//! speak the [SPIFFE Workload API](https://github.com/spiffe/spiffe/blob/main/standards/SPIFFE_Workload_API.md)
//! themselves.
//!
//! The crate receives X.509 and JWT SVIDs (plus their trust bundles) from a
//! [`CredentialSource`], persists them atomically with configured permission
//! bits, and keeps an optional supervised process fresh by signaling it (or a
//! process named by a PID file) whenever new material lands on disk.
//!
//! The entry point is [`RotationController`], which runs either a one-shot
//! "fetch, write and exit" pass or a daemon that rotates credentials until it
//! is cancelled.
//!
//! ```no_run
//! use std::sync::Arc;
//! use spiffe_helper::{RotationConfig, RotationController, WorkloadApiSource};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example(config: RotationConfig) -> Result<(), Box<dyn std::error::Error>> {
//! let config = Arc::new(config);
//! let source = WorkloadApiSource::from_config(&config)?;
//!
//! let termination = RotationController::builder(Arc::clone(&config), source)
//!     .build()
//!     .run(CancellationToken::new())
//!     .await?;
//!
//! std::process::exit(termination.exit_code());
//! # }
//! ```
//!
//! ## Features
//!
//! - **`tracing`** (default): log through `tracing` events.
//! - **`logging`**: log through the `log` facade when `tracing` is disabled.

mod observability;
mod prelude;

pub mod backoff;
pub mod cert;
pub mod config;
pub mod controller;
pub mod credential;
pub mod error;
pub mod health;
pub mod notify;
pub mod process;
pub mod source;
pub mod workload_api;
pub mod writer;

// -----------------------
// Re-exports
// -----------------------

pub use crate::config::{RotationConfig, RunMode};
pub use crate::controller::{RotationController, RotationControllerBuilder, RotationError, Termination};
pub use crate::credential::{
    AudienceKey, CredentialKind, CredentialUpdate, JwtBundleUpdate, JwtSvidUpdate, JwtUpdate,
    UpdateSlot, X509Update,
};
pub use crate::error::Error;
pub use crate::health::HealthReporter;
pub use crate::notify::{ReloadMechanism, ReloadNotifier};
pub use crate::process::{ProcessState, ProcessSupervisor, Signal, SupervisorHandle};
pub use crate::source::{ChannelSource, CredentialSource, SourceError, WorkloadApiSource};
pub use crate::writer::{CredentialWriter, WriteError, WriteTarget};
