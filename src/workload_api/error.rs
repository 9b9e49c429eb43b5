//! Error types for Workload API operations.

use thiserror::Error;

use super::AgentAddressError;
use crate::cert::CertificateError;

/// Errors produced by Workload API operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WorkloadApiError {
    /// The agent address does not name a usable endpoint.
    #[error("invalid agent address: {0}")]
    Endpoint(#[from] AgentAddressError),

    /// The endpoint transport is not available on this platform.
    #[error("{scheme}: endpoints are not supported on this platform")]
    UnsupportedTransport {
        /// Endpoint scheme.
        scheme: &'static str,
    },

    /// The Workload API returned an empty response or ended the stream.
    #[error("empty Workload API response")]
    EmptyResponse,

    /// The agent has no identity for this workload (e.g. selectors do not match).
    #[error("no identity issued")]
    NoIdentityIssued,

    /// The Workload API denied the request for other permission reasons.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The response carried a malformed certificate.
    #[error("invalid certificate in Workload API response: {0}")]
    Certificate(#[from] CertificateError),

    /// The gRPC call failed.
    #[error("workload api call failed: {0}")]
    Status(#[source] tonic::Status),

    /// The transport could not be established.
    #[error("workload api transport error: {0}")]
    Transport(#[from] tonic::transport::Error),
}

impl From<tonic::Status> for WorkloadApiError {
    fn from(status: tonic::Status) -> Self {
        use tonic::Code;

        if status.code() == Code::PermissionDenied {
            let msg = status.message();

            if msg.contains("no identity issued") {
                return Self::NoIdentityIssued;
            }

            return Self::PermissionDenied(msg.to_owned());
        }

        Self::Status(status)
    }
}
