//! Minimal SPIFFE Workload API client over gRPC.
//!
//! Supports `unix:` and `tcp:` endpoints and the three calls the helper needs:
//! the X.509 SVID stream, JWT SVID fetches and the JWT bundle stream.

mod client;
mod endpoint;
mod error;
pub(crate) mod pb;

pub use client::{JwtBundleStream, WorkloadApiClient, X509SvidStream};
pub use endpoint::{AgentAddressError, Endpoint};
pub use error::WorkloadApiError;
