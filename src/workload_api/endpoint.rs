//! Agent address parsing and channel construction.
//!
//! The helper talks to a local agent, so only two address shapes are
//! accepted: `unix:` with an absolute socket path (`unix:///run/agent.sock`
//! or `unix:/run/agent.sock`) and `tcp://<ip>:<port>`.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
#[cfg(unix)]
use std::sync::Arc;

#[cfg(unix)]
use hyper_util::rt::TokioIo;
#[cfg(unix)]
use tokio::net::UnixStream;
use tonic::transport::{Channel, Endpoint as TonicEndpoint};
#[cfg(unix)]
use tonic::transport::Uri;
#[cfg(unix)]
use tower::service_fn;
use url::Url;

use super::WorkloadApiError;

const TCP_SCHEME: &str = "tcp";
const UNIX_SCHEME: &str = "unix";

// tonic requires an http URI even when the connector ignores it.
#[cfg(unix)]
const TONIC_DUMMY_URI: &str = "http://[::]:50051";

/// Where the agent's Workload API listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// UNIX domain socket path.
    Unix(PathBuf),

    /// IP socket address.
    Tcp {
        /// IP address of the agent.
        host: IpAddr,
        /// TCP port of the agent.
        port: u16,
    },
}

/// An `agent_address` that does not name a usable endpoint.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[error("{address:?} {reason}")]
pub struct AgentAddressError {
    /// The rejected address.
    pub address: String,
    /// What is wrong with it.
    pub reason: &'static str,
}

impl Endpoint {
    /// Parses an agent address.
    ///
    /// # Errors
    ///
    /// Returns [`AgentAddressError`] naming the address and the problem.
    pub fn parse(address: &str) -> Result<Self, AgentAddressError> {
        let invalid = |reason| AgentAddressError {
            address: address.to_owned(),
            reason,
        };

        let url = Url::parse(address).map_err(|_| invalid("is not a URI"))?;
        let decorated = !url.username().is_empty()
            || url.password().is_some()
            || url.query().is_some()
            || url.fragment().is_some();
        if decorated {
            return Err(invalid("must not carry user info, a query or a fragment"));
        }

        let host = url.host_str().filter(|h| !h.is_empty());
        let path = url.path();
        match url.scheme() {
            UNIX_SCHEME if host.is_some() => {
                Err(invalid("names a host; use unix:///absolute/path"))
            }
            UNIX_SCHEME if path.len() > 1 => Ok(Self::Unix(PathBuf::from(path))),
            UNIX_SCHEME => Err(invalid("has no socket path")),
            TCP_SCHEME => {
                if !path.is_empty() && path != "/" {
                    return Err(invalid("must not have a path after the port"));
                }
                let host = host
                    .map(|h| h.trim_start_matches('[').trim_end_matches(']'))
                    .and_then(|h| h.parse::<IpAddr>().ok())
                    .ok_or_else(|| invalid("must use an IP address as host"))?;
                let port = url.port().ok_or_else(|| invalid("has no port"))?;
                Ok(Self::Tcp { host, port })
            }
            _ => Err(invalid("must use the unix: or tcp: scheme")),
        }
    }

    /// Opens a gRPC channel to this endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`WorkloadApiError`] if the connection cannot be established
    /// or the transport is unsupported on this platform.
    pub async fn connect(&self) -> Result<Channel, WorkloadApiError> {
        match self {
            Self::Unix(path) => connect_unix(path).await,
            Self::Tcp { host, port } => connect_tcp(SocketAddr::new(*host, *port)).await,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unix(path) => write!(f, "{UNIX_SCHEME}://{}", path.display()),
            Self::Tcp { host, port } => {
                write!(f, "{TCP_SCHEME}://{}", SocketAddr::new(*host, *port))
            }
        }
    }
}

impl FromStr for Endpoint {
    type Err = AgentAddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

async fn connect_tcp(addr: SocketAddr) -> Result<Channel, WorkloadApiError> {
    Ok(TonicEndpoint::try_from(format!("http://{addr}"))?
        .connect()
        .await?)
}

#[cfg(unix)]
async fn connect_unix(path: &Path) -> Result<Channel, WorkloadApiError> {
    let path: Arc<PathBuf> = Arc::new(path.to_path_buf());

    let channel = TonicEndpoint::try_from(TONIC_DUMMY_URI)?
        .connect_with_connector(service_fn(move |_: Uri| {
            let path = Arc::clone(&path);
            async move {
                let stream = UnixStream::connect(path.as_path()).await?;
                Ok::<_, std::io::Error>(TokioIo::new(stream))
            }
        }))
        .await?;

    Ok(channel)
}

#[cfg(not(unix))]
async fn connect_unix(_path: &Path) -> Result<Channel, WorkloadApiError> {
    Err(WorkloadApiError::UnsupportedTransport { scheme: UNIX_SCHEME })
}
