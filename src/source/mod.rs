//! Credential sources: where updates come from.
//!
//! A [`CredentialSource`] turns a [`SubscriptionRequest`] into independent
//! X.509 and JWT event channels. Transient failures arrive as `Err` items;
//! a closed channel means the source gave up for good.

mod channel;
mod workload;

use std::fmt;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::RotationConfig;
use crate::credential::{AudienceKey, JwtUpdate, X509Update};
use crate::workload_api::WorkloadApiError;

pub use channel::{ChannelSource, ChannelSourceSender};
pub use workload::WorkloadApiSource;

/// Channel capacity used by the built-in sources.
pub(crate) const UPDATE_BUFFER: usize = 16;

/// Receiver of X.509 events.
pub type X509Receiver = mpsc::Receiver<Result<X509Update, SourceError>>;

/// Receiver of JWT SVID and JWT bundle events.
pub type JwtReceiver = mpsc::Receiver<Result<JwtUpdate, SourceError>>;

/// Errors delivered by a credential source.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum SourceError {
    /// The Workload API stream or call failed. The source keeps retrying.
    #[error("credential stream failed: {0}")]
    Stream(#[from] WorkloadApiError),

    /// A source-specific failure.
    #[error("credential source failed: {0}")]
    Unavailable(String),

    /// The subscriber has gone away.
    #[error("credential subscriber is closed")]
    Closed,
}

/// What the controller needs from a source.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionRequest {
    /// Stream X.509 identities.
    pub x509: bool,
    /// Audience keys to fetch JWT SVIDs for.
    pub jwt_audiences: Vec<AudienceKey>,
    /// Stream JWT bundles.
    pub jwt_bundle: bool,
}

impl SubscriptionRequest {
    /// Everything `config` has an output for.
    pub fn from_config(config: &RotationConfig) -> Self {
        Self {
            x509: config.x509.is_some(),
            jwt_audiences: config.audience_keys(),
            jwt_bundle: config.jwt_bundle_file_name.is_some(),
        }
    }

    /// Whether a JWT channel is needed.
    pub fn wants_jwt(&self) -> bool {
        !self.jwt_audiences.is_empty() || self.jwt_bundle
    }
}

/// Live channels returned by [`CredentialSource::subscribe`].
#[derive(Debug, Default)]
pub struct Subscription {
    /// X.509 events, when requested.
    pub x509: Option<X509Receiver>,
    /// JWT events, when requested.
    pub jwt: Option<JwtReceiver>,
}

/// Asynchronous provider of credential updates.
pub trait CredentialSource: Send + fmt::Debug + 'static {
    /// Starts delivering updates for `request` until `cancel` fires.
    ///
    /// Only the channels the request asks for are returned.
    fn subscribe(
        self: Box<Self>,
        request: &SubscriptionRequest,
        cancel: CancellationToken,
    ) -> Subscription;
}
