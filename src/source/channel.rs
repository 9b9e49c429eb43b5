use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{
    CredentialSource, JwtReceiver, SourceError, Subscription, SubscriptionRequest, X509Receiver,
    UPDATE_BUFFER,
};
use crate::credential::{JwtBundleUpdate, JwtSvidUpdate, JwtUpdate, X509Update};

/// A source fed by hand through a [`ChannelSourceSender`].
///
/// Useful for embedding the controller behind a custom credential feed and
/// for driving it in tests.
#[derive(Debug)]
pub struct ChannelSource {
    x509: X509Receiver,
    jwt: JwtReceiver,
}

/// Feeds a [`ChannelSource`]. Dropping every sender closes both streams.
#[derive(Debug, Clone)]
pub struct ChannelSourceSender {
    x509: mpsc::Sender<Result<X509Update, SourceError>>,
    jwt: mpsc::Sender<Result<JwtUpdate, SourceError>>,
}

impl ChannelSource {
    /// Creates a connected sender and source.
    pub fn new() -> (ChannelSourceSender, Self) {
        let (x509_tx, x509_rx) = mpsc::channel(UPDATE_BUFFER);
        let (jwt_tx, jwt_rx) = mpsc::channel(UPDATE_BUFFER);
        (
            ChannelSourceSender {
                x509: x509_tx,
                jwt: jwt_tx,
            },
            Self {
                x509: x509_rx,
                jwt: jwt_rx,
            },
        )
    }
}

impl CredentialSource for ChannelSource {
    fn subscribe(
        self: Box<Self>,
        request: &SubscriptionRequest,
        _cancel: CancellationToken,
    ) -> Subscription {
        let Self { x509, jwt } = *self;
        Subscription {
            x509: request.x509.then_some(x509),
            jwt: request.wants_jwt().then_some(jwt),
        }
    }
}

impl ChannelSourceSender {
    /// Delivers an X.509 identity.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::Closed`] if the subscriber is gone.
    pub async fn send_x509(&self, update: X509Update) -> Result<(), SourceError> {
        self.x509
            .send(Ok(update))
            .await
            .map_err(|_| SourceError::Closed)
    }

    /// Delivers a JWT SVID.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::Closed`] if the subscriber is gone.
    pub async fn send_jwt_svid(&self, update: JwtSvidUpdate) -> Result<(), SourceError> {
        self.send_jwt(Ok(JwtUpdate::Svid(update))).await
    }

    /// Delivers a JWT bundle set.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::Closed`] if the subscriber is gone.
    pub async fn send_jwt_bundle(&self, update: JwtBundleUpdate) -> Result<(), SourceError> {
        self.send_jwt(Ok(JwtUpdate::Bundle(update))).await
    }

    /// Delivers a failure on the X.509 stream.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::Closed`] if the subscriber is gone.
    pub async fn fail_x509(&self, error: SourceError) -> Result<(), SourceError> {
        self.x509
            .send(Err(error))
            .await
            .map_err(|_| SourceError::Closed)
    }

    /// Delivers a failure on the JWT stream.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::Closed`] if the subscriber is gone.
    pub async fn fail_jwt(&self, error: SourceError) -> Result<(), SourceError> {
        self.send_jwt(Err(error)).await
    }

    async fn send_jwt(&self, item: Result<JwtUpdate, SourceError>) -> Result<(), SourceError> {
        self.jwt.send(item).await.map_err(|_| SourceError::Closed)
    }
}
