use std::collections::BTreeMap;

use tonic::codegen::http::uri::PathAndQuery;
use tonic::metadata::MetadataValue;
use tonic::transport::Channel;
use tonic::{Request, Streaming};

use super::pb::{
    JwtBundlesRequest, JwtBundlesResponse, JwtsvidRequest, JwtsvidResponse, X509svidRequest,
    X509svidResponse,
};
use super::{Endpoint, WorkloadApiError};
use crate::cert::{split_der_bundle, split_der_chain};
use crate::credential::{AudienceKey, JwtBundleUpdate, JwtToken, X509Update};

const SPIFFE_HEADER_KEY: &str = "workload.spiffe.io";
const SPIFFE_HEADER_VALUE: &str = "true";
const TRUST_DOMAIN_PREFIX: &str = "spiffe://";

const FETCH_X509_SVID: &str = "/SpiffeWorkloadAPI/FetchX509SVID";
const FETCH_JWT_SVID: &str = "/SpiffeWorkloadAPI/FetchJWTSVID";
const FETCH_JWT_BUNDLES: &str = "/SpiffeWorkloadAPI/FetchJWTBundles";

/// Minimal SPIFFE Workload API client.
///
/// Cloning is cheap; clones share the underlying channel.
#[derive(Debug, Clone)]
pub struct WorkloadApiClient {
    channel: Channel,
}

impl WorkloadApiClient {
    /// Connects to the Workload API at `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns [`WorkloadApiError`] if the connection fails.
    pub async fn connect(endpoint: &Endpoint) -> Result<Self, WorkloadApiError> {
        Ok(Self {
            channel: endpoint.connect().await?,
        })
    }

    /// Opens the X.509 SVID stream. Each message carries a full identity.
    ///
    /// # Errors
    ///
    /// Returns [`WorkloadApiError`] if the call is rejected.
    pub async fn stream_x509_svids(&self) -> Result<X509SvidStream, WorkloadApiError> {
        let mut grpc = self.grpc().await?;
        let response = grpc
            .server_streaming(
                spiffe_request(X509svidRequest::default()),
                PathAndQuery::from_static(FETCH_X509_SVID),
                tonic_prost::ProstCodec::<X509svidRequest, X509svidResponse>::default(),
            )
            .await?;
        Ok(X509SvidStream {
            inner: response.into_inner(),
        })
    }

    /// Fetches the default JWT SVID for `audience`.
    ///
    /// # Errors
    ///
    /// Returns [`WorkloadApiError::EmptyResponse`] if no token is returned.
    pub async fn fetch_jwt_svid(&self, audience: &AudienceKey) -> Result<JwtToken, WorkloadApiError> {
        let mut grpc = self.grpc().await?;
        let request = JwtsvidRequest {
            audience: audience.audiences(),
            spiffe_id: String::new(),
        };
        let response = grpc
            .unary(
                spiffe_request(request),
                PathAndQuery::from_static(FETCH_JWT_SVID),
                tonic_prost::ProstCodec::<JwtsvidRequest, JwtsvidResponse>::default(),
            )
            .await?
            .into_inner();

        response
            .svids
            .into_iter()
            .next()
            .map(|svid| JwtToken::from(svid.svid))
            .ok_or(WorkloadApiError::EmptyResponse)
    }

    /// Opens the JWT bundle stream.
    ///
    /// # Errors
    ///
    /// Returns [`WorkloadApiError`] if the call is rejected.
    pub async fn stream_jwt_bundles(&self) -> Result<JwtBundleStream, WorkloadApiError> {
        let mut grpc = self.grpc().await?;
        let response = grpc
            .server_streaming(
                spiffe_request(JwtBundlesRequest::default()),
                PathAndQuery::from_static(FETCH_JWT_BUNDLES),
                tonic_prost::ProstCodec::<JwtBundlesRequest, JwtBundlesResponse>::default(),
            )
            .await?;
        Ok(JwtBundleStream {
            inner: response.into_inner(),
        })
    }

    async fn grpc(&self) -> Result<tonic::client::Grpc<Channel>, WorkloadApiError> {
        let mut grpc = tonic::client::Grpc::new(self.channel.clone());
        grpc.ready().await?;
        Ok(grpc)
    }
}

/// Stream of X.509 identities.
#[derive(Debug)]
pub struct X509SvidStream {
    inner: Streaming<X509svidResponse>,
}

impl X509SvidStream {
    /// Next identity, or `None` when the server ends the stream.
    ///
    /// # Errors
    ///
    /// Returns [`WorkloadApiError`] on stream failure or malformed content.
    pub async fn next(&mut self) -> Result<Option<X509Update>, WorkloadApiError> {
        match self.inner.message().await? {
            Some(response) => x509_update(response).map(Some),
            None => Ok(None),
        }
    }
}

/// Stream of JWT bundle sets.
#[derive(Debug)]
pub struct JwtBundleStream {
    inner: Streaming<JwtBundlesResponse>,
}

impl JwtBundleStream {
    /// Next bundle set, or `None` when the server ends the stream.
    ///
    /// # Errors
    ///
    /// Returns [`WorkloadApiError`] on stream failure.
    pub async fn next(&mut self) -> Result<Option<JwtBundleUpdate>, WorkloadApiError> {
        Ok(self.inner.message().await?.map(jwt_bundle_update))
    }
}

fn spiffe_request<T>(message: T) -> Request<T> {
    let mut request = Request::new(message);
    request.metadata_mut().insert(
        SPIFFE_HEADER_KEY,
        MetadataValue::from_static(SPIFFE_HEADER_VALUE),
    );
    request
}

fn trust_domain_name(id: &str) -> String {
    id.strip_prefix(TRUST_DOMAIN_PREFIX).unwrap_or(id).to_owned()
}

pub(crate) fn x509_update(response: X509svidResponse) -> Result<X509Update, WorkloadApiError> {
    let svid = response
        .svids
        .into_iter()
        .next()
        .ok_or(WorkloadApiError::EmptyResponse)?;

    let chain = split_der_chain(&svid.x509_svid)?;
    if chain.is_empty() {
        return Err(WorkloadApiError::EmptyResponse);
    }

    let federated_bundles = response
        .federated_bundles
        .into_iter()
        .map(|(td, der)| -> Result<_, WorkloadApiError> {
            Ok((trust_domain_name(&td), split_der_bundle(&der)?))
        })
        .collect::<Result<BTreeMap<_, _>, _>>()?;

    Ok(X509Update {
        chain,
        key: svid.x509_svid_key.into(),
        bundle: split_der_bundle(&svid.bundle)?,
        federated_bundles,
    })
}

pub(crate) fn jwt_bundle_update(response: JwtBundlesResponse) -> JwtBundleUpdate {
    JwtBundleUpdate {
        bundles: response
            .bundles
            .into_iter()
            .map(|(td, jwks)| (trust_domain_name(&td), jwks))
            .collect(),
    }
}
