//! Workload API protobuf messages.
//!
//! Only the messages used by the helper are declared. Field tags follow the
//! SPIFFE `workload.proto` definition.

/// `X509SVIDRequest`
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct X509svidRequest {}

/// `X509SVIDResponse`
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct X509svidResponse {
    /// SVIDs issued to the workload. The first one is the default.
    #[prost(message, repeated, tag = "1")]
    pub svids: ::prost::alloc::vec::Vec<X509svid>,
    /// ASN.1 DER encoded certificate revocation lists.
    #[prost(bytes = "vec", repeated, tag = "2")]
    pub crl: ::prost::alloc::vec::Vec<::prost::alloc::vec::Vec<u8>>,
    /// CA certificates of federated trust domains, keyed by trust domain ID.
    #[prost(map = "string, bytes", tag = "3")]
    pub federated_bundles: ::std::collections::HashMap<
        ::prost::alloc::string::String,
        ::prost::alloc::vec::Vec<u8>,
    >,
}

/// `X509SVID`
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct X509svid {
    /// SPIFFE ID of the SVID.
    #[prost(string, tag = "1")]
    pub spiffe_id: ::prost::alloc::string::String,
    /// Concatenated ASN.1 DER certificate chain, leaf first.
    #[prost(bytes = "vec", tag = "2")]
    pub x509_svid: ::prost::alloc::vec::Vec<u8>,
    /// ASN.1 DER PKCS#8 private key.
    #[prost(bytes = "vec", tag = "3")]
    pub x509_svid_key: ::prost::alloc::vec::Vec<u8>,
    /// Concatenated ASN.1 DER CA certificates of the SVID's trust domain.
    #[prost(bytes = "vec", tag = "4")]
    pub bundle: ::prost::alloc::vec::Vec<u8>,
    /// Operator-specified hint.
    #[prost(string, tag = "5")]
    pub hint: ::prost::alloc::string::String,
}

/// `JWTSVIDRequest`
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct JwtsvidRequest {
    /// Audiences the token is issued for.
    #[prost(string, repeated, tag = "1")]
    pub audience: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
    /// Requested SPIFFE ID; empty for all identities.
    #[prost(string, tag = "2")]
    pub spiffe_id: ::prost::alloc::string::String,
}

/// `JWTSVIDResponse`
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct JwtsvidResponse {
    /// Issued tokens. The first one is the default.
    #[prost(message, repeated, tag = "1")]
    pub svids: ::prost::alloc::vec::Vec<Jwtsvid>,
}

/// `JWTSVID`
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Jwtsvid {
    /// SPIFFE ID of the token.
    #[prost(string, tag = "1")]
    pub spiffe_id: ::prost::alloc::string::String,
    /// Compact-serialized JWT.
    #[prost(string, tag = "2")]
    pub svid: ::prost::alloc::string::String,
    /// Operator-specified hint.
    #[prost(string, tag = "3")]
    pub hint: ::prost::alloc::string::String,
}

/// `JWTBundlesRequest`
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct JwtBundlesRequest {}

/// `JWTBundlesResponse`
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct JwtBundlesResponse {
    /// JWKS documents keyed by trust domain ID.
    #[prost(map = "string, bytes", tag = "1")]
    pub bundles: ::std::collections::HashMap<
        ::prost::alloc::string::String,
        ::prost::alloc::vec::Vec<u8>,
    >,
}
