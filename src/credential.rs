//! Credential update events delivered by a [`CredentialSource`](crate::CredentialSource).
//!
//! Updates carry credential material exactly as it arrived (DER certificates,
//! PKCS#8 key bytes, compact JWTs, JWKS documents). Rendering into the on-disk
//! formats happens in [`crate::writer`].

use std::collections::BTreeMap;
use std::fmt;

use zeroize::{Zeroize, ZeroizeOnDrop};

/// The kind of credential material an update carries.
///
/// Each kind has its own write queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CredentialKind {
    /// X.509 SVID, private key and trust bundle.
    X509Svid,
    /// A JWT SVID for one configured audience entry.
    JwtSvid,
    /// The JWT trust bundle (JWKS per trust domain).
    JwtBundle,
}

impl CredentialKind {
    /// Stable lowercase identifier used in logs and health output.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::X509Svid => "x509_svid",
            Self::JwtSvid => "jwt_svid",
            Self::JwtBundle => "jwt_bundle",
        }
    }
}

impl fmt::Display for CredentialKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single DER-encoded certificate.
#[derive(Clone, PartialEq, Eq)]
pub struct CertificateDer(Vec<u8>);

impl CertificateDer {
    /// Returns the DER bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for CertificateDer {
    fn from(der: Vec<u8>) -> Self {
        Self(der)
    }
}

impl AsRef<[u8]> for CertificateDer {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for CertificateDer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CertificateDer({} bytes)", self.0.len())
    }
}

/// A PKCS#8 DER-encoded private key. Zeroed on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct PrivateKeyDer(Vec<u8>);

impl PrivateKeyDer {
    /// Returns the DER bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for PrivateKeyDer {
    fn from(der: Vec<u8>) -> Self {
        Self(der)
    }
}

impl fmt::Debug for PrivateKeyDer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrivateKeyDer(<redacted>)")
    }
}

/// A new X.509 identity: the SVID chain, its private key and trust bundles.
///
/// Replaced wholesale on every rotation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct X509Update {
    /// Certificate chain, leaf first.
    pub chain: Vec<CertificateDer>,
    /// Private key matching the leaf certificate.
    pub key: PrivateKeyDer,
    /// CA certificates of the workload's own trust domain.
    pub bundle: Vec<CertificateDer>,
    /// CA certificates of federated trust domains, keyed by trust domain name.
    pub federated_bundles: BTreeMap<String, Vec<CertificateDer>>,
}

impl X509Update {
    /// The leaf certificate, if the chain is non-empty.
    pub fn leaf(&self) -> Option<&CertificateDer> {
        self.chain.first()
    }

    /// Certificates after the leaf, in chain order.
    pub fn intermediates(&self) -> &[CertificateDer] {
        self.chain.get(1..).unwrap_or(&[])
    }
}

/// Identifies one configured JWT SVID request.
///
/// Two configured entries with the same audiences share a key and receive the
/// same token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AudienceKey {
    /// Primary audience.
    pub audience: String,
    /// Additional audiences requested with the primary one.
    pub extra_audiences: Vec<String>,
}

impl AudienceKey {
    /// Creates a key for `audience` with the given extra audiences.
    pub fn new(audience: impl Into<String>, extra_audiences: Vec<String>) -> Self {
        Self {
            audience: audience.into(),
            extra_audiences,
        }
    }

    /// All audiences, primary first.
    pub fn audiences(&self) -> Vec<String> {
        std::iter::once(self.audience.clone())
            .chain(self.extra_audiences.iter().cloned())
            .collect()
    }
}

impl fmt::Display for AudienceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.audience)?;
        for extra in &self.extra_audiences {
            write!(f, ",{extra}")?;
        }
        Ok(())
    }
}

/// A compact-serialized JWT. Zeroed on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct JwtToken(String);

impl JwtToken {
    /// Returns the token string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for JwtToken {
    fn from(token: String) -> Self {
        Self(token)
    }
}

impl From<&str> for JwtToken {
    fn from(token: &str) -> Self {
        Self(token.to_owned())
    }
}

impl fmt::Debug for JwtToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("JwtToken(<redacted>)")
    }
}

/// A fresh JWT SVID for one audience key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JwtSvidUpdate {
    /// The audiences the token was issued for.
    pub audience: AudienceKey,
    /// The token itself.
    pub token: JwtToken,
}

/// A new set of JWT bundles.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct JwtBundleUpdate {
    /// Raw JWKS documents keyed by trust domain name.
    pub bundles: BTreeMap<String, Vec<u8>>,
}

/// An event on the JWT stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JwtUpdate {
    /// A token for one audience key.
    Svid(JwtSvidUpdate),
    /// A new trust bundle set.
    Bundle(JwtBundleUpdate),
}

/// Any update accepted by the [`CredentialWriter`](crate::CredentialWriter).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialUpdate {
    /// X.509 identity.
    X509(X509Update),
    /// JWT SVID for one audience key.
    JwtSvid(JwtSvidUpdate),
    /// JWT trust bundles.
    JwtBundle(JwtBundleUpdate),
}

impl CredentialUpdate {
    /// The credential kind this update carries.
    pub fn kind(&self) -> CredentialKind {
        match self {
            Self::X509(_) => CredentialKind::X509Svid,
            Self::JwtSvid(_) => CredentialKind::JwtSvid,
            Self::JwtBundle(_) => CredentialKind::JwtBundle,
        }
    }
}

impl From<X509Update> for CredentialUpdate {
    fn from(update: X509Update) -> Self {
        Self::X509(update)
    }
}

impl From<JwtUpdate> for CredentialUpdate {
    fn from(update: JwtUpdate) -> Self {
        match update {
            JwtUpdate::Svid(svid) => Self::JwtSvid(svid),
            JwtUpdate::Bundle(bundle) => Self::JwtBundle(bundle),
        }
    }
}

/// Identifies the write slot an update occupies.
///
/// Updates with the same slot are serialized and coalesced: only the most
/// recent pending value is written.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum UpdateSlot {
    /// The X.509 file set.
    X509,
    /// The files of one JWT audience key.
    JwtSvid(AudienceKey),
    /// The JWT bundle file.
    JwtBundle,
}

impl UpdateSlot {
    /// The credential kind written into this slot.
    pub fn kind(&self) -> CredentialKind {
        match self {
            Self::X509 => CredentialKind::X509Svid,
            Self::JwtSvid(_) => CredentialKind::JwtSvid,
            Self::JwtBundle => CredentialKind::JwtBundle,
        }
    }
}

impl CredentialUpdate {
    /// The write slot for this update.
    pub fn slot(&self) -> UpdateSlot {
        match self {
            Self::X509(_) => UpdateSlot::X509,
            Self::JwtSvid(svid) => UpdateSlot::JwtSvid(svid.audience.clone()),
            Self::JwtBundle(_) => UpdateSlot::JwtBundle,
        }
    }
}
