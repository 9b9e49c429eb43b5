//! Rendering of credential updates into their on-disk form.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use zeroize::Zeroizing;

use crate::cert::{certificates_to_pem, private_key_to_pem};
use crate::config::{JwtSvidEncoding, RotationConfig};
use crate::credential::{CertificateDer, JwtBundleUpdate, JwtSvidUpdate, X509Update};

use super::{WriteError, WriteTarget};

/// Renders the SVID, key and bundle files.
///
/// With `add_intermediates_to_bundle` the SVID file holds only the leaf and
/// the intermediates follow the trust domain CAs in the bundle file. With
/// `include_federated_domains` federated CAs are appended to the bundle,
/// ordered by trust domain name.
pub(crate) fn x509_targets(config: &RotationConfig, update: &X509Update) -> Vec<WriteTarget> {
    let Some(files) = &config.x509 else {
        return Vec::new();
    };

    let (svid_certs, extra_bundle): (&[CertificateDer], &[CertificateDer]) =
        if config.add_intermediates_to_bundle {
            (
                update.chain.get(..1).unwrap_or(&[]),
                update.intermediates(),
            )
        } else {
            (update.chain.as_slice(), &[][..])
        };

    let mut bundle: Vec<&CertificateDer> = update.bundle.iter().chain(extra_bundle).collect();
    if config.include_federated_domains {
        bundle.extend(update.federated_bundles.values().flatten());
    }

    vec![
        WriteTarget::new(
            config.path_for(&files.svid_file_name),
            certificates_to_pem(svid_certs),
            config.modes.cert,
        ),
        WriteTarget::from_secret(
            config.path_for(&files.svid_key_file_name),
            private_key_to_pem(&update.key),
            config.modes.key,
        ),
        WriteTarget::new(
            config.path_for(&files.svid_bundle_file_name),
            certificates_to_pem(bundle),
            config.modes.cert,
        ),
    ]
}

/// Renders one file per configured entry requesting these audiences.
pub(crate) fn jwt_svid_targets(config: &RotationConfig, update: &JwtSvidUpdate) -> Vec<WriteTarget> {
    config
        .jwt_svids
        .iter()
        .filter(|target| target.audience == update.audience)
        .map(|target| {
            let token = update.token.as_str().as_bytes();
            let contents = match target.encoding {
                JwtSvidEncoding::Raw => Zeroizing::new(token.to_vec()),
                JwtSvidEncoding::Base64 => Zeroizing::new(STANDARD.encode(token).into_bytes()),
            };
            WriteTarget::from_secret(
                config.path_for(&target.file_name),
                contents,
                config.modes.jwt_svid,
            )
        })
        .collect()
}

/// Renders the JWT bundle file: a JSON object mapping each trust domain to
/// the standard base64 encoding of its JWKS document.
pub(crate) fn jwt_bundle_targets(
    config: &RotationConfig,
    update: &JwtBundleUpdate,
) -> Result<Vec<WriteTarget>, WriteError> {
    let Some(file_name) = &config.jwt_bundle_file_name else {
        return Ok(Vec::new());
    };

    let encoded: BTreeMap<&str, String> = update
        .bundles
        .iter()
        .map(|(td, jwks)| (td.as_str(), STANDARD.encode(jwks)))
        .collect();
    let contents = serde_json::to_vec(&encoded)?;

    Ok(vec![WriteTarget::new(
        config.path_for(file_name),
        contents,
        config.modes.jwt_bundle,
    )])
}
