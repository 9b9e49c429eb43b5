//! Credential Writer: renders updates and persists them atomically.
//!
//! Every file is replaced through [`write_atomic`], so a concurrent reader sees
//! either the previous credential or the new one. Permission bits are applied
//! to the temporary file before any content is written.

mod atomic;
mod render;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use zeroize::Zeroizing;

use crate::config::RotationConfig;
use crate::credential::CredentialUpdate;
use crate::prelude::debug;

pub use atomic::write_atomic;

/// Errors returned by the [`CredentialWriter`].
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum WriteError {
    /// A filesystem operation failed for the given destination.
    #[error("failed to write {}: {source}", path.display())]
    WriteFailed {
        /// Destination path of the failed write.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The JWT bundle could not be serialized to JSON.
    #[error("failed to encode JWT bundle: {0}")]
    Encode(#[from] serde_json::Error),
}

impl WriteError {
    /// The destination path, if the failure is tied to one.
    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::WriteFailed { path, .. } => Some(path),
            Self::Encode(_) => None,
        }
    }
}

/// The unit of persistence: final bytes, destination and permission bits.
///
/// Contents are zeroed on drop since targets may hold private keys or tokens.
#[derive(Clone)]
pub struct WriteTarget {
    path: PathBuf,
    contents: Zeroizing<Vec<u8>>,
    mode: u32,
}

impl WriteTarget {
    /// Creates a target.
    pub fn new(path: impl Into<PathBuf>, contents: Vec<u8>, mode: u32) -> Self {
        Self::from_secret(path, Zeroizing::new(contents), mode)
    }

    /// Creates a target from an already zeroizing buffer.
    pub fn from_secret(path: impl Into<PathBuf>, contents: Zeroizing<Vec<u8>>, mode: u32) -> Self {
        Self {
            path: path.into(),
            contents,
            mode,
        }
    }

    /// Destination path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes written to the destination.
    pub fn contents(&self) -> &[u8] {
        &self.contents
    }

    /// Permission bits of the destination.
    pub fn mode(&self) -> u32 {
        self.mode
    }
}

impl fmt::Debug for WriteTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteTarget")
            .field("path", &self.path)
            .field("len", &self.contents.len())
            .field("mode", &format_args!("{:#o}", self.mode))
            .finish()
    }
}

/// Renders credential updates to their configured files and writes them.
///
/// Writes are blocking filesystem calls; async callers should run them on a
/// blocking thread.
#[derive(Debug, Clone)]
pub struct CredentialWriter {
    config: Arc<RotationConfig>,
}

impl CredentialWriter {
    /// Creates a writer for the files named in `config`.
    pub fn new(config: Arc<RotationConfig>) -> Self {
        Self { config }
    }

    /// Renders `update` into its write targets without touching the filesystem.
    ///
    /// # Errors
    ///
    /// Returns [`WriteError::Encode`] if the JWT bundle cannot be serialized.
    pub fn targets(&self, update: &CredentialUpdate) -> Result<Vec<WriteTarget>, WriteError> {
        match update {
            CredentialUpdate::X509(u) => Ok(render::x509_targets(&self.config, u)),
            CredentialUpdate::JwtSvid(u) => Ok(render::jwt_svid_targets(&self.config, u)),
            CredentialUpdate::JwtBundle(u) => render::jwt_bundle_targets(&self.config, u),
        }
    }

    /// Writes every target for `update`, in order.
    ///
    /// Stops at the first failure. Files already replaced stay replaced.
    ///
    /// # Errors
    ///
    /// Returns [`WriteError`] if rendering or any file write fails.
    pub fn write(&self, update: &CredentialUpdate) -> Result<(), WriteError> {
        let targets = self.targets(update)?;
        for target in &targets {
            write_atomic(target)?;
            debug!(
                "Wrote credential file: kind={}, path={}, mode={:#o}",
                update.kind(),
                target.path().display(),
                target.mode()
            );
        }
        Ok(())
    }
}
