//! Atomic file replacement.
//!
//! Content goes to a temporary file in the destination directory, gets its
//! final mode, is synced, and is then renamed over the destination. Readers
//! observe either the previous file or the new one, never a partial write.

use std::fs::File;
use std::io::Write as _;
use std::path::Path;

use tempfile::Builder;

use super::{WriteError, WriteTarget};
use crate::prelude::debug;

const TEMP_PREFIX: &str = ".spiffe-helper-";

/// Atomically replaces `target.path` with `target.contents` at `target.mode`.
///
/// # Errors
///
/// Returns [`WriteError::WriteFailed`] carrying the destination path if any
/// filesystem step fails. The destination is left untouched in that case.
pub fn write_atomic(target: &WriteTarget) -> Result<(), WriteError> {
    let path = target.path();
    let failed = |source| WriteError::WriteFailed {
        path: path.to_path_buf(),
        source,
    };

    let dir = parent_dir(path);
    let mut tmp = Builder::new()
        .prefix(TEMP_PREFIX)
        .tempfile_in(dir)
        .map_err(failed)?;

    // Permissions are set on the open handle so the process umask never applies.
    set_mode(tmp.as_file(), target.mode()).map_err(failed)?;

    tmp.write_all(target.contents()).map_err(failed)?;
    tmp.as_file().sync_all().map_err(failed)?;
    tmp.persist(path).map_err(|e| failed(e.error))?;

    // The new content is already in place; a failed directory sync only
    // weakens durability across a crash.
    if let Err(e) = sync_dir(dir) {
        debug!(
            "Failed to sync directory after rename: dir={}, error={}",
            dir.display(),
            e
        );
    }
    Ok(())
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    }
}

#[cfg(unix)]
fn set_mode(file: &File, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt as _;
    file.set_permissions(std::fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_file: &File, _mode: u32) -> std::io::Result<()> {
    Ok(())
}

// Makes the rename durable on filesystems that need it.
#[cfg(unix)]
fn sync_dir(dir: &Path) -> std::io::Result<()> {
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}
