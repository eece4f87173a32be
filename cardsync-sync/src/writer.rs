//! Atomic file writer shared by the State Store and marker injection.
//!
//! ## `atomic_write` protocol
//!
//! 1. Ensure the parent directory exists.
//! 2. Write to `<path>.cardsync.tmp` in the same directory.
//! 3. Restrict permissions when requested (`0600` on Unix).
//! 4. Rename to the final path (atomic on POSIX).
//! 5. On rename failure, remove the `.tmp` and leave the original untouched.

use std::path::{Path, PathBuf};

use crate::error::{io_err, SyncError};

/// Sibling temp path used by [`atomic_write`].
pub(crate) fn tmp_path_for(path: &Path) -> PathBuf {
    PathBuf::from(format!("{}.cardsync.tmp", path.display()))
}

/// Atomically replace `path` with `content`.
pub(crate) fn atomic_write(path: &Path, content: &str, private: bool) -> Result<(), SyncError> {
    atomic_write_with_tmp(path, content, private, &tmp_path_for(path))
}

fn atomic_write_with_tmp(
    path: &Path,
    content: &str,
    private: bool,
    tmp: &Path,
) -> Result<(), SyncError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
        }
    }

    std::fs::write(tmp, content).map_err(|e| io_err(tmp, e))?;
    if private {
        set_file_permissions(tmp)?;
    }

    if let Err(e) = std::fs::rename(tmp, path) {
        let _ = std::fs::remove_file(tmp);
        return Err(io_err(path, e));
    }

    tracing::debug!("wrote: {}", path.display());
    Ok(())
}

#[cfg(unix)]
fn set_file_permissions(path: &Path) -> Result<(), SyncError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .map_err(|e| io_err(path, e))
}
#[cfg(not(unix))]
fn set_file_permissions(_path: &Path) -> Result<(), SyncError> {
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
