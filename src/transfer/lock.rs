//! Advisory target locking
//!
//! Two workers never stream into the same target: the engine holds an
//! exclusive `fd-lock` on `.<name>.lock` next to the target for the whole
//! transfer.

use fd_lock::{RwLock, RwLockWriteGuard};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use super::{TransferError, TransferResult};

/// Lock file guarding one target path
pub struct TargetLock {
    lock: RwLock<File>,
    path: PathBuf,
    owned: bool,
}

impl TargetLock {
    /// Open (creating if needed) the lock file for `target`
    pub fn open(target: &Path) -> TransferResult<Self> {
        if let Some(parent) = target.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let path = lock_path(target);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        Ok(Self {
            lock: RwLock::new(file),
            path,
            owned: false,
        })
    }

    /// Take the exclusive lock without blocking
    ///
    /// Fails with [`TransferError::TargetBusy`] when another transfer owns it.
    pub fn try_acquire(&mut self) -> TransferResult<RwLockWriteGuard<'_, File>> {
        match self.lock.try_write() {
            Ok(guard) => {
                self.owned = true;
                Ok(guard)
            }
            Err(_) => Err(TransferError::TargetBusy(self.path.clone())),
        }
    }
}

impl Drop for TargetLock {
    fn drop(&mut self) {
        // Only the owner removes the file; a rejected opener must not
        // unlink a lock someone else holds.
        if self.owned {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

fn lock_path(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    target.with_file_name(format!(".{name}.lock"))
}
