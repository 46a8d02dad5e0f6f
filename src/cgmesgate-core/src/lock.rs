//! Exclusive ownership of a data directory.
//!
//! Opening a service sweeps workspaces and enforces the install and
//! capacity bounds in memory, so only one process may own a data directory
//! at a time. Ownership is an advisory `flock` on `<data_dir>/.lock`, held
//! for as long as the [`DataDirLock`] lives and dropped with the process.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use log::{debug, warn};

use crate::error::{Error, Result};

pub const LOCK_FILE: &str = ".lock";

/// Held exclusive lock on a data directory.
#[derive(Debug)]
pub struct DataDirLock {
    path: PathBuf,
    file: File,
}

impl DataDirLock {
    /// Take the lock without waiting.
    ///
    /// # Errors
    /// [`Error::DataDirLocked`] when another service (in this or any other
    /// process) already owns `data_dir`.
    pub fn acquire(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join(LOCK_FILE);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .map_err(|e| Error::workspace(&path, e))?;

        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => {
                debug!("lock={} Acquired data directory lock", path.display());
                Ok(Self { path, file })
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                warn!("data_dir={} Data directory is owned by another service", data_dir.display());
                Err(Error::DataDirLocked(data_dir.to_path_buf()))
            }
            Err(e) => Err(Error::workspace(&path, e)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DataDirLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!("lock={} error={} Failed to release data directory lock", self.path.display(), e);
        }
    }
}
