//! Advisory file locks.

use anyhow::{Context, Result};
use fs4::FileExt;
use std::fs::{File, OpenOptions};
use std::path::Path;

use super::RealRuntime;

/// An exclusive advisory lock, released when dropped.
#[derive(Debug)]
pub struct EnvLock {
    file: Option<File>,
}

impl EnvLock {
    /// A lock that holds no file, for runtimes without real locking.
    pub fn detached() -> Self {
        Self { file: None }
    }
}

impl Drop for EnvLock {
    fn drop(&mut self) {
        if let Some(file) = &self.file {
            let _ = file.unlock();
        }
    }
}

impl RealRuntime {
    #[tracing::instrument(skip(self))]
    pub(crate) fn try_lock_impl(&self, path: &Path) -> Result<Option<EnvLock>> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("Failed to open lock file {:?}", path))?;

        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(EnvLock { file: Some(file) })),
            Err(e) if e.raw_os_error() == fs4::lock_contended_error().raw_os_error() => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to lock {:?}", path)),
        }
    }
}
