//! Artifact unpacking.
//!
//! Cache entries are stored under their digest without an extension, so the
//! format is chosen from the artifact's original file name. Archives are
//! unpacked into a sibling temp directory first; a single wrapping top-level
//! directory (as in release tarballs and sdists) is stripped before the
//! result is moved into place.

mod tar_gz;
mod zip;

use anyhow::{Context, Result, bail};
use log::debug;
use std::path::{Component, Path, PathBuf};

use crate::cleanup::{CleanupGuard, SharedCleanupContext};
use crate::runtime::Runtime;

pub use tar_gz::TarGzExtractor;
pub use zip::ZipExtractor;

/// Format-specific unpacker.
pub trait ArchiveExtractor: Send + Sync {
    fn can_handle(&self, file_name: &str) -> bool;

    /// Unpack every entry of `archive` under `dest`, which already exists.
    fn unpack<R: Runtime>(&self, runtime: &R, archive: &Path, dest: &Path) -> Result<()>;
}

/// Picks the extractor for an artifact and stages its contents.
pub struct ArchiveExtractorImpl {
    tar_gz: TarGzExtractor,
    zip: ZipExtractor,
}

impl Default for ArchiveExtractorImpl {
    fn default() -> Self {
        Self::new()
    }
}

impl ArchiveExtractorImpl {
    pub fn new() -> Self {
        Self {
            tar_gz: TarGzExtractor,
            zip: ZipExtractor,
        }
    }

    pub fn is_archive(&self, file_name: &str) -> bool {
        self.tar_gz.can_handle(file_name) || self.zip.can_handle(file_name)
    }

    /// Stage `archive` (named `file_name` at its source) at `extract_to`,
    /// which must not exist yet. Non-archive artifacts are staged as a single
    /// file `extract_to/<file_name>`.
    #[tracing::instrument(skip(self, runtime, cleanup_ctx))]
    pub fn stage<R: Runtime>(
        &self,
        runtime: &R,
        archive: &Path,
        file_name: &str,
        extract_to: &Path,
        cleanup_ctx: Option<SharedCleanupContext>,
    ) -> Result<()> {
        let temp_dir = sibling_temp_dir(extract_to)?;
        if runtime.exists(&temp_dir) {
            runtime.remove_dir_all(&temp_dir)?;
        }
        runtime.create_dir_all(&temp_dir)?;
        let guard = cleanup_ctx.map(|ctx| CleanupGuard::new(ctx, temp_dir.clone()));

        let result = self.stage_into(runtime, archive, file_name, &temp_dir, extract_to);
        if let Err(e) = result {
            if runtime.exists(&temp_dir) {
                let _ = runtime.remove_dir_all(&temp_dir);
            }
            return Err(e);
        }

        if let Some(guard) = guard {
            guard.success();
        }
        Ok(())
    }

    fn stage_into<R: Runtime>(
        &self,
        runtime: &R,
        archive: &Path,
        file_name: &str,
        temp_dir: &Path,
        extract_to: &Path,
    ) -> Result<()> {
        if self.tar_gz.can_handle(file_name) {
            debug!("Unpacking {} as tar.gz", file_name);
            self.tar_gz.unpack(runtime, archive, temp_dir)?;
        } else if self.zip.can_handle(file_name) {
            debug!("Unpacking {} as zip", file_name);
            self.zip.unpack(runtime, archive, temp_dir)?;
        } else {
            debug!("Staging {} as a plain file", file_name);
            runtime.copy(archive, &temp_dir.join(file_name))?;
        }
        promote_single_root(runtime, temp_dir, extract_to)
    }
}

/// Move the unpacked tree into `extract_to`, stripping one wrapping directory.
fn promote_single_root<R: Runtime>(runtime: &R, temp_dir: &Path, extract_to: &Path) -> Result<()> {
    let entries = runtime
        .read_dir(temp_dir)
        .context("Failed to read temp extraction directory")?;

    let source = match entries.as_slice() {
        [] => bail!("Archive appears to be empty."),
        [only] if runtime.is_dir(only) && !runtime.is_symlink(only) => only.clone(),
        _ => temp_dir.to_path_buf(),
    };

    debug!("Moving {:?} to {:?}", source, extract_to);
    runtime.rename(&source, extract_to)?;
    if source != temp_dir && runtime.exists(temp_dir) {
        runtime.remove_dir_all(temp_dir)?;
    }
    Ok(())
}

fn sibling_temp_dir(extract_to: &Path) -> Result<PathBuf> {
    let name = extract_to
        .file_name()
        .with_context(|| format!("Invalid extraction target {:?}", extract_to))?;
    Ok(extract_to.with_file_name(format!("{}.partial", name.to_string_lossy())))
}

/// Join an archive entry path onto `dest`, refusing anything that would
/// land outside of it.
pub(crate) fn safe_entry_path(dest: &Path, entry: &Path) -> Result<PathBuf> {
    let mut out = dest.to_path_buf();
    for component in entry.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            _ => bail!("Archive entry {:?} escapes the extraction directory", entry),
        }
    }
    if out == dest {
        bail!("Archive entry {:?} has an empty path", entry);
    }
    Ok(out)
}
