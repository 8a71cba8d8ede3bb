//! File system operations (read, write, directory, permissions).

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use super::RealRuntime;

impl RealRuntime {
    #[tracing::instrument(skip(self, contents))]
    pub(crate) fn write_impl(&self, path: &Path, contents: &[u8]) -> Result<()> {
        fs::write(path, contents).with_context(|| format!("Failed to write {:?}", path))
    }

    #[tracing::instrument(skip(self))]
    pub(crate) fn read_to_string_impl(&self, path: &Path) -> Result<String> {
        fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))
    }

    #[tracing::instrument(skip(self))]
    pub(crate) fn rename_impl(&self, from: &Path, to: &Path) -> Result<()> {
        fs::rename(from, to).with_context(|| format!("Failed to move {:?} to {:?}", from, to))
    }

    #[tracing::instrument(skip(self))]
    pub(crate) fn copy_impl(&self, from: &Path, to: &Path) -> Result<u64> {
        fs::copy(from, to).with_context(|| format!("Failed to copy {:?} to {:?}", from, to))
    }

    #[tracing::instrument(skip(self))]
    pub(crate) fn create_dir_all_impl(&self, path: &Path) -> Result<()> {
        fs::create_dir_all(path).with_context(|| format!("Failed to create directory {:?}", path))
    }

    #[tracing::instrument(skip(self))]
    pub(crate) fn remove_file_impl(&self, path: &Path) -> Result<()> {
        fs::remove_file(path).with_context(|| format!("Failed to remove {:?}", path))
    }

    #[tracing::instrument(skip(self))]
    pub(crate) fn exists_impl(&self, path: &Path) -> bool {
        path.exists()
    }

    /// Entries sorted by path, so install order and link order do not depend
    /// on the platform's directory iteration order.
    #[tracing::instrument(skip(self))]
    pub(crate) fn read_dir_impl(&self, path: &Path) -> Result<Vec<PathBuf>> {
        let mut entries = fs::read_dir(path)
            .with_context(|| format!("Failed to list {:?}", path))?
            .map(|entry| entry.map(|e| e.path()))
            .collect::<std::io::Result<Vec<_>>>()
            .with_context(|| format!("Failed to list {:?}", path))?;
        entries.sort();
        Ok(entries)
    }

    #[tracing::instrument(skip(self))]
    pub(crate) fn create_file_impl(&self, path: &Path) -> Result<Box<dyn std::io::Write + Send>> {
        let file = fs::File::create(path).with_context(|| format!("Failed to create {:?}", path))?;
        Ok(Box::new(file))
    }

    #[tracing::instrument(skip(self))]
    pub(crate) fn open_impl(&self, path: &Path) -> Result<Box<dyn std::io::Read + Send>> {
        let file = fs::File::open(path).with_context(|| format!("Failed to open {:?}", path))?;
        Ok(Box::new(file))
    }

    #[tracing::instrument(skip(self))]
    pub(crate) fn remove_dir_all_impl(&self, path: &Path) -> Result<()> {
        fs::remove_dir_all(path).with_context(|| format!("Failed to remove directory {:?}", path))
    }

    #[tracing::instrument(skip(self))]
    pub(crate) fn is_dir_impl(&self, path: &Path) -> bool {
        path.is_dir()
    }

    #[tracing::instrument(skip(self))]
    pub(crate) fn set_permissions_impl(&self, path: &Path, mode: u32) -> Result<()> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(mode))
                .with_context(|| format!("Failed to set mode {:o} on {:?}", mode, path))?;
        }
        #[cfg(not(unix))]
        let _ = (path, mode);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::runtime::{RealRuntime, Runtime};
    use std::io::{Read, Write};
    use std::path::Path;
    use tempfile::tempdir;

    #[test]
    fn test_atomic_replace_via_rename() {
        let dir = tempdir().unwrap();
        let record = dir.path().join("install-record.json");
        let tmp = dir.path().join("install-record.json.tmp");

        RealRuntime.write(&record, b"{\"state\":\"Pending\"}").unwrap();
        RealRuntime.write(&tmp, b"{\"state\":\"Fetched\"}").unwrap();
        RealRuntime.rename(&tmp, &record).unwrap();

        assert!(!RealRuntime.exists(&tmp));
        assert_eq!(
            RealRuntime.read_to_string(&record).unwrap(),
            "{\"state\":\"Fetched\"}"
        );
    }

    #[test]
    fn test_staging_tree_lifecycle() {
        let dir = tempdir().unwrap();
        let staging = dir.path().join(".staging");
        let unpacked = staging.join("abc123").join("bin");

        RealRuntime.create_dir_all(&unpacked).unwrap();
        RealRuntime.write(&unpacked.join("tool"), b"#!/bin/sh\n").unwrap();
        RealRuntime
            .copy(&unpacked.join("tool"), &dir.path().join("tool"))
            .unwrap();
        assert!(RealRuntime.is_dir(&unpacked));
        assert_eq!(
            RealRuntime.read_dir(&staging).unwrap(),
            vec![staging.join("abc123")]
        );

        RealRuntime.remove_dir_all(&staging).unwrap();
        assert!(!RealRuntime.exists(&staging));
        assert!(RealRuntime.exists(&dir.path().join("tool")));
    }

    #[test]
    fn test_streamed_download_roundtrip() {
        let dir = tempdir().unwrap();
        let partial = dir.path().join("artifact.part");

        {
            let mut writer = RealRuntime.create_file(&partial).unwrap();
            writer.write_all(b"first chunk,").unwrap();
            writer.write_all(b"second chunk").unwrap();
        }
        let mut body = String::new();
        RealRuntime
            .open(&partial)
            .unwrap()
            .read_to_string(&mut body)
            .unwrap();
        assert_eq!(body, "first chunk,second chunk");

        RealRuntime.remove_file(&partial).unwrap();
        assert!(!RealRuntime.exists(&partial));
    }

    #[test]
    fn test_errors_name_the_path() {
        let missing = Path::new("/nonexistent/pkgenv/install-record.json");
        let err = RealRuntime.read_to_string(missing).unwrap_err();
        assert!(format!("{:#}", err).contains("install-record.json"));
        assert!(RealRuntime.remove_file(missing).is_err());
        assert!(RealRuntime.read_dir(Path::new("/nonexistent/pkgenv")).is_err());
    }

    #[test]
    fn test_read_dir_is_sorted() {
        let dir = tempdir().unwrap();
        for name in ["urllib3", "click", "pyyaml"] {
            RealRuntime.create_dir_all(&dir.path().join(name)).unwrap();
        }

        let names: Vec<_> = RealRuntime
            .read_dir(dir.path())
            .unwrap()
            .into_iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, ["click", "pyyaml", "urllib3"]);
    }

    #[test]
    #[cfg(unix)]
    fn test_set_permissions_marks_executable() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempdir().unwrap();
        let script = dir.path().join("respec-ai");
        RealRuntime.write(&script, b"#!/bin/sh\n").unwrap();

        RealRuntime.set_permissions(&script, 0o755).unwrap();
        let mode = std::fs::metadata(&script).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }
}
