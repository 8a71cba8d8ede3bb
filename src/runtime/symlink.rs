//! Symlink operations (create, read, resolve, remove).

use anyhow::{Context, Result};
use log::{debug, info, warn};
use std::fs;
use std::path::{Path, PathBuf};

use super::RealRuntime;
use super::path::{is_path_under, normalize_path};

impl RealRuntime {
    #[tracing::instrument(skip(self))]
    pub(crate) fn symlink_impl(&self, original: &Path, link: &Path) -> Result<()> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::symlink as unix_symlink;
            unix_symlink(original, link)
                .with_context(|| format!("Failed to create symlink {:?} -> {:?}", link, original))?;
        }
        #[cfg(windows)]
        {
            use std::os::windows::fs::{symlink_dir, symlink_file};

            // `is_dir()` on a relative path is relative to CWD; we want it relative to the link's parent.
            let target_path = if original.is_absolute() {
                original.to_path_buf()
            } else {
                link.parent()
                    .context("Failed to get parent directory for symlink")?
                    .join(original)
            };

            if target_path.is_dir() {
                symlink_dir(original, link).context("Failed to create directory symlink")?;
            } else {
                symlink_file(original, link).context("Failed to create file symlink")?;
            }
        }
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    pub(crate) fn read_link_impl(&self, path: &Path) -> Result<PathBuf> {
        fs::read_link(path).with_context(|| format!("Failed to read symlink {:?}", path))
    }

    #[tracing::instrument(skip(self))]
    pub(crate) fn resolve_link_impl(&self, path: &Path) -> Result<PathBuf> {
        let target = self.read_link_impl(path)?;
        if target.is_absolute() {
            return Ok(normalize_path(&target));
        }
        let parent = path
            .parent()
            .context("Failed to get parent directory of symlink")?;
        Ok(normalize_path(&parent.join(&target)))
    }

    #[tracing::instrument(skip(self))]
    pub(crate) fn is_symlink_impl(&self, path: &Path) -> bool {
        fs::symlink_metadata(path)
            .map(|m| m.file_type().is_symlink())
            .unwrap_or(false)
    }

    #[tracing::instrument(skip(self))]
    pub(crate) fn remove_symlink_impl(&self, path: &Path) -> Result<()> {
        #[cfg(unix)]
        {
            fs::remove_file(path).with_context(|| format!("Failed to remove symlink {:?}", path))?;
        }
        #[cfg(windows)]
        {
            // Directory symlinks need remove_dir, file symlinks need remove_file.
            fs::remove_dir(path)
                .or_else(|_| fs::remove_file(path))
                .with_context(|| format!("Failed to remove symlink {:?}", path))?;
        }
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    pub(crate) fn remove_symlink_if_target_under_impl(
        &self,
        link_path: &Path,
        target_prefix: &Path,
        description: &str,
    ) -> Result<bool> {
        if !self.is_symlink_impl(link_path) {
            if self.exists_impl(link_path) {
                warn!(
                    "{} {:?} exists but is not a symlink, leaving it alone",
                    description, link_path
                );
            } else {
                debug!("{} {:?} does not exist, skipping", description, link_path);
            }
            return Ok(false);
        }

        let target = match self.resolve_link_impl(link_path) {
            Ok(target) => target,
            Err(e) => {
                warn!(
                    "{} {:?} is a symlink but its target cannot be read: {}",
                    description, link_path, e
                );
                return Ok(false);
            }
        };

        if !is_path_under(&target, target_prefix) {
            warn!(
                "{} {:?} points to {:?} which is not within {:?}, leaving it alone",
                description, link_path, target, target_prefix
            );
            return Ok(false);
        }

        self.remove_symlink_impl(link_path)?;
        info!("Removed {} {:?}", description, link_path);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use crate::runtime::{RealRuntime, Runtime};
    use std::path::Path;
    use tempfile::tempdir;

    #[cfg_attr(
        pkgenv_skip_cross_windows_tests,
        ignore = "cross windows tests disabled; set PKGENV_RUN_CROSS_WINDOWS_TESTS=1 to enable"
    )]
    #[test]
    fn test_real_runtime_symlink_ops() {
        let runtime = RealRuntime;
        let dir = tempdir().unwrap();
        let target = dir.path().join("target");
        runtime.create_dir_all(&target).unwrap();

        let link = dir.path().join("link");
        runtime.symlink(&target, &link).unwrap();
        assert!(runtime.is_symlink(&link));
        assert!(!runtime.is_symlink(&target));
        assert_eq!(runtime.resolve_link(&link).unwrap(), target);

        runtime.remove_symlink(&link).unwrap();
        assert!(!runtime.exists(&link));
        assert!(runtime.exists(&target));
    }

    #[cfg_attr(
        pkgenv_skip_cross_windows_tests,
        ignore = "cross windows tests disabled; set PKGENV_RUN_CROSS_WINDOWS_TESTS=1 to enable"
    )]
    #[test]
    fn test_resolve_link_relative_target() {
        let runtime = RealRuntime;
        let dir = tempdir().unwrap();
        let env_bin = dir.path().join("envs").join("tool").join("bin");
        runtime.create_dir_all(&env_bin).unwrap();
        runtime.write(&env_bin.join("tool"), b"#!/bin/sh\n").unwrap();

        let link_dir = dir.path().join("bin");
        runtime.create_dir_all(&link_dir).unwrap();
        let link = link_dir.join("tool");
        runtime
            .symlink(Path::new("../envs/./tool/bin/tool"), &link)
            .unwrap();

        assert_eq!(runtime.resolve_link(&link).unwrap(), env_bin.join("tool"));
    }

    #[cfg_attr(
        pkgenv_skip_cross_windows_tests,
        ignore = "cross windows tests disabled; set PKGENV_RUN_CROSS_WINDOWS_TESTS=1 to enable"
    )]
    #[test]
    fn test_remove_symlink_if_target_under_env() {
        let runtime = RealRuntime;
        let dir = tempdir().unwrap();
        let env_root = dir.path().join("envs").join("tool");
        runtime.create_dir_all(&env_root).unwrap();
        let exe = env_root.join("tool");
        runtime.write(&exe, b"bin").unwrap();

        let link = dir.path().join("tool");
        runtime.symlink(&exe, &link).unwrap();

        assert!(
            runtime
                .remove_symlink_if_target_under(&link, &env_root, "entry point")
                .unwrap()
        );
        assert!(!runtime.is_symlink(&link));
    }

    #[cfg_attr(
        pkgenv_skip_cross_windows_tests,
        ignore = "cross windows tests disabled; set PKGENV_RUN_CROSS_WINDOWS_TESTS=1 to enable"
    )]
    #[test]
    fn test_remove_symlink_if_target_under_keeps_foreign_link() {
        let runtime = RealRuntime;
        let dir = tempdir().unwrap();
        let env_root = dir.path().join("envs").join("tool");
        runtime.create_dir_all(&env_root).unwrap();

        // "tool-extra" shares a string prefix with "tool" but is not inside it
        let other = dir.path().join("envs").join("tool-extra");
        runtime.create_dir_all(&other).unwrap();
        let exe = other.join("tool");
        runtime.write(&exe, b"bin").unwrap();

        let link = dir.path().join("tool");
        runtime.symlink(&exe, &link).unwrap();

        assert!(
            !runtime
                .remove_symlink_if_target_under(&link, &env_root, "entry point")
                .unwrap()
        );
        assert!(runtime.is_symlink(&link));
    }

    #[test]
    fn test_remove_symlink_if_target_under_skips_regular_file() {
        let runtime = RealRuntime;
        let dir = tempdir().unwrap();
        let file = dir.path().join("tool");
        runtime.write(&file, b"not a link").unwrap();

        assert!(
            !runtime
                .remove_symlink_if_target_under(&file, dir.path(), "entry point")
                .unwrap()
        );
        assert!(runtime.exists(&file));

        let missing = dir.path().join("missing");
        assert!(
            !runtime
                .remove_symlink_if_target_under(&missing, dir.path(), "entry point")
                .unwrap()
        );
    }
}
