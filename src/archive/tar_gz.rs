use anyhow::{Context, Result, bail};
use flate2::read::GzDecoder;
use log::debug;
use std::path::Path;
use tar::{Archive, EntryType};

use super::{ArchiveExtractor, safe_entry_path};
use crate::runtime::{Runtime, is_path_under};

/// Extractor for .tar.gz / .tgz archives
pub struct TarGzExtractor;

impl ArchiveExtractor for TarGzExtractor {
    fn can_handle(&self, file_name: &str) -> bool {
        let name = file_name.to_lowercase();
        name.ends_with(".tar.gz") || name.ends_with(".tgz")
    }

    fn unpack<R: Runtime>(&self, runtime: &R, archive_path: &Path, dest: &Path) -> Result<()> {
        let file = runtime
            .open(archive_path)
            .with_context(|| format!("Failed to open archive at {:?}", archive_path))?;
        let mut archive = Archive::new(GzDecoder::new(file));

        let entries = archive
            .entries()
            .with_context(|| format!("Failed to read tar entries from {:?}", archive_path))?;
        for entry in entries {
            let mut entry = entry.context("Failed to read tar entry")?;
            let entry_path = entry.path().context("Invalid tar entry path")?.into_owned();
            let full_path = safe_entry_path(dest, &entry_path)?;
            let entry_type = entry.header().entry_type();

            match entry_type {
                EntryType::Directory => runtime.create_dir_all(&full_path)?,
                EntryType::Regular | EntryType::Continuous => {
                    if let Some(parent) = full_path.parent() {
                        runtime.create_dir_all(parent)?;
                    }
                    let mut dest_file = runtime.create_file(&full_path)?;
                    std::io::copy(&mut entry, &mut dest_file)
                        .with_context(|| format!("Failed to extract file {:?}", full_path))?;
                    drop(dest_file);

                    #[cfg(unix)]
                    if let Ok(mode) = entry.header().mode()
                        && let Err(e) = runtime.set_permissions(&full_path, mode & 0o7777)
                    {
                        debug!("Failed to set permissions on {:?}: {}", full_path, e);
                    }
                }
                EntryType::Symlink => {
                    let target = entry
                        .link_name()
                        .context("Invalid symlink target")?
                        .with_context(|| format!("Symlink {:?} has no target", entry_path))?
                        .into_owned();
                    let resolved = full_path.parent().unwrap_or(dest).join(&target);
                    if target.is_absolute() || !is_path_under(&resolved, dest) {
                        bail!(
                            "Symlink {:?} -> {:?} points outside the archive",
                            entry_path,
                            target
                        );
                    }
                    if let Some(parent) = full_path.parent() {
                        runtime.create_dir_all(parent)?;
                    }
                    runtime.symlink(&target, &full_path)?;
                }
                other => {
                    debug!("Skipping tar entry {:?} of type {:?}", entry_path, other);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::test_archives::tar_gz;
    use crate::runtime::RealRuntime;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_can_handle() {
        assert!(TarGzExtractor.can_handle("tool-1.0.tar.gz"));
        assert!(TarGzExtractor.can_handle("TOOL.TGZ"));
        assert!(!TarGzExtractor.can_handle("tool.zip"));
        assert!(!TarGzExtractor.can_handle("tool.tar"));
    }

    #[test]
    #[cfg(unix)]
    fn test_unpack_preserves_modes() -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir()?;
        let archive = dir.path().join("a.tar.gz");
        fs::write(
            &archive,
            tar_gz(&[("pkg/bin/tool", "#!/bin/sh\n", 0o755), ("pkg/conf", "x", 0o644)])?,
        )?;
        let dest = dir.path().join("out");
        fs::create_dir(&dest)?;

        TarGzExtractor.unpack(&RealRuntime, &archive, &dest)?;

        let tool_mode = fs::metadata(dest.join("pkg/bin/tool"))?.permissions().mode();
        assert!(tool_mode & 0o111 != 0, "mode was {:o}", tool_mode);
        let conf_mode = fs::metadata(dest.join("pkg/conf"))?.permissions().mode();
        assert!(conf_mode & 0o111 == 0, "mode was {:o}", conf_mode);
        Ok(())
    }

    #[test]
    #[cfg(unix)]
    fn test_unpack_symlinks_inside_archive() -> Result<()> {
        let dir = tempdir()?;
        let archive = dir.path().join("a.tar.gz");
        {
            let file = fs::File::create(&archive)?;
            let enc = flate2::write::GzEncoder::new(file, flate2::Compression::default());
            let mut tar = tar::Builder::new(enc);

            let mut header = tar::Header::new_gnu();
            header.set_path("pkg/lib/tool.py")?;
            header.set_size(2);
            header.set_mode(0o644);
            header.set_cksum();
            tar.append(&header, &b"ok"[..])?;

            let mut link = tar::Header::new_gnu();
            link.set_entry_type(EntryType::Symlink);
            link.set_size(0);
            tar.append_link(&mut link, "pkg/bin/tool", "../lib/tool.py")?;
            tar.into_inner()?.finish()?;
        }
        let dest = dir.path().join("out");
        fs::create_dir(&dest)?;

        TarGzExtractor.unpack(&RealRuntime, &archive, &dest)?;

        assert_eq!(fs::read_to_string(dest.join("pkg/bin/tool"))?, "ok");
        Ok(())
    }

    #[test]
    #[cfg(unix)]
    fn test_unpack_rejects_escaping_symlink() -> Result<()> {
        let dir = tempdir()?;
        let archive = dir.path().join("a.tar.gz");
        {
            let file = fs::File::create(&archive)?;
            let enc = flate2::write::GzEncoder::new(file, flate2::Compression::default());
            let mut tar = tar::Builder::new(enc);
            let mut link = tar::Header::new_gnu();
            link.set_entry_type(EntryType::Symlink);
            link.set_size(0);
            tar.append_link(&mut link, "pkg/evil", "../../../etc/passwd")?;
            tar.into_inner()?.finish()?;
        }
        let dest = dir.path().join("out");
        fs::create_dir(&dest)?;

        let err = TarGzExtractor.unpack(&RealRuntime, &archive, &dest).unwrap_err();
        assert!(err.to_string().contains("points outside"));
        assert!(!dest.join("pkg/evil").exists());
        Ok(())
    }

    #[test]
    fn test_unpack_corrupted_archive() {
        let dir = tempdir().unwrap();
        let archive = dir.path().join("a.tar.gz");
        fs::write(&archive, "corrupted data").unwrap();

        let result = TarGzExtractor.unpack(&RealRuntime, &archive, dir.path());
        assert!(result.is_err());
    }

    #[test]
    fn test_unpack_missing_archive() {
        let dir = tempdir().unwrap();
        let err = TarGzExtractor
            .unpack(&RealRuntime, &dir.path().join("missing.tar.gz"), dir.path())
            .unwrap_err();
        assert!(err.to_string().contains("Failed to open archive"));
    }
}
