//! Entry-Point Linker.
//!
//! Exposes an environment's executables on the shared link directory as
//! symlinks `<link_dir>/<file name> -> <env>/<entry point>`.

use anyhow::anyhow;
use log::{debug, info, warn};
use std::path::{Path, PathBuf};

use crate::error::InstallError;
use crate::provision::Environment;
use crate::resolver::ResolveReport;
use crate::runtime::{Runtime, is_path_under, relative_symlink_path};

/// State of a link location before linking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkStatus {
    /// Nothing there yet
    NotExists,
    /// Already points at the entry point
    Valid,
    /// Points somewhere else inside this environment
    Stale,
    /// Points outside this environment
    Foreign(PathBuf),
    /// Path exists but is not a symlink
    NotSymlink,
}

impl LinkStatus {
    pub fn is_conflict(&self) -> bool {
        matches!(self, LinkStatus::Foreign(_) | LinkStatus::NotSymlink)
    }
}

pub struct Linker<'a, R: Runtime> {
    runtime: &'a R,
    link_dir: PathBuf,
}

impl<'a, R: Runtime> Linker<'a, R> {
    pub fn new(runtime: &'a R, link_dir: impl Into<PathBuf>) -> Self {
        Self {
            runtime,
            link_dir: link_dir.into(),
        }
    }

    pub fn link_path(&self, entry_point: &Path) -> Option<PathBuf> {
        entry_point.file_name().map(|name| self.link_dir.join(name))
    }

    pub fn status(&self, link: &Path, target: &Path, env: &Environment) -> LinkStatus {
        if self.runtime.is_symlink(link) {
            match self.runtime.resolve_link(link) {
                Ok(resolved) if resolved == target => LinkStatus::Valid,
                Ok(resolved) if is_path_under(&resolved, &env.root) => LinkStatus::Stale,
                Ok(resolved) => LinkStatus::Foreign(resolved),
                Err(e) => {
                    debug!("Cannot resolve {:?}: {:#}", link, e);
                    LinkStatus::Foreign(PathBuf::new())
                }
            }
        } else if self.runtime.exists(link) {
            LinkStatus::NotSymlink
        } else {
            LinkStatus::NotExists
        }
    }

    /// Link every entry point. Requires a completed resolve. All links are
    /// checked before any is created, so a conflict leaves the link
    /// directory untouched. Linking again is a no-op.
    #[tracing::instrument(skip(self, _resolved))]
    pub fn link(
        &self,
        env: &Environment,
        _resolved: &ResolveReport,
        entry_points: &[PathBuf],
    ) -> Result<Vec<PathBuf>, InstallError> {
        let mut plan = Vec::with_capacity(entry_points.len());
        for entry in entry_points {
            let target = env.root.join(entry);
            if !self.runtime.exists(&target) {
                return Err(InstallError::Other(anyhow!(
                    "entry point {:?} does not exist in {:?}",
                    entry,
                    env.root
                )));
            }
            let link = self.link_path(entry).ok_or_else(|| {
                InstallError::Other(anyhow!("invalid entry point {:?}", entry))
            })?;

            let status = self.status(&link, &target, env);
            if status.is_conflict() {
                return Err(InstallError::LinkConflict {
                    link,
                    env: env.root.clone(),
                });
            }
            plan.push((link, target, status));
        }

        self.runtime
            .create_dir_all(&self.link_dir)
            .map_err(InstallError::Other)?;

        let mut links = Vec::with_capacity(plan.len());
        for (link, target, status) in plan {
            match status {
                LinkStatus::Valid => debug!("{:?} already linked", link),
                LinkStatus::Stale => {
                    self.runtime.remove_symlink(&link)?;
                    self.create(&link, &target)?;
                }
                _ => self.create(&link, &target)?,
            }
            links.push(link);
        }
        Ok(links)
    }

    fn create(&self, link: &Path, target: &Path) -> anyhow::Result<()> {
        let relative = relative_symlink_path(link, target).unwrap_or_else(|| target.to_path_buf());
        self.runtime.symlink(&relative, link)?;
        info!("Linked {:?} -> {:?}", link, target);
        Ok(())
    }

    /// Remove the given links, but only those that still point into `env`.
    #[tracing::instrument(skip(self, links))]
    pub fn unlink(&self, env: &Environment, links: &[PathBuf]) -> anyhow::Result<Vec<PathBuf>> {
        let mut removed = Vec::new();
        for link in links {
            if self
                .runtime
                .remove_symlink_if_target_under(link, &env.root, "link")?
            {
                removed.push(link.clone());
            } else {
                warn!("Leaving {:?} in place, it no longer points into {:?}", link, env.root);
            }
        }
        Ok(removed)
    }
}
