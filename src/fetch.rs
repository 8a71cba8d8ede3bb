//! Artifact Fetcher.
//!
//! Brings each package's artifact into the shared cache, verifies its
//! digest and stages its contents under the environment's staging
//! directory. Downloads of the same digest are deduplicated across every
//! fetcher sharing the cache and across processes: concurrent callers wait
//! for the first one and then read the committed cache entry.

use anyhow::{Context, Result, bail};
use futures_util::StreamExt;
use log::{debug, info, warn};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::archive::ArchiveExtractorImpl;
use crate::cache::ArtifactCache;
use crate::cleanup::{CleanupGuard, SharedCleanupContext};
use crate::error::InstallError;
use crate::http::HttpClient;
use crate::package::Package;
use crate::runtime::{EnvLock, Runtime};

/// How long to wait for another process downloading the same digest.
pub const CACHE_LOCK_WAIT: Duration = Duration::from_secs(600);
const CACHE_LOCK_POLL: Duration = Duration::from_millis(100);

/// A package whose verified artifact has been unpacked into staging.
#[derive(Debug, Clone, PartialEq)]
pub struct StagedArtifact {
    pub package: Package,
    /// The verified cache entry.
    pub archive: PathBuf,
    /// Unpacked contents, `<staging>/<digest>`.
    pub path: PathBuf,
}

pub struct Fetcher<'a, R: Runtime> {
    runtime: &'a R,
    http: HttpClient,
    cache: ArtifactCache,
    extractor: ArchiveExtractorImpl,
    cleanup: Option<SharedCleanupContext>,
    cancel: CancellationToken,
    lock_wait: Duration,
}

impl<'a, R: Runtime> Fetcher<'a, R> {
    pub fn new(runtime: &'a R, http: HttpClient, cache: ArtifactCache) -> Self {
        Self {
            runtime,
            http,
            cache,
            extractor: ArchiveExtractorImpl::new(),
            cleanup: None,
            cancel: CancellationToken::new(),
            lock_wait: CACHE_LOCK_WAIT,
        }
    }

    pub fn with_cleanup(mut self, ctx: SharedCleanupContext) -> Self {
        self.cleanup = Some(ctx);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_lock_wait(mut self, wait: Duration) -> Self {
        self.lock_wait = wait;
        self
    }

    pub fn cache(&self) -> &ArtifactCache {
        &self.cache
    }

    /// Fetch every package concurrently (at most `jobs` at a time). Each
    /// fetch runs to completion; the first failure in input order is returned.
    #[tracing::instrument(skip(self, packages))]
    pub async fn fetch_all(
        &self,
        packages: &[Package],
        staging_root: &Path,
        jobs: usize,
    ) -> Result<Vec<StagedArtifact>, InstallError> {
        let results: Vec<_> = futures_util::stream::iter(packages)
            .map(|package| self.fetch(package, staging_root))
            .buffered(jobs.max(1))
            .collect()
            .await;
        results.into_iter().collect()
    }

    /// Fetch one package into the cache and stage it at `<staging_root>/<digest>`.
    /// An already staged artifact is reused.
    #[tracing::instrument(skip(self, package), fields(package = %package.id()))]
    pub async fn fetch(
        &self,
        package: &Package,
        staging_root: &Path,
    ) -> Result<StagedArtifact, InstallError> {
        if self.cancel.is_cancelled() {
            return Err(InstallError::Cancelled {
                installed: Vec::new(),
            });
        }

        let archive = self.fetch_to_cache(package).await?;
        let staged = staging_root.join(package.hash.as_str());
        if self.runtime.is_dir(&staged) {
            debug!("{} already staged at {:?}", package.id(), staged);
        } else {
            self.runtime
                .create_dir_all(staging_root)
                .and_then(|_| {
                    self.extractor.stage(
                        self.runtime,
                        &archive,
                        package.file_name(),
                        &staged,
                        self.cleanup.clone(),
                    )
                })
                .map_err(|e| InstallError::Fetch {
                    package: package.id(),
                    url: package.source.clone(),
                    reason: format!("failed to unpack artifact: {:#}", e),
                })?;
        }

        Ok(StagedArtifact {
            package: package.clone(),
            archive,
            path: staged,
        })
    }

    /// Make sure the verified artifact for `package` is in the cache and
    /// return the entry's path. Uses no network on a cache hit.
    #[tracing::instrument(skip(self, package), fields(package = %package.id()))]
    pub async fn fetch_to_cache(&self, package: &Package) -> Result<PathBuf, InstallError> {
        let slot = self.cache.inflight_slot(&package.hash);
        let result = {
            let _turn = slot.lock().await;
            self.fetch_exclusive(package).await
        };
        self.cache.release_slot(&package.hash, slot);
        result
    }

    /// Runs with this process's slot for the digest held.
    async fn fetch_exclusive(&self, package: &Package) -> Result<PathBuf, InstallError> {
        let _lock = self.lock_digest(package).await?;

        if self.cache.contains(self.runtime, &package.hash) {
            let intact = self
                .cache
                .verify_entry(self.runtime, &package.hash)
                .map_err(InstallError::Other)?;
            if intact {
                debug!("Cache hit for {} ({})", package.id(), package.hash.short());
                return Ok(self.cache.entry_path(&package.hash));
            }
        }

        info!("Fetching {} from {}", package.id(), package.source);
        let temp = self.cache.temp_path(&package.hash);
        let guard = self
            .cleanup
            .clone()
            .map(|ctx| CleanupGuard::new(ctx, temp.clone()));

        let result = self.download_and_commit(package, &temp).await;
        if result.is_err()
            && self.runtime.exists(&temp)
            && let Err(e) = self.runtime.remove_file(&temp)
        {
            warn!("Failed to remove partial download {:?}: {:#}", temp, e);
        }
        if let Some(guard) = guard {
            guard.success();
        }
        result
    }

    /// Take the cache's advisory lock for the digest, waiting while another
    /// process holds it.
    async fn lock_digest(&self, package: &Package) -> Result<EnvLock, InstallError> {
        let path = self.cache.lock_path(&package.hash);
        if let Some(parent) = path.parent() {
            self.runtime.create_dir_all(parent)?;
        }

        let deadline = tokio::time::Instant::now() + self.lock_wait;
        loop {
            if let Some(lock) = self.runtime.try_lock(&path)? {
                return Ok(lock);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(InstallError::Fetch {
                    package: package.id(),
                    url: package.source.clone(),
                    reason: format!(
                        "another download of {} still holds {:?}",
                        package.hash.short(),
                        path
                    ),
                });
            }
            debug!("Waiting for {:?}", path);
            tokio::time::sleep(CACHE_LOCK_POLL).await;
        }
    }

    async fn download_and_commit(
        &self,
        package: &Package,
        temp: &Path,
    ) -> Result<PathBuf, InstallError> {
        self.download(&package.source, temp)
            .await
            .map_err(|e| InstallError::Fetch {
                package: package.id(),
                url: package.source.clone(),
                reason: format!("{:#}", e),
            })?;

        let actual = ArtifactCache::digest_of(self.runtime, temp)?;
        if actual != package.hash {
            return Err(InstallError::Integrity {
                package: package.id(),
                expected: package.hash.to_string(),
                actual: actual.to_string(),
            });
        }

        Ok(self.cache.commit(self.runtime, temp, &package.hash)?)
    }

    async fn download(&self, source: &str, temp: &Path) -> Result<()> {
        if let Some(parent) = temp.parent() {
            self.runtime.create_dir_all(parent)?;
        }

        let url = reqwest::Url::parse(source)
            .with_context(|| format!("Invalid source location '{}'", source))?;
        match url.scheme() {
            "http" | "https" => {
                let temp = temp.to_path_buf();
                self.http
                    .download_file(source, || {
                        self.runtime.create_file(&temp).with_context(|| {
                            format!("Failed to create temporary file at {:?}", temp)
                        })
                    })
                    .await?;
            }
            "file" => {
                let path = url
                    .to_file_path()
                    .map_err(|_| anyhow::anyhow!("Invalid file location '{}'", source))?;
                self.runtime.copy(&path, temp)?;
            }
            other => bail!("Unsupported source scheme '{}'", other),
        }
        Ok(())
    }
}
