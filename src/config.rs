//! Installer configuration.
//!
//! Values come from command line flags (which clap also reads from
//! `PKGENV_*` environment variables) and fall back to runtime-derived
//! defaults: per-user locations under the home directory, or system-wide
//! locations when running privileged.

use anyhow::{Context, Result};
use log::debug;
use std::path::PathBuf;
use std::time::Duration;

use crate::http::RetryPolicy;
use crate::runtime::Runtime;

pub const DEFAULT_JOBS: usize = 4;
pub const DEFAULT_VERIFY_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_INSTALL_TIMEOUT: Duration = Duration::from_secs(600);
pub const DEFAULT_PREREQUISITE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Values the user supplied explicitly; `None` means "use the default".
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub install_root: Option<PathBuf>,
    pub link_dir: Option<PathBuf>,
    pub cache_dir: Option<PathBuf>,
    pub interpreter: Option<PathBuf>,
    pub jobs: Option<usize>,
    pub retries: Option<usize>,
    pub verify_timeout: Option<Duration>,
    pub fetch_timeout: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Parent of all environments; each package gets `<install_root>/<name>`.
    pub install_root: PathBuf,
    /// Shared directory on the executable search path.
    pub link_dir: PathBuf,
    /// Content-addressed artifact cache shared by all installations.
    pub cache_dir: PathBuf,
    /// Explicit interpreter, bypassing the search path.
    pub interpreter: Option<PathBuf>,
    pub jobs: usize,
    pub retry: RetryPolicy,
    /// Limit for connecting and for each read of a download; a stalled
    /// transfer fails the attempt and is retried.
    pub fetch_timeout: Duration,
    pub verify_timeout: Duration,
    pub install_timeout: Duration,
    pub prerequisite_timeout: Duration,
}

impl Config {
    #[tracing::instrument(skip(runtime))]
    pub fn resolve<R: Runtime>(runtime: &R, overrides: ConfigOverrides) -> Result<Self> {
        let base = default_base_dir(runtime)?;

        let install_root = overrides
            .install_root
            .unwrap_or_else(|| base.join("envs"));
        let cache_dir = overrides.cache_dir.unwrap_or_else(|| base.join("cache"));
        let link_dir = match overrides.link_dir {
            Some(dir) => dir,
            None => default_link_dir(runtime)?,
        };

        let mut retry = RetryPolicy::default();
        if let Some(retries) = overrides.retries {
            retry.max_attempts = retries.max(1);
        }

        let config = Self {
            install_root,
            link_dir,
            cache_dir,
            interpreter: overrides.interpreter,
            jobs: overrides.jobs.unwrap_or(DEFAULT_JOBS).max(1),
            retry,
            fetch_timeout: overrides
                .fetch_timeout
                .unwrap_or(DEFAULT_FETCH_TIMEOUT)
                .max(Duration::from_millis(1)),
            verify_timeout: overrides.verify_timeout.unwrap_or(DEFAULT_VERIFY_TIMEOUT),
            install_timeout: DEFAULT_INSTALL_TIMEOUT,
            prerequisite_timeout: DEFAULT_PREREQUISITE_TIMEOUT,
        };
        debug!("Resolved configuration: {:?}", config);
        Ok(config)
    }

    pub fn env_root(&self, package: &str) -> PathBuf {
        self.install_root.join(package)
    }
}

/// Base directory holding environments and the cache.
#[tracing::instrument(skip(runtime))]
pub fn default_base_dir<R: Runtime>(runtime: &R) -> Result<PathBuf> {
    if runtime.is_privileged() {
        Ok(system_base_dir())
    } else {
        let home_dir = runtime
            .home_dir()
            .context("Could not find home directory")?;
        Ok(home_dir.join(".pkgenv"))
    }
}

#[tracing::instrument(skip(runtime))]
pub fn default_link_dir<R: Runtime>(runtime: &R) -> Result<PathBuf> {
    if runtime.is_privileged() {
        Ok(system_link_dir())
    } else {
        let home_dir = runtime
            .home_dir()
            .context("Could not find home directory")?;
        Ok(home_dir.join(".local").join("bin"))
    }
}

#[cfg(target_os = "macos")]
fn system_base_dir() -> PathBuf {
    PathBuf::from("/opt/pkgenv")
}

#[cfg(target_os = "windows")]
fn system_base_dir() -> PathBuf {
    PathBuf::from(r"C:\ProgramData\pkgenv")
}

#[cfg(not(any(target_os = "macos", target_os = "windows")))]
fn system_base_dir() -> PathBuf {
    PathBuf::from("/usr/local/pkgenv")
}

#[cfg(target_os = "windows")]
fn system_link_dir() -> PathBuf {
    PathBuf::from(r"C:\ProgramData\pkgenv\bin")
}

#[cfg(not(target_os = "windows"))]
fn system_link_dir() -> PathBuf {
    PathBuf::from("/usr/local/bin")
}
