//! Environment Provisioner.
//!
//! An environment is a self-contained directory per root package:
//!
//! ```text
//! <install_root>/<name>/
//!   bin/                  executables (+ bin/<runtime> -> interpreter)
//!   lib/
//!   packages/<dep>/       installed artifact trees
//!   .staging/<digest>/    unpacked artifacts awaiting install
//!   pkgenv-env.json       marker
//!   install-record.json
//!   .lock
//! ```

use anyhow::Context;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::InstallError;
use crate::runtime::{EnvLock, Runtime};

const MARKER_FILE: &str = "pkgenv-env.json";
const RECORD_FILE: &str = "install-record.json";
const LOCK_FILE: &str = ".lock";
const STAGING_DIR: &str = ".staging";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Environment {
    pub name: String,
    pub root: PathBuf,
}

impl Environment {
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            root: root.into(),
        }
    }

    pub fn bin_dir(&self) -> PathBuf {
        self.root.join("bin")
    }

    pub fn lib_dir(&self) -> PathBuf {
        self.root.join("lib")
    }

    pub fn packages_dir(&self) -> PathBuf {
        self.root.join("packages")
    }

    pub fn package_dir(&self, package: &str) -> PathBuf {
        self.packages_dir().join(package)
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.root.join(STAGING_DIR)
    }

    pub fn record_path(&self) -> PathBuf {
        self.root.join(RECORD_FILE)
    }

    pub fn marker_path(&self) -> PathBuf {
        self.root.join(MARKER_FILE)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.root.join(LOCK_FILE)
    }
}

/// Identifies a directory as an environment owned by one package.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvMarker {
    pub package: String,
    #[serde(default)]
    pub runtime: Option<PathBuf>,
}

impl EnvMarker {
    fn load<R: Runtime>(runtime: &R, path: &Path) -> anyhow::Result<Self> {
        let content = runtime.read_to_string(path)?;
        serde_json::from_str(&content).with_context(|| format!("Failed to parse {:?}", path))
    }
}

pub struct Provisioner<'a, R: Runtime> {
    runtime: &'a R,
}

impl<'a, R: Runtime> Provisioner<'a, R> {
    pub fn new(runtime: &'a R) -> Self {
        Self { runtime }
    }

    /// Create (or reopen) the environment for `package` at `root` and lock it.
    /// The returned lock must be held until the installation finishes.
    #[tracing::instrument(skip(self))]
    pub fn provision(
        &self,
        root: &Path,
        package: &str,
        interpreter: Option<&Path>,
    ) -> Result<(Environment, EnvLock), InstallError> {
        let env = Environment::new(package, root);

        if let Some(interpreter) = interpreter
            && !self.runtime.exists(interpreter)
        {
            return Err(InstallError::provision(
                root,
                format!("runtime {:?} cannot be located", interpreter),
            ));
        }

        let existing = self.check_existing(&env)?;

        self.runtime
            .create_dir_all(root)
            .map_err(|e| InstallError::provision(root, format!("{:#}", e)))?;
        let lock = self.lock(&env)?;

        self.create_layout(&env, interpreter, existing.as_ref())
            .map_err(|e| InstallError::provision(root, format!("{:#}", e)))?;

        if existing.is_some() {
            debug!("Reusing environment {:?}", root);
        } else {
            info!("Provisioned environment {:?}", root);
        }
        Ok((env, lock))
    }

    /// Open an existing environment without modifying it, for uninstall.
    pub fn open(&self, root: &Path, package: &str) -> Result<(Environment, EnvLock), InstallError> {
        let env = Environment::new(package, root);
        if self.check_existing(&env)?.is_none() {
            return Err(InstallError::provision(root, "no environment found"));
        }
        let lock = self.lock(&env)?;
        Ok((env, lock))
    }

    /// The marker of a prior environment for this package, or `None` when
    /// `root` is absent or empty.
    fn check_existing(&self, env: &Environment) -> Result<Option<EnvMarker>, InstallError> {
        let root = &env.root;
        if !self.runtime.exists(root) {
            return Ok(None);
        }
        if !self.runtime.is_dir(root) {
            return Err(InstallError::provision(root, "path exists and is not a directory"));
        }

        let marker_path = env.marker_path();
        if self.runtime.exists(&marker_path) {
            let marker = EnvMarker::load(self.runtime, &marker_path)
                .map_err(|e| InstallError::provision(root, format!("{:#}", e)))?;
            if marker.package != env.name {
                return Err(InstallError::provision(
                    root,
                    format!("directory is the environment of '{}'", marker.package),
                ));
            }
            return Ok(Some(marker));
        }

        let entries = self
            .runtime
            .read_dir(root)
            .map_err(|e| InstallError::provision(root, format!("{:#}", e)))?;
        // A crash between locking and writing the marker leaves only the lock file
        let foreign = entries
            .iter()
            .any(|p| p.file_name().is_none_or(|n| n != LOCK_FILE));
        if foreign {
            return Err(InstallError::provision(
                root,
                "directory is not empty and is not a pkgenv environment",
            ));
        }
        Ok(None)
    }

    fn lock(&self, env: &Environment) -> Result<EnvLock, InstallError> {
        match self.runtime.try_lock(&env.lock_path()) {
            Ok(Some(lock)) => Ok(lock),
            Ok(None) => Err(InstallError::provision(
                &env.root,
                "environment is locked by another installation",
            )),
            Err(e) => Err(InstallError::provision(&env.root, format!("{:#}", e))),
        }
    }

    fn create_layout(
        &self,
        env: &Environment,
        interpreter: Option<&Path>,
        existing: Option<&EnvMarker>,
    ) -> anyhow::Result<()> {
        for dir in [env.bin_dir(), env.lib_dir(), env.packages_dir()] {
            self.runtime.create_dir_all(&dir)?;
        }

        if let Some(interpreter) = interpreter {
            let name = interpreter
                .file_name()
                .with_context(|| format!("Invalid interpreter path {:?}", interpreter))?;
            let link = env.bin_dir().join(name);
            if self.runtime.is_symlink(&link) {
                if self.runtime.resolve_link(&link)? == interpreter {
                    debug!("Interpreter link {:?} already in place", link);
                } else {
                    self.runtime.remove_symlink(&link)?;
                    self.runtime.symlink(interpreter, &link)?;
                }
            } else if !self.runtime.exists(&link) {
                self.runtime.symlink(interpreter, &link)?;
            }
        }

        let marker = EnvMarker {
            package: env.name.clone(),
            runtime: interpreter
                .map(Path::to_path_buf)
                .or_else(|| existing.and_then(|m| m.runtime.clone())),
        };
        if existing != Some(&marker) {
            let content = serde_json::to_string_pretty(&marker)?;
            self.runtime.write(&env.marker_path(), content.as_bytes())?;
        }
        Ok(())
    }
}
