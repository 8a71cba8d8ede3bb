//! Prerequisite checks, run once before anything touches the filesystem.

use log::{debug, info};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::InstallError;
use crate::package::{
    Manifest, RuntimeRequirement, ServiceRequirement, find_version_in_text, parse_version,
};
use crate::runtime::{CommandRequest, Runtime};

pub struct PrerequisiteChecker<'a, R: Runtime> {
    runtime: &'a R,
    timeout: Duration,
}

impl<'a, R: Runtime> PrerequisiteChecker<'a, R> {
    pub fn new(runtime: &'a R, timeout: Duration) -> Self {
        Self { runtime, timeout }
    }

    /// Check the manifest's runtime and service. Returns the located runtime
    /// executable, if the manifest declares one.
    #[tracing::instrument(skip(self, manifest))]
    pub async fn check(
        &self,
        manifest: &Manifest,
        interpreter: Option<&Path>,
    ) -> Result<Option<PathBuf>, InstallError> {
        let runtime_path = match &manifest.runtime {
            Some(requirement) => Some(self.check_runtime(requirement, interpreter).await?),
            None => interpreter.map(Path::to_path_buf),
        };
        if let Some(service) = &manifest.service {
            self.check_service(service)?;
        }
        Ok(runtime_path)
    }

    pub async fn check_runtime(
        &self,
        requirement: &RuntimeRequirement,
        interpreter: Option<&Path>,
    ) -> Result<PathBuf, InstallError> {
        let unsatisfied = |reason: String| InstallError::Prerequisite {
            name: requirement.name.clone(),
            reason,
        };

        let path = match interpreter {
            Some(path) if self.runtime.exists(path) => path.to_path_buf(),
            Some(path) => return Err(unsatisfied(format!("{:?} does not exist", path))),
            None => self
                .runtime
                .which(&requirement.name)
                .ok_or_else(|| unsatisfied("not found on the search path".to_string()))?,
        };
        debug!("Using {} at {:?}", requirement.name, path);

        let Some(min_version) = &requirement.min_version else {
            return Ok(path);
        };
        let minimum = parse_version(min_version)
            .ok_or_else(|| unsatisfied(format!("invalid minimum version '{}'", min_version)))?;

        let request = CommandRequest::new(&path, self.timeout).args(["--version"]);
        let output = self
            .runtime
            .run_command(&request)
            .await
            .map_err(|e| unsatisfied(format!("{:#}", e)))?;
        if !output.success() {
            return Err(unsatisfied(format!(
                "'{} --version' exited with {:?}",
                path.display(),
                output.code
            )));
        }

        // Some interpreters print their version on stderr
        let text = format!("{}\n{}", output.stdout, output.stderr);
        let found = find_version_in_text(&text)
            .ok_or_else(|| unsatisfied(format!("cannot read a version from '{}'", text.trim())))?;
        if found < minimum {
            return Err(unsatisfied(format!(
                "version {} is older than the required {}",
                found, min_version
            )));
        }

        info!("{} {} satisfies >= {}", requirement.name, found, min_version);
        Ok(path)
    }

    /// Presence only; the service is never started or managed.
    pub fn check_service(&self, requirement: &ServiceRequirement) -> Result<PathBuf, InstallError> {
        self.runtime
            .which(&requirement.name)
            .ok_or_else(|| InstallError::Prerequisite {
                name: requirement.name.clone(),
                reason: "not found on the search path".to_string(),
            })
    }
}
