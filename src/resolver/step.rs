use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use log::debug;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::fetch::StagedArtifact;
use crate::package::InstallStrategy;
use crate::provision::Environment;
use crate::runtime::{CommandRequest, Runtime, relative_symlink_path};

/// Installs one staged artifact into an environment.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait InstallStep: Send + Sync {
    /// Returns where the package ended up.
    async fn install(&self, artifact: &StagedArtifact, env: &Environment) -> Result<PathBuf>;
}

/// Build the step a manifest asks for.
pub fn install_step<'a, R: Runtime>(
    runtime: &'a R,
    strategy: &InstallStrategy,
    runtime_path: Option<&Path>,
    timeout: Duration,
) -> Box<dyn InstallStep + 'a> {
    match strategy {
        InstallStrategy::Copy => Box::new(CopyInstall::new(runtime)),
        InstallStrategy::Command { program, args } => Box::new(CommandInstall {
            runtime,
            program: program.clone(),
            args: args.clone(),
            runtime_path: runtime_path.map(Path::to_path_buf),
            timeout,
        }),
    }
}

/// Copies the staged tree into `packages/<name>` and exposes the
/// executables of its `bin/` in the environment's `bin/`.
pub struct CopyInstall<'a, R: Runtime> {
    runtime: &'a R,
}

impl<'a, R: Runtime> CopyInstall<'a, R> {
    pub fn new(runtime: &'a R) -> Self {
        Self { runtime }
    }

    fn copy_tree(&self, from: &Path, to: &Path) -> Result<()> {
        self.runtime.create_dir_all(to)?;
        for item in self.runtime.read_dir(from)? {
            let name = item
                .file_name()
                .with_context(|| format!("Invalid path {:?}", item))?;
            let dest = to.join(name);
            if self.runtime.is_symlink(&item) {
                let target = self.runtime.read_link(&item)?;
                self.runtime.symlink(&target, &dest)?;
            } else if self.runtime.is_dir(&item) {
                self.copy_tree(&item, &dest)?;
            } else {
                self.runtime.copy(&item, &dest)?;
            }
        }
        Ok(())
    }

    fn expose_executables(&self, installed: &Path, env: &Environment) -> Result<()> {
        let bin = installed.join("bin");
        if !self.runtime.is_dir(&bin) {
            return Ok(());
        }
        let env_bin = env.bin_dir();
        self.runtime.create_dir_all(&env_bin)?;
        for exe in self.runtime.read_dir(&bin)? {
            let Some(name) = exe.file_name() else {
                continue;
            };
            let link = env_bin.join(name);
            if self.runtime.is_symlink(&link) {
                self.runtime.remove_symlink(&link)?;
            } else if self.runtime.exists(&link) {
                bail!("{:?} already exists in the environment", link);
            }
            let target = relative_symlink_path(&link, &exe).unwrap_or_else(|| exe.clone());
            debug!("Linking {:?} -> {:?}", link, target);
            self.runtime.symlink(&target, &link)?;
        }
        Ok(())
    }
}

#[async_trait]
impl<'a, R: Runtime> InstallStep for CopyInstall<'a, R> {
    async fn install(&self, artifact: &StagedArtifact, env: &Environment) -> Result<PathBuf> {
        let dest = env.package_dir(&artifact.package.name);
        // Leftovers of an interrupted attempt; the record does not list them
        if self.runtime.exists(&dest) {
            self.runtime.remove_dir_all(&dest)?;
        }
        self.copy_tree(&artifact.path, &dest)
            .with_context(|| format!("Failed to copy {} into {:?}", artifact.package.id(), dest))?;
        self.expose_executables(&dest, env)?;
        Ok(dest)
    }
}

/// Runs a package manager command inside the environment.
///
/// Placeholders in `program` and `args`: `{env}` environment root,
/// `{artifact}` unpacked tree, `{archive}` the artifact under its original
/// file name, `{name}`, `{version}`, `{runtime}` interpreter path.
pub struct CommandInstall<'a, R: Runtime> {
    runtime: &'a R,
    program: String,
    args: Vec<String>,
    runtime_path: Option<PathBuf>,
    timeout: Duration,
}

impl<'a, R: Runtime> CommandInstall<'a, R> {
    fn substitute(
        &self,
        template: &str,
        artifact: &StagedArtifact,
        env: &Environment,
        archive: &Path,
    ) -> String {
        let runtime = self
            .runtime_path
            .as_ref()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();
        template
            .replace("{env}", &env.root.to_string_lossy())
            .replace("{artifact}", &artifact.path.to_string_lossy())
            .replace("{archive}", &archive.to_string_lossy())
            .replace("{name}", &artifact.package.name)
            .replace("{version}", &artifact.package.version)
            .replace("{runtime}", &runtime)
    }

    /// Package managers infer the format from the file name, which the
    /// content-addressed cache entry does not have.
    fn named_archive(&self, artifact: &StagedArtifact, env: &Environment) -> Result<PathBuf> {
        let dir = env
            .staging_dir()
            .join("archives")
            .join(artifact.package.hash.as_str());
        let path = dir.join(artifact.package.file_name());
        if !self.runtime.exists(&path) {
            self.runtime.create_dir_all(&dir)?;
            self.runtime.copy(&artifact.archive, &path)?;
        }
        Ok(path)
    }
}

#[async_trait]
impl<'a, R: Runtime> InstallStep for CommandInstall<'a, R> {
    async fn install(&self, artifact: &StagedArtifact, env: &Environment) -> Result<PathBuf> {
        let uses_archive = std::iter::once(&self.program)
            .chain(&self.args)
            .any(|s| s.contains("{archive}"));
        let archive = if uses_archive {
            self.named_archive(artifact, env)?
        } else {
            artifact.archive.clone()
        };

        let program = self.substitute(&self.program, artifact, env, &archive);
        let args: Vec<String> = self
            .args
            .iter()
            .map(|a| self.substitute(a, artifact, env, &archive))
            .collect();

        let path = match self.runtime.env_var("PATH") {
            Ok(path) if !path.is_empty() => {
                let separator = if cfg!(windows) { ";" } else { ":" };
                format!("{}{}{}", env.bin_dir().display(), separator, path)
            }
            _ => env.bin_dir().display().to_string(),
        };
        let request = CommandRequest::new(program, self.timeout)
            .args(args)
            .cwd(&env.root)
            .env("VIRTUAL_ENV", env.root.to_string_lossy())
            .env("PATH", path);

        let output = self.runtime.run_command(&request).await?;
        if !output.success() {
            let detail = if output.stderr.trim().is_empty() {
                output.stdout.trim()
            } else {
                output.stderr.trim()
            };
            bail!(
                "{} exited with {:?}: {}",
                request.program.display(),
                output.code,
                last_lines(detail, 5)
            );
        }
        Ok(env.root.clone())
    }
}

fn last_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    lines[lines.len().saturating_sub(n)..].join("\n")
}
