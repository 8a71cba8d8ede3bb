use anyhow::{Context, Result, bail};
use log::warn;
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};

use super::{Digest, Package, parse_requirement, parse_version, version_from_file_name};
use crate::error::InstallError;
use crate::runtime::Runtime;

/// Description of one installation, as supplied by a manifest author.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub package: PackageSpec,
    #[serde(default)]
    pub dependencies: Vec<DependencySpec>,
    /// Executables to expose, relative to the environment root.
    /// Defaults to `bin/<package name>`.
    #[serde(default)]
    pub entry_points: Vec<PathBuf>,
    #[serde(default)]
    pub runtime: Option<RuntimeRequirement>,
    #[serde(default)]
    pub service: Option<ServiceRequirement>,
    #[serde(default)]
    pub install: InstallStrategy,
    #[serde(default)]
    pub verify: VerifySpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageSpec {
    pub name: String,
    pub version: String,
    pub source: String,
    pub hash: Digest,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependencySpec {
    pub name: String,
    /// Version constraint, e.g. `>=8.0, <9`.
    #[serde(default)]
    pub version: String,
    /// Concrete version of the archive, when the collaborator knows it.
    #[serde(default)]
    pub resolved_version: Option<String>,
    pub source: String,
    pub hash: Digest,
    /// Other dependencies (by name) this one needs installed first.
    #[serde(default)]
    pub dependencies: Vec<String>,
}

/// Interpreter or runtime the package runs on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeRequirement {
    pub name: String,
    #[serde(default)]
    pub min_version: Option<String>,
}

/// External service that must be present; never managed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRequirement {
    pub name: String,
}

/// How a staged artifact is installed into the environment.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum InstallStrategy {
    /// Copy the staged tree into `packages/<name>` and expose its `bin/`.
    #[default]
    Copy,
    /// Run a package manager inside the environment. `program` and `args`
    /// may use `{env}`, `{artifact}`, `{archive}`, `{name}`, `{version}` and `{runtime}`.
    Command {
        program: String,
        #[serde(default)]
        args: Vec<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifySpec {
    #[serde(default = "default_verify_args")]
    pub args: Vec<String>,
    /// Text the output must contain. Defaults to the package version.
    #[serde(default)]
    pub expected: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl Default for VerifySpec {
    fn default() -> Self {
        Self {
            args: default_verify_args(),
            expected: None,
            timeout_secs: None,
        }
    }
}

fn default_verify_args() -> Vec<String> {
    vec!["--version".to_string()]
}

impl Manifest {
    #[tracing::instrument(skip(runtime))]
    pub fn load<R: Runtime>(runtime: &R, path: &Path) -> Result<Self> {
        let content = runtime
            .read_to_string(path)
            .with_context(|| format!("Failed to read manifest {:?}", path))?;
        let manifest: Manifest = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse manifest {:?}", path))?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Check names and paths before anything touches the filesystem.
    pub fn validate(&self) -> Result<()> {
        validate_name(&self.package.name)?;
        if parse_version(&self.package.version).is_none() {
            bail!(
                "package {} has an invalid version '{}'",
                self.package.name,
                self.package.version
            );
        }
        for dep in &self.dependencies {
            validate_name(&dep.name)?;
            for name in &dep.dependencies {
                validate_name(name)?;
            }
        }
        for entry in &self.entry_points {
            let escapes = entry
                .components()
                .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
            if entry.as_os_str().is_empty() || escapes {
                bail!(
                    "entry point {:?} must be a relative path inside the environment",
                    entry
                );
            }
        }
        Ok(())
    }

    pub fn entry_points(&self) -> Vec<PathBuf> {
        if self.entry_points.is_empty() {
            vec![Path::new("bin").join(&self.package.name)]
        } else {
            self.entry_points.clone()
        }
    }

    pub fn expected_version(&self) -> &str {
        self.verify
            .expected
            .as_deref()
            .unwrap_or(&self.package.version)
    }

    /// The root package. It depends on every declared dependency.
    pub fn root_package(&self) -> Package {
        Package {
            name: self.package.name.clone(),
            version: self.package.version.clone(),
            source: self.package.source.clone(),
            hash: self.package.hash.clone(),
            dependencies: self.dependencies.iter().map(|d| d.name.clone()).collect(),
        }
    }

    /// Resolve each declared dependency to a concrete package, checking its
    /// version against the declared constraint.
    pub fn dependency_packages(&self) -> Result<Vec<Package>, InstallError> {
        self.dependencies.iter().map(resolve_dependency).collect()
    }
}

fn resolve_dependency(dep: &DependencySpec) -> Result<Package, InstallError> {
    let requirement = parse_requirement(&dep.version)
        .map_err(|e| InstallError::conflict(&dep.name, format!("{:#}", e)))?;

    let mut package = Package {
        name: dep.name.clone(),
        version: String::new(),
        source: dep.source.clone(),
        hash: dep.hash.clone(),
        dependencies: dep.dependencies.clone(),
    };

    let concrete = dep
        .resolved_version
        .clone()
        .or_else(|| version_from_file_name(&dep.name, package.file_name()));

    match concrete {
        Some(version) => {
            let parsed = parse_version(&version).ok_or_else(|| {
                InstallError::conflict(&dep.name, format!("invalid version '{}'", version))
            })?;
            if !requirement.matches(&parsed) {
                return Err(InstallError::conflict(
                    &dep.name,
                    format!("version {} does not satisfy '{}'", version, dep.version),
                ));
            }
            package.version = version;
        }
        None => {
            warn!(
                "Cannot determine the version of {} from {}; trusting constraint '{}'",
                dep.name, dep.source, dep.version
            );
            package.version = if dep.version.is_empty() {
                "*".to_string()
            } else {
                dep.version.clone()
            };
        }
    }

    Ok(package)
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\'])
        || name.starts_with('.')
    {
        bail!("invalid package name '{}'", name);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::runtime::MockRuntime;
    use mockall::predicate::eq;

    const HASH: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    fn manifest_json() -> String {
        format!(
            r#"{{
                "package": {{
                    "name": "respec-ai",
                    "version": "0.6.3",
                    "source": "https://files.example.com/respec_ai-0.6.3.tar.gz",
                    "hash": "sha256:{HASH}"
                }},
                "dependencies": [
                    {{
                        "name": "click",
                        "version": ">=8, <9",
                        "source": "https://files.example.com/click-8.1.7-py3-none-any.whl",
                        "hash": "{HASH}"
                    }}
                ],
                "runtime": {{ "name": "python3", "min_version": "3.11" }},
                "service": {{ "name": "docker" }}
            }}"#
        )
    }

    #[test]
    fn test_load_manifest_with_defaults() {
        let mut runtime = MockRuntime::new();
        runtime
            .expect_read_to_string()
            .with(eq(PathBuf::from("/tmp/respec-ai.json")))
            .returning(|_| Ok(manifest_json()));

        let manifest = Manifest::load(&runtime, Path::new("/tmp/respec-ai.json")).unwrap();
        assert_eq!(manifest.package.name, "respec-ai");
        assert_eq!(manifest.install, InstallStrategy::Copy);
        assert_eq!(manifest.verify.args, vec!["--version"]);
        assert_eq!(manifest.expected_version(), "0.6.3");
        assert_eq!(manifest.entry_points(), vec![PathBuf::from("bin/respec-ai")]);
        assert_eq!(manifest.service.as_ref().unwrap().name, "docker");

        let root = manifest.root_package();
        assert_eq!(root.dependencies, vec!["click"]);

        let deps = manifest.dependency_packages().unwrap();
        assert_eq!(deps[0].version, "8.1.7");
    }

    #[test]
    fn test_install_strategy_command() {
        let json = r#"{"kind": "command", "program": "{env}/bin/pip", "args": ["install", "{artifact}"]}"#;
        let strategy: InstallStrategy = serde_json::from_str(json).unwrap();
        assert_eq!(
            strategy,
            InstallStrategy::Command {
                program: "{env}/bin/pip".to_string(),
                args: vec!["install".to_string(), "{artifact}".to_string()],
            }
        );
    }

    #[test]
    fn test_dependency_version_must_satisfy_constraint() {
        let mut manifest: Manifest = serde_json::from_str(&manifest_json()).unwrap();
        manifest.dependencies[0].resolved_version = Some("9.0.0".to_string());

        let err = manifest.dependency_packages().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DependencyConflict);
        assert!(err.to_string().contains("does not satisfy"));
    }

    #[test]
    fn test_dependency_without_detectable_version_keeps_constraint() {
        let mut manifest: Manifest = serde_json::from_str(&manifest_json()).unwrap();
        manifest.dependencies[0].source = "https://files.example.com/download".to_string();

        let deps = manifest.dependency_packages().unwrap();
        assert_eq!(deps[0].version, ">=8, <9");
    }

    #[test]
    fn test_validate_rejects_unsafe_names_and_entry_points() {
        let mut manifest: Manifest = serde_json::from_str(&manifest_json()).unwrap();
        manifest.package.name = "../evil".to_string();
        assert!(manifest.validate().is_err());

        let mut manifest: Manifest = serde_json::from_str(&manifest_json()).unwrap();
        manifest.entry_points = vec![PathBuf::from("../../usr/bin/sh")];
        assert!(manifest.validate().is_err());

        let mut manifest: Manifest = serde_json::from_str(&manifest_json()).unwrap();
        manifest.package.version = "latest".to_string();
        assert!(manifest.validate().is_err());

        let manifest: Manifest = serde_json::from_str(&manifest_json()).unwrap();
        assert!(manifest.validate().is_ok());
    }
}
