//! Installation orchestrator.
//!
//! Drives one package root through
//! `Pending → Provisioned → Fetched → Resolved → Linked → Verified`,
//! saving the record after every stage. A failing stage moves the record to
//! `Failed(kind)` with the error text; nothing advances past a failure.
//! Re-running the same manifest resumes: recorded packages are neither
//! fetched nor installed again, linking is idempotent and verification
//! always runs.

use log::{debug, info, warn};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::cache::ArtifactCache;
use crate::cleanup::SharedCleanupContext;
use crate::config::Config;
use crate::error::InstallError;
use crate::fetch::Fetcher;
use crate::http::HttpClient;
use crate::linker::Linker;
use crate::package::{Manifest, Package};
use crate::prereq::PrerequisiteChecker;
use crate::provision::{Environment, Provisioner};
use crate::record::InstallRecord;
use crate::resolver::{DependencyGraph, Resolver, install_step};
use crate::runtime::Runtime;
use crate::state::InstallState;
use crate::verify::Verifier;

#[derive(Debug, Clone)]
pub struct InstallOutcome {
    pub env: Environment,
    pub record: InstallRecord,
    pub links: Vec<PathBuf>,
    /// Packages installed by this run, in install order.
    pub installed: Vec<String>,
    /// Packages already present from an earlier run.
    pub skipped: Vec<String>,
    /// What the entry point printed during verification.
    pub version_output: String,
}

pub struct Installer<'a, R: Runtime> {
    runtime: &'a R,
    config: Config,
    http: HttpClient,
    cache: ArtifactCache,
    cleanup: Option<SharedCleanupContext>,
    cancel: CancellationToken,
}

impl<'a, R: Runtime> Installer<'a, R> {
    pub fn new(runtime: &'a R, config: Config, http: HttpClient) -> Self {
        let cache = ArtifactCache::new(&config.cache_dir);
        Self {
            runtime,
            config,
            http,
            cache,
            cleanup: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Share a cache handle (and its in-flight downloads) with other installers.
    pub fn with_cache(mut self, cache: ArtifactCache) -> Self {
        self.cache = cache;
        self
    }

    pub fn cache(&self) -> &ArtifactCache {
        &self.cache
    }

    pub fn with_cleanup(mut self, ctx: SharedCleanupContext) -> Self {
        self.cleanup = Some(ctx);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    #[tracing::instrument(skip(self, manifest), fields(package = %manifest.package.name))]
    pub async fn install(&self, manifest: &Manifest) -> Result<InstallOutcome, InstallError> {
        manifest.validate()?;
        let name = &manifest.package.name;

        let runtime_path = PrerequisiteChecker::new(self.runtime, self.config.prerequisite_timeout)
            .check(manifest, self.config.interpreter.as_deref())
            .await?;

        let (env, _lock) = Provisioner::new(self.runtime).provision(
            &self.config.env_root(name),
            name,
            runtime_path.as_deref(),
        )?;

        let mut record = InstallRecord::load(self.runtime, &env.record_path())?
            .unwrap_or_else(|| InstallRecord::new(name, &manifest.package.version));
        // A working installation of another build stays untouched
        check_recorded_hashes(manifest, &record)?;
        record.version = manifest.package.version.clone();

        match self
            .run_stages(manifest, &env, runtime_path.as_deref(), &mut record)
            .await
        {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                record.state = record.state.fail(e.kind());
                record.last_error = Some(e.to_string());
                if let Err(save_err) = record.save(self.runtime, &env.record_path()) {
                    warn!("Failed to record the failure: {:#}", save_err);
                }
                Err(e)
            }
        }
    }

    async fn run_stages(
        &self,
        manifest: &Manifest,
        env: &Environment,
        runtime_path: Option<&Path>,
        record: &mut InstallRecord,
    ) -> Result<InstallOutcome, InstallError> {
        record.state = InstallState::Pending;
        self.advance(record, env, InstallState::Provisioned)?;

        // Conflicts and cycles are rejected before anything is downloaded
        let graph = DependencyGraph::build(manifest.root_package(), manifest.dependency_packages()?)?;
        graph.install_order()?;

        let to_fetch: Vec<Package> = graph
            .packages()
            .iter()
            .filter(|p| !record.contains(p))
            .cloned()
            .collect();
        debug!(
            "{} of {} packages need fetching",
            to_fetch.len(),
            graph.len()
        );
        let staged = self
            .fetcher()
            .fetch_all(&to_fetch, &env.staging_dir(), self.config.jobs)
            .await
            .map_err(|e| match e {
                InstallError::Cancelled { .. } => InstallError::Cancelled {
                    installed: record.installed_names(),
                },
                other => other,
            })?;
        let staged: HashMap<_, _> = staged
            .into_iter()
            .map(|a| (a.package.name.clone(), a))
            .collect();
        self.advance(record, env, InstallState::Fetched)?;

        let step = install_step(
            self.runtime,
            &manifest.install,
            runtime_path,
            self.config.install_timeout,
        );
        let report = Resolver::new(self.runtime, step.as_ref(), self.config.jobs)
            .with_cancellation(self.cancel.clone())
            .resolve(env, &graph, &staged, record)
            .await?;
        let staging = env.staging_dir();
        if self.runtime.exists(&staging)
            && let Err(e) = self.runtime.remove_dir_all(&staging)
        {
            warn!("Failed to remove staging directory {:?}: {:#}", staging, e);
        }
        self.advance(record, env, InstallState::Resolved)?;

        let links = Linker::new(self.runtime, &self.config.link_dir).link(
            env,
            &report,
            &manifest.entry_points(),
        )?;
        for link in &links {
            record.add_link(link.clone());
        }
        record.verified = false;
        self.advance(record, env, InstallState::Linked)?;

        let timeout = manifest
            .verify
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.config.verify_timeout);
        let executable = links.first().ok_or_else(|| {
            InstallError::Other(anyhow::anyhow!("no entry point to verify"))
        })?;
        let version_output = Verifier::new(self.runtime, timeout)
            .verify(executable, &manifest.verify.args, manifest.expected_version())
            .await?;
        record.verified = true;
        record.last_error = None;
        self.advance(record, env, InstallState::Verified)?;

        info!(
            "{} is installed and verified ({} new, {} already present)",
            manifest.package.name,
            report.installed().len(),
            report.skipped().len()
        );
        Ok(InstallOutcome {
            env: env.clone(),
            record: record.clone(),
            links,
            installed: report.installed().to_vec(),
            skipped: report.skipped().to_vec(),
            version_output,
        })
    }

    /// Move to the next stage and persist it. Cancellation is honored here,
    /// between stages.
    fn advance(
        &self,
        record: &mut InstallRecord,
        env: &Environment,
        to: InstallState,
    ) -> Result<(), InstallError> {
        if self.cancel.is_cancelled() && to != InstallState::Verified {
            return Err(InstallError::Cancelled {
                installed: record.installed_names(),
            });
        }
        record.state = record.state.advance(to)?;
        record.save(self.runtime, &env.record_path())?;
        debug!("{} is now {}", env.name, record.state);
        Ok(())
    }

    fn fetcher(&self) -> Fetcher<'a, R> {
        let fetcher = Fetcher::new(
            self.runtime,
            self.http.clone(),
            self.cache.clone(),
        )
        .with_cancellation(self.cancel.clone());
        match &self.cleanup {
            Some(ctx) => fetcher.with_cleanup(ctx.clone()),
            None => fetcher,
        }
    }

    /// Remove an environment and the links it owns. Links that were taken
    /// over by something else are left alone; the shared cache is kept.
    #[tracing::instrument(skip(self))]
    pub async fn uninstall(&self, name: &str) -> Result<Vec<PathBuf>, InstallError> {
        let (env, lock) = Provisioner::new(self.runtime).open(&self.config.env_root(name), name)?;
        let removed = match InstallRecord::load(self.runtime, &env.record_path())? {
            Some(record) => Linker::new(self.runtime, &self.config.link_dir).unlink(&env, &record.links)?,
            None => Vec::new(),
        };
        // Removed under the lock so no installation can start in between;
        // the open lock file may be unlinked
        self.runtime.remove_dir_all(&env.root)?;
        drop(lock);
        info!("Removed environment {:?}", env.root);
        Ok(removed)
    }

    pub fn status(&self, name: &str) -> Result<Option<InstallRecord>, InstallError> {
        let env = Environment::new(name, self.config.env_root(name));
        Ok(InstallRecord::load(self.runtime, &env.record_path())?)
    }
}

/// Every declared package that the record already lists must carry the
/// recorded hash. Replacing one needs an uninstall first.
fn check_recorded_hashes(manifest: &Manifest, record: &InstallRecord) -> Result<(), InstallError> {
    let declared = std::iter::once((&manifest.package.name, &manifest.package.hash)).chain(
        manifest
            .dependencies
            .iter()
            .map(|dep| (&dep.name, &dep.hash)),
    );
    for (name, hash) in declared {
        if let Some(existing) = record.entry(name)
            && &existing.hash != hash
        {
            return Err(InstallError::conflict(
                name.as_str(),
                format!(
                    "{} is installed with hash {}; uninstall {} before installing hash {}",
                    existing.version, existing.hash, record.package, hash
                ),
            ));
        }
    }
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::archive::test_archives::tar_gz;
    use crate::error::ErrorKind;
    use crate::http::RetryPolicy;
    use crate::package::{DependencySpec, Digest, InstallStrategy, PackageSpec, VerifySpec};
    use crate::runtime::RealRuntime;
    use std::fs;
    use tempfile::{TempDir, tempdir};

    const TOOL_SCRIPT: &str = "#!/bin/sh\n[ -f \"$(dirname \"$0\")/../ready\" ] || exit 1\necho \"tool 1.0.0\"\n";

    struct Fixture {
        dir: TempDir,
        manifest: Manifest,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempdir().unwrap();
            fs::create_dir(dir.path().join("src")).unwrap();
            let tool = publish(
                dir.path(),
                "tool-1.0.0.tar.gz",
                &[("tool-1.0.0/bin/tool", TOOL_SCRIPT, 0o755)],
            );
            let lib = publish(
                dir.path(),
                "libtool-2.1.0.tar.gz",
                &[("libtool-2.1.0/lib/libtool.txt", "lib", 0o644)],
            );

            let manifest = Manifest {
                package: PackageSpec {
                    name: "tool".to_string(),
                    version: "1.0.0".to_string(),
                    source: tool.0,
                    hash: tool.1,
                },
                dependencies: vec![DependencySpec {
                    name: "libtool".to_string(),
                    version: ">=2, <3".to_string(),
                    resolved_version: None,
                    source: lib.0,
                    hash: lib.1,
                    dependencies: Vec::new(),
                }],
                entry_points: Vec::new(),
                runtime: None,
                service: None,
                install: InstallStrategy::Copy,
                verify: VerifySpec::default(),
            };
            Self { dir, manifest }
        }

        fn path(&self, rel: &str) -> PathBuf {
            self.dir.path().join(rel)
        }

        fn config(&self) -> Config {
            Config {
                install_root: self.path("envs"),
                link_dir: self.path("bin"),
                cache_dir: self.path("cache"),
                interpreter: None,
                jobs: 2,
                retry: RetryPolicy {
                    max_attempts: 1,
                    base_delay: Duration::from_millis(1),
                },
                fetch_timeout: Duration::from_secs(5),
                verify_timeout: Duration::from_secs(10),
                install_timeout: Duration::from_secs(10),
                prerequisite_timeout: Duration::from_secs(10),
            }
        }

        fn installer(&self) -> Installer<'static, RealRuntime> {
            Installer::new(&RealRuntime, self.config(), HttpClient::new(reqwest::Client::new()))
        }

        fn record(&self) -> InstallRecord {
            self.installer().status("tool").unwrap().unwrap()
        }
    }

    /// Write an archive under `src/` and return its file:// URL and digest.
    fn publish(root: &Path, file_name: &str, files: &[(&str, &str, u32)]) -> (String, Digest) {
        let body = tar_gz(files).unwrap();
        let path = root.join("src").join(file_name);
        fs::write(&path, &body).unwrap();
        (
            reqwest::Url::from_file_path(&path).unwrap().to_string(),
            Digest::of_bytes(&body),
        )
    }

    #[test_log::test(tokio::test)]
    async fn test_install_reaches_verified_and_rerun_is_idempotent() {
        let fx = Fixture::new();
        fs::write(fx.path("ready"), "").unwrap();

        let outcome = fx.installer().install(&fx.manifest).await.unwrap();
        assert_eq!(outcome.installed, ["libtool", "tool"]);
        assert_eq!(outcome.links, [fx.path("bin/tool")]);
        assert_eq!(outcome.version_output, "tool 1.0.0");
        assert!(!outcome.env.staging_dir().exists());
        assert!(outcome.env.package_dir("libtool").join("lib/libtool.txt").exists());

        let record = fx.record();
        assert_eq!(record.state, InstallState::Verified);
        assert!(record.verified);
        assert_eq!(record.installed_names(), ["libtool", "tool"]);

        let again = fx.installer().install(&fx.manifest).await.unwrap();
        assert!(again.installed.is_empty());
        assert_eq!(again.skipped, ["libtool", "tool"]);
        assert_eq!(fx.record().entries, record.entries);
    }

    #[test_log::test(tokio::test)]
    async fn test_verification_failure_then_resume_without_refetch() {
        let fx = Fixture::new();

        let err = fx.installer().install(&fx.manifest).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Verification);
        let record = fx.record();
        assert_eq!(record.state, InstallState::Failed(ErrorKind::Verification));
        assert!(!record.verified);
        assert!(record.last_error.unwrap().contains("exited with 1"));
        assert_eq!(record.links, [fx.path("bin/tool")]);

        // Neither sources nor cache are available for the second run
        fs::remove_dir_all(fx.path("src")).unwrap();
        fs::remove_dir_all(fx.path("cache")).unwrap();
        fs::write(fx.path("ready"), "").unwrap();

        let outcome = fx.installer().install(&fx.manifest).await.unwrap();
        assert!(outcome.installed.is_empty());
        assert_eq!(fx.record().state, InstallState::Verified);
    }

    #[tokio::test]
    async fn test_cycle_installs_nothing() {
        let mut fx = Fixture::new();
        let mut a = fx.manifest.dependencies[0].clone();
        a.name = "a".to_string();
        a.version = String::new();
        a.dependencies = vec!["b".to_string()];
        let mut b = a.clone();
        b.name = "b".to_string();
        b.hash = Digest::of_bytes(b"b");
        b.dependencies = vec!["a".to_string()];
        fx.manifest.dependencies = vec![a, b];

        let err = fx.installer().install(&fx.manifest).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Cycle);
        assert_eq!(err.exit_code(), 13);
        assert!(err.to_string().contains("a -> b -> a"));
        let record = fx.record();
        assert_eq!(record.state, InstallState::Failed(ErrorKind::Cycle));
        assert!(record.entries.is_empty());
        assert_eq!(fs::read_dir(fx.path("envs/tool/packages")).unwrap().count(), 0);
        assert!(!fx.path("cache").exists());
    }

    #[tokio::test]
    async fn test_integrity_failure_is_recorded() {
        let mut fx = Fixture::new();
        fx.manifest.dependencies[0].hash = Digest::of_bytes(b"not the archive");

        let err = fx.installer().install(&fx.manifest).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Integrity);
        assert_eq!(
            fx.record().state,
            InstallState::Failed(ErrorKind::Integrity)
        );
        assert!(fx.record().entries.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_before_fetch() {
        let fx = Fixture::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = fx
            .installer()
            .with_cancellation(cancel)
            .install(&fx.manifest)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert_eq!(fx.record().state, InstallState::Failed(ErrorKind::Cancelled));
    }

    #[tokio::test]
    async fn test_different_root_hash_requires_uninstall() {
        let mut fx = Fixture::new();
        fs::write(fx.path("ready"), "").unwrap();
        fx.installer().install(&fx.manifest).await.unwrap();

        let rebuilt = publish(
            fx.dir.path(),
            "tool-1.0.0-rebuilt.tar.gz",
            &[("tool-1.0.0/bin/tool", "#!/bin/sh\necho rebuilt\n", 0o755)],
        );
        fx.manifest.package.source = rebuilt.0;
        fx.manifest.package.hash = rebuilt.1;

        let err = fx.installer().install(&fx.manifest).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DependencyConflict);
        assert_eq!(fx.record().state, InstallState::Verified);
    }

    #[tokio::test]
    async fn test_changed_dependency_hash_requires_uninstall() {
        let mut fx = Fixture::new();
        fs::write(fx.path("ready"), "").unwrap();
        fx.installer().install(&fx.manifest).await.unwrap();
        let before = fx.record();

        let rebuilt = publish(
            fx.dir.path(),
            "libtool-2.1.0-rebuilt.tar.gz",
            &[("libtool-2.1.0/lib/libtool.txt", "rebuilt", 0o644)],
        );
        fx.manifest.dependencies[0].source = rebuilt.0;
        fx.manifest.dependencies[0].hash = rebuilt.1;

        let err = fx.installer().install(&fx.manifest).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::DependencyConflict);
        assert_eq!(err.exit_code(), 14);
        assert!(err.to_string().contains("libtool"));
        let after = fx.record();
        assert_eq!(after.state, InstallState::Verified);
        assert_eq!(after.entries, before.entries);
        let installed = Environment::new("tool", fx.path("envs/tool"))
            .package_dir("libtool")
            .join("lib/libtool.txt");
        assert_eq!(fs::read_to_string(installed).unwrap(), "lib");
    }

    /// Root package `name` that prints its version and depends on `deps`.
    fn root_manifest(root: &Path, name: &str, deps: Vec<DependencySpec>) -> Manifest {
        let script = format!("#!/bin/sh\necho \"{} 1.0.0\"\n", name);
        let entry = format!("{}-1.0.0/bin/{}", name, name);
        let (source, hash) = publish(
            root,
            &format!("{}-1.0.0.tar.gz", name),
            &[(entry.as_str(), script.as_str(), 0o755)],
        );
        Manifest {
            package: PackageSpec {
                name: name.to_string(),
                version: "1.0.0".to_string(),
                source,
                hash,
            },
            dependencies: deps,
            entry_points: Vec::new(),
            runtime: None,
            service: None,
            install: InstallStrategy::Copy,
            verify: VerifySpec::default(),
        }
    }

    /// Serve `shared-1.0.0.tar.gz`, expecting exactly one download.
    async fn serve_shared(server: &mut mockito::ServerGuard) -> (mockito::Mock, DependencySpec) {
        let body = tar_gz(&[("shared-1.0.0/lib/shared.txt", "shared", 0o644)]).unwrap();
        let mock = server
            .mock("GET", "/shared-1.0.0.tar.gz")
            .with_status(200)
            .with_body(body.clone())
            .expect(1)
            .create_async()
            .await;
        let dep = DependencySpec {
            name: "shared".to_string(),
            version: ">=1".to_string(),
            resolved_version: Some("1.0.0".to_string()),
            source: format!("{}/shared-1.0.0.tar.gz", server.url()),
            hash: Digest::of_bytes(&body),
            dependencies: Vec::new(),
        };
        (mock, dep)
    }

    #[test_log::test(tokio::test)]
    async fn test_installers_sharing_a_cache_download_a_dependency_once() {
        let fx = Fixture::new();
        let mut server = mockito::Server::new_async().await;
        let (mock, shared) = serve_shared(&mut server).await;
        let one = root_manifest(fx.dir.path(), "one", vec![shared.clone()]);
        let two = root_manifest(fx.dir.path(), "two", vec![shared]);

        let first = fx.installer();
        let second = fx.installer().with_cache(first.cache().clone());
        let (a, b) = tokio::join!(first.install(&one), second.install(&two));

        let (a, b) = (a.unwrap(), b.unwrap());
        mock.assert_async().await;
        assert_eq!(a.installed, ["shared", "one"]);
        assert_eq!(b.installed, ["shared", "two"]);
        assert!(b.env.package_dir("shared").join("lib/shared.txt").exists());
        assert_eq!(first.cache().inflight_len(), 0);
    }

    #[tokio::test]
    async fn test_separate_installers_download_a_dependency_once() {
        let fx = Fixture::new();
        let mut server = mockito::Server::new_async().await;
        let (mock, shared) = serve_shared(&mut server).await;
        let one = root_manifest(fx.dir.path(), "one", vec![shared.clone()]);
        let two = root_manifest(fx.dir.path(), "two", vec![shared]);

        // No shared handle: only the lock file under the cache serializes them
        let (first, second) = (fx.installer(), fx.installer());
        let (a, b) = tokio::join!(first.install(&one), second.install(&two));

        a.unwrap();
        b.unwrap();
        mock.assert_async().await;
        assert!(fx.path("cache/locks").is_dir());
    }

    #[tokio::test]
    async fn test_uninstall_of_a_locked_environment_changes_nothing() {
        let fx = Fixture::new();
        fs::write(fx.path("ready"), "").unwrap();
        let outcome = fx.installer().install(&fx.manifest).await.unwrap();

        let held = RealRuntime.try_lock(&outcome.env.lock_path()).unwrap();
        assert!(held.is_some());
        let err = fx.installer().uninstall("tool").await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Provision);
        assert!(err.to_string().contains("locked"));
        assert!(fx.path("envs/tool").is_dir());
        assert!(fx.path("bin/tool").is_symlink());
        assert_eq!(fx.record().state, InstallState::Verified);

        drop(held);
        fx.installer().uninstall("tool").await.unwrap();
        assert!(!fx.path("envs/tool").exists());
    }

    #[tokio::test]
    async fn test_uninstall_removes_env_and_own_links() {
        let fx = Fixture::new();
        fs::write(fx.path("ready"), "").unwrap();
        fx.installer().install(&fx.manifest).await.unwrap();
        std::os::unix::fs::symlink("/usr/bin/true", fx.path("bin/other")).unwrap();

        let removed = fx.installer().uninstall("tool").await.unwrap();

        assert_eq!(removed, [fx.path("bin/tool")]);
        assert!(!fx.path("envs/tool").exists());
        assert!(fx.path("bin/other").is_symlink());
        assert!(fx.path("cache/sha256").exists());
        assert!(fx.installer().status("tool").unwrap().is_none());
    }
}
