//! Dependency Resolver.
//!
//! Orders the packages of an installation and installs the ones the record
//! does not list yet, running independent packages concurrently. A package
//! starts only once all of its dependencies are installed.

mod graph;
mod step;

use futures_util::StreamExt;
use futures_util::stream::FuturesUnordered;
use log::{debug, info, warn};
use std::collections::{HashMap, VecDeque};
use tokio_util::sync::CancellationToken;

use crate::error::InstallError;
use crate::fetch::StagedArtifact;
use crate::provision::Environment;
use crate::record::{InstallRecord, RecordEntry};
use crate::runtime::Runtime;

pub use graph::DependencyGraph;
#[cfg(test)]
pub use step::MockInstallStep;
pub use step::{CommandInstall, CopyInstall, InstallStep, install_step};

/// Proof that every package of the graph is installed and recorded.
/// Only [`Resolver::resolve`] creates one; linking requires it.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolveReport {
    order: Vec<String>,
    installed: Vec<String>,
    skipped: Vec<String>,
}

impl ResolveReport {
    /// All packages, in a valid install order.
    pub fn order(&self) -> &[String] {
        &self.order
    }

    /// Packages installed by this run.
    pub fn installed(&self) -> &[String] {
        &self.installed
    }

    /// Packages that were already recorded.
    pub fn skipped(&self) -> &[String] {
        &self.skipped
    }

    #[cfg(test)]
    pub(crate) fn for_tests(order: &[&str]) -> Self {
        Self {
            order: order.iter().map(|s| s.to_string()).collect(),
            installed: Vec::new(),
            skipped: Vec::new(),
        }
    }
}

pub struct Resolver<'a, R: Runtime> {
    runtime: &'a R,
    step: &'a dyn InstallStep,
    jobs: usize,
    cancel: CancellationToken,
}

impl<'a, R: Runtime> Resolver<'a, R> {
    pub fn new(runtime: &'a R, step: &'a dyn InstallStep, jobs: usize) -> Self {
        Self {
            runtime,
            step,
            jobs: jobs.max(1),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Install every package of `graph` into `env`, saving `record` after
    /// each one. On failure or cancellation, steps already running are
    /// allowed to finish and are recorded; nothing new starts.
    #[tracing::instrument(skip_all, fields(env = %env.name))]
    pub async fn resolve(
        &self,
        env: &Environment,
        graph: &DependencyGraph,
        staged: &HashMap<String, StagedArtifact>,
        record: &mut InstallRecord,
    ) -> Result<ResolveReport, InstallError> {
        // A recorded name may never be installed again under another hash
        for package in graph.packages() {
            if let Some(existing) = record.entry(&package.name)
                && existing.hash != package.hash
            {
                return Err(InstallError::conflict(
                    &package.name,
                    format!(
                        "recorded with hash {}, declared with hash {}",
                        existing.hash, package.hash
                    ),
                ));
            }
        }

        let order: Vec<String> = graph
            .install_order()?
            .into_iter()
            .map(|p| p.name.clone())
            .collect();

        let mut remaining: HashMap<&str, usize> = graph
            .packages()
            .iter()
            .map(|p| (p.name.as_str(), p.dependencies.len()))
            .collect();
        let mut ready: VecDeque<&str> = order
            .iter()
            .map(String::as_str)
            .filter(|name| remaining[name] == 0)
            .collect();

        let mut running = FuturesUnordered::new();
        let mut installed = Vec::new();
        let mut skipped = Vec::new();
        let mut failure: Option<(String, String)> = None;
        let mut done = 0;

        loop {
            while failure.is_none() && !self.cancel.is_cancelled() && running.len() < self.jobs {
                let Some(name) = ready.pop_front() else {
                    break;
                };
                let Some(package) = graph.package(name) else {
                    continue;
                };

                if record.contains(package) {
                    debug!("{} is already installed, skipping", package.id());
                    skipped.push(name.to_string());
                    done += 1;
                    release_dependents(graph, name, &order, &mut remaining, &mut ready);
                    continue;
                }

                let Some(artifact) = staged.get(name) else {
                    failure = Some((name.to_string(), "artifact was not fetched".to_string()));
                    break;
                };
                info!("Installing {}", package.id());
                running.push(async move { (name, self.step.install(artifact, env).await) });
            }

            let Some((name, result)) = running.next().await else {
                break;
            };
            let result = result.and_then(|path| {
                let package = &staged[name].package;
                record.push(RecordEntry {
                    name: package.name.clone(),
                    version: package.version.clone(),
                    hash: package.hash.clone(),
                    installed_path: path,
                })?;
                record.save(self.runtime, &env.record_path())
            });

            match result {
                Ok(()) => {
                    installed.push(name.to_string());
                    done += 1;
                    release_dependents(graph, name, &order, &mut remaining, &mut ready);
                }
                Err(e) => {
                    warn!("Failed to install {}: {:#}", name, e);
                    if failure.is_none() {
                        failure = Some((name.to_string(), format!("{:#}", e)));
                    }
                }
            }
        }

        if let Some((package, reason)) = failure {
            return Err(InstallError::InstallStep {
                package,
                installed: record.installed_names(),
                reason,
            });
        }
        if done < order.len() {
            return Err(InstallError::Cancelled {
                installed: record.installed_names(),
            });
        }

        // Queued names borrow `order` until `running` is dropped
        drop(running);
        Ok(ResolveReport {
            order,
            installed,
            skipped,
        })
    }
}

/// Mark `name` done and queue dependents whose dependencies are now all
/// installed, keeping install order among them.
fn release_dependents<'g>(
    graph: &'g DependencyGraph,
    name: &str,
    order: &[String],
    remaining: &mut HashMap<&'g str, usize>,
    ready: &mut VecDeque<&'g str>,
) {
    let mut released: Vec<&'g str> = Vec::new();
    for dependent in graph.dependents_of(name) {
        if let Some(count) = remaining.get_mut(dependent) {
            *count -= 1;
            if *count == 0 {
                released.push(dependent);
            }
        }
    }
    released.sort_by_key(|n| order.iter().position(|o| o == n));
    ready.extend(released);
}
