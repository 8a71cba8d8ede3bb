//! Package model
//!
//! Packages, their content digests, version helpers and the manifest that
//! describes one installation.

mod digest;
mod manifest;
mod version;

use serde::{Deserialize, Serialize};

pub use digest::Digest;
pub use manifest::{
    DependencySpec, InstallStrategy, Manifest, PackageSpec, RuntimeRequirement,
    ServiceRequirement, VerifySpec,
};
pub use version::{
    find_version_in_text, parse_requirement, parse_version, version_from_file_name,
};

/// A concrete package: one archive at one version with a known digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Package {
    pub name: String,
    pub version: String,
    pub source: String,
    pub hash: Digest,
    /// Names of the packages this one needs installed first.
    #[serde(default)]
    pub dependencies: Vec<String>,
}

impl Package {
    /// `name@version`
    pub fn id(&self) -> String {
        format!("{}@{}", self.name, self.version)
    }

    /// Last path segment of the source location, without query or fragment.
    pub fn file_name(&self) -> &str {
        let without_query = self
            .source
            .split(['?', '#'])
            .next()
            .unwrap_or(&self.source);
        without_query
            .rsplit(['/', '\\'])
            .next()
            .filter(|s| !s.is_empty())
            .unwrap_or(&self.name)
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    /// A package whose digest is derived from its name, for graph tests.
    pub fn package(name: &str, deps: &[&str]) -> Package {
        Package {
            name: name.to_string(),
            version: "1.0.0".to_string(),
            source: format!("https://files.example.com/{}-1.0.0.tar.gz", name),
            hash: Digest::of_bytes(name.as_bytes()),
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
        }
    }
}
