//! Install record: the ledger of what has been installed into an environment.
//!
//! Stored as `install-record.json` at the environment root. Re-running an
//! installation consults it to skip packages that are already in place.

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::package::{Digest, Package};
use crate::runtime::Runtime;
use crate::state::InstallState;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordEntry {
    pub name: String,
    pub version: String,
    pub hash: Digest,
    pub installed_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstallRecord {
    pub package: String,
    pub version: String,
    pub state: InstallState,
    #[serde(default)]
    pub entries: Vec<RecordEntry>,
    /// Links created in the shared link directory.
    #[serde(default)]
    pub links: Vec<PathBuf>,
    #[serde(default)]
    pub verified: bool,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl InstallRecord {
    pub fn new(package: &str, version: &str) -> Self {
        Self {
            package: package.to_string(),
            version: version.to_string(),
            state: InstallState::Pending,
            entries: Vec::new(),
            links: Vec::new(),
            verified: false,
            last_error: None,
        }
    }

    /// Returns `None` if no record has been written yet.
    #[tracing::instrument(skip(runtime))]
    pub fn load<R: Runtime>(runtime: &R, path: &Path) -> Result<Option<Self>> {
        if !runtime.exists(path) {
            return Ok(None);
        }
        let content = runtime.read_to_string(path)?;
        let record = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse install record {:?}", path))?;
        Ok(Some(record))
    }

    /// Write the record atomically (temp file + rename).
    #[tracing::instrument(skip(self, runtime))]
    pub fn save<R: Runtime>(&self, runtime: &R, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        runtime
            .write(&tmp, content.as_bytes())
            .with_context(|| format!("Failed to save install record to {:?}", tmp))?;
        runtime.rename(&tmp, path)
    }

    pub fn entry(&self, name: &str) -> Option<&RecordEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    /// Whether exactly this package (name and content hash) is installed.
    pub fn contains(&self, package: &Package) -> bool {
        self.entry(&package.name)
            .is_some_and(|e| e.hash == package.hash)
    }

    pub fn installed_names(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.name.clone()).collect()
    }

    /// Append an entry. A name may only ever map to one hash.
    pub fn push(&mut self, entry: RecordEntry) -> Result<()> {
        if let Some(existing) = self.entry(&entry.name) {
            if existing.hash == entry.hash {
                return Ok(());
            }
            bail!(
                "{} is already installed with hash {}, refusing to add hash {}",
                entry.name,
                existing.hash,
                entry.hash
            );
        }
        self.entries.push(entry);
        Ok(())
    }

    pub fn add_link(&mut self, link: PathBuf) {
        if !self.links.contains(&link) {
            self.links.push(link);
        }
    }
}
