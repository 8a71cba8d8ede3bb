//! Content-addressed artifact cache shared by all environments.
//!
//! Entries live at `<root>/sha256/<hex digest>` and are write-once: a
//! download goes to `<root>/tmp/<hex>.<unique>` and is renamed into place
//! only after its digest matched. An existing entry is never overwritten.
//!
//! Writers of one digest are serialized twice: clones of an [`ArtifactCache`]
//! share an in-process slot per digest, and every writer holds the advisory
//! lock `<root>/locks/<hex>`, which also covers other processes.

use anyhow::{Context, Result};
use log::{debug, warn};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::package::Digest;
use crate::runtime::Runtime;

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Serializes in-process writers of one digest.
pub type DigestSlot = Arc<tokio::sync::Mutex<()>>;

#[derive(Debug, Clone)]
pub struct ArtifactCache {
    root: PathBuf,
    inflight: Arc<Mutex<HashMap<Digest, DigestSlot>>>,
}

impl ArtifactCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            inflight: Arc::default(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn entry_path(&self, digest: &Digest) -> PathBuf {
        self.root.join("sha256").join(digest.as_str())
    }

    /// A fresh temp path for downloading `digest`, unique within this host.
    pub fn temp_path(&self, digest: &Digest) -> PathBuf {
        let n = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        self.root
            .join("tmp")
            .join(format!("{}.{}-{}", digest.as_str(), std::process::id(), n))
    }

    /// Advisory lock file guarding writes of `digest`.
    pub fn lock_path(&self, digest: &Digest) -> PathBuf {
        self.root.join("locks").join(digest.as_str())
    }

    /// The slot for `digest`, shared by every clone of this cache.
    pub fn inflight_slot(&self, digest: &Digest) -> DigestSlot {
        let mut inflight = self
            .inflight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(inflight.entry(digest.clone()).or_default())
    }

    /// Give back a slot taken with [`inflight_slot`](Self::inflight_slot).
    /// The entry is dropped once no other caller holds it.
    pub fn release_slot(&self, digest: &Digest, slot: DigestSlot) {
        let mut inflight = self
            .inflight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // The map holds one reference and `slot` the other
        let current = inflight
            .get(digest)
            .is_some_and(|entry| Arc::ptr_eq(entry, &slot));
        if current && Arc::strong_count(&slot) <= 2 {
            inflight.remove(digest);
        }
    }

    pub fn inflight_len(&self) -> usize {
        self.inflight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn contains<R: Runtime>(&self, runtime: &R, digest: &Digest) -> bool {
        runtime.exists(&self.entry_path(digest))
    }

    /// Hash a file through the runtime.
    pub fn digest_of<R: Runtime>(runtime: &R, path: &Path) -> Result<Digest> {
        let reader = runtime.open(path)?;
        Digest::of_reader(reader).with_context(|| format!("Failed to hash {:?}", path))
    }

    /// Re-hash an existing entry. A corrupted entry is removed so the next
    /// fetch can replace it; returns whether the entry is intact.
    #[tracing::instrument(skip(self, runtime))]
    pub fn verify_entry<R: Runtime>(&self, runtime: &R, digest: &Digest) -> Result<bool> {
        let path = self.entry_path(digest);
        let actual = Self::digest_of(runtime, &path)?;
        if &actual == digest {
            return Ok(true);
        }
        warn!(
            "Cache entry {:?} is corrupted (hash {}), removing it",
            path,
            actual.short()
        );
        runtime.remove_file(&path)?;
        Ok(false)
    }

    /// Move a verified temp file into the cache. If another writer already
    /// committed the same digest, the temp file is discarded instead.
    #[tracing::instrument(skip(self, runtime))]
    pub fn commit<R: Runtime>(&self, runtime: &R, temp: &Path, digest: &Digest) -> Result<PathBuf> {
        let entry = self.entry_path(digest);
        if runtime.exists(&entry) {
            debug!("{} already cached, discarding {:?}", digest.short(), temp);
            runtime.remove_file(temp)?;
            return Ok(entry);
        }
        if let Some(parent) = entry.parent() {
            runtime.create_dir_all(parent)?;
        }
        runtime.rename(temp, &entry)?;
        Ok(entry)
    }
}
