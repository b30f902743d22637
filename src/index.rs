//! Persistent URL → archived-file map that makes acquisitions idempotent.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::warn;

pub const INDEX_FILE: &str = "index.json";

type Entries = BTreeMap<String, PathBuf>;

/// The index file is reread on every access and rewritten whole after every
/// mutation. One mutex serializes all of it.
pub struct ArchiveIndex {
    path: PathBuf,
    lock: Mutex<()>,
}

impl ArchiveIndex {
    pub fn new(archive_root: &Path) -> Self {
        Self {
            path: archive_root.join(INDEX_FILE),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Archived file for `url`, if recorded and still present on disk.
    pub fn get(&self, url: &str) -> Option<PathBuf> {
        let _guard = self.lock.lock();
        let path = self.load().remove(url)?;
        path.is_file().then_some(path)
    }

    pub fn put(&self, url: &str, file: &Path) -> Result<()> {
        let _guard = self.lock.lock();
        let mut entries = self.load();
        entries.insert(url.to_string(), file.to_path_buf());
        self.store(&entries)
    }

    /// Drops `url` and returns the path it pointed at. Nothing is written
    /// when the URL was unknown.
    pub fn delete(&self, url: &str) -> Result<Option<PathBuf>> {
        let _guard = self.lock.lock();
        let mut entries = self.load();
        let Some(removed) = entries.remove(url) else {
            return Ok(None);
        };
        self.store(&entries)?;
        Ok(Some(removed))
    }

    /// Snapshot of every entry, stale ones included.
    pub fn entries(&self) -> Vec<(String, PathBuf)> {
        let _guard = self.lock.lock();
        self.load().into_iter().collect()
    }

    fn load(&self) -> Entries {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Entries::new(),
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "archive index unreadable, treating as empty");
                return Entries::new();
            }
        };
        match serde_json::from_str(&raw) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "archive index is corrupt, treating as empty");
                Entries::new()
            }
        }
    }

    fn store(&self, entries: &Entries) -> Result<()> {
        write_json_atomic(&self.path, entries)
    }
}

/// Writes `value` as pretty JSON through a sibling temp file and a rename.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }
    let tmp_path = path.with_extension("tmp");
    let payload = serde_json::to_vec_pretty(value)?;
    fs::write(&tmp_path, payload).with_context(|| format!("writing {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path)
        .with_context(|| format!("replacing {}", path.display()))?;
    Ok(())
}
