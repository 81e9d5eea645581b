//! Load-mutate-persist index over backup metadata.
//!
//! The on-disk form is the sidecar `backup-metadata.json`: a JSON array of
//! records with ISO-8601 timestamps. The in-memory copy is the single
//! source of truth while the store is open; every mutation rewrites the
//! sidecar through a temp-file rename so a crash leaves either the old or
//! the new index, never a torn one.

use super::BackupRecord;
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

#[derive(Debug, Default)]
pub(crate) struct BackupIndex {
    records: Vec<BackupRecord>,
    /// Highest version ever handed out per original path. Seeded from the
    /// loaded records and kept monotonic for the lifetime of the store.
    version_counters: HashMap<String, u64>,
}

impl BackupIndex {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let json = fs::read_to_string(path)
            .with_context(|| format!("read backup index {}", path.display()))?;
        let records: Vec<BackupRecord> =
            serde_json::from_str(&json).context("parse backup index")?;
        let mut version_counters: HashMap<String, u64> = HashMap::new();
        for record in &records {
            let counter = version_counters
                .entry(record.original_path.clone())
                .or_insert(0);
            if record.version > *counter {
                *counter = record.version;
            }
        }
        Ok(Self {
            records,
            version_counters,
        })
    }

    pub fn persist(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(&self.records)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json)
            .with_context(|| format!("write backup index staging {}", tmp.display()))?;
        fs::rename(&tmp, path)
            .with_context(|| format!("replace backup index {}", path.display()))?;
        Ok(())
    }

    /// Reserve the next version for a path. Versions only ever grow; a
    /// reservation is released with [`release_version`] when the backup
    /// that claimed it fails, so callers never observe gaps.
    pub fn next_version(&mut self, original_path: &str) -> u64 {
        let counter = self
            .version_counters
            .entry(original_path.to_string())
            .or_insert(0);
        *counter += 1;
        *counter
    }

    pub fn release_version(&mut self, original_path: &str, version: u64) {
        if let Some(counter) = self.version_counters.get_mut(original_path) {
            if *counter == version {
                *counter -= 1;
            }
        }
    }

    pub fn insert(&mut self, record: BackupRecord) {
        self.records.push(record);
    }

    pub fn remove(&mut self, id: &str) -> Option<BackupRecord> {
        let pos = self.records.iter().position(|r| r.id == id)?;
        Some(self.records.remove(pos))
    }

    pub fn get(&self, id: &str) -> Option<&BackupRecord> {
        self.records.iter().find(|r| r.id == id)
    }

    pub fn records(&self) -> &[BackupRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Records for one original path, oldest version first.
    pub fn for_path(&self, original_path: &str) -> Vec<BackupRecord> {
        let mut out: Vec<BackupRecord> = self
            .records
            .iter()
            .filter(|r| r.original_path == original_path)
            .cloned()
            .collect();
        out.sort_by_key(|r| r.version);
        out
    }
}
