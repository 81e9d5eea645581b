//! Versioned, checksummed snapshots of watched files.
//!
//! Payloads live as `<id>_v<version><origExt>[.gz]` under the backup
//! directory; the sidecar `backup-metadata.json` holds every record.
//! Creation and restore both go through staged writes with an atomic
//! rename, and every successful backup immediately applies the retention
//! policy for its own path; there is no separate sweeper.
//!
//! Creation and restore never return `Err` to callers: failures surface as
//! [`BackupOutcome::Failed`] / [`RestoreOutcome::Failed`] values.

mod index;

use crate::checksum::{self, ChecksumAlgorithm};
use crate::config::BackupConfig;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;

use index::BackupIndex;

pub const INDEX_FILE: &str = "backup-metadata.json";
const STAGING_SUFFIX: &str = ".staging";

#[derive(Debug, thiserror::Error)]
pub enum BackupStoreError {
    #[error("backup not found: {0}")]
    NotFound(String),
    #[error("payload missing for backup {0}")]
    PayloadMissing(String),
    #[error("checksum mismatch - expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupRecord {
    pub id: String,
    pub original_path: String,
    pub backup_path: PathBuf,
    pub timestamp: DateTime<Utc>,
    pub file_size: u64,
    pub checksum: String,
    pub checksum_algorithm: ChecksumAlgorithm,
    pub compressed: bool,
    pub version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone)]
pub enum BackupOutcome {
    Created(BackupRecord),
    Failed { path: PathBuf, error: String },
}

impl BackupOutcome {
    pub fn record(&self) -> Option<&BackupRecord> {
        match self {
            Self::Created(record) => Some(record),
            Self::Failed { .. } => None,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, Self::Created(_))
    }
}

#[derive(Debug, Clone)]
pub enum RestoreOutcome {
    Restored {
        record: BackupRecord,
        safety_backup: Option<BackupRecord>,
    },
    Failed {
        error: String,
        /// Set when the rollback to the safety backup also failed; reported
        /// alongside the original error, never instead of it.
        rollback_error: Option<String>,
    },
}

impl RestoreOutcome {
    pub fn is_restored(&self) -> bool {
        matches!(self, Self::Restored { .. })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupSort {
    #[default]
    Timestamp,
    Size,
    Version,
}

#[derive(Debug, Clone, Default)]
pub struct BackupFilter {
    pub original_path: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub tags: Vec<String>,
    pub sort: BackupSort,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackupSummary {
    pub total_backups: usize,
    pub total_bytes: u64,
    pub distinct_files: usize,
}

pub struct BackupStore {
    backup_dir: PathBuf,
    index_path: PathBuf,
    config: BackupConfig,
    index: Mutex<BackupIndex>,
}

impl BackupStore {
    /// Open (or create) the store: ensures the backup directory exists,
    /// removes orphaned staging files from a previous crash, and loads the
    /// persisted index.
    pub fn open(config: BackupConfig) -> Result<Self> {
        let backup_dir = config.dir.clone();
        fs::create_dir_all(&backup_dir)
            .with_context(|| format!("create backup directory {}", backup_dir.display()))?;
        cleanup_staging(&backup_dir);
        let index_path = backup_dir.join(INDEX_FILE);
        let index = BackupIndex::load(&index_path)?;
        info!(
            dir = %backup_dir.display(),
            records = index.len(),
            "backup store ready"
        );
        Ok(Self {
            backup_dir,
            index_path,
            config,
            index: Mutex::new(index),
        })
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    // ── Creation ────────────────────────────────────────────────────────

    pub fn create_backup(
        &self,
        path: &Path,
        context: Option<&str>,
        tags: &[String],
    ) -> BackupOutcome {
        match self.try_create(path, context, tags) {
            Ok(record) => {
                info!(
                    path = %path.display(),
                    id = %record.id,
                    version = record.version,
                    "backup created"
                );
                BackupOutcome::Created(record)
            }
            Err(e) => {
                warn!(path = %path.display(), error = %format!("{e:#}"), "backup failed");
                BackupOutcome::Failed {
                    path: path.to_path_buf(),
                    error: format!("{e:#}"),
                }
            }
        }
    }

    fn try_create(
        &self,
        path: &Path,
        context: Option<&str>,
        tags: &[String],
    ) -> Result<BackupRecord> {
        let data = fs::read(path).with_context(|| format!("read {}", path.display()))?;
        let checksum = checksum::digest_bytes(self.config.checksum_algorithm, &data);
        let canonical = path
            .canonicalize()
            .unwrap_or_else(|_| path.to_path_buf());
        let original_path = canonical.display().to_string();

        let mut index = self.index.lock();
        let id = Uuid::new_v4().to_string();
        let version = index.next_version(&original_path);
        let ext = canonical
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();
        let file_name = if self.config.compress {
            format!("{id}_v{version}{ext}.gz")
        } else {
            format!("{id}_v{version}{ext}")
        };
        let backup_path = self.backup_dir.join(file_name);

        let payload = if self.config.compress {
            gzip_encode(&data, self.config.compression_level)?
        } else {
            data.clone()
        };

        if let Err(e) = write_atomic(&self.backup_dir, &backup_path, &payload) {
            index.release_version(&original_path, version);
            return Err(e).with_context(|| format!("write payload {}", backup_path.display()));
        }

        let record = BackupRecord {
            id,
            original_path: original_path.clone(),
            backup_path: backup_path.clone(),
            timestamp: Utc::now(),
            file_size: data.len() as u64,
            checksum,
            checksum_algorithm: self.config.checksum_algorithm,
            compressed: self.config.compress,
            version,
            context: context.map(str::to_string),
            tags: tags.to_vec(),
        };

        index.insert(record.clone());
        if let Err(e) = index.persist(&self.index_path) {
            // Keep payload and record in lock-step: undo both.
            index.remove(&record.id);
            index.release_version(&original_path, version);
            let _ = fs::remove_file(&backup_path);
            return Err(e).context("persist backup index");
        }

        let pruned = self.apply_retention_locked(&mut index, &original_path);
        if !pruned.is_empty() {
            debug!(
                path = %original_path,
                pruned = pruned.len(),
                "retention policy removed older backups"
            );
        }

        Ok(record)
    }

    // ── Retrieval & verification ────────────────────────────────────────

    pub fn find(&self, id: &str) -> Option<BackupRecord> {
        self.index.lock().get(id).cloned()
    }

    /// Most recent backup (highest version) for an original path.
    pub fn latest_for_path(&self, path: &Path) -> Option<BackupRecord> {
        let key = original_key(path);
        self.index.lock().for_path(&key).pop()
    }

    /// Decompressed payload bytes, verified against the record's checksum.
    pub fn read_payload(&self, id: &str) -> Result<Vec<u8>> {
        let record = self
            .find(id)
            .ok_or_else(|| anyhow!(BackupStoreError::NotFound(id.to_string())))?;
        self.read_payload_record(&record)
    }

    fn read_payload_record(&self, record: &BackupRecord) -> Result<Vec<u8>> {
        if !record.backup_path.exists() {
            return Err(anyhow!(BackupStoreError::PayloadMissing(record.id.clone())));
        }
        let raw = fs::read(&record.backup_path)
            .with_context(|| format!("read payload {}", record.backup_path.display()))?;
        let data = if record.compressed {
            let mut out = Vec::new();
            GzDecoder::new(&raw[..])
                .read_to_end(&mut out)
                .context("decompress backup payload")?;
            out
        } else {
            raw
        };
        let actual = checksum::digest_bytes(record.checksum_algorithm, &data);
        if actual != record.checksum {
            return Err(anyhow!(BackupStoreError::ChecksumMismatch {
                expected: record.checksum.clone(),
                actual,
            }));
        }
        Ok(data)
    }

    /// Recompute the payload checksum and compare against the record.
    /// Returns `false` on any failure; never errors.
    pub fn verify_backup(&self, id: &str) -> bool {
        match self.read_payload(id) {
            Ok(_) => true,
            Err(e) => {
                warn!(id = %id, error = %format!("{e:#}"), "backup verification failed");
                false
            }
        }
    }

    pub fn list_backups(&self, filter: &BackupFilter) -> Vec<BackupRecord> {
        let path_key = filter.original_path.as_ref().map(|p| original_key(Path::new(p)));
        let index = self.index.lock();
        let mut out: Vec<BackupRecord> = index
            .records()
            .iter()
            .filter(|r| {
                if let Some(key) = &path_key {
                    if &r.original_path != key {
                        return false;
                    }
                }
                if let Some(from) = filter.from {
                    if r.timestamp < from {
                        return false;
                    }
                }
                if let Some(to) = filter.to {
                    if r.timestamp > to {
                        return false;
                    }
                }
                filter.tags.iter().all(|t| r.tags.contains(t))
            })
            .cloned()
            .collect();
        match filter.sort {
            BackupSort::Timestamp => out.sort_by(|a, b| b.timestamp.cmp(&a.timestamp)),
            BackupSort::Size => out.sort_by(|a, b| b.file_size.cmp(&a.file_size)),
            BackupSort::Version => out.sort_by(|a, b| b.version.cmp(&a.version)),
        }
        if let Some(limit) = filter.limit {
            out.truncate(limit);
        }
        out
    }

    pub fn summary(&self) -> BackupSummary {
        let index = self.index.lock();
        let records = index.records();
        let mut paths: Vec<&str> = records.iter().map(|r| r.original_path.as_str()).collect();
        paths.sort_unstable();
        paths.dedup();
        BackupSummary {
            total_backups: records.len(),
            total_bytes: records.iter().map(|r| r.file_size).sum(),
            distinct_files: paths.len(),
        }
    }

    // ── Restore ─────────────────────────────────────────────────────────

    /// Restore a backup over `target` (default: the original path). An
    /// existing target is safety-backed-up first; if the restore write
    /// fails afterwards, the target is rolled back to that safety copy
    /// best-effort.
    pub fn restore_from_backup(&self, id: &str, target: Option<&Path>) -> RestoreOutcome {
        let record = match self.find(id) {
            Some(r) => r,
            None => {
                return RestoreOutcome::Failed {
                    error: format!("backup not found: {id}"),
                    rollback_error: None,
                }
            }
        };
        let target: PathBuf = target
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(&record.original_path));

        let mut safety_backup = None;
        if target.exists() {
            match self.create_backup(&target, Some("pre-restore"), &["pre-restore".to_string()])
            {
                BackupOutcome::Created(r) => safety_backup = Some(r),
                BackupOutcome::Failed { error, .. } => {
                    return RestoreOutcome::Failed {
                        error: format!("safety backup failed: {error}"),
                        rollback_error: None,
                    }
                }
            }
        }

        match self.write_restore(&record, &target) {
            Ok(()) => {
                info!(
                    id = %record.id,
                    target = %target.display(),
                    "backup restored"
                );
                RestoreOutcome::Restored {
                    record,
                    safety_backup,
                }
            }
            Err(e) => {
                let mut rollback_error = None;
                if let Some(safety) = &safety_backup {
                    if let Err(rb) = self.write_restore(safety, &target) {
                        rollback_error = Some(format!("{rb:#}"));
                        warn!(
                            target = %target.display(),
                            error = %format!("{rb:#}"),
                            "rollback to safety backup failed"
                        );
                    } else {
                        info!(target = %target.display(), "rolled back to safety backup");
                    }
                }
                RestoreOutcome::Failed {
                    error: format!("{e:#}"),
                    rollback_error,
                }
            }
        }
    }

    fn write_restore(&self, record: &BackupRecord, target: &Path) -> Result<()> {
        let data = self.read_payload_record(record)?;
        let parent = target
            .parent()
            .ok_or_else(|| anyhow!("no parent directory for {}", target.display()))?;
        fs::create_dir_all(parent)?;
        write_atomic(parent, target, &data)?;
        // Recheck the restored bytes against the record.
        let (actual, _) = checksum::digest_file(record.checksum_algorithm, target)?;
        if actual != record.checksum {
            return Err(anyhow!(BackupStoreError::ChecksumMismatch {
                expected: record.checksum.clone(),
                actual,
            }));
        }
        Ok(())
    }

    // ── Deletion & retention ────────────────────────────────────────────

    pub fn delete_backup(&self, id: &str) -> Result<BackupRecord> {
        let mut index = self.index.lock();
        let record = index
            .remove(id)
            .ok_or_else(|| anyhow!(BackupStoreError::NotFound(id.to_string())))?;
        if let Err(e) = index.persist(&self.index_path) {
            index.insert(record);
            return Err(e).context("persist backup index");
        }
        if record.backup_path.exists() {
            if let Err(e) = fs::remove_file(&record.backup_path) {
                warn!(
                    path = %record.backup_path.display(),
                    error = %e,
                    "could not remove backup payload"
                );
            }
        }
        Ok(record)
    }

    /// Apply the retention policy to one original path. Runs automatically
    /// after every successful backup; public for manual sweeps. Returns the
    /// pruned records.
    pub fn apply_retention(&self, path: &Path) -> Vec<BackupRecord> {
        let key = original_key(path);
        let mut index = self.index.lock();
        self.apply_retention_locked(&mut index, &key)
    }

    fn apply_retention_locked(
        &self,
        index: &mut BackupIndex,
        original_path: &str,
    ) -> Vec<BackupRecord> {
        let policy = &self.config.retention;
        let records = index.for_path(original_path);
        let total = records.len();
        if total <= policy.min_backups {
            return Vec::new();
        }
        let cutoff = policy
            .max_age_days
            .map(|days| Utc::now() - Duration::days(i64::from(days)));

        let mut doomed = Vec::new();
        for record in records {
            // oldest version first
            let remaining = total - doomed.len();
            if remaining <= policy.min_backups {
                break;
            }
            let over_cap = remaining > policy.max_backups;
            let too_old = cutoff.map(|c| record.timestamp < c).unwrap_or(false);
            if over_cap || too_old {
                doomed.push(record);
            } else {
                break;
            }
        }
        if doomed.is_empty() {
            return Vec::new();
        }

        let mut pruned = Vec::new();
        for record in doomed {
            if record.backup_path.exists() {
                if let Err(e) = fs::remove_file(&record.backup_path) {
                    warn!(
                        path = %record.backup_path.display(),
                        error = %e,
                        "retention could not remove payload; keeping record"
                    );
                    continue;
                }
            }
            index.remove(&record.id);
            pruned.push(record);
        }
        if let Err(e) = index.persist(&self.index_path) {
            warn!(error = %format!("{e:#}"), "persist after retention sweep failed");
        }
        pruned
    }
}

// ── Helpers ─────────────────────────────────────────────────────────────

fn original_key(path: &Path) -> String {
    path.canonicalize()
        .unwrap_or_else(|_| path.to_path_buf())
        .display()
        .to_string()
}

fn gzip_encode(data: &[u8], level: u32) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::new(level));
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

/// Write bytes to a staging file in `dir`, fsync, then rename over `dest`.
fn write_atomic(dir: &Path, dest: &Path, bytes: &[u8]) -> Result<()> {
    let staging = dir.join(format!(".{}{}", Uuid::new_v4(), STAGING_SUFFIX));
    let written = (|| -> Result<()> {
        let mut file = File::create(&staging)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        Ok(())
    })();
    if let Err(e) = written {
        let _ = fs::remove_file(&staging);
        return Err(e);
    }
    if let Err(e) = fs::rename(&staging, dest) {
        let _ = fs::remove_file(&staging);
        return Err(e.into());
    }
    Ok(())
}

/// Remove leftover staging files from a previous crash.
fn cleanup_staging(dir: &Path) {
    if let Ok(entries) = fs::read_dir(dir) {
        for entry in entries.flatten() {
            let name = entry.file_name();
            if name.to_string_lossy().ends_with(STAGING_SUFFIX) {
                warn!(path = %entry.path().display(), "removing orphaned staging file");
                let _ = fs::remove_file(entry.path());
            }
        }
    }
}
