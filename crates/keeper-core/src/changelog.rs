//! Append-only change log.
//!
//! One JSONL line per processed [`ChangeEvent`], with a monotonically
//! increasing sequence id. Entries are never rewritten; append order is
//! the per-file processing completion order. The log supports recency and
//! per-file queries plus JSON / delimited-text export for downstream
//! tooling.

use crate::event::ChangeEvent;
use crate::validate::ValidationSummary;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

pub const LOG_FILE: &str = "changes.log";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChangeLogMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column_count: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeLogEntry {
    pub id: u64,
    pub event: ChangeEvent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ChangeLogMetadata>,
}

pub struct ChangeLog {
    path: PathBuf,
    last_seq: Mutex<u64>,
}

impl ChangeLog {
    pub fn new(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("create log directory {}", dir.display()))?;
        let path = dir.join(LOG_FILE);
        let last_seq = Self::load_last_seq(&path)?;
        Ok(Self {
            path,
            last_seq: Mutex::new(last_seq),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load_last_seq(path: &Path) -> Result<u64> {
        if !path.exists() {
            return Ok(0);
        }
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        let mut last = 0;
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: ChangeLogEntry =
                serde_json::from_str(&line).context("parse change log entry")?;
            last = entry.id;
        }
        Ok(last)
    }

    pub fn append(
        &self,
        event: &ChangeEvent,
        metadata: Option<ChangeLogMetadata>,
    ) -> Result<ChangeLogEntry> {
        let mut last_seq = self.last_seq.lock();
        let entry = ChangeLogEntry {
            id: *last_seq + 1,
            event: event.clone(),
            metadata,
        };
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open change log {}", self.path.display()))?;
        let line = serde_json::to_string(&entry)?;
        writeln!(file, "{}", line)?;
        file.flush()?;
        *last_seq = entry.id;
        Ok(entry)
    }

    fn read_all(&self) -> Result<Vec<ChangeLogEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&self.path)?;
        let reader = BufReader::new(file);
        let mut entries = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            entries.push(serde_json::from_str(&line).context("parse change log entry")?);
        }
        Ok(entries)
    }

    /// Most recent entries first, optionally bounded by count and a
    /// timestamp floor.
    pub fn read_recent(
        &self,
        limit: Option<usize>,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<ChangeLogEntry>> {
        let mut entries = self.read_all()?;
        if let Some(since) = since {
            entries.retain(|e| e.event.timestamp >= since);
        }
        entries.reverse();
        if let Some(limit) = limit {
            entries.truncate(limit);
        }
        Ok(entries)
    }

    /// Entries for one originating file, most recent first.
    pub fn entries_for_path(
        &self,
        path: &Path,
        limit: Option<usize>,
    ) -> Result<Vec<ChangeLogEntry>> {
        let mut entries = self.read_all()?;
        entries.retain(|e| e.event.path == path);
        entries.reverse();
        if let Some(limit) = limit {
            entries.truncate(limit);
        }
        Ok(entries)
    }

    /// Export the full log as a JSON array. Returns the entry count.
    pub fn export_json(&self, out: &Path) -> Result<usize> {
        let entries = self.read_all()?;
        let json = serde_json::to_string_pretty(&entries)?;
        fs::write(out, json).with_context(|| format!("write export {}", out.display()))?;
        Ok(entries.len())
    }

    /// Export the full log as delimited text. Returns the entry count.
    pub fn export_delimited(&self, out: &Path) -> Result<usize> {
        let entries = self.read_all()?;
        let mut writer = csv::Writer::from_path(out)
            .with_context(|| format!("write export {}", out.display()))?;
        writer.write_record([
            "id",
            "kind",
            "path",
            "timestamp",
            "size",
            "backup_id",
            "is_valid",
            "error_count",
        ])?;
        for entry in &entries {
            let metadata = entry.metadata.as_ref();
            let validation = metadata.and_then(|m| m.validation.as_ref());
            writer.write_record([
                entry.id.to_string(),
                entry.event.kind.as_str().to_string(),
                entry.event.path.display().to_string(),
                entry.event.timestamp.to_rfc3339(),
                entry.event.size.to_string(),
                metadata
                    .and_then(|m| m.backup_id.clone())
                    .unwrap_or_default(),
                validation
                    .map(|v| v.is_valid.to_string())
                    .unwrap_or_default(),
                validation
                    .map(|v| v.error_count.to_string())
                    .unwrap_or_default(),
            ])?;
        }
        writer.flush()?;
        Ok(entries.len())
    }
}
