//! Status snapshot for the caller-facing surface.

use chrono::{DateTime, Utc};
use keeper_core::backup::BackupSummary;
use keeper_core::validate::ValidationSummary;
use serde::Serialize;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize)]
pub struct RecentError {
    pub at: DateTime<Utc>,
    pub context: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    pub active_watches: Vec<PathBuf>,
    pub change_count: u64,
    pub last_change: Option<DateTime<Utc>>,
    pub hooks: Vec<String>,
    pub validators: Vec<String>,
    /// Bounded ring of the most recent internal failures, oldest first.
    pub recent_errors: Vec<RecentError>,
    /// Present when auto-backup is enabled.
    pub backups: Option<BackupSummary>,
    /// Summary of the most recent validation, when auto-validate is enabled.
    pub last_validation: Option<ValidationSummary>,
}
