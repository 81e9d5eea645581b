//! Runtime configuration for the pipeline.
//!
//! Every section has sensible defaults so a partial TOML file (or none at
//! all) yields a working configuration; `validate()` rejects combinations
//! that would misbehave at runtime rather than letting them surface later.

use crate::checksum::ChecksumAlgorithm;
use crate::diff::report::ReportFormat;
use crate::diff::DiffMode;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeeperConfig {
    pub monitor: MonitorConfig,
    pub csv: CsvConfig,
    pub backup: BackupConfig,
    pub validation: ValidationConfig,
    pub diff: DiffConfig,
    pub reports: ReportConfig,
    pub orchestrator: OrchestratorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Raw notifications for the same path inside this window coalesce into
    /// one event.
    pub debounce_ms: u64,
    /// Compare content digests when classifying changes. When false, size
    /// and mtime deltas are enough to report a change.
    pub digest_comparison: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 500,
            digest_comparison: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CsvConfig {
    pub delimiter: char,
    pub quote: char,
    pub escape: Option<char>,
}

impl Default for CsvConfig {
    fn default() -> Self {
        Self {
            delimiter: ',',
            quote: '"',
            escape: None,
        }
    }
}

impl CsvConfig {
    pub fn delimiter_byte(&self) -> u8 {
        self.delimiter as u8
    }

    pub fn quote_byte(&self) -> u8 {
        self.quote as u8
    }

    pub fn escape_byte(&self) -> Option<u8> {
        self.escape.map(|c| c as u8)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    pub dir: PathBuf,
    pub checksum_algorithm: ChecksumAlgorithm,
    pub compress: bool,
    /// flate2 level, 0-9.
    pub compression_level: u32,
    pub retention: RetentionPolicy,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("backups"),
            checksum_algorithm: ChecksumAlgorithm::Blake3,
            compress: true,
            compression_level: 6,
            retention: RetentionPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionPolicy {
    pub max_backups: usize,
    pub max_age_days: Option<u32>,
    pub min_backups: usize,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_backups: 10,
            max_age_days: None,
            min_backups: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    /// Strict mode escalates structural irregularities (ragged rows,
    /// unexpected columns) from warnings to errors.
    pub strict: bool,
    /// Errors stop being collected past this count; reading continues.
    pub max_errors: usize,
    /// Non-empty values sampled per column for type inference.
    pub type_sample_size: usize,
    pub expected_headers: Option<Vec<String>>,
    pub required_columns: Vec<String>,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            strict: false,
            max_errors: 100,
            type_sample_size: 100,
            expected_headers: None,
            required_columns: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiffConfig {
    pub mode: DiffMode,
    /// Columns whose pipe-joined values identify "the same row" across
    /// versions. Empty means positional matching.
    pub key_columns: Vec<String>,
    pub detect_moves: bool,
    /// Row ceiling; inputs beyond it are truncated and the result marked
    /// partial.
    pub max_rows: usize,
    /// How many columns the statistics rank by change frequency.
    pub top_columns: usize,
}

impl Default for DiffConfig {
    fn default() -> Self {
        Self {
            mode: DiffMode::Structured,
            key_columns: Vec::new(),
            detect_moves: true,
            max_rows: 100_000,
            top_columns: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    pub formats: Vec<ReportFormat>,
    pub output_dir: Option<PathBuf>,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            formats: vec![ReportFormat::Console],
            output_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RebuildCommandConfig {
    pub name: String,
    pub program: String,
    pub args: Vec<String>,
}

impl Default for RebuildCommandConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            program: String::new(),
            args: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub auto_backup: bool,
    pub auto_validate: bool,
    pub backup_on_validation_failure: bool,
    /// After a successful auto-backup, diff the new contents against the
    /// most recent earlier backup and render reports.
    pub diff_against_backups: bool,
    pub log_dir: PathBuf,
    pub max_recent_errors: usize,
    /// Shell commands registered as rebuild hooks at startup.
    pub rebuild_commands: Vec<RebuildCommandConfig>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            auto_backup: true,
            auto_validate: true,
            backup_on_validation_failure: true,
            diff_against_backups: false,
            log_dir: PathBuf::from("logs"),
            max_recent_errors: 50,
            rebuild_commands: Vec::new(),
        }
    }
}

impl Default for KeeperConfig {
    fn default() -> Self {
        Self {
            monitor: MonitorConfig::default(),
            csv: CsvConfig::default(),
            backup: BackupConfig::default(),
            validation: ValidationConfig::default(),
            diff: DiffConfig::default(),
            reports: ReportConfig::default(),
            orchestrator: OrchestratorConfig::default(),
        }
    }
}

impl KeeperConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.monitor.debounce_ms == 0 {
            anyhow::bail!("monitor.debounce_ms must be greater than zero");
        }
        if !self.csv.delimiter.is_ascii() || !self.csv.quote.is_ascii() {
            anyhow::bail!("csv delimiter and quote must be ASCII characters");
        }
        if let Some(escape) = self.csv.escape {
            if !escape.is_ascii() {
                anyhow::bail!("csv escape must be an ASCII character");
            }
        }
        if self.backup.compression_level > 9 {
            anyhow::bail!("backup.compression_level must be between 0 and 9");
        }
        let retention = &self.backup.retention;
        if retention.max_backups == 0 {
            anyhow::bail!("backup.retention.max_backups must be at least 1");
        }
        if retention.min_backups > retention.max_backups {
            anyhow::bail!("backup.retention.min_backups cannot exceed max_backups");
        }
        if self.validation.max_errors == 0 {
            anyhow::bail!("validation.max_errors must be at least 1");
        }
        if self.validation.type_sample_size == 0 {
            anyhow::bail!("validation.type_sample_size must be at least 1");
        }
        if self.diff.max_rows == 0 {
            anyhow::bail!("diff.max_rows must be at least 1");
        }
        for command in &self.orchestrator.rebuild_commands {
            if command.name.trim().is_empty() || command.program.trim().is_empty() {
                anyhow::bail!("rebuild commands need both a name and a program");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pass_validation() {
        KeeperConfig::default().validate().unwrap();
    }

    #[test]
    fn retention_bounds_are_checked() {
        let mut config = KeeperConfig::default();
        config.backup.retention.min_backups = 20;
        config.backup.retention.max_backups = 5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_debounce_is_rejected() {
        let mut config = KeeperConfig::default();
        config.monitor.debounce_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn partial_toml_overlays_defaults() {
        let config: KeeperConfig = serde_json::from_str(
            r#"{"monitor": {"debounce_ms": 250}, "diff": {"key_columns": ["name"]}}"#,
        )
        .unwrap();
        assert_eq!(config.monitor.debounce_ms, 250);
        assert!(config.monitor.digest_comparison);
        assert_eq!(config.diff.key_columns, vec!["name".to_string()]);
        assert_eq!(config.backup.retention.max_backups, 10);
    }
}
