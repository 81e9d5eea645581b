//! Validation pipeline: structural, schema, and semantic checks over a
//! parsed table, plus derived metadata.
//!
//! Findings are data, not exceptions: `errors` holds critical/error
//! severity issues, `warnings` everything advisory, and `is_valid` is true
//! exactly when `errors` is empty. A misbehaving custom validator is
//! downgraded to a warning naming the validator so third-party bugs never
//! take the pipeline down. Results are derived fresh on every call and
//! deterministic apart from the timing block.

mod infer;
mod validators;

pub use infer::{classify, infer_column, InferredType};
pub use validators::{CoordinateRangeValidator, MaxLengthValidator};

use crate::config::{CsvConfig, ValidationConfig};
use crate::table::Table;
use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Critical,
    Error,
    Warning,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub code: String,
    pub severity: Severity,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

impl ValidationIssue {
    pub fn new(severity: Severity, code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            severity,
            message: message.into(),
            row: None,
            column: None,
            value: None,
        }
    }

    pub fn critical(code: &str, message: impl Into<String>) -> Self {
        Self::new(Severity::Critical, code, message)
    }

    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Self::new(Severity::Error, code, message)
    }

    pub fn warning(code: &str, message: impl Into<String>) -> Self {
        Self::new(Severity::Warning, code, message)
    }

    pub fn at_row(mut self, row: usize) -> Self {
        self.row = Some(row);
        self
    }

    pub fn in_column(mut self, column: &str) -> Self {
        self.column = Some(column.to_string());
        self
    }

    pub fn with_value(mut self, value: &str) -> Self {
        self.value = Some(value.to_string());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnType {
    pub column: String,
    pub inferred: InferredType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableMetadata {
    pub column_types: Vec<ColumnType>,
    pub empty_rows: usize,
    pub duplicate_rows: usize,
    pub file_size: u64,
    pub encoding: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationTiming {
    pub total_ms: u64,
    pub parse_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub headers: Vec<String>,
    pub row_count: usize,
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<TableMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub performance: Option<ValidationTiming>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationSummary {
    pub is_valid: bool,
    pub error_count: usize,
    pub warning_count: usize,
}

impl From<&ValidationResult> for ValidationSummary {
    fn from(result: &ValidationResult) -> Self {
        Self {
            is_valid: result.is_valid,
            error_count: result.errors.len(),
            warning_count: result.warnings.len(),
        }
    }
}

/// Field-level validator capability. One call per cell, scoped by column
/// name; returning `Err` is treated as a bug in the validator itself and
/// downgraded to a warning.
pub trait FieldValidator: Send + Sync {
    fn validate(
        &self,
        value: &str,
        row: &[String],
        row_index: usize,
        column: &str,
    ) -> Result<Option<ValidationIssue>>;
}

#[derive(Clone)]
pub struct RegisteredValidator {
    pub name: String,
    pub description: String,
    validator: Arc<dyn FieldValidator>,
}

pub struct ValidationPipeline {
    config: ValidationConfig,
    csv: CsvConfig,
    validators: RwLock<Vec<RegisteredValidator>>,
}

impl ValidationPipeline {
    pub fn new(config: ValidationConfig, csv: CsvConfig) -> Self {
        let pipeline = Self {
            config,
            csv,
            validators: RwLock::new(Vec::new()),
        };
        pipeline
            .register_validator(
                "coordinate-range",
                "Rejects latitude/longitude values outside the valid range",
                Arc::new(CoordinateRangeValidator),
            )
            .expect("built-in validator registration cannot collide");
        pipeline
    }

    pub fn register_validator(
        &self,
        name: &str,
        description: &str,
        validator: Arc<dyn FieldValidator>,
    ) -> Result<()> {
        let mut validators = self.validators.write();
        if validators.iter().any(|v| v.name == name) {
            anyhow::bail!("validator already registered: {name}");
        }
        validators.push(RegisteredValidator {
            name: name.to_string(),
            description: description.to_string(),
            validator,
        });
        Ok(())
    }

    pub fn unregister_validator(&self, name: &str) -> bool {
        let mut validators = self.validators.write();
        let before = validators.len();
        validators.retain(|v| v.name != name);
        validators.len() != before
    }

    pub fn validator_names(&self) -> Vec<String> {
        self.validators.read().iter().map(|v| v.name.clone()).collect()
    }

    /// Parse and validate one file. I/O failures are `Err`; everything
    /// data-shaped lands in the returned result.
    pub fn validate_file(&self, path: &Path) -> Result<ValidationResult> {
        let started = Instant::now();
        let data =
            std::fs::read(path).with_context(|| format!("read {}", path.display()))?;
        let file_size = data.len() as u64;

        let mut collector = Collector::new(self.config.max_errors);
        let encoding = self.check_encoding(&data, &mut collector);

        let parse_started = Instant::now();
        let table = match Table::from_bytes(&data, &self.csv) {
            Ok(table) => table,
            Err(e) => {
                collector.push(ValidationIssue::critical(
                    "parse_failed",
                    format!("{e:#}"),
                ));
                return Ok(self.finish(
                    Vec::new(),
                    0,
                    collector,
                    None,
                    started,
                    parse_started.elapsed().as_millis() as u64,
                ));
            }
        };
        let parse_ms = parse_started.elapsed().as_millis() as u64;

        if table.rows.is_empty() {
            collector.push(ValidationIssue::critical(
                "no_data_rows",
                "file contains a header row but no data records",
            ));
            return Ok(self.finish(table.headers, 0, collector, None, started, parse_ms));
        }

        self.check_structure(&table, &mut collector);
        self.check_schema(&table, &mut collector);
        self.run_field_validators(&table, &mut collector);
        let metadata = self.derive_metadata(&table, file_size, encoding);

        debug!(
            path = %path.display(),
            rows = table.rows.len(),
            errors = collector.errors.len(),
            warnings = collector.warnings.len(),
            "validation finished"
        );
        let row_count = table.rows.len();
        Ok(self.finish(
            table.headers,
            row_count,
            collector,
            Some(metadata),
            started,
            parse_ms,
        ))
    }

    fn finish(
        &self,
        headers: Vec<String>,
        row_count: usize,
        collector: Collector,
        metadata: Option<TableMetadata>,
        started: Instant,
        parse_ms: u64,
    ) -> ValidationResult {
        ValidationResult {
            is_valid: collector.errors.is_empty(),
            headers,
            row_count,
            errors: collector.errors,
            warnings: collector.warnings,
            metadata,
            performance: Some(ValidationTiming {
                total_ms: started.elapsed().as_millis() as u64,
                parse_ms,
            }),
        }
    }

    fn check_encoding(&self, data: &[u8], collector: &mut Collector) -> String {
        let mut encoding = "utf-8".to_string();
        let body = if data.starts_with(&[0xEF, 0xBB, 0xBF]) {
            collector.push(ValidationIssue::warning(
                "utf8_bom",
                "file starts with a UTF-8 byte-order mark",
            ));
            encoding = "utf-8-bom".to_string();
            &data[3..]
        } else {
            data
        };
        if std::str::from_utf8(body).is_err() {
            collector.push(ValidationIssue::warning(
                "suspicious_encoding",
                "file contains byte sequences that are not valid UTF-8",
            ));
            encoding = "unknown".to_string();
        } else if body.contains(&0u8) {
            collector.push(ValidationIssue::warning(
                "suspicious_encoding",
                "file contains NUL bytes",
            ));
        }
        encoding
    }

    fn check_structure(&self, table: &Table, collector: &mut Collector) {
        let mut seen: HashMap<&str, usize> = HashMap::new();
        for (i, header) in table.headers.iter().enumerate() {
            if header.trim().is_empty() {
                collector.push(
                    ValidationIssue::error("empty_header", format!("header {i} is empty"))
                        .in_column(header),
                );
            }
            if let Some(first) = seen.insert(header.as_str(), i) {
                collector.push(
                    ValidationIssue::error(
                        "duplicate_header",
                        format!("header '{header}' appears at positions {first} and {i}"),
                    )
                    .in_column(header),
                );
            }
        }

        let width = table.headers.len();
        let ragged_severity = if self.config.strict {
            Severity::Error
        } else {
            Severity::Warning
        };
        for (i, row) in table.rows.iter().enumerate() {
            if row.len() != width {
                collector.push(
                    ValidationIssue::new(
                        ragged_severity,
                        "column_count_mismatch",
                        format!("row has {} cells, expected {width}", row.len()),
                    )
                    .at_row(i),
                );
            }
        }
    }

    fn check_schema(&self, table: &Table, collector: &mut Collector) {
        if let Some(expected) = &self.config.expected_headers {
            for column in expected {
                if table.column_index(column).is_none() {
                    collector.push(
                        ValidationIssue::error(
                            "missing_column",
                            format!("declared column '{column}' is missing"),
                        )
                        .in_column(column),
                    );
                }
            }
            let unexpected_severity = if self.config.strict {
                Severity::Error
            } else {
                Severity::Warning
            };
            for header in &table.headers {
                if !expected.contains(header) {
                    collector.push(
                        ValidationIssue::new(
                            unexpected_severity,
                            "unexpected_column",
                            format!("column '{header}' is not part of the declared shape"),
                        )
                        .in_column(header),
                    );
                }
            }
        }

        for column in &self.config.required_columns {
            match table.column_index(column) {
                None => collector.push(
                    ValidationIssue::error(
                        "missing_column",
                        format!("required column '{column}' is missing"),
                    )
                    .in_column(column),
                ),
                Some(idx) => {
                    for (i, row) in table.rows.iter().enumerate() {
                        let empty = row
                            .get(idx)
                            .map(|v| v.trim().is_empty())
                            .unwrap_or(true);
                        if empty {
                            collector.push(
                                ValidationIssue::error(
                                    "missing_required_value",
                                    format!("required column '{column}' is empty"),
                                )
                                .at_row(i)
                                .in_column(column),
                            );
                        }
                    }
                }
            }
        }
    }

    fn run_field_validators(&self, table: &Table, collector: &mut Collector) {
        let validators = self.validators.read().clone();
        if validators.is_empty() {
            return;
        }
        for (row_index, row) in table.rows.iter().enumerate() {
            for (col_index, column) in table.headers.iter().enumerate() {
                let value = row.get(col_index).map(String::as_str).unwrap_or("");
                for registered in &validators {
                    match registered.validator.validate(value, row, row_index, column) {
                        Ok(Some(mut issue)) => {
                            if issue.row.is_none() {
                                issue.row = Some(row_index);
                            }
                            if issue.column.is_none() {
                                issue.column = Some(column.clone());
                            }
                            if issue.value.is_none() {
                                issue.value = Some(value.to_string());
                            }
                            collector.push(issue);
                        }
                        Ok(None) => {}
                        Err(e) => {
                            warn!(
                                validator = %registered.name,
                                error = %format!("{e:#}"),
                                "validator failed; downgrading to warning"
                            );
                            collector.push(
                                ValidationIssue::warning(
                                    "validator_failure",
                                    format!(
                                        "validator '{}' failed on row {row_index}: {e:#}",
                                        registered.name
                                    ),
                                )
                                .at_row(row_index)
                                .in_column(column),
                            );
                        }
                    }
                }
            }
        }
    }

    fn derive_metadata(
        &self,
        table: &Table,
        file_size: u64,
        encoding: String,
    ) -> TableMetadata {
        let sample = self.config.type_sample_size;
        let column_types = table
            .headers
            .iter()
            .enumerate()
            .map(|(idx, header)| ColumnType {
                column: header.clone(),
                inferred: infer_column(
                    table
                        .rows
                        .iter()
                        .filter_map(|row| row.get(idx).map(String::as_str))
                        .filter(|v| !v.trim().is_empty())
                        .take(sample),
                ),
            })
            .collect();

        let empty_rows = table
            .rows
            .iter()
            .filter(|row| row.iter().all(|cell| cell.trim().is_empty()))
            .count();

        let mut occurrences: HashMap<&[String], usize> = HashMap::new();
        for row in &table.rows {
            *occurrences.entry(row.as_slice()).or_insert(0) += 1;
        }
        let duplicate_rows = occurrences
            .values()
            .filter(|&&count| count > 1)
            .map(|&count| count - 1)
            .sum();

        TableMetadata {
            column_types,
            empty_rows,
            duplicate_rows,
            file_size,
            encoding,
        }
    }
}

/// Splits findings into errors and warnings and enforces the error cap:
/// once reached, further errors are dropped and a single warning notes the
/// cap. Warnings are never capped.
struct Collector {
    errors: Vec<ValidationIssue>,
    warnings: Vec<ValidationIssue>,
    max_errors: usize,
    cap_noted: bool,
}

impl Collector {
    fn new(max_errors: usize) -> Self {
        Self {
            errors: Vec::new(),
            warnings: Vec::new(),
            max_errors,
            cap_noted: false,
        }
    }

    fn push(&mut self, issue: ValidationIssue) {
        match issue.severity {
            Severity::Warning => self.warnings.push(issue),
            Severity::Critical | Severity::Error => {
                if self.errors.len() < self.max_errors {
                    self.errors.push(issue);
                } else if !self.cap_noted {
                    self.cap_noted = true;
                    self.warnings.push(ValidationIssue::warning(
                        "error_cap_reached",
                        format!(
                            "error collection halted after {} errors; the file was still read in full",
                            self.max_errors
                        ),
                    ));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn pipeline() -> ValidationPipeline {
        ValidationPipeline::new(ValidationConfig::default(), CsvConfig::default())
    }

    fn pipeline_with(config: ValidationConfig) -> ValidationPipeline {
        ValidationPipeline::new(config, CsvConfig::default())
    }

    fn write(dir: &Path, name: &str, content: &str) -> std::path::PathBuf {
        let path = dir.join(name);
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn clean_file_is_valid_with_metadata() {
        let dir = tempdir().unwrap();
        let path = write(
            dir.path(),
            "stores.csv",
            "name,latitude,longitude,website\n\
             Book Haven,40.7,-74.0,https://haven.example\n\
             The Reading Room,34.0,-118.2,https://reading.example\n",
        );
        let result = pipeline().validate_file(&path).unwrap();
        assert!(result.is_valid, "unexpected errors: {:?}", result.errors);
        assert_eq!(result.row_count, 2);
        let metadata = result.metadata.unwrap();
        assert_eq!(metadata.column_types[0].inferred, InferredType::String);
        assert_eq!(metadata.column_types[1].inferred, InferredType::Number);
        assert_eq!(metadata.column_types[3].inferred, InferredType::Url);
        assert_eq!(metadata.duplicate_rows, 0);
    }

    #[test]
    fn zero_data_rows_is_critical() {
        let dir = tempdir().unwrap();
        let path = write(dir.path(), "empty.csv", "name,phone\n");
        let result = pipeline().validate_file(&path).unwrap();
        assert!(!result.is_valid);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].code, "no_data_rows");
        assert_eq!(result.errors[0].severity, Severity::Critical);
    }

    #[test]
    fn out_of_range_latitude_is_an_error() {
        let dir = tempdir().unwrap();
        let path = write(
            dir.path(),
            "stores.csv",
            "name,latitude\nBook Haven,95.0\n",
        );
        let result = pipeline().validate_file(&path).unwrap();
        assert!(!result.is_valid);
        let issue = result
            .errors
            .iter()
            .find(|e| e.code == "coordinate_out_of_range")
            .expect("latitude 95.0 must be flagged");
        assert_eq!(issue.severity, Severity::Error);
        assert_eq!(issue.row, Some(0));
        assert_eq!(issue.column.as_deref(), Some("latitude"));
    }

    #[test]
    fn duplicate_and_empty_headers_are_errors() {
        let dir = tempdir().unwrap();
        let path = write(dir.path(), "bad.csv", "name,,name\na,b,c\n");
        let result = pipeline().validate_file(&path).unwrap();
        assert!(!result.is_valid);
        assert!(result.errors.iter().any(|e| e.code == "empty_header"));
        assert!(result.errors.iter().any(|e| e.code == "duplicate_header"));
    }

    #[test]
    fn validation_is_deterministic() {
        let dir = tempdir().unwrap();
        let path = write(
            dir.path(),
            "stores.csv",
            "name,latitude\nBook Haven,95.0\nThe Reading Room,200\n,\n",
        );
        let p = pipeline();
        let first = p.validate_file(&path).unwrap();
        let second = p.validate_file(&path).unwrap();
        assert_eq!(
            serde_json::to_string(&first.errors).unwrap(),
            serde_json::to_string(&second.errors).unwrap()
        );
        assert_eq!(
            serde_json::to_string(&first.warnings).unwrap(),
            serde_json::to_string(&second.warnings).unwrap()
        );
    }

    #[test]
    fn error_cap_halts_collection_with_warning() {
        let dir = tempdir().unwrap();
        let mut body = String::from("name,latitude\n");
        for i in 0..20 {
            body.push_str(&format!("store {i},95.0\n"));
        }
        let path = write(dir.path(), "stores.csv", &body);
        let config = ValidationConfig {
            max_errors: 5,
            ..ValidationConfig::default()
        };
        let result = pipeline_with(config).validate_file(&path).unwrap();
        assert_eq!(result.errors.len(), 5);
        assert!(result
            .warnings
            .iter()
            .any(|w| w.code == "error_cap_reached"));
        // Reading still covered the whole file.
        assert_eq!(result.row_count, 20);
    }

    #[test]
    fn failing_validator_downgrades_to_warning() {
        struct Broken;
        impl FieldValidator for Broken {
            fn validate(
                &self,
                _value: &str,
                _row: &[String],
                _row_index: usize,
                _column: &str,
            ) -> Result<Option<ValidationIssue>> {
                anyhow::bail!("internal bug")
            }
        }
        let dir = tempdir().unwrap();
        let path = write(dir.path(), "stores.csv", "name\nBook Haven\n");
        let p = pipeline();
        p.register_validator("broken", "always fails", Arc::new(Broken))
            .unwrap();
        let result = p.validate_file(&path).unwrap();
        assert!(result.is_valid, "validator bugs must not invalidate the file");
        assert!(result
            .warnings
            .iter()
            .any(|w| w.code == "validator_failure" && w.message.contains("broken")));
    }

    #[test]
    fn required_columns_must_be_present_and_filled() {
        let dir = tempdir().unwrap();
        let path = write(dir.path(), "stores.csv", "name,phone\nBook Haven,\n");
        let config = ValidationConfig {
            required_columns: vec!["phone".to_string(), "website".to_string()],
            ..ValidationConfig::default()
        };
        let result = pipeline_with(config).validate_file(&path).unwrap();
        assert!(!result.is_valid);
        assert!(result
            .errors
            .iter()
            .any(|e| e.code == "missing_required_value"));
        assert!(result.errors.iter().any(|e| e.code == "missing_column"));
    }

    #[test]
    fn unregistering_validator_removes_its_findings() {
        let dir = tempdir().unwrap();
        let path = write(dir.path(), "stores.csv", "latitude\n95.0\n");
        let p = pipeline();
        assert!(p.unregister_validator("coordinate-range"));
        let result = p.validate_file(&path).unwrap();
        assert!(result.is_valid);
        assert!(!p.unregister_validator("coordinate-range"));
    }

    #[test]
    fn duplicate_rows_counted() {
        let dir = tempdir().unwrap();
        let path = write(
            dir.path(),
            "stores.csv",
            "name\nBook Haven\nBook Haven\nBook Haven\nOther\n",
        );
        let result = pipeline().validate_file(&path).unwrap();
        assert_eq!(result.metadata.unwrap().duplicate_rows, 2);
    }
}
