//! Structured, explainable differences between two versions of a table.
//!
//! Row matching is an explicit algorithm rather than a generic deep-diff:
//! when key columns are configured (and present on both sides) a row's
//! identity is the pipe-joined values of those columns; otherwise rows pair
//! positionally. Leftover removed/added pairs with identical full content
//! become `moved` changes when move detection is on; a content change is
//! never classified as a move. All diff structures are read-only snapshots
//! of one comparison; filtering happens as a post-pass in [`filter`].

mod filter;
pub mod report;
mod text;

pub use filter::{apply_filters, DiffFilter};
pub use text::TextDiff;

use crate::config::{CsvConfig, DiffConfig};
use crate::table::Table;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum DiffError {
    #[error("cannot read {}: {source}", path.display())]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse {}: {message}", path.display())]
    Unparseable { path: PathBuf, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffMode {
    Text,
    Schema,
    #[default]
    Structured,
    Hybrid,
}

impl DiffMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Schema => "schema",
            Self::Structured => "structured",
            Self::Hybrid => "hybrid",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemaChangeKind {
    Added,
    Removed,
    Moved,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaChange {
    pub column: String,
    pub kind: SchemaChangeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_position: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_position: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowChangeKind {
    Added,
    Removed,
    Modified,
    Moved,
}

impl RowChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Added => "added",
            Self::Removed => "removed",
            Self::Modified => "modified",
            Self::Moved => "moved",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CellChangeKind {
    Modified,
    Added,
    Removed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CellChange {
    pub column: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_value: Option<String>,
    pub change_type: CellChangeKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RowChange {
    /// Index in the new file for added/modified/moved rows, in the old file
    /// for removed rows.
    pub row_index: usize,
    pub change_type: RowChangeKind,
    pub cell_changes: Vec<CellChange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_row: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_row: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub moved_from: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub similarity: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnChangeCount {
    pub column: String,
    pub changes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffStatistics {
    pub rows_added: usize,
    pub rows_removed: usize,
    pub rows_modified: usize,
    pub rows_moved: usize,
    pub cells_changed: usize,
    /// `total changed rows / max(old rows, new rows)`, as a percentage.
    pub change_percentage: f64,
    pub top_changed_columns: Vec<ColumnChangeCount>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceFiles {
    pub old: PathBuf,
    pub new: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffMetadata {
    pub generated_at: DateTime<Utc>,
    pub old_row_count: usize,
    pub new_row_count: usize,
    pub key_columns: Vec<String>,
    pub top_columns: usize,
    /// True when the row ceiling truncated processing; the result is
    /// partial and callers must treat it as such.
    pub truncated: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffResult {
    pub mode: DiffMode,
    pub source_files: SourceFiles,
    pub statistics: DiffStatistics,
    pub schema_changes: Vec<SchemaChange>,
    pub row_changes: Vec<RowChange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_diff: Option<TextDiff>,
    pub metadata: DiffMetadata,
}

pub struct DiffEngine {
    config: DiffConfig,
    csv: CsvConfig,
}

impl DiffEngine {
    pub fn new(config: DiffConfig, csv: CsvConfig) -> Self {
        Self { config, csv }
    }

    pub fn compare_files(
        &self,
        old_path: &Path,
        new_path: &Path,
    ) -> Result<DiffResult, DiffError> {
        let old_raw = fs::read(old_path).map_err(|source| DiffError::Unreadable {
            path: old_path.to_path_buf(),
            source,
        })?;
        let new_raw = fs::read(new_path).map_err(|source| DiffError::Unreadable {
            path: new_path.to_path_buf(),
            source,
        })?;
        let old_table =
            Table::from_bytes(&old_raw, &self.csv).map_err(|e| DiffError::Unparseable {
                path: old_path.to_path_buf(),
                message: format!("{e:#}"),
            })?;
        let new_table =
            Table::from_bytes(&new_raw, &self.csv).map_err(|e| DiffError::Unparseable {
                path: new_path.to_path_buf(),
                message: format!("{e:#}"),
            })?;
        let sources = SourceFiles {
            old: old_path.to_path_buf(),
            new: new_path.to_path_buf(),
        };
        let old_text = String::from_utf8_lossy(&old_raw);
        let new_text = String::from_utf8_lossy(&new_raw);
        Ok(self.compare_inner(&old_table, &new_table, Some(&old_text), Some(&new_text), sources))
    }

    /// Compare already-parsed tables. Text patches are only produced by
    /// [`compare_files`], which has the raw bytes.
    pub fn compare_tables(
        &self,
        old: &Table,
        new: &Table,
        sources: SourceFiles,
    ) -> DiffResult {
        self.compare_inner(old, new, None, None, sources)
    }

    fn compare_inner(
        &self,
        old: &Table,
        new: &Table,
        old_text: Option<&str>,
        new_text: Option<&str>,
        source_files: SourceFiles,
    ) -> DiffResult {
        let mode = self.config.mode;
        let max_rows = self.config.max_rows;
        let truncated = old.rows.len() > max_rows || new.rows.len() > max_rows;
        let old_limit = old.rows.len().min(max_rows);
        let new_limit = new.rows.len().min(max_rows);

        let schema_changes = match mode {
            DiffMode::Text => Vec::new(),
            _ => schema_diff(&old.headers, &new.headers),
        };
        let row_changes = match mode {
            DiffMode::Structured | DiffMode::Hybrid => {
                self.structured_diff(old, new, old_limit, new_limit)
            }
            _ => Vec::new(),
        };
        let text_diff = match (mode, old_text, new_text) {
            (DiffMode::Text | DiffMode::Hybrid, Some(o), Some(n)) => {
                Some(text::line_diff(o, n, max_rows.saturating_add(1)))
            }
            _ => None,
        };
        let statistics =
            compute_statistics(&row_changes, old_limit, new_limit, self.config.top_columns);

        DiffResult {
            mode,
            source_files,
            statistics,
            schema_changes,
            row_changes,
            text_diff,
            metadata: DiffMetadata {
                generated_at: Utc::now(),
                old_row_count: old.rows.len(),
                new_row_count: new.rows.len(),
                key_columns: self.config.key_columns.clone(),
                top_columns: self.config.top_columns,
                truncated,
            },
        }
    }

    // ── Row matching ────────────────────────────────────────────────────

    fn structured_diff(
        &self,
        old: &Table,
        new: &Table,
        old_limit: usize,
        new_limit: usize,
    ) -> Vec<RowChange> {
        let old_rows = &old.rows[..old_limit];
        let new_rows = &new.rows[..new_limit];

        let mut changes: Vec<RowChange> = Vec::new();
        let mut unmatched_old: Vec<usize> = Vec::new();
        let mut unmatched_new: Vec<usize> = Vec::new();

        let key_indices = self.key_indices(&old.headers, &new.headers);
        let positional = key_indices.is_none();
        match key_indices {
            Some((old_keys, new_keys)) => {
                let mut old_by_key: HashMap<String, VecDeque<usize>> = HashMap::new();
                for (i, row) in old_rows.iter().enumerate() {
                    old_by_key
                        .entry(key_of(row, &old_keys))
                        .or_default()
                        .push_back(i);
                }
                let mut matched_old = vec![false; old_rows.len()];
                for (j, row) in new_rows.iter().enumerate() {
                    let key = key_of(row, &new_keys);
                    match old_by_key.get_mut(&key).and_then(VecDeque::pop_front) {
                        Some(i) => {
                            matched_old[i] = true;
                            self.emit_pairing(old, new, i, j, &mut changes);
                        }
                        None => unmatched_new.push(j),
                    }
                }
                for (i, was_matched) in matched_old.iter().enumerate() {
                    if !was_matched {
                        unmatched_old.push(i);
                    }
                }
            }
            None => {
                let shared = old_rows.len().min(new_rows.len());
                for idx in 0..shared {
                    if self.config.detect_moves {
                        // Unchanged pairs settle here; differing pairs are
                        // deferred so the move pass can look for their
                        // content elsewhere first.
                        if !diff_cells(&old.headers, &new.headers, &old.rows[idx], &new.rows[idx])
                            .is_empty()
                        {
                            unmatched_old.push(idx);
                            unmatched_new.push(idx);
                        }
                    } else {
                        self.emit_pairing(old, new, idx, idx, &mut changes);
                    }
                }
                for i in shared..old_rows.len() {
                    unmatched_old.push(i);
                }
                for j in shared..new_rows.len() {
                    unmatched_new.push(j);
                }
            }
        }

        // Move pass over the leftovers: identical full content at a
        // different position is a move; nearest positional distance wins
        // ties.
        let mut taken = vec![false; unmatched_new.len()];
        let mut leftover_old: Vec<usize> = Vec::new();
        for &i in &unmatched_old {
            let mut best: Option<(usize, usize)> = None;
            if self.config.detect_moves {
                for (slot, &j) in unmatched_new.iter().enumerate() {
                    if taken[slot] || i == j {
                        continue;
                    }
                    if diff_cells(&old.headers, &new.headers, &old.rows[i], &new.rows[j])
                        .is_empty()
                    {
                        let distance = i.abs_diff(j);
                        if best.map(|(_, d)| distance < d).unwrap_or(true) {
                            best = Some((slot, distance));
                        }
                    }
                }
            }
            match best {
                Some((slot, _)) => {
                    taken[slot] = true;
                    let j = unmatched_new[slot];
                    changes.push(RowChange {
                        row_index: j,
                        change_type: RowChangeKind::Moved,
                        cell_changes: Vec::new(),
                        old_row: old.row_map(i),
                        new_row: new.row_map(j),
                        moved_from: Some(i),
                        similarity: Some(1.0),
                    });
                }
                None => leftover_old.push(i),
            }
        }

        // Positional leftovers that still share an index pair up as plain
        // modifications.
        let mut removed_rows: Vec<usize> = Vec::new();
        for &i in &leftover_old {
            let mut matched_slot = None;
            if positional {
                for (slot, &j) in unmatched_new.iter().enumerate() {
                    if !taken[slot] && j == i {
                        matched_slot = Some(slot);
                        break;
                    }
                }
            }
            match matched_slot {
                Some(slot) => {
                    taken[slot] = true;
                    self.emit_pairing(old, new, i, i, &mut changes);
                }
                None => removed_rows.push(i),
            }
        }

        for (slot, &j) in unmatched_new.iter().enumerate() {
            if taken[slot] {
                continue;
            }
            changes.push(RowChange {
                row_index: j,
                change_type: RowChangeKind::Added,
                cell_changes: Vec::new(),
                old_row: None,
                new_row: new.row_map(j),
                moved_from: None,
                similarity: None,
            });
        }
        for i in removed_rows {
            changes.push(RowChange {
                row_index: i,
                change_type: RowChangeKind::Removed,
                cell_changes: Vec::new(),
                old_row: old.row_map(i),
                new_row: None,
                moved_from: None,
                similarity: None,
            });
        }
        changes
    }

    fn emit_pairing(
        &self,
        old: &Table,
        new: &Table,
        i: usize,
        j: usize,
        changes: &mut Vec<RowChange>,
    ) {
        let cell_changes = diff_cells(&old.headers, &new.headers, &old.rows[i], &new.rows[j]);
        if cell_changes.is_empty() {
            if self.config.detect_moves && i != j {
                changes.push(RowChange {
                    row_index: j,
                    change_type: RowChangeKind::Moved,
                    cell_changes: Vec::new(),
                    old_row: old.row_map(i),
                    new_row: new.row_map(j),
                    moved_from: Some(i),
                    similarity: Some(1.0),
                });
            }
            return;
        }
        let union = column_union_len(&old.headers, &new.headers).max(1);
        let similarity = (union.saturating_sub(cell_changes.len())) as f64 / union as f64;
        changes.push(RowChange {
            row_index: j,
            change_type: RowChangeKind::Modified,
            cell_changes,
            old_row: old.row_map(i),
            new_row: new.row_map(j),
            moved_from: None,
            similarity: Some(similarity),
        });
    }

    fn key_indices(
        &self,
        old_headers: &[String],
        new_headers: &[String],
    ) -> Option<(Vec<usize>, Vec<usize>)> {
        if self.config.key_columns.is_empty() {
            return None;
        }
        let mut old_idx = Vec::with_capacity(self.config.key_columns.len());
        let mut new_idx = Vec::with_capacity(self.config.key_columns.len());
        for column in &self.config.key_columns {
            old_idx.push(old_headers.iter().position(|h| h == column)?);
            new_idx.push(new_headers.iter().position(|h| h == column)?);
        }
        Some((old_idx, new_idx))
    }
}

// ── Helpers ─────────────────────────────────────────────────────────────

/// Identity hash for keyed matching: pipe-joined key-column values.
fn key_of(row: &[String], indices: &[usize]) -> String {
    indices
        .iter()
        .map(|&i| row.get(i).map(String::as_str).unwrap_or(""))
        .collect::<Vec<_>>()
        .join("|")
}

fn column_union_len(old_headers: &[String], new_headers: &[String]) -> usize {
    old_headers.len()
        + new_headers
            .iter()
            .filter(|h| !old_headers.contains(h))
            .count()
}

/// Cell-level changes over the union of both header sets. Columns present
/// on one side only contribute a change when the value there is non-empty.
fn diff_cells(
    old_headers: &[String],
    new_headers: &[String],
    old_row: &[String],
    new_row: &[String],
) -> Vec<CellChange> {
    let mut changes = Vec::new();
    for (i, column) in old_headers.iter().enumerate() {
        let old_value = old_row.get(i).map(String::as_str).unwrap_or("");
        match new_headers.iter().position(|h| h == column) {
            Some(j) => {
                let new_value = new_row.get(j).map(String::as_str).unwrap_or("");
                if old_value != new_value {
                    changes.push(CellChange {
                        column: column.clone(),
                        old_value: Some(old_value.to_string()),
                        new_value: Some(new_value.to_string()),
                        change_type: CellChangeKind::Modified,
                    });
                }
            }
            None => {
                if !old_value.is_empty() {
                    changes.push(CellChange {
                        column: column.clone(),
                        old_value: Some(old_value.to_string()),
                        new_value: None,
                        change_type: CellChangeKind::Removed,
                    });
                }
            }
        }
    }
    for (j, column) in new_headers.iter().enumerate() {
        if old_headers.contains(column) {
            continue;
        }
        let new_value = new_row.get(j).map(String::as_str).unwrap_or("");
        if !new_value.is_empty() {
            changes.push(CellChange {
                column: column.clone(),
                old_value: None,
                new_value: Some(new_value.to_string()),
                change_type: CellChangeKind::Added,
            });
        }
    }
    changes
}

/// Column presence and order changes between two header rows.
pub fn schema_diff(old: &[String], new: &[String]) -> Vec<SchemaChange> {
    let mut changes = Vec::new();
    for (i, header) in old.iter().enumerate() {
        match new.iter().position(|h| h == header) {
            None => changes.push(SchemaChange {
                column: header.clone(),
                kind: SchemaChangeKind::Removed,
                old_position: Some(i),
                new_position: None,
            }),
            Some(j) if j != i => changes.push(SchemaChange {
                column: header.clone(),
                kind: SchemaChangeKind::Moved,
                old_position: Some(i),
                new_position: Some(j),
            }),
            Some(_) => {}
        }
    }
    for (j, header) in new.iter().enumerate() {
        if !old.contains(header) {
            changes.push(SchemaChange {
                column: header.clone(),
                kind: SchemaChangeKind::Added,
                old_position: None,
                new_position: Some(j),
            });
        }
    }
    changes
}

pub(crate) fn compute_statistics(
    row_changes: &[RowChange],
    old_rows: usize,
    new_rows: usize,
    top_columns: usize,
) -> DiffStatistics {
    let mut rows_added = 0;
    let mut rows_removed = 0;
    let mut rows_modified = 0;
    let mut rows_moved = 0;
    let mut cells_changed = 0;
    let mut column_counts: HashMap<&str, usize> = HashMap::new();
    for change in row_changes {
        match change.change_type {
            RowChangeKind::Added => rows_added += 1,
            RowChangeKind::Removed => rows_removed += 1,
            RowChangeKind::Modified => rows_modified += 1,
            RowChangeKind::Moved => rows_moved += 1,
        }
        if change.change_type == RowChangeKind::Modified {
            cells_changed += change.cell_changes.len();
            for cell in &change.cell_changes {
                *column_counts.entry(cell.column.as_str()).or_insert(0) += 1;
            }
        }
    }
    let total_changed = rows_added + rows_removed + rows_modified + rows_moved;
    let denominator = old_rows.max(new_rows);
    let change_percentage = if denominator == 0 {
        0.0
    } else {
        total_changed as f64 / denominator as f64 * 100.0
    };
    let mut ranked: Vec<ColumnChangeCount> = column_counts
        .into_iter()
        .map(|(column, changes)| ColumnChangeCount {
            column: column.to_string(),
            changes,
        })
        .collect();
    ranked.sort_by(|a, b| b.changes.cmp(&a.changes).then_with(|| a.column.cmp(&b.column)));
    ranked.truncate(top_columns);
    DiffStatistics {
        rows_added,
        rows_removed,
        rows_modified,
        rows_moved,
        cells_changed,
        change_percentage,
        top_changed_columns: ranked,
    }
}
