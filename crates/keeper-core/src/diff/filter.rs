//! Post-processing filters over a completed diff result.
//!
//! Filters never touch the original comparison: they clone, prune, and
//! recompute statistics, so the same result can be re-filtered cheaply
//! with different options.

use super::{
    compute_statistics, CellChange, DiffResult, RowChange, RowChangeKind,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DiffFilter {
    pub ignore_case: bool,
    pub ignore_whitespace: bool,
    /// Empty means every column.
    pub include_columns: Vec<String>,
    pub exclude_columns: Vec<String>,
    /// Empty means every change type.
    pub change_types: Vec<RowChangeKind>,
}

impl DiffFilter {
    fn column_allowed(&self, column: &str) -> bool {
        if self.exclude_columns.iter().any(|c| c == column) {
            return false;
        }
        self.include_columns.is_empty() || self.include_columns.iter().any(|c| c == column)
    }

    fn normalize(&self, value: &str) -> String {
        let mut v = if self.ignore_whitespace {
            value.split_whitespace().collect::<Vec<_>>().join(" ")
        } else {
            value.to_string()
        };
        if self.ignore_case {
            v = v.to_lowercase();
        }
        v
    }

    fn cell_still_differs(&self, cell: &CellChange) -> bool {
        let old = self.normalize(cell.old_value.as_deref().unwrap_or(""));
        let new = self.normalize(cell.new_value.as_deref().unwrap_or(""));
        old != new
    }
}

pub fn apply_filters(result: &DiffResult, filter: &DiffFilter) -> DiffResult {
    let mut out = result.clone();

    out.schema_changes = result
        .schema_changes
        .iter()
        .filter(|c| filter.column_allowed(&c.column))
        .cloned()
        .collect();

    out.row_changes = result
        .row_changes
        .iter()
        .filter_map(|row_change| {
            if !filter.change_types.is_empty()
                && !filter.change_types.contains(&row_change.change_type)
            {
                return None;
            }
            let mut row_change: RowChange = row_change.clone();
            if row_change.change_type == RowChangeKind::Modified {
                row_change.cell_changes.retain(|cell| {
                    filter.column_allowed(&cell.column) && filter.cell_still_differs(cell)
                });
                if row_change.cell_changes.is_empty() {
                    return None;
                }
            }
            Some(row_change)
        })
        .collect();

    out.statistics = compute_statistics(
        &out.row_changes,
        result.metadata.old_row_count,
        result.metadata.new_row_count,
        result.metadata.top_columns,
    );
    out
}
