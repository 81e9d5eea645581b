//! Diff report rendering.
//!
//! `render` is a pure transform of a [`DiffResult`]: no clock reads, no
//! filesystem access, byte-identical output for identical input. The only
//! side effect lives in [`write_report`], which renders and then writes.

use super::{DiffResult, RowChange, RowChangeKind, SchemaChangeKind};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportFormat {
    Console,
    Html,
    Json,
    Markdown,
}

impl ReportFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Console => "console",
            Self::Html => "html",
            Self::Json => "json",
            Self::Markdown => "markdown",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Console => "txt",
            Self::Html => "html",
            Self::Json => "json",
            Self::Markdown => "md",
        }
    }
}

impl fmt::Display for ReportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReportFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "console" | "text" | "txt" => Ok(Self::Console),
            "html" => Ok(Self::Html),
            "json" => Ok(Self::Json),
            "markdown" | "md" => Ok(Self::Markdown),
            other => Err(format!("unknown report format: {other}")),
        }
    }
}

pub fn render(result: &DiffResult, format: ReportFormat) -> String {
    match format {
        ReportFormat::Console => render_console(result),
        ReportFormat::Html => render_html(result),
        ReportFormat::Json => render_json(result),
        ReportFormat::Markdown => render_markdown(result),
    }
}

/// Render and write to `path`, creating parent directories as needed.
pub fn write_report(result: &DiffResult, format: ReportFormat, path: &Path) -> Result<()> {
    let text = render(result, format);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create report directory {}", parent.display()))?;
    }
    std::fs::write(path, text).with_context(|| format!("write report {}", path.display()))
}

// ── Console ─────────────────────────────────────────────────────────────

fn render_console(result: &DiffResult) -> String {
    let mut out = String::new();
    let stats = &result.statistics;
    out.push_str(&format!(
        "Comparison ({} mode)\n  old: {}\n  new: {}\n\n",
        result.mode.as_str(),
        result.source_files.old.display(),
        result.source_files.new.display()
    ));
    out.push_str(&format!(
        "Rows: +{} -{} ~{} moved {}  ({:.1}% changed)\n",
        stats.rows_added,
        stats.rows_removed,
        stats.rows_modified,
        stats.rows_moved,
        stats.change_percentage
    ));
    if result.metadata.truncated {
        out.push_str("NOTE: row ceiling reached; this result is partial\n");
    }

    if !result.schema_changes.is_empty() {
        out.push_str("\nSchema changes:\n");
        for change in &result.schema_changes {
            match change.kind {
                SchemaChangeKind::Added => out.push_str(&format!(
                    "  + column '{}' at {}\n",
                    change.column,
                    change.new_position.unwrap_or_default()
                )),
                SchemaChangeKind::Removed => out.push_str(&format!(
                    "  - column '{}' from {}\n",
                    change.column,
                    change.old_position.unwrap_or_default()
                )),
                SchemaChangeKind::Moved => out.push_str(&format!(
                    "  ~ column '{}' {} -> {}\n",
                    change.column,
                    change.old_position.unwrap_or_default(),
                    change.new_position.unwrap_or_default()
                )),
            }
        }
    }

    if !result.row_changes.is_empty() {
        out.push_str("\nRow changes:\n");
        for change in &result.row_changes {
            out.push_str(&format!(
                "  [{}] row {}{}\n",
                change.change_type.as_str(),
                change.row_index,
                change
                    .moved_from
                    .map(|from| format!(" (from {from})"))
                    .unwrap_or_default()
            ));
            for cell in &change.cell_changes {
                out.push_str(&format!(
                    "      {}: '{}' -> '{}'\n",
                    cell.column,
                    cell.old_value.as_deref().unwrap_or(""),
                    cell.new_value.as_deref().unwrap_or("")
                ));
            }
        }
    }

    if !stats.top_changed_columns.is_empty() {
        out.push_str("\nMost changed columns:\n");
        for column in &stats.top_changed_columns {
            out.push_str(&format!("  {}: {}\n", column.column, column.changes));
        }
    }

    if let Some(text_diff) = &result.text_diff {
        out.push_str(&format!(
            "\nText patch (+{} -{} ~{}):\n{}",
            text_diff.added_lines, text_diff.removed_lines, text_diff.modified_lines,
            text_diff.patch
        ));
    }
    out
}

// ── JSON ────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct JsonReport<'a> {
    generator: &'static str,
    generator_version: &'static str,
    diff: &'a DiffResult,
}

fn render_json(result: &DiffResult) -> String {
    let report = JsonReport {
        generator: "tablekeeper",
        generator_version: env!("CARGO_PKG_VERSION"),
        diff: result,
    };
    // Serialization of our own types cannot fail.
    serde_json::to_string_pretty(&report).unwrap_or_default()
}

// ── Markdown ────────────────────────────────────────────────────────────

fn render_markdown(result: &DiffResult) -> String {
    let mut out = String::new();
    let stats = &result.statistics;
    out.push_str(&format!(
        "# Diff report\n\n- mode: `{}`\n- old: `{}`\n- new: `{}`\n- generated: {}\n\n",
        result.mode.as_str(),
        result.source_files.old.display(),
        result.source_files.new.display(),
        result.metadata.generated_at.to_rfc3339()
    ));
    out.push_str("## Statistics\n\n");
    out.push_str("| metric | value |\n|---|---|\n");
    out.push_str(&format!("| rows added | {} |\n", stats.rows_added));
    out.push_str(&format!("| rows removed | {} |\n", stats.rows_removed));
    out.push_str(&format!("| rows modified | {} |\n", stats.rows_modified));
    out.push_str(&format!("| rows moved | {} |\n", stats.rows_moved));
    out.push_str(&format!("| cells changed | {} |\n", stats.cells_changed));
    out.push_str(&format!(
        "| change percentage | {:.1}% |\n",
        stats.change_percentage
    ));
    if result.metadata.truncated {
        out.push_str("\n> Row ceiling reached; this result is partial.\n");
    }

    if !result.schema_changes.is_empty() {
        out.push_str("\n## Schema changes\n\n| column | change | old position | new position |\n|---|---|---|---|\n");
        for change in &result.schema_changes {
            out.push_str(&format!(
                "| {} | {} | {} | {} |\n",
                change.column,
                match change.kind {
                    SchemaChangeKind::Added => "added",
                    SchemaChangeKind::Removed => "removed",
                    SchemaChangeKind::Moved => "moved",
                },
                change
                    .old_position
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| "-".to_string()),
                change
                    .new_position
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| "-".to_string()),
            ));
        }
    }

    if !result.row_changes.is_empty() {
        out.push_str("\n## Row changes\n\n| row | change | details |\n|---|---|---|\n");
        for change in &result.row_changes {
            out.push_str(&format!(
                "| {} | {} | {} |\n",
                change.row_index,
                change.change_type.as_str(),
                row_details(change)
            ));
        }
    }

    if !stats.top_changed_columns.is_empty() {
        out.push_str("\n## Most changed columns\n\n| column | changes |\n|---|---|\n");
        for column in &stats.top_changed_columns {
            out.push_str(&format!("| {} | {} |\n", column.column, column.changes));
        }
    }

    if let Some(text_diff) = &result.text_diff {
        out.push_str(&format!(
            "\n## Text patch\n\n```diff\n{}```\n",
            text_diff.patch
        ));
    }
    out
}

fn row_details(change: &RowChange) -> String {
    match change.change_type {
        RowChangeKind::Moved => change
            .moved_from
            .map(|from| format!("moved from row {from}"))
            .unwrap_or_default(),
        RowChangeKind::Modified => change
            .cell_changes
            .iter()
            .map(|cell| {
                format!(
                    "{}: '{}' -> '{}'",
                    cell.column,
                    cell.old_value.as_deref().unwrap_or(""),
                    cell.new_value.as_deref().unwrap_or("")
                )
            })
            .collect::<Vec<_>>()
            .join("; "),
        _ => String::new(),
    }
}

// ── HTML ────────────────────────────────────────────────────────────────

fn render_html(result: &DiffResult) -> String {
    let stats = &result.statistics;
    let mut body = String::new();
    body.push_str(&format!(
        "<h1>Diff report</h1>\n<p class=\"meta\">mode {} · old {} · new {} · generated {}</p>\n",
        escape(result.mode.as_str()),
        escape(&result.source_files.old.display().to_string()),
        escape(&result.source_files.new.display().to_string()),
        result.metadata.generated_at.to_rfc3339()
    ));
    body.push_str(&format!(
        "<ul class=\"stats\"><li class=\"added\">+{}</li><li class=\"removed\">-{}</li>\
         <li class=\"modified\">~{}</li><li class=\"moved\">moved {}</li>\
         <li>{:.1}% changed</li></ul>\n",
        stats.rows_added,
        stats.rows_removed,
        stats.rows_modified,
        stats.rows_moved,
        stats.change_percentage
    ));
    if result.metadata.truncated {
        body.push_str("<p class=\"warning\">Row ceiling reached; this result is partial.</p>\n");
    }

    if !result.schema_changes.is_empty() {
        body.push_str("<h2>Schema changes</h2>\n<table><tr><th>column</th><th>change</th><th>old</th><th>new</th></tr>\n");
        for change in &result.schema_changes {
            body.push_str(&format!(
                "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>\n",
                escape(&change.column),
                match change.kind {
                    SchemaChangeKind::Added => "added",
                    SchemaChangeKind::Removed => "removed",
                    SchemaChangeKind::Moved => "moved",
                },
                change
                    .old_position
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| "-".to_string()),
                change
                    .new_position
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| "-".to_string()),
            ));
        }
        body.push_str("</table>\n");
    }

    if !result.row_changes.is_empty() {
        body.push_str("<h2>Row changes</h2>\n<table><tr><th>row</th><th>change</th><th>details</th></tr>\n");
        for change in &result.row_changes {
            body.push_str(&format!(
                "<tr class=\"{}\"><td>{}</td><td>{}</td><td>{}</td></tr>\n",
                change.change_type.as_str(),
                change.row_index,
                change.change_type.as_str(),
                escape(&row_details(change)),
            ));
        }
        body.push_str("</table>\n");
    }

    if let Some(text_diff) = &result.text_diff {
        body.push_str(&format!(
            "<h2>Text patch</h2>\n<pre>{}</pre>\n",
            escape(&text_diff.patch)
        ));
    }

    format!(
        "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n<title>Diff report</title>\n\
         <style>\n\
         body {{ font-family: sans-serif; margin: 2rem; color: #222; }}\n\
         table {{ border-collapse: collapse; margin: 1rem 0; }}\n\
         td, th {{ border: 1px solid #ccc; padding: 4px 8px; text-align: left; }}\n\
         .stats {{ list-style: none; padding: 0; }}\n\
         .stats li {{ display: inline-block; margin-right: 1rem; }}\n\
         .added {{ color: #1a7f37; }}\n\
         .removed {{ color: #cf222e; }}\n\
         .modified {{ color: #9a6700; }}\n\
         .moved {{ color: #0969da; }}\n\
         .warning {{ color: #cf222e; font-weight: bold; }}\n\
         .meta {{ color: #666; }}\n\
         pre {{ background: #f6f8fa; padding: 1rem; overflow-x: auto; }}\n\
         </style>\n</head>\n<body>\n{body}</body>\n</html>\n"
    )
}

fn escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CsvConfig, DiffConfig};
    use crate::diff::{DiffEngine, SourceFiles};
    use crate::table::Table;
    use std::path::PathBuf;

    fn sample_result() -> DiffResult {
        let old = Table {
            headers: vec!["name".into(), "phone".into()],
            rows: vec![vec!["Book Haven".into(), "555-0101".into()]],
        };
        let new = Table {
            headers: vec!["name".into(), "phone".into()],
            rows: vec![vec!["Book Haven".into(), "555-0199".into()]],
        };
        let config = DiffConfig {
            key_columns: vec!["name".into()],
            ..DiffConfig::default()
        };
        DiffEngine::new(config, CsvConfig::default()).compare_tables(
            &old,
            &new,
            SourceFiles {
                old: PathBuf::from("old.csv"),
                new: PathBuf::from("new.csv"),
            },
        )
    }

    #[test]
    fn rendering_is_byte_identical_across_runs() {
        let result = sample_result();
        for format in [
            ReportFormat::Console,
            ReportFormat::Html,
            ReportFormat::Json,
            ReportFormat::Markdown,
        ] {
            assert_eq!(render(&result, format), render(&result, format));
        }
    }

    #[test]
    fn console_report_mentions_the_cell_change() {
        let text = render(&sample_result(), ReportFormat::Console);
        assert!(text.contains("phone: '555-0101' -> '555-0199'"));
        assert!(text.contains("[modified] row 0"));
    }

    #[test]
    fn json_report_wraps_diff_with_generator_metadata() {
        let text = render(&sample_result(), ReportFormat::Json);
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["generator"], "tablekeeper");
        assert_eq!(value["diff"]["statistics"]["rows_modified"], 1);
    }

    #[test]
    fn html_report_is_self_contained_and_escaped() {
        let text = render(&sample_result(), ReportFormat::Html);
        assert!(text.starts_with("<!DOCTYPE html>"));
        assert!(text.contains("<style>"));
        assert!(!text.contains("<script"));
    }

    #[test]
    fn markdown_report_has_statistics_table() {
        let text = render(&sample_result(), ReportFormat::Markdown);
        assert!(text.contains("| rows modified | 1 |"));
        assert!(text.contains("## Row changes"));
    }

    #[test]
    fn write_report_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("reports/diff.md");
        write_report(&sample_result(), ReportFormat::Markdown, &out).unwrap();
        assert!(out.exists());
    }

    #[test]
    fn format_parsing() {
        assert_eq!("md".parse::<ReportFormat>().unwrap(), ReportFormat::Markdown);
        assert_eq!("HTML".parse::<ReportFormat>().unwrap(), ReportFormat::Html);
        assert!("yaml".parse::<ReportFormat>().is_err());
    }
}
