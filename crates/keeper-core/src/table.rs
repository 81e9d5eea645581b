//! Delimited-file parsing into an in-memory table.
//!
//! The first record is always treated as the header row. Parsing is
//! deliberately lenient (`flexible`), so ragged rows survive into the table
//! and the validation pipeline can report them instead of the parser
//! swallowing the file whole.

use crate::config::CsvConfig;
use anyhow::{Context, Result};
use csv::ReaderBuilder;
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Table {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl Table {
    pub fn from_path(path: &Path, config: &CsvConfig) -> Result<Self> {
        let data =
            std::fs::read(path).with_context(|| format!("read {}", path.display()))?;
        Self::from_bytes(&data, config)
    }

    pub fn from_bytes(data: &[u8], config: &CsvConfig) -> Result<Self> {
        let mut reader = ReaderBuilder::new()
            .delimiter(config.delimiter_byte())
            .quote(config.quote_byte())
            .escape(config.escape_byte())
            .flexible(true)
            .has_headers(true)
            .from_reader(data);

        let headers: Vec<String> = reader
            .headers()
            .context("read header row")?
            .iter()
            .map(|h| h.to_string())
            .collect();

        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record.context("parse record")?;
            rows.push(record.iter().map(|f| f.to_string()).collect());
        }

        Ok(Self { headers, rows })
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn column_count(&self) -> usize {
        self.headers.len()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == name)
    }

    /// Cell value by row index and column name. Missing cells in ragged
    /// rows read as `None`.
    pub fn cell(&self, row: usize, column: &str) -> Option<&str> {
        let col = self.column_index(column)?;
        self.rows.get(row)?.get(col).map(String::as_str)
    }

    /// One row as a header-keyed map. Ragged rows are padded with empty
    /// strings; trailing cells beyond the header width are dropped.
    pub fn row_map(&self, row: usize) -> Option<BTreeMap<String, String>> {
        let cells = self.rows.get(row)?;
        let mut map = BTreeMap::new();
        for (i, header) in self.headers.iter().enumerate() {
            map.insert(
                header.clone(),
                cells.get(i).cloned().unwrap_or_default(),
            );
        }
        Some(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(data: &str) -> Table {
        Table::from_bytes(data.as_bytes(), &CsvConfig::default()).unwrap()
    }

    #[test]
    fn parses_headers_and_rows() {
        let table = parse("name,phone\nBook Haven,555-0101\nThe Reading Room,555-0102\n");
        assert_eq!(table.headers, vec!["name", "phone"]);
        assert_eq!(table.row_count(), 2);
        assert_eq!(table.cell(0, "phone"), Some("555-0101"));
    }

    #[test]
    fn quoted_fields_keep_embedded_delimiters() {
        let table = parse("name,address\n\"Book Haven\",\"12 Main St, Springfield\"\n");
        assert_eq!(table.cell(0, "address"), Some("12 Main St, Springfield"));
    }

    #[test]
    fn ragged_rows_survive_parsing() {
        let table = parse("a,b,c\n1,2\n1,2,3,4\n");
        assert_eq!(table.rows[0].len(), 2);
        assert_eq!(table.rows[1].len(), 4);
        let map = table.row_map(0).unwrap();
        assert_eq!(map.get("c").map(String::as_str), Some(""));
    }

    #[test]
    fn alternate_delimiter() {
        let config = CsvConfig {
            delimiter: ';',
            ..CsvConfig::default()
        };
        let table = Table::from_bytes(b"a;b\n1;2\n", &config).unwrap();
        assert_eq!(table.cell(0, "b"), Some("2"));
    }
}
