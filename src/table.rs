//! In-memory record table loaded from spreadsheet-style CSV exports.
//!
//! Column names are not unique keys: exports routinely carry several columns
//! with the same header. Every column is addressed by position, and name
//! lookups go through a [`ColumnIndex`] that maps a name to all of its
//! positions in left-to-right order.

use crate::error::{Result, SyncError};
use crate::models::is_filled;
use regex::Regex;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::Path;

/// Name to positions lookup, rebuilt whenever the column sequence changes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColumnIndex {
    positions: HashMap<String, Vec<usize>>,
}

impl ColumnIndex {
    pub fn build(columns: &[String]) -> Self {
        let mut positions: HashMap<String, Vec<usize>> = HashMap::new();
        for (pos, name) in columns.iter().enumerate() {
            positions.entry(name.clone()).or_default().push(pos);
        }
        Self { positions }
    }

    /// First position carrying `name`
    pub fn first(&self, name: &str) -> Option<usize> {
        self.positions.get(name).and_then(|p| p.first().copied())
    }

    /// Every position carrying `name`, left to right
    pub fn all(&self, name: &str) -> &[usize] {
        self.positions.get(name).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// One row: a cell per column, aligned with the owning table's column sequence
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Row {
    cells: Vec<Option<String>>,
}

impl Row {
    pub fn get(&self, pos: usize) -> Option<&str> {
        self.cells.get(pos).and_then(|c| c.as_deref())
    }

    pub fn cells(&self) -> &[Option<String>] {
        &self.cells
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordTable {
    columns: Vec<String>,
    index: ColumnIndex,
    rows: Vec<Row>,
}

impl RecordTable {
    pub fn new(columns: Vec<String>) -> Self {
        let index = ColumnIndex::build(&columns);
        Self {
            columns,
            index,
            rows: Vec::new(),
        }
    }

    /// Append a row; short rows are padded with empty cells and long rows truncated
    pub fn push_row(&mut self, mut cells: Vec<Option<String>>) {
        cells.resize(self.columns.len(), None);
        self.rows.push(Row { cells });
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn index(&self) -> &ColumnIndex {
        &self.index
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn width(&self) -> usize {
        self.columns.len()
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.index.first(name)
    }

    /// Position of a column the caller cannot proceed without
    pub fn require(&self, name: &str) -> Result<usize> {
        self.position(name)
            .ok_or_else(|| SyncError::schema(format!("required column '{}' not found", name)))
    }

    pub fn cell(&self, row: usize, pos: usize) -> Option<&str> {
        self.rows.get(row).and_then(|r| r.get(pos))
    }

    pub fn set_cell(&mut self, row: usize, pos: usize, value: Option<String>) {
        if let Some(cell) = self.rows.get_mut(row).and_then(|r| r.cells.get_mut(pos)) {
            *cell = value;
        }
    }

    /// True when any column named `name` holds a filled value in this row
    pub fn any_filled(&self, row: &Row, name: &str) -> bool {
        self.index.all(name).iter().any(|&pos| is_filled(row.get(pos)))
    }

    /// Coalesce all columns named `name`, preferring the first filled value
    pub fn value_by_name<'a>(&self, row: &'a Row, name: &str) -> Option<&'a str> {
        self.index
            .all(name)
            .iter()
            .map(|&pos| row.get(pos))
            .find(|v| is_filled(*v))
            .flatten()
    }

    /// Keep only the rows for which `keep` returns true
    pub fn filter_rows<F>(&self, mut keep: F) -> RecordTable
    where
        F: FnMut(&RecordTable, &Row) -> bool,
    {
        let rows = self.rows.iter().filter(|&row| keep(self, row)).cloned().collect();
        RecordTable {
            columns: self.columns.clone(),
            index: self.index.clone(),
            rows,
        }
    }

    /// Insert a contiguous run of empty columns before position `at`.
    ///
    /// This is the only structural change the table supports; all other
    /// columns keep their relative order.
    pub fn insert_columns(self, at: usize, names: Vec<String>) -> RecordTable {
        let at = at.min(self.columns.len());
        let added = names.len();

        let mut columns = Vec::with_capacity(self.columns.len() + added);
        columns.extend_from_slice(&self.columns[..at]);
        columns.extend(names);
        columns.extend_from_slice(&self.columns[at..]);

        let rows = self
            .rows
            .into_iter()
            .map(|row| {
                let mut cells = Vec::with_capacity(columns.len());
                let mut old = row.cells.into_iter();
                cells.extend(old.by_ref().take(at));
                cells.extend(std::iter::repeat(None).take(added));
                cells.extend(old);
                Row { cells }
            })
            .collect();

        let index = ColumnIndex::build(&columns);
        RecordTable { columns, index, rows }
    }

    pub fn from_csv_path<P: AsRef<Path>>(path: P, naming: &AnonymousNaming) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        Self::from_csv_reader(file, naming)
    }

    /// Read a CSV with a header row. Blank headers get anonymous names taken
    /// from their position, the way spreadsheet exports label them.
    pub fn from_csv_reader<R: Read>(reader: R, naming: &AnonymousNaming) -> Result<Self> {
        let mut csv_reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(reader);

        let columns: Vec<String> = csv_reader
            .headers()?
            .iter()
            .enumerate()
            .map(|(pos, h)| {
                if h.trim().is_empty() {
                    naming.name(pos as u64)
                } else {
                    h.to_string()
                }
            })
            .collect();

        let mut table = RecordTable::new(columns);
        for record in csv_reader.records() {
            let record = record?;
            let cells = record
                .iter()
                .map(|v| if v.is_empty() { None } else { Some(v.to_string()) })
                .collect();
            table.push_row(cells);
        }
        Ok(table)
    }

    pub fn write_csv_path<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = std::fs::File::create(path)?;
        self.write_csv(file)
    }

    pub fn write_csv<W: Write>(&self, writer: W) -> Result<()> {
        let mut csv_writer = csv::Writer::from_writer(writer);
        csv_writer.write_record(&self.columns)?;
        for row in &self.rows {
            csv_writer.write_record(row.cells.iter().map(|c| c.as_deref().unwrap_or("")))?;
        }
        csv_writer.flush()?;
        Ok(())
    }
}

/// Naming convention for anonymous columns, e.g. `Unnamed: 12`
#[derive(Debug, Clone)]
pub struct AnonymousNaming {
    prefix: String,
    pattern: Regex,
}

impl AnonymousNaming {
    pub fn new(prefix: &str) -> Result<Self> {
        let pattern = Regex::new(&format!(r"^{}\s*(\d+)$", regex::escape(prefix.trim())))
            .map_err(|e| SyncError::config(format!("bad anonymous column prefix: {}", e)))?;
        Ok(Self {
            prefix: prefix.trim().to_string(),
            pattern,
        })
    }

    pub fn name(&self, suffix: u64) -> String {
        format!("{} {}", self.prefix, suffix)
    }

    /// Numeric suffix of an anonymous column name, if `name` is one
    pub fn suffix(&self, name: &str) -> Option<u64> {
        self.pattern
            .captures(name.trim())
            .and_then(|caps| caps.get(1))
            .and_then(|m| m.as_str().parse().ok())
    }

    pub fn is_anonymous(&self, name: &str) -> bool {
        name.trim().starts_with(&self.prefix)
    }

    /// Next unused suffix after the largest one in `columns`
    pub fn next_suffix(&self, columns: &[String]) -> Result<u64> {
        match columns.iter().filter_map(|c| self.suffix(c)).max() {
            None => Ok(0),
            Some(n) => n.checked_add(1).ok_or_else(|| {
                let last = self.name(n);
                SyncError::schema(format!("no anonymous column suffix left after '{}'", last))
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn naming() -> AnonymousNaming {
        AnonymousNaming::new("Unnamed:").unwrap()
    }

    fn cells(values: &[&str]) -> Vec<Option<String>> {
        values
            .iter()
            .map(|v| if v.is_empty() { None } else { Some(v.to_string()) })
            .collect()
    }

    #[test]
    fn blank_headers_get_positional_anonymous_names() {
        let csv = "ATTR_EMAIL,ATTR_GROUPS,,,ATTR_USER_KEY\na@x.com,g,,,k1\n";
        let table = RecordTable::from_csv_reader(csv.as_bytes(), &naming()).unwrap();
        assert_eq!(
            table.columns(),
            &["ATTR_EMAIL", "ATTR_GROUPS", "Unnamed: 2", "Unnamed: 3", "ATTR_USER_KEY"]
        );
        assert_eq!(table.cell(0, 1), Some("g"));
        assert_eq!(table.cell(0, 2), None);
        assert_eq!(table.cell(0, 4), Some("k1"));
    }

    #[test]
    fn ragged_rows_are_padded() {
        let csv = "a,b,c\n1\n1,2,3,4\n";
        let table = RecordTable::from_csv_reader(csv.as_bytes(), &naming()).unwrap();
        assert_eq!(table.rows()[0].cells().len(), 3);
        assert_eq!(table.rows()[1].cells().len(), 3);
        assert_eq!(table.cell(1, 2), Some("3"));
    }

    #[test]
    fn duplicate_names_coalesce_to_first_filled() {
        let mut table = RecordTable::new(vec!["x".into(), "dup".into(), "dup".into()]);
        table.push_row(cells(&["1", " ", "second"]));
        table.push_row(cells(&["2", "", ""]));

        let row = &table.rows()[0];
        assert!(table.any_filled(row, "dup"));
        assert_eq!(table.value_by_name(row, "dup"), Some("second"));

        let row = &table.rows()[1];
        assert!(!table.any_filled(row, "dup"));
        assert_eq!(table.value_by_name(row, "dup"), None);
        assert_eq!(table.index().all("dup"), &[1, 2]);
    }

    #[test]
    fn insert_columns_keeps_surrounding_order() {
        let mut table = RecordTable::new(vec!["a".into(), "b".into(), "c".into()]);
        table.push_row(cells(&["1", "2", "3"]));

        let table = table.insert_columns(2, vec!["n1".into(), "n2".into()]);
        assert_eq!(table.columns(), &["a", "b", "n1", "n2", "c"]);
        assert_eq!(table.rows()[0].cells(), cells(&["1", "2", "", "", "3"]).as_slice());
        assert_eq!(table.position("c"), Some(4));
    }

    #[test]
    fn anonymous_suffix_parsing() {
        let naming = naming();
        assert_eq!(naming.suffix("Unnamed: 17"), Some(17));
        assert_eq!(naming.suffix("Unnamed:3"), Some(3));
        assert_eq!(naming.suffix("Unnamed: x"), None);
        assert_eq!(naming.suffix("ATTR_GROUPS"), None);
        assert_eq!(naming.name(4), "Unnamed: 4");

        let columns: Vec<String> = vec!["Unnamed: 3".into(), "a".into(), "Unnamed: 11".into()];
        assert_eq!(naming.next_suffix(&columns).unwrap(), 12);
        assert_eq!(naming.next_suffix(&["a".to_string()]).unwrap(), 0);
    }

    #[test]
    fn exhausted_anonymous_suffix_is_a_schema_error() {
        let naming = naming();
        let columns = vec![format!("Unnamed: {}", u64::MAX)];
        assert_eq!(naming.suffix(&columns[0]), Some(u64::MAX));
        let err = naming.next_suffix(&columns).unwrap_err();
        assert!(matches!(err, SyncError::Schema(_)));
    }

    #[test]
    fn csv_output_writes_empty_cells() {
        let mut table = RecordTable::new(vec!["a".into(), "b".into()]);
        table.push_row(cells(&["1", ""]));
        let mut out = Vec::new();
        table.write_csv(&mut out).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "a,b\n1,\n");
    }
}
