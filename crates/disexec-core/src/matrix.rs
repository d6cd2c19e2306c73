use crate::error::{Error, Result};
use crate::fsutil::atomic_write_bytes;
use std::collections::BTreeSet;
use std::io::Read;
use std::path::{Path, PathBuf};

/// Rectangular parameter table: one experiment configuration per row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Matrix {
    columns: Vec<String>,
    rows: Vec<Vec<String>>,
}

/// Borrowed view of one matrix row, aligned with the header.
#[derive(Debug, Clone, Copy)]
pub struct Row<'a> {
    index: usize,
    columns: &'a [String],
    values: &'a [String],
}

impl<'a> Row<'a> {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn get(&self, column: &str) -> Option<&'a str> {
        self.columns
            .iter()
            .position(|c| c == column)
            .map(|i| self.values[i].as_str())
    }

    pub fn values(&self) -> &'a [String] {
        self.values
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'a str, &'a str)> + 'a {
        let columns: &'a [String] = self.columns;
        let values: &'a [String] = self.values;
        columns
            .iter()
            .map(String::as_str)
            .zip(values.iter().map(String::as_str))
    }
}

impl Matrix {
    pub fn new(columns: Vec<String>) -> Result<Self> {
        check_unique(&columns, Path::new("<memory>"))?;
        Ok(Self {
            columns,
            rows: Vec::new(),
        })
    }

    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(Error::FileNotFound(path.to_path_buf()));
        }
        let file = std::fs::File::open(path)?;
        Self::from_reader(file, path)
    }

    /// `origin` only labels errors.
    pub fn from_reader<R: Read>(reader: R, origin: &Path) -> Result<Self> {
        let mut csv_reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(reader);
        let mut records = csv_reader.records();
        let header = match records.next() {
            Some(record) => record?,
            None => {
                return Err(Error::SchemaMismatch {
                    path: origin.to_path_buf(),
                    record: 0,
                    expected: 1,
                    found: 0,
                })
            }
        };
        let columns: Vec<String> = header.iter().map(|s| s.to_string()).collect();
        check_unique(&columns, origin)?;

        let mut matrix = Matrix {
            columns,
            rows: Vec::new(),
        };
        for (idx, record) in records.enumerate() {
            let record = record?;
            let values: Vec<String> = record.iter().map(|s| s.to_string()).collect();
            if values.len() != matrix.columns.len() {
                return Err(Error::SchemaMismatch {
                    path: origin.to_path_buf(),
                    record: idx + 1,
                    expected: matrix.columns.len(),
                    found: values.len(),
                });
            }
            matrix.rows.push(values);
        }
        Ok(matrix)
    }

    pub fn push_row(&mut self, values: Vec<String>) -> Result<()> {
        if values.len() != self.columns.len() {
            return Err(Error::SchemaMismatch {
                path: PathBuf::from("<memory>"),
                record: self.rows.len() + 1,
                expected: self.columns.len(),
                found: values.len(),
            });
        }
        self.rows.push(values);
        Ok(())
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn row(&self, index: usize) -> Option<Row<'_>> {
        self.rows.get(index).map(|values| Row {
            index,
            columns: &self.columns,
            values,
        })
    }

    pub fn rows(&self) -> impl Iterator<Item = Row<'_>> + '_ {
        self.rows.iter().enumerate().map(move |(index, values)| Row {
            index,
            columns: &self.columns,
            values,
        })
    }

    /// Same header, only the selected rows, in the order given.
    pub fn subset(&self, indices: &[usize]) -> Matrix {
        Matrix {
            columns: self.columns.clone(),
            rows: indices
                .iter()
                .filter_map(|i| self.rows.get(*i).cloned())
                .collect(),
        }
    }

    pub fn to_csv_bytes(&self) -> Result<Vec<u8>> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer.write_record(&self.columns)?;
        for row in &self.rows {
            writer.write_record(row)?;
        }
        writer
            .into_inner()
            .map_err(|e| Error::Io(e.into_error()))
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        atomic_write_bytes(path, &self.to_csv_bytes()?)
    }
}

fn check_unique(columns: &[String], origin: &Path) -> Result<()> {
    let mut seen = BTreeSet::new();
    for column in columns {
        if !seen.insert(column.as_str()) {
            return Err(Error::DuplicateColumn {
                path: origin.to_path_buf(),
                column: column.clone(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> Result<Matrix> {
        Matrix::from_reader(text.as_bytes(), Path::new("test.csv"))
    }

    #[test]
    fn loads_header_and_rows_in_order() {
        let m = parse("Scenario.name,Seed\nrun_%%Seed%%,1\nrun_%%Seed%%,2\n").expect("matrix");
        assert_eq!(m.columns(), &["Scenario.name".to_string(), "Seed".to_string()]);
        assert_eq!(m.len(), 2);
        let row = m.row(1).expect("row");
        assert_eq!(row.get("Seed"), Some("2"));
        assert_eq!(row.get("missing"), None);
        let pairs: Vec<_> = row.iter().collect();
        assert_eq!(pairs, vec![("Scenario.name", "run_%%Seed%%"), ("Seed", "2")]);
    }

    #[test]
    fn short_row_is_schema_mismatch() {
        let err = parse("a,b,c\n1,2,3\n4,5\n").expect_err("mismatch");
        match err {
            Error::SchemaMismatch {
                record,
                expected,
                found,
                ..
            } => {
                assert_eq!(record, 2);
                assert_eq!(expected, 3);
                assert_eq!(found, 2);
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn duplicate_header_is_rejected() {
        let err = parse("a,b,a\n1,2,3\n").expect_err("duplicate");
        assert!(matches!(err, Error::DuplicateColumn { ref column, .. } if column == "a"));
    }

    #[test]
    fn quoted_list_values_survive_round_trip_through_csv() {
        let m = parse("Group.router,Seed\nEpidemicRouter,\"[1;2;3]\"\n").expect("matrix");
        let bytes = m.to_csv_bytes().expect("csv");
        let again = Matrix::from_reader(bytes.as_slice(), Path::new("again.csv")).expect("again");
        assert_eq!(m, again);
    }

    #[test]
    fn subset_keeps_header_and_selected_rows() {
        let m = parse("k\na\nb\nc\n").expect("matrix");
        let s = m.subset(&[2, 0]);
        assert_eq!(s.columns(), m.columns());
        assert_eq!(s.row(0).unwrap().get("k"), Some("c"));
        assert_eq!(s.row(1).unwrap().get("k"), Some("a"));
    }

    #[test]
    fn missing_file_is_file_not_found() {
        let err = Matrix::load(Path::new("/nonexistent/matrix.csv")).expect_err("missing");
        assert!(matches!(err, Error::FileNotFound(_)));
    }
}
