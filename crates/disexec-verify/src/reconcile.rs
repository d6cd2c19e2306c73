use crate::template::{compile, expand, row_label, Expansion, SCENARIO_COLUMN};
use disexec_core::{
    atomic_write_bytes, ensure_dir, sanitize_file_name, Error, Matrix, Result, ResultRecord, Row,
};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Default file name of the rerun matrix.
pub const RERUN_FILE: &str = "rerun.csv";

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Nonexec,
    Incomplete { ratio: f64 },
    Complete,
    Repeated,
}

impl Status {
    pub fn classify(matched: usize, expected: usize) -> Self {
        match matched {
            0 => Status::Nonexec,
            k if k < expected => Status::Incomplete {
                ratio: k as f64 / expected as f64,
            },
            k if k == expected => Status::Complete,
            _ => Status::Repeated,
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, Status::Complete)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Nonexec => write!(f, "NONEXEC"),
            Status::Incomplete { ratio } => write!(f, "INCOMPLETE ({:.4})", ratio),
            Status::Complete => write!(f, "COMPLETE"),
            Status::Repeated => write!(f, "REPEATED"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RowVerdict {
    /// Zero-based data row index in the matrix.
    pub row: usize,
    pub scenario: String,
    pub expected: usize,
    pub matched: usize,
    #[serde(flatten)]
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub side_file: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ReconcileOptions {
    /// Expected results per expansion of a row.
    pub repetitions: usize,
    /// Column that overrides `repetitions` per row; empty cells fall back.
    pub repetitions_column: Option<String>,
    /// Placeholders replaced by a match-any token.
    pub ignore: BTreeSet<String>,
    pub scenario_column: String,
    /// Where REPEATED rows dump their matching records.
    pub side_dir: PathBuf,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            repetitions: 1,
            repetitions_column: None,
            ignore: BTreeSet::new(),
            scenario_column: SCENARIO_COLUMN.to_string(),
            side_dir: PathBuf::from("."),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Reconciliation {
    pub verdicts: Vec<RowVerdict>,
    /// Rows not classified COMPLETE, same header as the input.
    pub rerun: Matrix,
}

impl Reconciliation {
    pub fn count(&self, pred: impl Fn(&Status) -> bool) -> usize {
        self.verdicts.iter().filter(|v| pred(&v.status)).count()
    }

    pub fn all_complete(&self) -> bool {
        self.rerun.is_empty()
    }

    /// Writes the rerun matrix to `path` if there is anything to rerun.
    /// Returns whether a file was written.
    pub fn write_rerun(&self, path: &Path) -> Result<bool> {
        if self.rerun.is_empty() {
            return Ok(false);
        }
        self.rerun.write(path)?;
        info!(path = %path.display(), rows = self.rerun.len(), "wrote rerun matrix");
        Ok(true)
    }
}

fn check_columns(matrix: &Matrix, options: &ReconcileOptions) -> Result<()> {
    let has = |name: &str| matrix.columns().iter().any(|c| c == name);
    if !has(&options.scenario_column) {
        return Err(Error::Configuration(format!(
            "matrix has no '{}' column",
            options.scenario_column
        )));
    }
    if let Some(col) = &options.repetitions_column {
        if !has(col) {
            return Err(Error::Configuration(format!(
                "repetitions column '{}' is not in the matrix",
                col
            )));
        }
    }
    if options.repetitions == 0 {
        return Err(Error::Configuration(
            "expected repetitions must be at least 1".to_string(),
        ));
    }
    Ok(())
}

fn row_repetitions(row: &Row<'_>, options: &ReconcileOptions) -> Result<usize> {
    let Some(col) = &options.repetitions_column else {
        return Ok(options.repetitions);
    };
    match row.get(col).map(str::trim) {
        None | Some("") => Ok(options.repetitions),
        Some(cell) => match cell.parse::<usize>() {
            Ok(n) if n > 0 => Ok(n),
            _ => Err(Error::Configuration(format!(
                "row {}: '{}' must be a positive integer, got '{}'",
                row.index() + 1,
                col,
                cell
            ))),
        },
    }
}

/// Side files carry the row index so rows sharing a label keep separate dumps.
fn write_side_file(
    dir: &Path,
    row: usize,
    scenario: &str,
    records: &[&ResultRecord],
) -> Result<PathBuf> {
    ensure_dir(dir)?;
    let path = dir.join(format!("row{}_{}.jsonl", row, sanitize_file_name(scenario)));
    let mut bytes = Vec::new();
    for record in records {
        bytes.extend(record.to_json_bytes()?);
        bytes.push(b'\n');
    }
    atomic_write_bytes(&path, &bytes)?;
    Ok(path)
}

/// How one row fared: the matched count, its status and the records a
/// REPEATED verdict dumps.
struct Tally<'r> {
    matched: usize,
    status: Status,
    excess: Vec<&'r ResultRecord>,
}

fn tally<'r>(
    expansions: &[Expansion],
    ids: &[(&str, &'r ResultRecord)],
    repetitions: usize,
) -> Result<Tally<'r>> {
    let names: Option<Vec<String>> = expansions.iter().map(Expansion::as_concrete).collect();
    if let Some(names) = names.filter(|n| n.len() > 1) {
        return Ok(tally_by_name(&names, ids, repetitions));
    }
    let pattern = compile(expansions)?;
    let matching: Vec<&ResultRecord> = ids
        .iter()
        .filter(|(id, _)| pattern.is_match(id))
        .map(|(_, r)| *r)
        .collect();
    Ok(Tally {
        matched: matching.len(),
        status: Status::classify(matching.len(), repetitions * expansions.len()),
        excess: matching,
    })
}

/// Every concrete name is held to its own count, so a duplicate of one
/// name cannot cover for another name that never ran.
fn tally_by_name<'r>(
    names: &[String],
    ids: &[(&str, &'r ResultRecord)],
    repetitions: usize,
) -> Tally<'r> {
    let mut wanted: BTreeMap<&str, usize> = BTreeMap::new();
    for name in names {
        *wanted.entry(name.as_str()).or_default() += repetitions;
    }
    let mut found: BTreeMap<&str, Vec<&ResultRecord>> = BTreeMap::new();
    for (id, record) in ids {
        if wanted.contains_key(*id) {
            found.entry(*id).or_default().push(*record);
        }
    }

    let expected: usize = wanted.values().sum();
    let matched: usize = found.values().map(Vec::len).sum();
    let mut excess = Vec::new();
    let mut exact = true;
    for (name, want) in &wanted {
        let got = found.get(*name).map_or(&[][..], Vec::as_slice);
        if got.len() > *want {
            excess.extend(got.iter().copied());
        }
        exact &= got.len() == *want;
    }
    let status = if matched == 0 {
        Status::Nonexec
    } else if !excess.is_empty() {
        Status::Repeated
    } else if exact {
        Status::Complete
    } else {
        Status::Incomplete {
            ratio: matched as f64 / expected as f64,
        }
    };
    Tally {
        matched,
        status,
        excess,
    }
}

/// Classifies every matrix row against the collected records.
///
/// A row expecting `n` results (repetitions times its number of expansions)
/// that matches `k` records is NONEXEC for `k = 0`, INCOMPLETE for `k < n`,
/// COMPLETE for `k = n` and REPEATED above that. A row with several
/// concrete names is COMPLETE only when each name matches exactly its
/// repetitions, and REPEATED when any name matches more. REPEATED rows get
/// the offending records dumped as JSON lines under `side_dir`.
pub fn reconcile(
    matrix: &Matrix,
    records: &[ResultRecord],
    options: &ReconcileOptions,
) -> Result<Reconciliation> {
    check_columns(matrix, options)?;
    let ids: Vec<(&str, &ResultRecord)> = records
        .iter()
        .filter_map(|r| r.id().map(|id| (id, r)))
        .collect();
    debug!(records = records.len(), with_id = ids.len(), rows = matrix.len(), "reconciling");

    let mut verdicts = Vec::with_capacity(matrix.len());
    let mut rerun_rows = Vec::new();
    for row in matrix.rows() {
        let template = row.get(&options.scenario_column).unwrap_or_default();
        let expansions = expand(template, &row, &options.ignore)?;
        let scenario = row_label(&expansions);
        let repetitions = row_repetitions(&row, options)?;
        let expected = repetitions * expansions.len();
        let Tally {
            matched,
            status,
            excess,
        } = tally(&expansions, &ids, repetitions)?;

        let side_file = if status == Status::Repeated {
            Some(write_side_file(&options.side_dir, row.index(), &scenario, &excess)?)
        } else {
            None
        };
        match status {
            Status::Complete => debug!(row = row.index(), %scenario, "COMPLETE"),
            Status::Repeated => warn!(row = row.index(), %scenario, matched, expected, "REPEATED"),
            _ => info!(row = row.index(), %scenario, matched, expected, "{}", status),
        }
        if !status.is_complete() {
            rerun_rows.push(row.index());
        }
        verdicts.push(RowVerdict {
            row: row.index(),
            scenario,
            expected,
            matched,
            status,
            side_file,
        });
    }

    Ok(Reconciliation {
        verdicts,
        rerun: matrix.subset(&rerun_rows),
    })
}
