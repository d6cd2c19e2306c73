use crate::template::expand;
use disexec_core::{Error, Matrix, Result};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportPresence {
    pub scenario: String,
    /// Where the report was found, if anywhere.
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LocalRowCheck {
    pub row: usize,
    pub reports: Vec<ReportPresence>,
}

impl LocalRowCheck {
    pub fn missing(&self) -> impl Iterator<Item = &str> {
        self.reports
            .iter()
            .filter(|r| r.path.is_none())
            .map(|r| r.scenario.as_str())
    }

    pub fn is_complete(&self) -> bool {
        self.reports.iter().all(|r| r.path.is_some())
    }
}

/// File name to path for every regular file under `root`. The first file
/// seen for a name wins, walking in sorted order.
fn index_reports(root: &Path) -> BTreeMap<String, PathBuf> {
    let mut index = BTreeMap::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!(root = %root.display(), error = %e, "skipping unreadable entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        index.entry(name).or_insert_with(|| entry.into_path());
    }
    debug!(root = %root.display(), files = index.len(), "indexed report directory");
    index
}

/// Checks, without any queue, that every expansion of every row has a
/// `<scenario><suffix>` report somewhere under `report_dir`.
pub fn check_local(
    matrix: &Matrix,
    report_dir: &Path,
    report_suffix: &str,
    scenario_column: &str,
) -> Result<Vec<LocalRowCheck>> {
    if !report_dir.is_dir() {
        return Err(Error::FileNotFound(report_dir.to_path_buf()));
    }
    if !matrix.columns().iter().any(|c| c == scenario_column) {
        return Err(Error::Configuration(format!(
            "matrix has no '{}' column",
            scenario_column
        )));
    }
    let index = index_reports(report_dir);
    let no_ignore = BTreeSet::new();

    let mut checks = Vec::with_capacity(matrix.len());
    for row in matrix.rows() {
        let template = row.get(scenario_column).unwrap_or_default();
        let reports = expand(template, &row, &no_ignore)?
            .iter()
            .map(|expansion| {
                let scenario = expansion.label();
                let path = index
                    .get(&format!("{}{}", scenario, report_suffix))
                    .cloned();
                ReportPresence { scenario, path }
            })
            .collect();
        checks.push(LocalRowCheck {
            row: row.index(),
            reports,
        });
    }
    Ok(checks)
}
