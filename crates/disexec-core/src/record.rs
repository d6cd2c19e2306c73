use crate::error::{Error, Result};
use crate::fsutil::atomic_write_bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::OnceLock;

/// Field holding the scenario identifier that reconciliation matches on.
pub const ID_FIELD: &str = "id";

/// Metrics parsed from one report plus provenance fields, in insertion
/// order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResultRecord(Map<String, Value>);

impl ResultRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id(&self) -> Option<&str> {
        self.0.get(ID_FIELD).and_then(Value::as_str)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn to_json_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_json_slice(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

impl From<Map<String, Value>> for ResultRecord {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

fn integer_pattern() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"^[+-]?\d+$").expect("static integer pattern"))
}

fn decimal_pattern() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"^[+-]?\d+\.\d+$").expect("static decimal pattern"))
}

/// Opportunistic typing of a metric token: integer, then decimal, else the
/// trimmed string.
pub fn typed_value(raw: &str) -> Value {
    let token = raw.trim();
    if integer_pattern().is_match(token) {
        if let Ok(v) = token.parse::<i64>() {
            return Value::from(v);
        }
        if let Ok(v) = token.parse::<u64>() {
            return Value::from(v);
        }
    } else if decimal_pattern().is_match(token) {
        if let Ok(v) = token.parse::<f64>() {
            return Value::from(v);
        }
    }
    Value::String(token.to_string())
}

/// Text form of a record value for flat outputs such as CSV cells.
pub fn value_to_cell(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Write records as CSV. The header is the sorted union of all record keys;
/// cells for keys a record lacks stay empty.
pub fn write_records_csv(records: &[ResultRecord], path: &Path) -> Result<()> {
    let header: BTreeSet<&str> = records.iter().flat_map(|r| r.keys()).collect();
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(&header)?;
    for record in records {
        writer.write_record(
            header
                .iter()
                .map(|key| record.get(key).map(value_to_cell).unwrap_or_default()),
        )?;
    }
    let bytes = writer
        .into_inner()
        .map_err(|e| Error::Io(e.into_error()))?;
    atomic_write_bytes(path, &bytes)
}

/// Read records back from a results CSV, retyping each cell and dropping
/// empty ones. The `id` column always stays a string.
pub fn read_records_csv(path: &Path) -> Result<Vec<ResultRecord>> {
    if !path.exists() {
        return Err(Error::FileNotFound(path.to_path_buf()));
    }
    let mut reader = csv::Reader::from_path(path)?;
    let header = reader.headers()?.clone();
    let mut records = Vec::new();
    for row in reader.records() {
        let row = row?;
        let mut record = ResultRecord::new();
        for (key, cell) in header.iter().zip(row.iter()) {
            if cell.is_empty() {
                continue;
            }
            if key == ID_FIELD {
                record.insert(key, cell);
            } else {
                record.insert(key, typed_value(cell));
            }
        }
        if !record.is_empty() {
            records.push(record);
        }
    }
    Ok(records)
}
