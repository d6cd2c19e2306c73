use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Placeholder in the argument template replaced by the payload file path.
pub const PAYLOAD_PLACEHOLDER: &str = "{edf}";

/// Self-contained unit of work derived from one matrix row. Everything a
/// worker needs travels inside the serialized form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: u64,
    /// Written verbatim to the payload file before execution.
    #[serde(alias = "external_data")]
    pub payload: String,
    #[serde(
        default,
        alias = "external_data_folder",
        skip_serializing_if = "Option::is_none"
    )]
    pub payload_folder: Option<String>,
    pub command: String,
    #[serde(default)]
    pub arguments: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned: Option<DateTime<Utc>>,
}

impl Task {
    pub fn from_json_slice(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn to_json_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn stamp_assigned(mut self, at: DateTime<Utc>) -> Self {
        self.assigned = Some(at);
        self
    }

    /// Configured payload directory; an empty string means "use a scoped
    /// temporary directory".
    pub fn payload_folder(&self) -> Option<&Path> {
        self.payload_folder
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .map(Path::new)
    }

    pub fn payload_file_name(&self) -> String {
        format!("{}.txt", self.id)
    }

    /// Value of the first `key=value` payload line with the given key.
    pub fn payload_value(&self, key: &str) -> Option<&str> {
        self.payload.lines().find_map(|line| {
            let (k, v) = line.split_once('=')?;
            if k.trim() == key {
                Some(v.trim())
            } else {
                None
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample() -> Task {
        Task {
            id: 7,
            payload: "Scenario.name=run_%%Seed%%\nSeed=3\nReport.reportDir = reports/\n".to_string(),
            payload_folder: None,
            command: "/opt/one/one.sh".to_string(),
            arguments: "-b 1 {edf}".to_string(),
            assigned: None,
        }
    }

    #[test]
    fn json_round_trip_is_lossless() {
        let task = sample().stamp_assigned(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap());
        let bytes = task.to_json_bytes().expect("serialize");
        let again = Task::from_json_slice(&bytes).expect("deserialize");
        assert_eq!(task, again);
    }

    #[test]
    fn accepts_legacy_field_names() {
        let raw = r#"{"id": 0, "external_data": "a=1\n", "external_data_folder": "", "command": "sim", "arguments": "{edf}"}"#;
        let task = Task::from_json_slice(raw.as_bytes()).expect("legacy task");
        assert_eq!(task.payload, "a=1\n");
        assert_eq!(task.payload_folder(), None);
        assert_eq!(task.assigned, None);
    }

    #[test]
    fn payload_value_trims_keys_and_values() {
        let task = sample();
        assert_eq!(task.payload_value("Seed"), Some("3"));
        assert_eq!(task.payload_value("Report.reportDir"), Some("reports/"));
        assert_eq!(task.payload_value("Missing"), None);
        assert_eq!(task.payload_file_name(), "7.txt");
    }
}
