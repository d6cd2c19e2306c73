use crate::error::{Error, Result};
use serde::Deserialize;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_FILE: &str = "./disexec.yaml";
pub const DEFAULT_WORKERS: usize = 4;
pub const DEFAULT_TASK_CREATOR: &str = "params_in_external_file";
pub const DEFAULT_PARSER: &str = "message_stats_report";
pub const DEFAULT_REPORT_SUFFIX: &str = "_MessageStatsReport.txt";
pub const DEFAULT_ANNOUNCE_PATTERN: &str = r"^Running simulation '(?P<scenario>.+)'$";
pub const DEFAULT_REPORT_DIR_KEY: &str = "Report.reportDir";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub general: GeneralConfig,
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub task: TaskConfig,
    #[serde(default)]
    pub collect: CollectConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeneralConfig {
    pub queue_url: String,
    pub queue_name: String,
    pub results_queue_name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CoordinatorConfig {
    #[serde(default = "default_task_creator")]
    pub task_creator: String,
    #[serde(default)]
    pub csv_file: Option<PathBuf>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            task_creator: default_task_creator(),
            csv_file: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_workers")]
    pub cores: usize,
    /// Overrides `general.queue_url` for workers that reach the broker
    /// through a different address than the coordinator.
    #[serde(default)]
    pub queue_url: Option<String>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            cores: default_workers(),
            queue_url: None,
            timeout_seconds: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskConfig {
    #[serde(default, alias = "external_folder")]
    pub payload_folder: Option<String>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub arguments: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CollectConfig {
    #[serde(default = "default_parser")]
    pub parser: String,
    #[serde(default = "default_report_suffix")]
    pub report_suffix: String,
    #[serde(default = "default_announce_pattern")]
    pub announce_pattern: String,
    #[serde(default = "default_report_dir_key")]
    pub report_dir_key: String,
}

impl Default for CollectConfig {
    fn default() -> Self {
        Self {
            parser: default_parser(),
            report_suffix: default_report_suffix(),
            announce_pattern: default_announce_pattern(),
            report_dir_key: default_report_dir_key(),
        }
    }
}

fn default_task_creator() -> String {
    DEFAULT_TASK_CREATOR.to_string()
}

fn default_workers() -> usize {
    DEFAULT_WORKERS
}

fn default_parser() -> String {
    DEFAULT_PARSER.to_string()
}

fn default_report_suffix() -> String {
    DEFAULT_REPORT_SUFFIX.to_string()
}

fn default_announce_pattern() -> String {
    DEFAULT_ANNOUNCE_PATTERN.to_string()
}

fn default_report_dir_key() -> String {
    DEFAULT_REPORT_DIR_KEY.to_string()
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(Error::Configuration(format!(
                "unable to locate the config file {}",
                path.display()
            )));
        }
        let raw = fs::read_to_string(path)?;
        Self::from_yaml_str(&raw)
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let yaml_value: serde_yaml::Value = serde_yaml::from_str(raw)?;
        let json_value: Value = serde_json::to_value(yaml_value)?;
        validate_required_fields(&json_value)?;
        let config: Config = serde_json::from_value(json_value)
            .map_err(|e| Error::Configuration(format!("invalid configuration: {}", e)))?;
        if config.worker.cores == 0 {
            return Err(Error::Configuration(
                "worker.cores must be at least 1".to_string(),
            ));
        }
        Ok(config)
    }

    /// Queue address used by workers; falls back to the general one.
    pub fn worker_queue_url(&self) -> &str {
        self.worker
            .queue_url
            .as_deref()
            .filter(|s| !s.is_empty())
            .unwrap_or(&self.general.queue_url)
    }

    pub fn csv_file(&self) -> Result<&Path> {
        self.coordinator
            .csv_file
            .as_deref()
            .filter(|p| !p.as_os_str().is_empty())
            .ok_or_else(|| Error::Configuration("missing /coordinator/csv_file".to_string()))
    }
}

fn validate_required_fields(json_value: &Value) -> Result<()> {
    let required: &[&str] = &[
        "/general/queue_url",
        "/general/queue_name",
        "/general/results_queue_name",
    ];
    let mut missing = Vec::new();
    for pointer in required {
        let is_missing = match json_value.pointer(pointer) {
            None | Some(Value::Null) => true,
            Some(Value::String(s)) => s.is_empty(),
            _ => false,
        };
        if is_missing {
            missing.push(*pointer);
        }
    }
    if missing.is_empty() {
        Ok(())
    } else {
        Err(Error::Configuration(format!(
            "config missing required fields:\n{}",
            missing
                .iter()
                .map(|p| format!("  - {}", p))
                .collect::<Vec<_>>()
                .join("\n")
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_full_config_with_defaults() {
        let raw = r#"
general:
  queue_url: spool:///tmp/disexec
  queue_name: tasks
  results_queue_name: results
coordinator:
  csv_file: experiments.csv
task:
  external_folder: ""
  command: /opt/one/one.sh
  arguments: "-b 1 {edf}"
"#;
        let cfg = Config::from_yaml_str(raw).expect("config");
        assert_eq!(cfg.general.queue_name, "tasks");
        assert_eq!(cfg.coordinator.task_creator, DEFAULT_TASK_CREATOR);
        assert_eq!(cfg.worker.cores, DEFAULT_WORKERS);
        assert_eq!(cfg.worker_queue_url(), "spool:///tmp/disexec");
        assert_eq!(cfg.task.payload_folder.as_deref(), Some(""));
        assert_eq!(cfg.collect.report_suffix, DEFAULT_REPORT_SUFFIX);
        assert_eq!(
            cfg.csv_file().expect("csv"),
            Path::new("experiments.csv")
        );
    }

    #[test]
    fn reports_all_missing_general_fields() {
        let raw = "general:\n  queue_name: tasks\n";
        let err = Config::from_yaml_str(raw).expect_err("should fail");
        let msg = err.to_string();
        assert!(matches!(err, Error::Configuration(_)));
        assert!(msg.contains("/general/queue_url"), "{}", msg);
        assert!(msg.contains("/general/results_queue_name"), "{}", msg);
        assert_eq!(msg.matches("  - ").count(), 2, "{}", msg);
    }

    #[test]
    fn worker_queue_url_override_wins() {
        let raw = r#"
general: { queue_url: "memory://", queue_name: t, results_queue_name: r }
worker: { cores: 2, queue_url: "spool:///srv/q" }
"#;
        let cfg = Config::from_yaml_str(raw).expect("config");
        assert_eq!(cfg.worker_queue_url(), "spool:///srv/q");
        assert!(cfg.csv_file().is_err());
    }

    #[test]
    fn missing_file_is_configuration_error() {
        let err = Config::load(Path::new("/nonexistent/disexec.yaml")).expect_err("missing");
        assert!(err.is_fatal());
    }
}
