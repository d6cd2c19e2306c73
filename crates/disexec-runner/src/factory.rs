use disexec_core::config::TaskConfig;
use disexec_core::{Config, Error, Matrix, Result, Task};
use tracing::debug;

/// Produces the task descriptors for one run from a parameter matrix.
pub trait TaskCreator {
    fn create_tasks(&self, matrix: &Matrix) -> Result<Vec<Task>>;
}

/// Static part of every task of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSettings {
    pub payload_folder: Option<String>,
    pub command: String,
    pub arguments: String,
}

impl TaskSettings {
    pub fn from_config(task: &TaskConfig) -> Result<Self> {
        let mut missing = Vec::new();
        let command = task.command.clone().filter(|c| !c.trim().is_empty());
        if command.is_none() {
            missing.push("/task/command");
        }
        if task.arguments.is_none() {
            missing.push("/task/arguments");
        }
        match (command, task.arguments.clone()) {
            (Some(command), Some(arguments)) => Ok(Self {
                payload_folder: task
                    .payload_folder
                    .clone()
                    .filter(|f| !f.trim().is_empty()),
                command,
                arguments,
            }),
            _ => Err(Error::Configuration(format!(
                "task configuration missing: {}",
                missing.join(", ")
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskCreatorKind {
    /// One task per row; the row becomes `name=value` payload lines.
    ParamsInExternalFile,
}

impl TaskCreatorKind {
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "params_in_external_file" | "ParamsInExternalFileCreator" => {
                Ok(Self::ParamsInExternalFile)
            }
            other => Err(Error::Configuration(format!(
                "unknown task creator '{}': expected params_in_external_file",
                other
            ))),
        }
    }

    pub fn build(self, settings: TaskSettings) -> Box<dyn TaskCreator> {
        match self {
            Self::ParamsInExternalFile => Box::new(ParamsInExternalFile { settings }),
        }
    }
}

pub struct ParamsInExternalFile {
    settings: TaskSettings,
}

impl ParamsInExternalFile {
    pub fn new(settings: TaskSettings) -> Self {
        Self { settings }
    }
}

impl TaskCreator for ParamsInExternalFile {
    fn create_tasks(&self, matrix: &Matrix) -> Result<Vec<Task>> {
        let tasks: Vec<Task> = matrix
            .rows()
            .map(|row| Task {
                id: row.index() as u64,
                payload: row
                    .iter()
                    .map(|(name, value)| format!("{}={}\n", name, value))
                    .collect(),
                payload_folder: self.settings.payload_folder.clone(),
                command: self.settings.command.clone(),
                arguments: self.settings.arguments.clone(),
                assigned: None,
            })
            .collect();
        debug!(count = tasks.len(), "created tasks from matrix");
        Ok(tasks)
    }
}

/// Resolves the configured creator and runs it over `matrix`.
pub fn create_tasks(config: &Config, matrix: &Matrix) -> Result<Vec<Task>> {
    let kind = TaskCreatorKind::from_name(&config.coordinator.task_creator)?;
    let settings = TaskSettings::from_config(&config.task)?;
    kind.build(settings).create_tasks(matrix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::path::Path;

    fn settings() -> TaskSettings {
        TaskSettings {
            payload_folder: None,
            command: "/opt/one/one.sh".to_string(),
            arguments: "-b 1 {edf}".to_string(),
        }
    }

    fn matrix(text: &str) -> Matrix {
        Matrix::from_reader(text.as_bytes(), Path::new("m.csv")).expect("matrix")
    }

    #[test]
    fn payload_has_one_line_per_column_in_header_order() {
        let m = matrix("Scenario.name,Group.router,Seed\nrun_%%Seed%%,Epidemic,1\nrun_%%Seed%%,Prophet,2\n");
        let tasks = ParamsInExternalFile::new(settings())
            .create_tasks(&m)
            .expect("tasks");
        assert_eq!(tasks.len(), 2);
        for task in &tasks {
            let keys: Vec<&str> = task
                .payload
                .lines()
                .map(|l| l.split_once('=').expect("pair").0)
                .collect();
            assert_eq!(keys, vec!["Scenario.name", "Group.router", "Seed"]);
        }
        assert_eq!(
            tasks[1].payload,
            "Scenario.name=run_%%Seed%%\nGroup.router=Prophet\nSeed=2\n"
        );
        assert_eq!(tasks[0].command, "/opt/one/one.sh");
        assert_eq!(tasks[0].arguments, "-b 1 {edf}");
    }

    #[test]
    fn ids_are_unique_and_contiguous_from_zero() {
        let mut text = String::from("a\n");
        for i in 0..25 {
            text.push_str(&format!("{}\n", i));
        }
        let tasks = ParamsInExternalFile::new(settings())
            .create_tasks(&matrix(&text))
            .expect("tasks");
        let ids: BTreeSet<u64> = tasks.iter().map(|t| t.id).collect();
        assert_eq!(ids.len(), 25);
        assert_eq!(ids.into_iter().collect::<Vec<_>>(), (0..25).collect::<Vec<_>>());
    }

    #[test]
    fn missing_command_and_arguments_are_reported_together() {
        let err = TaskSettings::from_config(&TaskConfig::default()).expect_err("missing");
        let msg = err.to_string();
        assert!(matches!(err, Error::Configuration(_)));
        assert!(msg.contains("/task/command") && msg.contains("/task/arguments"), "{}", msg);
    }

    #[test]
    fn empty_payload_folder_means_scoped_temp_dir() {
        let cfg = TaskConfig {
            payload_folder: Some("  ".to_string()),
            command: Some("sim".to_string()),
            arguments: Some(String::new()),
        };
        let settings = TaskSettings::from_config(&cfg).expect("settings");
        assert_eq!(settings.payload_folder, None);
        assert_eq!(settings.arguments, "");
    }

    #[test]
    fn creator_registry_rejects_unknown_names() {
        assert!(TaskCreatorKind::from_name("params_in_external_file").is_ok());
        assert!(matches!(
            TaskCreatorKind::from_name("os.system"),
            Err(Error::Configuration(_))
        ));
    }
}
