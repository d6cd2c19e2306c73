use crate::process::{ProcessInvoker, ProcessOutput};
use crate::report::{ParserKind, ReportParser};
use chrono::{DateTime, Utc};
use disexec_core::config::CollectConfig;
use disexec_core::{ensure_dir, Error, Result, ResultRecord, Task, ID_FIELD, PAYLOAD_PLACEHOLDER};
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Created,
    Prepared,
    Executing,
    Completed,
    Failed,
    Cleaned,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Created => "created",
            Phase::Prepared => "prepared",
            Phase::Executing => "executing",
            Phase::Completed => "completed",
            Phase::Failed => "failed",
            Phase::Cleaned => "cleaned",
        }
    }
}

enum WorkDir {
    Configured(PathBuf),
    /// Removed when dropped, whatever the exit path.
    Scoped(TempDir),
}

impl WorkDir {
    fn path(&self) -> &Path {
        match self {
            WorkDir::Configured(p) => p,
            WorkDir::Scoped(t) => t.path(),
        }
    }
}

/// Extracts result records from a finished run: which scenarios the
/// simulator announced on stdout, where their reports live, and how to parse
/// them.
pub struct Collector {
    announce: Regex,
    report_suffix: String,
    report_dir_key: String,
    parser: Box<dyn ReportParser>,
}

impl Collector {
    pub fn new(
        announce_pattern: &str,
        report_suffix: &str,
        report_dir_key: &str,
        parser: Box<dyn ReportParser>,
    ) -> Result<Self> {
        let announce = Regex::new(announce_pattern)?;
        if announce.captures_len() < 2 {
            return Err(Error::Configuration(format!(
                "announce pattern '{}' needs a capture group for the scenario name",
                announce_pattern
            )));
        }
        Ok(Self {
            announce,
            report_suffix: report_suffix.to_string(),
            report_dir_key: report_dir_key.to_string(),
            parser,
        })
    }

    pub fn from_config(cfg: &CollectConfig) -> Result<Self> {
        let parser = ParserKind::from_name(&cfg.parser)?.build(&cfg.report_suffix);
        Self::new(
            &cfg.announce_pattern,
            &cfg.report_suffix,
            &cfg.report_dir_key,
            parser,
        )
    }

    /// Scenario names announced on stdout, in order of appearance.
    pub fn announced_scenarios(&self, stdout: &str) -> Vec<String> {
        stdout
            .lines()
            .filter_map(|line| {
                let caps = self.announce.captures(line.trim_end())?;
                caps.name("scenario")
                    .or_else(|| caps.get(1))
                    .map(|m| m.as_str().to_string())
            })
            .collect()
    }

    /// Report directory named in the task payload; relative paths resolve
    /// against the command's directory.
    pub fn report_dir(&self, task: &Task, command_dir: &Path) -> PathBuf {
        match task.payload_value(&self.report_dir_key) {
            Some(dir) if !dir.is_empty() => {
                let dir = Path::new(dir);
                if dir.is_absolute() {
                    dir.to_path_buf()
                } else {
                    command_dir.join(dir)
                }
            }
            _ => command_dir.to_path_buf(),
        }
    }

    pub fn report_path(&self, report_dir: &Path, scenario: &str) -> PathBuf {
        report_dir.join(format!("{}{}", scenario, self.report_suffix))
    }
}

/// One execution attempt of a task, walked strictly forward through
/// prepare, execute, collect and clean.
pub struct TaskRun {
    task: Task,
    phase: Phase,
    workdir: Option<WorkDir>,
    payload_path: Option<PathBuf>,
    arguments: Vec<String>,
    started: Option<DateTime<Utc>>,
    finished: Option<DateTime<Utc>>,
    output: Option<ProcessOutput>,
}

impl TaskRun {
    pub fn new(task: Task) -> Self {
        Self {
            task,
            phase: Phase::Created,
            workdir: None,
            payload_path: None,
            arguments: Vec::new(),
            started: None,
            finished: None,
            output: None,
        }
    }

    pub fn task(&self) -> &Task {
        &self.task
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn payload_path(&self) -> Option<&Path> {
        self.payload_path.as_deref()
    }

    pub fn arguments(&self) -> &[String] {
        &self.arguments
    }

    pub fn output(&self) -> Option<&ProcessOutput> {
        self.output.as_ref()
    }

    fn expect_phase(&self, expected: Phase, action: &'static str) -> Result<()> {
        if self.phase == expected {
            Ok(())
        } else {
            Err(Error::InvalidPhase {
                task_id: self.task.id,
                action,
                phase: self.phase.as_str(),
            })
        }
    }

    fn command_dir(&self) -> PathBuf {
        Path::new(&self.task.command)
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn prepare(&mut self) -> Result<()> {
        self.expect_phase(Phase::Created, "prepare")?;
        let workdir = match self.task.payload_folder() {
            Some(folder) => {
                ensure_dir(folder)?;
                WorkDir::Configured(folder.to_path_buf())
            }
            None => WorkDir::Scoped(
                tempfile::Builder::new()
                    .prefix(&format!("disexec-{}-", self.task.id))
                    .tempdir()?,
            ),
        };
        let payload_path = workdir.path().join(self.task.payload_file_name());
        fs::write(&payload_path, self.task.payload.as_bytes())?;

        let resolved = payload_path.to_string_lossy().to_string();
        self.arguments = self
            .task
            .arguments
            .split_whitespace()
            .map(|arg| arg.replace(PAYLOAD_PLACEHOLDER, &resolved))
            .collect();
        self.payload_path = Some(payload_path);
        self.workdir = Some(workdir);
        self.phase = Phase::Prepared;
        Ok(())
    }

    /// Runs the command. A non-zero exit moves the run to `Failed`; it is
    /// an outcome, not an error.
    pub fn execute(&mut self, invoker: &dyn ProcessInvoker) -> Result<&ProcessOutput> {
        self.expect_phase(Phase::Prepared, "execute")?;
        self.phase = Phase::Executing;
        self.started = Some(Utc::now());
        info!(
            task_id = self.task.id,
            command = %self.task.command,
            args = ?self.arguments,
            "running task"
        );
        let result = invoker.invoke(
            Path::new(&self.task.command),
            &self.arguments,
            &self.command_dir(),
        );
        self.finished = Some(Utc::now());
        let output = match result {
            Ok(output) => output,
            Err(e) => {
                self.phase = Phase::Failed;
                return Err(e);
            }
        };
        self.phase = if output.success() {
            Phase::Completed
        } else {
            Phase::Failed
        };
        Ok(&*self.output.insert(output))
    }

    /// Parses every report the run announced and stamps provenance fields.
    pub fn collect(&self, collector: &Collector, worker: &str) -> Result<Vec<ResultRecord>> {
        self.expect_phase(Phase::Completed, "collect")?;
        let stdout = self
            .output
            .as_ref()
            .map(|o| o.stdout.as_str())
            .unwrap_or_default();
        let report_dir = collector.report_dir(&self.task, &self.command_dir());
        let mut records = Vec::new();
        for scenario in collector.announced_scenarios(stdout) {
            let path = collector.report_path(&report_dir, &scenario);
            debug!(task_id = self.task.id, report = %path.display(), "parsing report");
            let mut record = collector.parser.parse(&path)?;
            if record.id().is_none() {
                record.insert(ID_FIELD, scenario.clone());
            }
            self.stamp_provenance(&mut record, worker, &path);
            records.push(record);
        }
        Ok(records)
    }

    fn stamp_provenance(&self, record: &mut ResultRecord, worker: &str, report: &Path) {
        let ts = |t: Option<DateTime<Utc>>| t.map(|t| t.to_rfc3339()).unwrap_or_default();
        record.insert("task_id", self.task.id);
        record.insert("assigned", ts(self.task.assigned));
        record.insert("started", ts(self.started));
        record.insert("finished", ts(self.finished));
        record.insert("worker", worker);
        record.insert(
            "report",
            report
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default(),
        );
    }

    /// Releases the scoped directory, if any. Valid from every phase.
    pub fn clean(&mut self) {
        if let Some(WorkDir::Scoped(dir)) = self.workdir.take() {
            let path = dir.path().to_path_buf();
            if let Err(e) = dir.close() {
                debug!(task_id = self.task.id, dir = %path.display(), error = %e, "temp dir cleanup failed");
            }
        }
        self.phase = Phase::Cleaned;
    }
}

/// Result of running one task to completion.
#[derive(Debug)]
pub struct TaskOutcome {
    pub task_id: u64,
    pub output: ProcessOutput,
    /// Parsed reports after a zero exit. An error here belongs to this run's
    /// results only; the command itself succeeded.
    pub collected: Result<Vec<ResultRecord>>,
}

impl TaskOutcome {
    pub fn success(&self) -> bool {
        self.output.success()
    }

    pub fn failure(&self) -> Option<Error> {
        if self.success() {
            None
        } else {
            Some(Error::ExecutionFailure {
                task_id: self.task_id,
                status: self.output.status_label(),
            })
        }
    }

    pub fn records(&self) -> &[ResultRecord] {
        self.collected.as_deref().unwrap_or_default()
    }
}

/// Full lifecycle of one task. Reports are collected only after a zero
/// exit; cleanup happens on every path. Errors returned here come from
/// prepare or from starting the command.
pub fn run_task(
    task: Task,
    invoker: &dyn ProcessInvoker,
    collector: &Collector,
    worker: &str,
) -> Result<TaskOutcome> {
    let mut run = TaskRun::new(task);
    let result = drive(&mut run, invoker, collector, worker);
    run.clean();
    result
}

fn drive(
    run: &mut TaskRun,
    invoker: &dyn ProcessInvoker,
    collector: &Collector,
    worker: &str,
) -> Result<TaskOutcome> {
    run.prepare()?;
    let output = run.execute(invoker)?.clone();
    let collected = if output.success() {
        run.collect(collector, worker)
    } else {
        Ok(Vec::new())
    };
    Ok(TaskOutcome {
        task_id: run.task().id,
        output,
        collected,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::MessageStatsReportParser;
    use disexec_core::config::{DEFAULT_ANNOUNCE_PATTERN, DEFAULT_REPORT_DIR_KEY, DEFAULT_REPORT_SUFFIX};
    use std::sync::Mutex;

    /// Records what it was asked to run and plays back a canned output.
    struct FakeInvoker {
        output: ProcessOutput,
        calls: Mutex<Vec<(PathBuf, Vec<String>, PathBuf, String)>>,
    }

    impl FakeInvoker {
        fn new(code: i32, stdout: &str) -> Self {
            Self {
                output: ProcessOutput {
                    code: Some(code),
                    stdout: stdout.to_string(),
                    stderr: String::new(),
                    timed_out: false,
                },
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    impl ProcessInvoker for FakeInvoker {
        fn invoke(&self, command: &Path, args: &[String], cwd: &Path) -> Result<ProcessOutput> {
            let payload = args
                .last()
                .map(|p| fs::read_to_string(p).unwrap_or_default())
                .unwrap_or_default();
            self.calls.lock().unwrap().push((
                command.to_path_buf(),
                args.to_vec(),
                cwd.to_path_buf(),
                payload,
            ));
            Ok(self.output.clone())
        }
    }

    fn collector() -> Collector {
        Collector::new(
            DEFAULT_ANNOUNCE_PATTERN,
            DEFAULT_REPORT_SUFFIX,
            DEFAULT_REPORT_DIR_KEY,
            Box::new(MessageStatsReportParser),
        )
        .expect("collector")
    }

    fn task(payload: &str, folder: Option<&Path>) -> Task {
        Task {
            id: 4,
            payload: payload.to_string(),
            payload_folder: folder.map(|p| p.to_string_lossy().to_string()),
            command: "/opt/one/one.sh".to_string(),
            arguments: "-b 1 {edf}".to_string(),
            assigned: Some(Utc::now()),
        }
    }

    #[test]
    fn prepare_writes_payload_and_substitutes_placeholder() {
        let dir = tempfile::tempdir().expect("tempdir");
        let folder = dir.path().join("payloads");
        let mut run = TaskRun::new(task("a=1\nb=2\n", Some(&folder)));
        run.prepare().expect("prepare");
        let payload = folder.join("4.txt");
        assert_eq!(fs::read_to_string(&payload).expect("payload"), "a=1\nb=2\n");
        assert_eq!(
            run.arguments(),
            &["-b".to_string(), "1".to_string(), payload.to_string_lossy().to_string()]
        );
        run.clean();
        assert!(payload.exists(), "configured folders are kept");
    }

    #[test]
    fn scoped_temp_dir_is_removed_after_failure() {
        let invoker = FakeInvoker::new(2, "");
        let mut run = TaskRun::new(task("a=1\n", None));
        run.prepare().expect("prepare");
        let temp_payload = run.payload_path().expect("path").to_path_buf();
        assert!(temp_payload.exists());
        let code = run.execute(&invoker).expect("execute").code;
        assert_eq!(code, Some(2));
        assert_eq!(run.phase(), Phase::Failed);
        assert!(run.collect(&collector(), "w").is_err(), "no collect after failure");
        run.clean();
        assert!(!temp_payload.exists());
        assert_eq!(run.phase(), Phase::Cleaned);
    }

    #[test]
    fn phases_cannot_be_skipped_or_repeated() {
        let invoker = FakeInvoker::new(0, "");
        let mut run = TaskRun::new(task("a=1\n", None));
        assert!(matches!(
            run.execute(&invoker),
            Err(Error::InvalidPhase { action: "execute", .. })
        ));
        run.prepare().expect("prepare");
        assert!(run.prepare().is_err());
        run.execute(&invoker).expect("execute");
        assert!(run.execute(&invoker).is_err());
        run.clean();
    }

    #[test]
    fn run_task_collects_announced_reports_with_provenance() {
        let dir = tempfile::tempdir().expect("tempdir");
        let reports = dir.path().join("reports");
        fs::create_dir_all(&reports).expect("reports");
        for seed in [1, 2] {
            fs::write(
                reports.join(format!("run_{}_MessageStatsReport.txt", seed)),
                format!("Message stats for scenario run_{}\ncreated: {}\n", seed, seed * 10),
            )
            .expect("report");
        }
        let stdout = "ONE v1.6\nRunning simulation 'run_1'\nnoise\nRunning simulation 'run_2'\n";
        let invoker = FakeInvoker::new(0, stdout);
        let payload = format!("Scenario.name=run_%%Seed%%\nReport.reportDir={}\n", reports.display());

        let outcome = run_task(task(&payload, None), &invoker, &collector(), "worker-0").expect("run");
        assert!(outcome.success());
        assert_eq!(outcome.records().len(), 2);
        let first = &outcome.records()[0];
        assert_eq!(first.id(), Some("run_1"));
        assert_eq!(first.get("created"), Some(&serde_json::json!(10)));
        assert_eq!(first.get("task_id"), Some(&serde_json::json!(4)));
        assert_eq!(first.get("worker"), Some(&serde_json::json!("worker-0")));
        assert!(first.get("started").and_then(|v| v.as_str()).map_or(false, |s| !s.is_empty()));

        let calls = invoker.calls.lock().unwrap();
        let (command, _, cwd, payload_seen) = &calls[0];
        assert_eq!(command, Path::new("/opt/one/one.sh"));
        assert_eq!(cwd, Path::new("/opt/one"));
        assert_eq!(payload_seen, &payload);
    }

    #[test]
    fn missing_announced_report_surfaces_file_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let invoker = FakeInvoker::new(0, "Running simulation 'ghost'\n");
        let payload = format!("Report.reportDir={}\n", dir.path().display());
        let outcome = run_task(task(&payload, None), &invoker, &collector(), "w").expect("run");
        assert!(outcome.success());
        assert!(outcome.records().is_empty());
        assert!(matches!(outcome.collected, Err(Error::FileNotFound(_))));
    }

    #[test]
    fn relative_report_dir_resolves_against_command_dir() {
        let c = collector();
        let t = task("Report.reportDir=reports/\n", None);
        assert_eq!(
            c.report_dir(&t, Path::new("/opt/one")),
            PathBuf::from("/opt/one/reports/")
        );
        let bare = task("x=1\n", None);
        assert_eq!(c.report_dir(&bare, Path::new("/opt/one")), PathBuf::from("/opt/one"));
    }

    #[test]
    fn announce_pattern_needs_a_capture_group() {
        let err = Collector::new("^Running", "_r.txt", "k", Box::new(MessageStatsReportParser))
            .err()
            .expect("error");
        assert!(matches!(err, Error::Configuration(_)));
    }
}
