use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use disexec_core::config::DEFAULT_CONFIG_FILE;
use disexec_core::{write_records_csv, Config, Matrix, ResultRecord};
use disexec_runner::{
    create_tasks, drain_records, open_queue, publish_tasks, Collector, DrainMode, MemoryQueue,
    PoolReport, SystemProcess, WorkQueue, WorkerContext, WorkerPool,
};
use disexec_verify::{
    check_local, reconcile, ReconcileOptions, Reconciliation, Status, RERUN_FILE, SCENARIO_COLUMN,
};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(
    name = "disexec",
    version,
    about = "Distribute a parameter matrix of simulation runs over a work queue"
)]
struct Cli {
    /// Configuration file.
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,
    /// Print a JSON summary on stdout instead of text.
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Turn every matrix row into a task on the work queue.
    Publish {
        /// Matrix to publish instead of coordinator.csv_file.
        #[arg(long)]
        csv: Option<PathBuf>,
    },
    /// Run a worker pool until the work queue is empty.
    Work {
        #[arg(short, long)]
        workers: Option<usize>,
    },
    /// Publish, work and collect in one process over an in-memory queue.
    RunLocal {
        #[arg(long)]
        csv: Option<PathBuf>,
        #[arg(short, long)]
        workers: Option<usize>,
        #[arg(short, long, default_value = "results.csv")]
        output: PathBuf,
    },
    /// Write the results queue to a CSV file.
    Collect {
        #[arg(short, long, default_value = "results.csv")]
        output: PathBuf,
        /// Acknowledge the messages, removing them from the queue.
        #[arg(long)]
        delete: bool,
    },
    /// Reconcile collected results against the matrix and write the rerun matrix.
    Verify {
        #[arg(long)]
        csv: Option<PathBuf>,
        /// Expected results per row.
        #[arg(short, long, default_value_t = 1)]
        results: usize,
        /// Placeholders to match with any value, e.g. a seed.
        #[arg(short, long, num_args = 1..)]
        ignore: Vec<String>,
        /// Column overriding the expected results per row.
        #[arg(long)]
        results_column: Option<String>,
        /// Read records from a results CSV instead of the results queue.
        #[arg(long)]
        from_csv: Option<PathBuf>,
        #[arg(long, default_value = RERUN_FILE)]
        rerun: PathBuf,
        /// Directory for the records of REPEATED rows.
        #[arg(long, default_value = ".")]
        side_dir: PathBuf,
    },
    /// Check that every expected report exists under a local directory.
    CheckLocal {
        #[arg(long)]
        csv: Option<PathBuf>,
        #[arg(long)]
        reports: PathBuf,
    },
    /// Move unacknowledged messages of a spool queue back to ready.
    Recover {
        /// Queue to recover; defaults to both the work and results queues.
        #[arg(long)]
        queue: Option<String>,
    },
}

fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    let json_mode = cli.json;
    match run_command(&cli.config, cli.command, json_mode) {
        Ok(Some(payload)) => emit_json(&payload),
        Ok(None) => Ok(()),
        Err(err) if json_mode => {
            emit_json(&error_payload(&err))?;
            std::process::exit(1);
        }
        Err(err) => Err(err),
    }
}

/// Logs go to stderr; `RUST_LOG` overrides the default filter.
fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn,disexec=info"));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn run_command(config_path: &Path, command: Commands, json: bool) -> Result<Option<Value>> {
    let config = Config::load(config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    match command {
        Commands::Publish { csv } => {
            let matrix = load_matrix(&config, csv.as_deref())?;
            let tasks = create_tasks(&config, &matrix)?;
            let queue = open_queue(&config.general.queue_url)?;
            let published = publish_tasks(queue.as_ref(), &config.general.queue_name, tasks)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "publish",
                    "queue": config.general.queue_name,
                    "published": published,
                })));
            }
            println!("published: {}", published);
        }
        Commands::Work { workers } => {
            let queue = open_queue(config.worker_queue_url())?;
            let report = run_pool(&config, queue, workers)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "work",
                    "pool": serde_json::to_value(&report)?,
                })));
            }
            print_pool(&report);
        }
        Commands::RunLocal {
            csv,
            workers,
            output,
        } => {
            let matrix = load_matrix(&config, csv.as_deref())?;
            let tasks = create_tasks(&config, &matrix)?;
            let queue: Arc<dyn WorkQueue> = Arc::new(MemoryQueue::new());
            publish_tasks(queue.as_ref(), &config.general.queue_name, tasks)?;
            let report = run_pool(&config, queue.clone(), workers)?;
            let records = drain_records(
                queue.as_ref(),
                &config.general.results_queue_name,
                DrainMode::Retire,
            )?;
            write_records_csv(&records, &output)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "run-local",
                    "pool": serde_json::to_value(&report)?,
                    "records": records.len(),
                    "output": output.display().to_string(),
                })));
            }
            print_pool(&report);
            println!("records: {}", records.len());
            println!("output: {}", output.display());
        }
        Commands::Collect { output, delete } => {
            let queue = open_queue(config.worker_queue_url())?;
            let mode = if delete {
                DrainMode::Retire
            } else {
                DrainMode::Peek
            };
            let records = drain_records(queue.as_ref(), &config.general.results_queue_name, mode)?;
            write_records_csv(&records, &output)?;
            info!(records = records.len(), output = %output.display(), "collected results");
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "collect",
                    "records": records.len(),
                    "deleted": delete,
                    "output": output.display().to_string(),
                })));
            }
            println!("records: {}", records.len());
            println!("output: {}", output.display());
        }
        Commands::Verify {
            csv,
            results,
            ignore,
            results_column,
            from_csv,
            rerun,
            side_dir,
        } => {
            let matrix = load_matrix(&config, csv.as_deref())?;
            let records = load_records(&config, from_csv.as_deref())?;
            let options = ReconcileOptions {
                repetitions: results,
                repetitions_column: results_column,
                ignore: ignore.into_iter().collect(),
                scenario_column: SCENARIO_COLUMN.to_string(),
                side_dir,
            };
            let outcome = reconcile(&matrix, &records, &options)?;
            let rerun_written = outcome.write_rerun(&rerun)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "verify",
                    "records": records.len(),
                    "summary": verify_summary(&outcome),
                    "rows": serde_json::to_value(&outcome.verdicts)?,
                    "rerun": rerun_written.then(|| rerun.display().to_string()),
                })));
            }
            for verdict in outcome.verdicts.iter().filter(|v| !v.status.is_complete()) {
                println!("{} {}", verdict.scenario, verdict.status);
            }
            let summary = verify_summary(&outcome);
            println!(
                "complete: {} / {}",
                summary["complete"],
                outcome.verdicts.len()
            );
            if rerun_written {
                println!("rerun: {}", rerun.display());
            }
        }
        Commands::CheckLocal { csv, reports } => {
            let matrix = load_matrix(&config, csv.as_deref())?;
            let checks = check_local(
                &matrix,
                &reports,
                &config.collect.report_suffix,
                SCENARIO_COLUMN,
            )?;
            let missing: usize = checks.iter().map(|c| c.missing().count()).sum();
            if json {
                return Ok(Some(json!({
                    "ok": missing == 0,
                    "command": "check-local",
                    "missing": missing,
                    "rows": serde_json::to_value(&checks)?,
                })));
            }
            for check in &checks {
                for report in &check.reports {
                    match &report.path {
                        Some(path) => println!("{} FOUND {}", report.scenario, path.display()),
                        None => println!("{} MISSING", report.scenario),
                    }
                }
            }
            println!("missing: {}", missing);
        }
        Commands::Recover { queue } => {
            let transport = open_queue(config.worker_queue_url())?;
            let names = match queue {
                Some(name) => vec![name],
                None => vec![
                    config.general.queue_name.clone(),
                    config.general.results_queue_name.clone(),
                ],
            };
            let mut recovered = serde_json::Map::new();
            for name in names {
                let n = transport.recover(&name)?;
                if !json {
                    println!("{}: {}", name, n);
                }
                recovered.insert(name, json!(n));
            }
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "recover",
                    "recovered": recovered,
                })));
            }
        }
    }
    Ok(None)
}

fn load_matrix(config: &Config, csv: Option<&Path>) -> Result<Matrix> {
    let path = match csv {
        Some(path) => path,
        None => config.csv_file()?,
    };
    Matrix::load(path).with_context(|| format!("loading matrix {}", path.display()))
}

fn load_records(config: &Config, from_csv: Option<&Path>) -> Result<Vec<ResultRecord>> {
    if let Some(path) = from_csv {
        return disexec_core::read_records_csv(path)
            .with_context(|| format!("reading results {}", path.display()));
    }
    let queue = open_queue(config.worker_queue_url())?;
    Ok(drain_records(
        queue.as_ref(),
        &config.general.results_queue_name,
        DrainMode::Peek,
    )?)
}

fn run_pool(config: &Config, queue: Arc<dyn WorkQueue>, workers: Option<usize>) -> Result<PoolReport> {
    let size = workers.unwrap_or(config.worker.cores);
    if size == 0 {
        bail!("worker count must be at least 1");
    }
    let ctx = WorkerContext {
        queue,
        work_queue: config.general.queue_name.clone(),
        results_queue: config.general.results_queue_name.clone(),
        invoker: Arc::new(SystemProcess::new(
            config.worker.timeout_seconds.map(Duration::from_secs),
        )),
        collector: Arc::new(Collector::from_config(&config.collect)?),
    };
    Ok(WorkerPool::new(ctx, size).run()?)
}

fn verify_summary(outcome: &Reconciliation) -> Value {
    json!({
        "complete": outcome.count(|s| matches!(s, Status::Complete)),
        "incomplete": outcome.count(|s| matches!(s, Status::Incomplete { .. })),
        "nonexec": outcome.count(|s| matches!(s, Status::Nonexec)),
        "repeated": outcome.count(|s| matches!(s, Status::Repeated)),
        "rerun_rows": outcome.rerun.len(),
    })
}

fn print_pool(report: &PoolReport) {
    for worker in &report.workers {
        println!(
            "{}: completed={} requeued={} discarded={} uncollected={} published={}",
            worker.worker,
            worker.completed.len(),
            worker.requeued,
            worker.discarded,
            worker.uncollected,
            worker.published
        );
    }
    println!("acked: {}", report.acked());
    println!("requeued: {}", report.requeued());
    println!("uncollected: {}", report.uncollected());
    println!("published: {}", report.published());
}

fn emit_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}

/// JSON form of a failed command: the outer message and each cause below it.
fn error_payload(err: &anyhow::Error) -> Value {
    let causes: Vec<String> = err.chain().skip(1).map(ToString::to_string).collect();
    json!({
        "ok": false,
        "error": err.to_string(),
        "causes": causes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn verify_flags_parse() {
        let cli = Cli::try_parse_from([
            "disexec",
            "-c",
            "cfg.yaml",
            "verify",
            "-r",
            "3",
            "-i",
            "Seed",
            "Movement.rngSeed",
            "--json",
        ])
        .expect("parse");
        assert_eq!(cli.config, PathBuf::from("cfg.yaml"));
        assert!(cli.json);
        match cli.command {
            Commands::Verify {
                results,
                ignore,
                rerun,
                ..
            } => {
                assert_eq!(results, 3);
                assert_eq!(ignore, vec!["Seed", "Movement.rngSeed"]);
                assert_eq!(rerun, PathBuf::from(RERUN_FILE));
            }
            _ => panic!("expected verify"),
        }
    }

    #[test]
    fn error_payload_lists_causes_in_order() {
        let err = anyhow::anyhow!("file missing")
            .context("loading matrix")
            .context("verify failed");
        let payload = error_payload(&err);
        assert_eq!(payload["ok"], json!(false));
        assert_eq!(payload["error"], json!("verify failed"));
        assert_eq!(payload["causes"], json!(["loading matrix", "file missing"]));
    }

    #[test]
    fn config_defaults_to_local_file() {
        let cli = Cli::try_parse_from(["disexec", "collect", "--delete"]).expect("parse");
        assert_eq!(cli.config, PathBuf::from(DEFAULT_CONFIG_FILE));
        assert!(matches!(cli.command, Commands::Collect { delete: true, .. }));
    }
}
