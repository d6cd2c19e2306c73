use crate::lifecycle::{run_task, Collector};
use crate::process::{ProcessInvoker, ProcessOutput};
use crate::queue::{Delivery, WorkQueue};
use chrono::Utc;
use disexec_core::{Error, Result, Task};
use serde::Serialize;
use std::sync::Arc;
use std::thread;
use tracing::{debug, error, info, warn};

/// Coordinator side: declares `queue` durable and publishes one message per
/// task, stamping `assigned` on the way out. Returns the published count.
pub fn publish_tasks(transport: &dyn WorkQueue, queue: &str, tasks: Vec<Task>) -> Result<usize> {
    transport.declare(queue, true)?;
    let mut published = 0;
    for task in tasks {
        let task = task.stamp_assigned(Utc::now());
        transport.publish(queue, &task.to_json_bytes()?)?;
        debug!(queue, task_id = task.id, "published task");
        published += 1;
    }
    info!(queue, count = published, "tasks published");
    Ok(published)
}

/// What a single worker step did with the message it pulled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// The work queue was empty.
    Idle,
    /// Results published and the message acknowledged.
    Completed { task_id: u64, published: usize },
    /// The message went back to the queue.
    Requeued { task_id: u64 },
    /// The message was not a task and was dropped.
    Discarded,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerReport {
    pub worker: String,
    pub completed: Vec<u64>,
    pub requeued: usize,
    pub discarded: usize,
    /// Acked tasks whose reports could not be collected.
    pub uncollected: usize,
    pub published: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolReport {
    pub workers: Vec<WorkerReport>,
}

impl PoolReport {
    pub fn completed_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self
            .workers
            .iter()
            .flat_map(|w| w.completed.iter().copied())
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn acked(&self) -> usize {
        self.workers.iter().map(|w| w.completed.len()).sum()
    }

    pub fn requeued(&self) -> usize {
        self.workers.iter().map(|w| w.requeued).sum()
    }

    pub fn published(&self) -> usize {
        self.workers.iter().map(|w| w.published).sum()
    }

    pub fn uncollected(&self) -> usize {
        self.workers.iter().map(|w| w.uncollected).sum()
    }
}

/// Shared, read-only context every worker of a pool runs with.
#[derive(Clone)]
pub struct WorkerContext {
    pub queue: Arc<dyn WorkQueue>,
    pub work_queue: String,
    pub results_queue: String,
    pub invoker: Arc<dyn ProcessInvoker>,
    pub collector: Arc<Collector>,
}

pub struct Worker {
    name: String,
    ctx: WorkerContext,
    report: WorkerReport,
}

impl Worker {
    pub fn new(name: impl Into<String>, ctx: WorkerContext) -> Self {
        let name = name.into();
        Self {
            report: WorkerReport {
                worker: name.clone(),
                ..WorkerReport::default()
            },
            name,
            ctx,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Pulls at most one message and settles it. Only queue and
    /// configuration failures are returned as errors. A task that fails
    /// before or while running is nacked; one that exits 0 but leaves no
    /// usable report is acked with nothing published.
    pub fn step(&mut self) -> Result<StepOutcome> {
        let Some(delivery) = self.ctx.queue.pull(&self.ctx.work_queue)? else {
            return Ok(StepOutcome::Idle);
        };
        let task = match Task::from_json_slice(delivery.body()) {
            Ok(task) => task,
            Err(e) => {
                error!(worker = %self.name, tag = delivery.tag(), error = %e, "discarding malformed task message");
                self.ctx.queue.ack(delivery)?;
                self.report.discarded += 1;
                return Ok(StepOutcome::Discarded);
            }
        };
        let task_id = task.id;
        info!(worker = %self.name, task_id, redeliveries = delivery.redeliveries(), "got a task");

        let outcome = match run_task(task, self.ctx.invoker.as_ref(), &self.ctx.collector, &self.name) {
            Ok(outcome) => outcome,
            Err(e) if e.is_fatal() => return Err(self.abandon(delivery, e)),
            Err(e) => {
                error!(worker = %self.name, task_id, error = %e, "task processing failed");
                return self.requeue(delivery, task_id);
            }
        };

        if let Some(failure) = outcome.failure() {
            warn!(worker = %self.name, task_id, %failure, "unexpected exit status");
            self.log_output(task_id, &outcome.output);
            return self.requeue(delivery, task_id);
        }

        let records = match outcome.collected {
            Ok(records) => records,
            Err(e) => {
                error!(worker = %self.name, task_id, error = %e, "collecting results failed, nothing published");
                self.log_output(task_id, &outcome.output);
                self.ctx.queue.ack(delivery)?;
                self.report.completed.push(task_id);
                self.report.uncollected += 1;
                return Ok(StepOutcome::Completed { task_id, published: 0 });
            }
        };

        debug!(worker = %self.name, task_id, records = records.len(), "task execution finished");
        // Publish before ack: a crash in between duplicates records, which
        // reconciliation reports, instead of losing them.
        for record in &records {
            let body = record.to_json_bytes()?;
            if let Err(e) = self.ctx.queue.publish(&self.ctx.results_queue, &body) {
                return Err(self.abandon(delivery, e));
            }
        }
        self.ctx.queue.ack(delivery)?;
        let published = records.len();
        self.report.completed.push(task_id);
        self.report.published += published;
        debug!(worker = %self.name, task_id, "task successfully completed");
        Ok(StepOutcome::Completed { task_id, published })
    }

    fn log_output(&self, task_id: u64, output: &ProcessOutput) {
        if !output.stdout.is_empty() {
            error!(worker = %self.name, task_id, "STDOUT: {}", output.stdout);
        }
        if !output.stderr.is_empty() {
            error!(worker = %self.name, task_id, "STDERR: {}", output.stderr);
        }
    }

    fn requeue(&mut self, delivery: Delivery, task_id: u64) -> Result<StepOutcome> {
        self.ctx.queue.nack(delivery)?;
        self.report.requeued += 1;
        Ok(StepOutcome::Requeued { task_id })
    }

    /// Hands the message back before the worker gives up with `cause`.
    fn abandon(&self, delivery: Delivery, cause: Error) -> Error {
        let tag = delivery.tag().to_string();
        if let Err(e) = self.ctx.queue.nack(delivery) {
            error!(worker = %self.name, tag, error = %e, "nack failed while aborting");
        }
        cause
    }

    /// Steps until the work queue is empty.
    pub fn run(mut self) -> Result<WorkerReport> {
        info!(worker = %self.name, "waiting for tasks");
        loop {
            if self.step()? == StepOutcome::Idle {
                info!(worker = %self.name, "nothing else to do, exiting");
                return Ok(self.report);
            }
        }
    }

    pub fn report(&self) -> &WorkerReport {
        &self.report
    }
}

/// N independent workers racing on one work queue. The pool is done when
/// every worker has seen the queue empty.
pub struct WorkerPool {
    ctx: WorkerContext,
    size: usize,
}

impl WorkerPool {
    pub fn new(ctx: WorkerContext, size: usize) -> Self {
        Self {
            ctx,
            size: size.max(1),
        }
    }

    pub fn run(&self) -> Result<PoolReport> {
        self.ctx.queue.declare(&self.ctx.work_queue, true)?;
        self.ctx.queue.declare(&self.ctx.results_queue, true)?;

        let mut handles = Vec::with_capacity(self.size);
        for i in 0..self.size {
            let name = format!("worker-{}", i);
            let worker = Worker::new(name.clone(), self.ctx.clone());
            let handle = thread::Builder::new()
                .name(name.clone())
                .spawn(move || worker.run())?;
            handles.push((name, handle));
        }

        let mut report = PoolReport::default();
        let mut first_error = None;
        for (name, handle) in handles {
            match handle.join() {
                Ok(Ok(worker_report)) => report.workers.push(worker_report),
                Ok(Err(e)) => {
                    error!(worker = %name, error = %e, "worker aborted");
                    first_error.get_or_insert(e);
                }
                Err(_) => {
                    first_error.get_or_insert(Error::WorkerPanicked(name));
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }
        info!(
            acked = report.acked(),
            requeued = report.requeued(),
            uncollected = report.uncollected(),
            published = report.published(),
            "worker pool finished"
        );
        Ok(report)
    }
}
