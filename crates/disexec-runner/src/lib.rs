//! Execution side of disexec: turning matrix rows into tasks, moving them
//! through a work queue, running each one as an external process and
//! publishing the parsed reports.

pub mod factory;
pub mod lifecycle;
pub mod pool;
pub mod process;
pub mod queue;
pub mod report;

pub use factory::{create_tasks, ParamsInExternalFile, TaskCreator, TaskCreatorKind, TaskSettings};
pub use lifecycle::{run_task, Collector, Phase, TaskOutcome, TaskRun};
pub use pool::{
    publish_tasks, PoolReport, StepOutcome, Worker, WorkerContext, WorkerPool, WorkerReport,
};
pub use process::{ProcessInvoker, ProcessOutput, SystemProcess};
pub use queue::{
    drain_records, open_queue, Delivery, DrainMode, MemoryQueue, SpoolQueue, WorkQueue,
};
pub use report::{ParserKind, ReportParser};
