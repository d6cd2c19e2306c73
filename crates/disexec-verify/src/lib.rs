//! Reconciliation of collected results against the parameter matrix they
//! were produced from.

pub mod local;
pub mod reconcile;
pub mod template;

pub use local::{check_local, LocalRowCheck, ReportPresence};
pub use reconcile::{
    reconcile, ReconcileOptions, Reconciliation, RowVerdict, Status, RERUN_FILE,
};
pub use template::{expand, Expansion, Segment, SCENARIO_COLUMN};
