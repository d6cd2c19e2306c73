//! Shared model for disexec: configuration, the parameter matrix, task
//! descriptors, result records and the error taxonomy.

pub mod config;
pub mod error;
pub mod fsutil;
pub mod matrix;
pub mod record;
pub mod task;

pub use config::Config;
pub use error::{Error, Result};
pub use fsutil::{atomic_write_bytes, ensure_dir, sanitize_file_name};
pub use matrix::{Matrix, Row};
pub use record::{
    read_records_csv, typed_value, value_to_cell, write_records_csv, ResultRecord, ID_FIELD,
};
pub use task::{Task, PAYLOAD_PLACEHOLDER};
