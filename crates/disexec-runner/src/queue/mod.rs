//! At-least-once queue adapter. The worker loop and the result drain talk to
//! [`WorkQueue`]; transports plug in underneath.

mod memory;
mod spool;

pub use memory::MemoryQueue;
pub use spool::SpoolQueue;

use disexec_core::{Error, Result, ResultRecord};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};

/// One message handed out by [`WorkQueue::pull`]. It must be given back to
/// exactly one of [`WorkQueue::ack`] or [`WorkQueue::nack`]; both take it by
/// value.
#[derive(Debug)]
pub struct Delivery {
    queue: String,
    tag: String,
    body: Vec<u8>,
    redeliveries: u32,
}

impl Delivery {
    pub(crate) fn new(queue: &str, tag: String, body: Vec<u8>, redeliveries: u32) -> Self {
        Self {
            queue: queue.to_string(),
            tag,
            body,
            redeliveries,
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// How many times this message was negatively acknowledged before.
    pub fn redeliveries(&self) -> u32 {
        self.redeliveries
    }
}

pub trait WorkQueue: Send + Sync {
    fn declare(&self, queue: &str, durable: bool) -> Result<()>;
    fn publish(&self, queue: &str, body: &[u8]) -> Result<()>;
    /// Claims the oldest ready message, or `None` once the queue is drained.
    fn pull(&self, queue: &str) -> Result<Option<Delivery>>;
    fn ack(&self, delivery: Delivery) -> Result<()>;
    /// Returns the message to the queue for redelivery.
    fn nack(&self, delivery: Delivery) -> Result<()>;
    /// Makes every unacknowledged message of `queue` deliverable again.
    fn recover(&self, _queue: &str) -> Result<usize> {
        Ok(0)
    }
}

/// Resolves a queue URL to a transport: `memory://`, `spool://<dir>` or a
/// bare directory path.
pub fn open_queue(url: &str) -> Result<Arc<dyn WorkQueue>> {
    if url == "memory://" || url == "memory" {
        return Ok(Arc::new(MemoryQueue::new()));
    }
    if let Some(path) = url.strip_prefix("spool://") {
        return Ok(Arc::new(SpoolQueue::open(PathBuf::from(path))?));
    }
    if url.contains("://") {
        return Err(Error::Configuration(format!(
            "unsupported queue url '{}': expected memory:// or spool://<dir>",
            url
        )));
    }
    Ok(Arc::new(SpoolQueue::open(PathBuf::from(url))?))
}

/// How a consumer treats the messages it reads from the results queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainMode {
    /// Read everything, then hand every message back.
    Peek,
    /// Acknowledge each record as it is read, removing it permanently.
    Retire,
}

/// Reads every result record currently in `queue`. Messages that do not
/// parse, or parse to an empty object, are skipped and always returned to
/// the queue.
pub fn drain_records(
    transport: &dyn WorkQueue,
    queue: &str,
    mode: DrainMode,
) -> Result<Vec<ResultRecord>> {
    transport.declare(queue, true)?;
    let mut records = Vec::new();
    let mut held = Vec::new();
    while let Some(delivery) = transport.pull(queue)? {
        match ResultRecord::from_json_slice(delivery.body()) {
            Ok(record) if !record.is_empty() => {
                records.push(record);
                match mode {
                    DrainMode::Retire => transport.ack(delivery)?,
                    DrainMode::Peek => held.push(delivery),
                }
            }
            Ok(_) => held.push(delivery),
            Err(e) => {
                warn!(queue, tag = delivery.tag(), error = %e, "skipping malformed result message");
                held.push(delivery);
            }
        }
    }
    for delivery in held {
        transport.nack(delivery)?;
    }
    debug!(queue, count = records.len(), ?mode, "drained result records");
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str) -> Vec<u8> {
        let mut r = ResultRecord::new();
        r.insert("id", id);
        r.to_json_bytes().expect("json")
    }

    #[test]
    fn peek_leaves_records_in_place() {
        let q = MemoryQueue::new();
        q.declare("results", true).unwrap();
        q.publish("results", &record("a")).unwrap();
        q.publish("results", &record("b")).unwrap();
        q.publish("results", b"{}").unwrap();

        let first = drain_records(&q, "results", DrainMode::Peek).expect("peek");
        assert_eq!(first.len(), 2);
        let second = drain_records(&q, "results", DrainMode::Peek).expect("peek again");
        assert_eq!(second, first);
        assert_eq!(q.ready_len("results"), 3);
    }

    #[test]
    fn retire_removes_parsed_records_but_keeps_garbage() {
        let q = MemoryQueue::new();
        q.declare("results", true).unwrap();
        q.publish("results", &record("a")).unwrap();
        q.publish("results", b"not json").unwrap();

        let got = drain_records(&q, "results", DrainMode::Retire).expect("retire");
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].id(), Some("a"));
        assert_eq!(q.ready_len("results"), 1);
    }

    #[test]
    fn unknown_scheme_is_configuration_error() {
        let err = open_queue("amqp://guest@localhost").err().expect("error");
        assert!(matches!(err, Error::Configuration(_)));
        assert!(open_queue("memory://").is_ok());
    }
}
