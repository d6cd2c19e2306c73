use super::{Delivery, WorkQueue};
use chrono::Utc;
use disexec_core::{atomic_write_bytes, ensure_dir, sanitize_file_name, Error, Result};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

const READY: &str = "ready";
const INFLIGHT: &str = "inflight";
const MESSAGE_EXT: &str = "msg";

static SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Durable filesystem transport shared by any number of processes on the
/// same filesystem.
///
/// Layout: `<root>/<queue>/ready/*.msg` and `<root>/<queue>/inflight/*.msg`.
/// A pull claims a message by renaming it into `inflight/`; rename is atomic,
/// so exactly one claimant wins. Names sort in publish order and encode the
/// redelivery count: `<micros>-<pid>-<seq>-r<redeliveries>.msg`.
#[derive(Debug, Clone)]
pub struct SpoolQueue {
    root: PathBuf,
}

impl SpoolQueue {
    pub fn open(root: PathBuf) -> Result<Self> {
        ensure_dir(&root).map_err(|e| {
            Error::QueueUnavailable(format!("spool root {}: {}", root.display(), e))
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn queue_dir(&self, queue: &str) -> Result<PathBuf> {
        if queue.is_empty() || sanitize_file_name(queue) != queue {
            return Err(Error::Configuration(format!(
                "invalid queue name '{}': use [A-Za-z0-9._-]",
                queue
            )));
        }
        Ok(self.root.join(queue))
    }

    fn declared_dir(&self, queue: &str, sub: &str) -> Result<PathBuf> {
        let dir = self.queue_dir(queue)?.join(sub);
        if !dir.is_dir() {
            return Err(Error::QueueUnavailable(format!(
                "queue '{}' is not declared under {}",
                queue,
                self.root.display()
            )));
        }
        Ok(dir)
    }

    fn ready_names(&self, queue: &str) -> Result<Vec<String>> {
        let dir = self.declared_dir(queue, READY)?;
        list_messages(&dir)
    }

    pub fn ready_len(&self, queue: &str) -> Result<usize> {
        Ok(self.ready_names(queue)?.len())
    }

    pub fn inflight_len(&self, queue: &str) -> Result<usize> {
        let dir = self.declared_dir(queue, INFLIGHT)?;
        Ok(list_messages(&dir)?.len())
    }
}

fn list_messages(dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        // Temp files from in-progress atomic writes start with a dot.
        if name.starts_with('.') || !name.ends_with(MESSAGE_EXT) {
            continue;
        }
        names.push(name);
    }
    names.sort();
    Ok(names)
}

fn message_name(redeliveries: u32) -> String {
    format!(
        "{:020}-{:010}-{:010}-r{}.{}",
        Utc::now().timestamp_micros().max(0),
        std::process::id(),
        SEQUENCE.fetch_add(1, Ordering::Relaxed),
        redeliveries,
        MESSAGE_EXT
    )
}

fn redeliveries_of(name: &str) -> u32 {
    name.trim_end_matches(MESSAGE_EXT)
        .trim_end_matches('.')
        .rsplit_once("-r")
        .and_then(|(_, n)| n.parse().ok())
        .unwrap_or(0)
}

impl WorkQueue for SpoolQueue {
    fn declare(&self, queue: &str, durable: bool) -> Result<()> {
        let dir = self.queue_dir(queue)?;
        for sub in [READY, INFLIGHT] {
            ensure_dir(&dir.join(sub)).map_err(|e| {
                Error::QueueUnavailable(format!("declare {}: {}", dir.display(), e))
            })?;
        }
        if !durable {
            debug!(queue, "spool queues are always durable");
        }
        Ok(())
    }

    fn publish(&self, queue: &str, body: &[u8]) -> Result<()> {
        let dir = self.declared_dir(queue, READY)?;
        atomic_write_bytes(&dir.join(message_name(0)), body)
    }

    fn pull(&self, queue: &str) -> Result<Option<Delivery>> {
        let ready = self.declared_dir(queue, READY)?;
        let inflight = self.declared_dir(queue, INFLIGHT)?;
        for name in list_messages(&ready)? {
            let claimed = inflight.join(&name);
            match fs::rename(ready.join(&name), &claimed) {
                Ok(()) => {
                    let body = fs::read(&claimed)?;
                    let redeliveries = redeliveries_of(&name);
                    return Ok(Some(Delivery::new(queue, name, body, redeliveries)));
                }
                // Another consumer claimed it first.
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(None)
    }

    fn ack(&self, delivery: Delivery) -> Result<()> {
        let inflight = self.declared_dir(delivery.queue(), INFLIGHT)?;
        fs::remove_file(inflight.join(delivery.tag()))?;
        Ok(())
    }

    fn nack(&self, delivery: Delivery) -> Result<()> {
        let inflight = self.declared_dir(delivery.queue(), INFLIGHT)?;
        let ready = self.declared_dir(delivery.queue(), READY)?;
        let requeued = ready.join(message_name(delivery.redeliveries() + 1));
        fs::rename(inflight.join(delivery.tag()), requeued)?;
        Ok(())
    }

    fn recover(&self, queue: &str) -> Result<usize> {
        let inflight = self.declared_dir(queue, INFLIGHT)?;
        let ready = self.declared_dir(queue, READY)?;
        let mut moved = 0;
        for name in list_messages(&inflight)? {
            let target = ready.join(message_name(redeliveries_of(&name) + 1));
            match fs::rename(inflight.join(&name), target) {
                Ok(()) => moved += 1,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(moved)
    }
}
