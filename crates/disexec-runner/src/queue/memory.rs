use super::{Delivery, WorkQueue};
use disexec_core::{Error, Result};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

#[derive(Default)]
struct QueueState {
    durable: bool,
    ready: VecDeque<Message>,
    inflight: HashMap<String, Message>,
}

struct Message {
    body: Vec<u8>,
    redeliveries: u32,
}

/// In-process transport. Requeued messages go to the back so one failing
/// task cannot starve the rest.
#[derive(Default)]
pub struct MemoryQueue {
    queues: Mutex<BTreeMap<String, QueueState>>,
    next_tag: AtomicU64,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ready_len(&self, queue: &str) -> usize {
        self.lock()
            .ok()
            .and_then(|queues| queues.get(queue).map(|q| q.ready.len()))
            .unwrap_or(0)
    }

    pub fn inflight_len(&self, queue: &str) -> usize {
        self.lock()
            .ok()
            .and_then(|queues| queues.get(queue).map(|q| q.inflight.len()))
            .unwrap_or(0)
    }

    pub fn is_durable(&self, queue: &str) -> bool {
        self.lock()
            .ok()
            .and_then(|queues| queues.get(queue).map(|q| q.durable))
            .unwrap_or(false)
    }

    fn lock(&self) -> Result<MutexGuard<'_, BTreeMap<String, QueueState>>> {
        self.queues
            .lock()
            .map_err(|_| Error::QueueUnavailable("memory queue lock poisoned".to_string()))
    }
}

fn undeclared(queue: &str) -> Error {
    Error::QueueUnavailable(format!("queue '{}' is not declared", queue))
}

impl WorkQueue for MemoryQueue {
    fn declare(&self, queue: &str, durable: bool) -> Result<()> {
        let mut queues = self.lock()?;
        let state = queues.entry(queue.to_string()).or_default();
        state.durable |= durable;
        Ok(())
    }

    fn publish(&self, queue: &str, body: &[u8]) -> Result<()> {
        let mut queues = self.lock()?;
        let state = queues.get_mut(queue).ok_or_else(|| undeclared(queue))?;
        state.ready.push_back(Message {
            body: body.to_vec(),
            redeliveries: 0,
        });
        Ok(())
    }

    fn pull(&self, queue: &str) -> Result<Option<Delivery>> {
        let mut queues = self.lock()?;
        let state = queues.get_mut(queue).ok_or_else(|| undeclared(queue))?;
        let Some(message) = state.ready.pop_front() else {
            return Ok(None);
        };
        let tag = self.next_tag.fetch_add(1, Ordering::Relaxed).to_string();
        let delivery = Delivery::new(queue, tag.clone(), message.body.clone(), message.redeliveries);
        state.inflight.insert(tag, message);
        Ok(Some(delivery))
    }

    fn ack(&self, delivery: Delivery) -> Result<()> {
        let mut queues = self.lock()?;
        let state = queues
            .get_mut(delivery.queue())
            .ok_or_else(|| undeclared(delivery.queue()))?;
        state.inflight.remove(delivery.tag()).ok_or_else(|| {
            Error::QueueUnavailable(format!("unknown delivery tag {}", delivery.tag()))
        })?;
        Ok(())
    }

    fn nack(&self, delivery: Delivery) -> Result<()> {
        let mut queues = self.lock()?;
        let state = queues
            .get_mut(delivery.queue())
            .ok_or_else(|| undeclared(delivery.queue()))?;
        let mut message = state.inflight.remove(delivery.tag()).ok_or_else(|| {
            Error::QueueUnavailable(format!("unknown delivery tag {}", delivery.tag()))
        })?;
        message.redeliveries += 1;
        state.ready.push_back(message);
        Ok(())
    }

    fn recover(&self, queue: &str) -> Result<usize> {
        let mut queues = self.lock()?;
        let state = queues.get_mut(queue).ok_or_else(|| undeclared(queue))?;
        let count = state.inflight.len();
        let mut tags: Vec<String> = state.inflight.keys().cloned().collect();
        tags.sort_by_key(|t| t.parse::<u64>().unwrap_or(u64::MAX));
        for tag in tags {
            if let Some(mut message) = state.inflight.remove(&tag) {
                message.redeliveries += 1;
                state.ready.push_back(message);
            }
        }
        Ok(count)
    }
}
