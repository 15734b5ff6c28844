use anyhow::{anyhow, bail, Result};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::{parse_id, EventLog, Fields, StreamMessage};

#[derive(Debug, Default)]
struct PendingEntry {
    consumer: String,
    deliveries: u32,
}

#[derive(Debug, Default)]
struct GroupState {
    last_delivered: u64,
    pending: BTreeMap<u64, PendingEntry>,
}

#[derive(Debug, Default)]
struct TopicState {
    next_id: u64,
    entries: BTreeMap<u64, Fields>,
    groups: HashMap<String, GroupState>,
}

/// In-process event log with the same group semantics as the sqlite one.
#[derive(Debug, Default)]
pub struct MemoryEventLog {
    topics: Mutex<HashMap<String, TopicState>>,
    published: Condvar,
    fail_reads: AtomicU32,
}

impl MemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, TopicState>>> {
        self.topics
            .lock()
            .map_err(|_| anyhow!("memory event log lock poisoned"))
    }

    /// Make the next `n` reads fail, for exercising read-failure handling.
    pub fn fail_next_reads(&self, n: u32) {
        self.fail_reads.store(n, Ordering::SeqCst);
    }

    pub fn messages(&self, topic: &str) -> Vec<StreamMessage> {
        let topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        topics
            .get(topic)
            .map(|t| {
                t.entries
                    .iter()
                    .map(|(id, data)| StreamMessage {
                        message_id: id.to_string(),
                        data: data.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn len(&self, topic: &str) -> usize {
        let topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        topics.get(topic).map(|t| t.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self, topic: &str) -> bool {
        self.len(topic) == 0
    }

    pub fn pending_count(&self, topic: &str, group: &str) -> usize {
        let topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        topics
            .get(topic)
            .and_then(|t| t.groups.get(group))
            .map(|g| g.pending.len())
            .unwrap_or(0)
    }

    fn take_new(
        topics: &mut HashMap<String, TopicState>,
        topic: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamMessage>> {
        let state = topics
            .get_mut(topic)
            .ok_or_else(|| anyhow!("no consumer group {} on {}", group, topic))?;
        let TopicState { entries, groups, .. } = state;
        let g = groups
            .get_mut(group)
            .ok_or_else(|| anyhow!("no consumer group {} on {}", group, topic))?;

        let mut out = Vec::new();
        for (id, data) in entries.range(g.last_delivered + 1..).take(count) {
            out.push(StreamMessage {
                message_id: id.to_string(),
                data: data.clone(),
            });
            g.pending.insert(
                *id,
                PendingEntry {
                    consumer: consumer.to_string(),
                    deliveries: 1,
                },
            );
            g.last_delivered = *id;
        }
        Ok(out)
    }
}

impl EventLog for MemoryEventLog {
    fn create_consumer_group(&self, topic: &str, group: &str) -> Result<()> {
        let mut topics = self.lock()?;
        topics
            .entry(topic.to_string())
            .or_default()
            .groups
            .entry(group.to_string())
            .or_default();
        Ok(())
    }

    fn read(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<StreamMessage>> {
        if self
            .fail_reads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            bail!("injected read failure on {}", topic);
        }

        let deadline = Instant::now() + Duration::from_millis(block_ms);
        let mut topics = self.lock()?;
        loop {
            let batch = Self::take_new(&mut topics, topic, group, consumer, count)?;
            if !batch.is_empty() {
                return Ok(batch);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(batch);
            }
            let (guard, _) = self
                .published
                .wait_timeout(topics, deadline - now)
                .map_err(|_| anyhow!("memory event log lock poisoned"))?;
            topics = guard;
        }
    }

    fn read_pending(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        after: Option<&str>,
        count: usize,
    ) -> Result<Vec<StreamMessage>> {
        let mut topics = self.lock()?;
        let state = topics
            .get_mut(topic)
            .ok_or_else(|| anyhow!("no consumer group {} on {}", group, topic))?;
        let TopicState { entries, groups, .. } = state;
        let g = groups
            .get_mut(group)
            .ok_or_else(|| anyhow!("no consumer group {} on {}", group, topic))?;

        let start = after.and_then(parse_id).map(|id| id + 1).unwrap_or(0);
        let mut out = Vec::new();
        for (id, entry) in g.pending.range_mut(start..) {
            if out.len() >= count {
                break;
            }
            if entry.consumer != consumer {
                continue;
            }
            // Entry may be gone if the topic was trimmed; skip it.
            if let Some(data) = entries.get(id) {
                entry.deliveries += 1;
                out.push(StreamMessage {
                    message_id: id.to_string(),
                    data: data.clone(),
                });
            }
        }
        Ok(out)
    }

    fn ack(&self, topic: &str, group: &str, message_id: &str) -> Result<()> {
        let id = parse_id(message_id).ok_or_else(|| anyhow!("bad message id {}", message_id))?;
        let mut topics = self.lock()?;
        if let Some(g) = topics.get_mut(topic).and_then(|t| t.groups.get_mut(group)) {
            g.pending.remove(&id);
        }
        Ok(())
    }

    fn publish(&self, topic: &str, data: &Fields) -> Result<Option<String>> {
        let mut topics = self.lock()?;
        let state = topics.entry(topic.to_string()).or_default();
        state.next_id += 1;
        let id = state.next_id;
        state.entries.insert(id, data.clone());
        drop(topics);
        self.published.notify_all();
        Ok(Some(id.to_string()))
    }
}
