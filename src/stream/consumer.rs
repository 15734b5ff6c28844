use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;

use super::{EventLog, StreamMessage};

/// Acknowledges exactly one delivered message.
pub struct AckHandle {
    log: Arc<dyn EventLog>,
    topic: String,
    group: String,
    message_id: String,
}

impl AckHandle {
    pub fn ack(self) -> Result<()> {
        self.log.ack(&self.topic, &self.group, &self.message_id)
    }
}

pub struct Delivery {
    pub topic: String,
    pub message: StreamMessage,
    /// True when this came from the consumer's pending list after a restart.
    pub redelivered: bool,
    handle: AckHandle,
}

impl Delivery {
    pub fn message_id(&self) -> &str {
        &self.message.message_id
    }

    pub fn ack(self) -> Result<()> {
        self.handle.ack()
    }
}

/// One poll's worth of deliveries. Finite; dropping unacked items leaves
/// them pending for redelivery.
pub struct Batch {
    log: Arc<dyn EventLog>,
    topic: String,
    group: String,
    redelivered: bool,
    messages: std::vec::IntoIter<StreamMessage>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Iterator for Batch {
    type Item = Delivery;

    fn next(&mut self) -> Option<Delivery> {
        let message = self.messages.next()?;
        Some(Delivery {
            topic: self.topic.clone(),
            redelivered: self.redelivered,
            handle: AckHandle {
                log: self.log.clone(),
                topic: self.topic.clone(),
                group: self.group.clone(),
                message_id: message.message_id.clone(),
            },
            message,
        })
    }
}

/// A named member of a consumer group.
///
/// After `join`, each topic first drains this consumer's own pending entries
/// (walking them with a cursor), then switches to new messages.
pub struct Consumer {
    log: Arc<dyn EventLog>,
    group: String,
    name: String,
    count: usize,
    block_ms: u64,
    recovering: HashMap<String, Option<String>>,
}

impl Consumer {
    pub fn new(log: Arc<dyn EventLog>, group: &str, name: &str, count: usize, block_ms: u64) -> Self {
        Self {
            log,
            group: group.to_string(),
            name: name.to_string(),
            count: count.max(1),
            block_ms,
            recovering: HashMap::new(),
        }
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn join(&mut self, topics: &[&str]) -> Result<()> {
        for topic in topics {
            self.log.create_consumer_group(topic, &self.group)?;
            self.recovering.insert(topic.to_string(), None);
        }
        Ok(())
    }

    pub fn is_recovering(&self, topic: &str) -> bool {
        self.recovering.contains_key(topic)
    }

    pub fn poll(&mut self, topic: &str) -> Result<Batch> {
        if let Some(cursor) = self.recovering.get(topic).cloned() {
            let pending = self.log.read_pending(
                topic,
                &self.group,
                &self.name,
                cursor.as_deref(),
                self.count,
            )?;
            if let Some(last) = pending.last() {
                self.recovering
                    .insert(topic.to_string(), Some(last.message_id.clone()));
                return Ok(self.batch(topic, pending, true));
            }
            self.recovering.remove(topic);
        }
        let fresh = self
            .log
            .read(topic, &self.group, &self.name, self.count, self.block_ms)?;
        Ok(self.batch(topic, fresh, false))
    }

    fn batch(&self, topic: &str, messages: Vec<StreamMessage>, redelivered: bool) -> Batch {
        Batch {
            log: self.log.clone(),
            topic: topic.to_string(),
            group: self.group.clone(),
            redelivered,
            messages: messages.into_iter(),
        }
    }
}
