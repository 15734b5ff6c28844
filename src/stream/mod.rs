//! Durable per-topic streams with consumer-group delivery.
//!
//! Delivery is at-least-once: a message read by a consumer stays in that
//! consumer's pending list until acked, and `read_pending` hands it back
//! after a restart.

pub mod consumer;
pub mod memory;
pub mod sqlite;

use anyhow::Result;

pub use crate::events::Fields;
pub use consumer::{Batch, Consumer, Delivery};
pub use memory::MemoryEventLog;
pub use sqlite::SqliteEventLog;

#[derive(Debug, Clone, PartialEq)]
pub struct StreamMessage {
    pub message_id: String,
    pub data: Fields,
}

pub trait EventLog: Send + Sync {
    /// Creating a group that already exists is not an error.
    fn create_consumer_group(&self, topic: &str, group: &str) -> Result<()>;

    /// New messages for the group, blocking up to `block_ms` when none are ready.
    /// `block_ms == 0` returns immediately.
    fn read(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<StreamMessage>>;

    /// Messages already delivered to `consumer` but never acked, ids after `after`.
    fn read_pending(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        after: Option<&str>,
        count: usize,
    ) -> Result<Vec<StreamMessage>>;

    fn ack(&self, topic: &str, group: &str, message_id: &str) -> Result<()>;

    fn publish(&self, topic: &str, data: &Fields) -> Result<Option<String>>;
}

impl<T: EventLog + ?Sized> EventLog for std::sync::Arc<T> {
    fn create_consumer_group(&self, topic: &str, group: &str) -> Result<()> {
        (**self).create_consumer_group(topic, group)
    }

    fn read(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<StreamMessage>> {
        (**self).read(topic, group, consumer, count, block_ms)
    }

    fn read_pending(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        after: Option<&str>,
        count: usize,
    ) -> Result<Vec<StreamMessage>> {
        (**self).read_pending(topic, group, consumer, after, count)
    }

    fn ack(&self, topic: &str, group: &str, message_id: &str) -> Result<()> {
        (**self).ack(topic, group, message_id)
    }

    fn publish(&self, topic: &str, data: &Fields) -> Result<Option<String>> {
        (**self).publish(topic, data)
    }
}

/// Message ids are decimal sequence numbers; ordering compares them numerically.
pub(crate) fn parse_id(id: &str) -> Option<u64> {
    id.parse().ok()
}
