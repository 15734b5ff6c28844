//! The consumer loop around a [`DecisionEngine`].

use anyhow::Result;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::circuit::CircuitBreaker;
use crate::config::Config;
use crate::engine::DecisionEngine;
use crate::logging::{
    agg_increment, log, log_stream_error, obj, tick_aggregator, v_str, Domain, Level, Tally,
};
use crate::stream::{Consumer, Delivery, EventLog};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunStats {
    pub processed: u64,
    pub failed: u64,
    pub redelivered: u64,
    pub read_errors: u64,
    pub ack_errors: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TopicKind {
    Exposure,
    Session,
}

pub struct Runner {
    engine: DecisionEngine,
    consumer: Consumer,
    exposure_topic: String,
    session_topic: String,
    stop: Arc<AtomicBool>,
    /// Keyed by topic; failures on one topic never reset another.
    breakers: HashMap<String, CircuitBreaker>,
    idle_backoff: Duration,
    joined: bool,
    stats: RunStats,
}

impl Runner {
    pub fn new(engine: DecisionEngine, log: Arc<dyn EventLog>, cfg: &Config) -> Self {
        let idle_backoff = Duration::from_millis(cfg.idle_backoff_ms);
        Self {
            engine,
            consumer: Consumer::new(
                log,
                &cfg.consumer_group,
                &cfg.consumer_name,
                cfg.read_count,
                cfg.read_block_ms,
            ),
            exposure_topic: cfg.exposure_topic.clone(),
            session_topic: cfg.session_topic.clone(),
            stop: Arc::new(AtomicBool::new(false)),
            breakers: [&cfg.exposure_topic, &cfg.session_topic]
                .into_iter()
                .map(|t| (t.clone(), CircuitBreaker::new(cfg.circuit_threshold, idle_backoff)))
                .collect(),
            idle_backoff,
            joined: false,
            stats: RunStats::default(),
        }
    }

    /// Setting the flag ends `run` after the in-flight message.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    pub fn engine(&self) -> &DecisionEngine {
        &self.engine
    }

    pub fn stats(&self) -> RunStats {
        self.stats
    }

    pub fn circuit(&self, topic: &str) -> Option<&CircuitBreaker> {
        self.breakers.get(topic)
    }

    /// Join the consumer group on both topics. Idempotent.
    pub fn start(&mut self) -> Result<()> {
        if self.joined {
            return Ok(());
        }
        let topics = [self.exposure_topic.clone(), self.session_topic.clone()];
        let refs: Vec<&str> = topics.iter().map(String::as_str).collect();
        self.consumer.join(&refs)?;
        self.joined = true;
        log(
            Level::Info,
            Domain::System,
            "consumer_joined",
            obj(&[
                ("group", v_str(self.consumer.group())),
                ("consumer", v_str(self.consumer.name())),
                ("topics", json!(refs)),
            ]),
        );
        Ok(())
    }

    /// One pass: exposure, then session. Returns messages handled.
    pub fn run_once(&mut self) -> usize {
        let exposure = self.exposure_topic.clone();
        let session = self.session_topic.clone();
        self.drain_topic(&exposure, TopicKind::Exposure) + self.drain_topic(&session, TopicKind::Session)
    }

    pub fn run(&mut self) -> Result<RunStats> {
        self.start()?;
        while !self.stop.load(Ordering::SeqCst) {
            let handled = self.run_once();
            tick_aggregator();
            if handled == 0 && self.breakers.values().any(CircuitBreaker::is_open) {
                std::thread::sleep(self.idle_backoff);
            }
        }
        log(
            Level::Info,
            Domain::System,
            "consumer_stopped",
            obj(&[
                ("processed", json!(self.stats.processed)),
                ("failed", json!(self.stats.failed)),
                ("redelivered", json!(self.stats.redelivered)),
            ]),
        );
        Ok(self.stats)
    }

    fn drain_topic(&mut self, topic: &str, kind: TopicKind) -> usize {
        let Some(breaker) = self.breakers.get_mut(topic) else {
            return 0;
        };
        if !breaker.allow() {
            log(
                Level::Warn,
                Domain::Stream,
                "read_circuit_open",
                obj(&[("topic", v_str(topic)), ("failures", json!(breaker.failures))]),
            );
            return 0;
        }
        let batch = match self.consumer.poll(topic) {
            Ok(batch) => {
                breaker.record_success();
                batch
            }
            Err(e) => {
                breaker.record_failure();
                self.stats.read_errors += 1;
                log_stream_error(topic, "read", &e.to_string());
                return 0;
            }
        };

        let mut handled = 0;
        for delivery in batch {
            // the rest of the batch stays pending and comes back on restart
            if self.stop.load(Ordering::SeqCst) {
                break;
            }
            self.handle(delivery, kind);
            handled += 1;
        }
        handled
    }

    fn handle(&mut self, delivery: Delivery, kind: TopicKind) {
        if delivery.redelivered {
            self.stats.redelivered += 1;
            log(
                Level::Info,
                Domain::Stream,
                "redelivery",
                obj(&[
                    ("topic", v_str(&delivery.topic)),
                    ("message_id", v_str(delivery.message_id())),
                ]),
            );
        }

        let result = match kind {
            TopicKind::Exposure => self.engine.process_exposure_event(&delivery.message),
            TopicKind::Session => self.engine.process_session_event(&delivery.message),
        };
        agg_increment(Tally::Message);
        match result {
            Ok(_) => self.stats.processed += 1,
            Err(e) => {
                self.stats.failed += 1;
                agg_increment(Tally::Failure);
                log(
                    Level::Error,
                    Domain::Stream,
                    "message_failed",
                    obj(&[
                        ("topic", v_str(&delivery.topic)),
                        ("message_id", v_str(delivery.message_id())),
                        ("error", v_str(&e.to_string())),
                    ]),
                );
            }
        }

        // Acked even on failure: the next snapshot supersedes this one.
        let topic = delivery.topic.clone();
        if let Err(e) = delivery.ack() {
            self.stats.ack_errors += 1;
            log_stream_error(&topic, "ack", &e.to_string());
        }
    }
}
