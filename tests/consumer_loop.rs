//! The consumer loop against real event logs: ordering, acking, restart
//! recovery and shutdown.

mod common;

use anyhow::{bail, Result};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use common::*;
use riskbrain::config::Config;
use riskbrain::engine::DecisionEngine;
use riskbrain::runner::Runner;
use riskbrain::storage::MemoryStateStore;
use riskbrain::stream::{EventLog, Fields, MemoryEventLog, SqliteEventLog, StreamMessage};

fn test_config() -> Config {
    log_to_tempdir();
    Config {
        read_block_ms: 0,
        idle_backoff_ms: 10,
        ..Config::default()
    }
}

fn runner(log: Arc<dyn EventLog>, cfg: &Config) -> Runner {
    let engine = DecisionEngine::builder(cfg.clone(), log.clone(), Arc::new(MemoryStateStore::new())).build();
    Runner::new(engine, log, cfg)
}

#[test]
fn exposure_then_session_in_one_pass() {
    let cfg = test_config();
    let log = Arc::new(MemoryEventLog::new());
    let mut runner = runner(log.clone(), &cfg);
    runner.start().unwrap();

    publish_session(log.as_ref(), &cfg.session_topic, &regular_session());
    publish_exposure(log.as_ref(), &cfg.exposure_topic, &single_long(132.0));

    assert_eq!(runner.run_once(), 2);
    let stats = runner.stats();
    assert_eq!(stats.processed, 2);
    assert_eq!(stats.failed, 0);

    // the session message completes the state and triggers the evaluation
    assert_eq!(log.len(&cfg.intents_topic), 1);
    assert_eq!(log.len(&cfg.control_topic), 1);
    assert_eq!(log.pending_count(&cfg.exposure_topic, &cfg.consumer_group), 0);
    assert_eq!(log.pending_count(&cfg.session_topic, &cfg.consumer_group), 0);
    assert_eq!(runner.engine().context().evaluations, 1);
}

#[test]
fn malformed_message_is_acked_and_counted() {
    let cfg = test_config();
    let log = Arc::new(MemoryEventLog::new());
    let mut runner = runner(log.clone(), &cfg);
    runner.start().unwrap();

    let mut bad = Fields::new();
    bad.insert("gross_exposure_pct".to_string(), "not-a-number".to_string());
    log.publish(&cfg.exposure_topic, &bad).unwrap();

    assert_eq!(runner.run_once(), 1);
    assert_eq!(runner.stats().failed, 1);
    assert_eq!(runner.stats().processed, 0);
    assert_eq!(log.pending_count(&cfg.exposure_topic, &cfg.consumer_group), 0);
    assert!(runner.engine().context().exposure.is_none());
}

#[test]
fn read_failure_is_counted_and_loop_continues() {
    let cfg = test_config();
    let log = Arc::new(MemoryEventLog::new());
    let mut runner = runner(log.clone(), &cfg);
    runner.start().unwrap();

    log.fail_next_reads(1);
    publish_session(log.as_ref(), &cfg.session_topic, &regular_session());
    runner.run_once();
    assert_eq!(runner.stats().read_errors, 1);

    // the session topic was still served
    assert_eq!(runner.stats().processed, 1);
    assert!(runner.engine().context().session.is_some());
}

#[test]
fn start_is_idempotent() {
    let cfg = test_config();
    let log = Arc::new(MemoryEventLog::new());
    let mut runner = runner(log.clone(), &cfg);
    runner.start().unwrap();
    runner.start().unwrap();
    assert_eq!(runner.run_once(), 0);
}

#[test]
fn stop_flag_ends_run() {
    let cfg = Config {
        read_block_ms: 20,
        ..test_config()
    };
    let log = Arc::new(MemoryEventLog::new());
    let mut runner = runner(log.clone(), &cfg);
    let stop = runner.stop_handle();

    let worker = std::thread::spawn(move || runner.run());
    publish_session(log.as_ref(), &cfg.session_topic, &regular_session());
    std::thread::sleep(Duration::from_millis(200));
    stop.store(true, Ordering::SeqCst);

    let stats = worker.join().unwrap().unwrap();
    assert_eq!(stats.processed, 1);
    assert_eq!(log.pending_count(&cfg.session_topic, &cfg.consumer_group), 0);
}

#[test]
fn unacked_messages_are_redelivered_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("events.sqlite");
    let path = path.to_str().unwrap();
    let cfg = test_config();

    {
        let log = SqliteEventLog::open(path).unwrap();
        log.create_consumer_group(&cfg.exposure_topic, &cfg.consumer_group)
            .unwrap();
        for gross in [90.0, 95.0, 100.0] {
            publish_exposure(&log, &cfg.exposure_topic, &single_long(gross));
        }
        // delivered to this consumer, then the process dies before acking
        let taken = log
            .read(&cfg.exposure_topic, &cfg.consumer_group, &cfg.consumer_name, 10, 0)
            .unwrap();
        assert_eq!(taken.len(), 3);
        assert_eq!(log.pending_count(&cfg.exposure_topic, &cfg.consumer_group).unwrap(), 3);
    }

    let log = Arc::new(SqliteEventLog::open(path).unwrap());
    publish_exposure(log.as_ref(), &cfg.exposure_topic, &single_long(105.0));
    let mut runner = runner(log.clone(), &cfg);
    runner.start().unwrap();

    assert_eq!(runner.run_once(), 3);
    assert_eq!(runner.stats().redelivered, 3);

    // recovery done; the fresh message follows
    assert_eq!(runner.run_once(), 1);
    assert_eq!(runner.stats().redelivered, 3);
    assert_eq!(runner.stats().processed, 4);
    assert_eq!(log.pending_count(&cfg.exposure_topic, &cfg.consumer_group).unwrap(), 0);

    let latest = runner.engine().context().exposure.as_ref().unwrap();
    assert_eq!(latest.gross_exposure_pct, 105.0);
}

/// Memory log whose reads on one topic always fail.
struct TopicDown {
    inner: MemoryEventLog,
    down: String,
}

impl EventLog for TopicDown {
    fn create_consumer_group(&self, topic: &str, group: &str) -> Result<()> {
        self.inner.create_consumer_group(topic, group)
    }

    fn read(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<StreamMessage>> {
        if topic == self.down {
            bail!("connection reset reading {}", topic);
        }
        self.inner.read(topic, group, consumer, count, block_ms)
    }

    fn read_pending(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        after: Option<&str>,
        count: usize,
    ) -> Result<Vec<StreamMessage>> {
        self.inner.read_pending(topic, group, consumer, after, count)
    }

    fn ack(&self, topic: &str, group: &str, message_id: &str) -> Result<()> {
        self.inner.ack(topic, group, message_id)
    }

    fn publish(&self, topic: &str, data: &Fields) -> Result<Option<String>> {
        self.inner.publish(topic, data)
    }
}

#[test]
fn broken_topic_trips_its_own_circuit() {
    let cfg = Config {
        circuit_threshold: 3,
        idle_backoff_ms: 60_000,
        ..test_config()
    };
    let log = Arc::new(TopicDown {
        inner: MemoryEventLog::new(),
        down: cfg.exposure_topic.clone(),
    });
    let mut runner = runner(log.clone(), &cfg);
    runner.start().unwrap();

    publish_session(log.as_ref(), &cfg.session_topic, &regular_session());
    for _ in 0..20 {
        runner.run_once();
    }

    // reads stop once the exposure circuit is open; session keeps flowing
    assert_eq!(runner.stats().read_errors, 3);
    assert!(runner.circuit(&cfg.exposure_topic).unwrap().is_open());
    assert!(!runner.circuit(&cfg.session_topic).unwrap().is_open());
    assert_eq!(runner.stats().processed, 1);
    assert!(runner.engine().context().session.is_some());
}
