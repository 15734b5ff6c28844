use anyhow::{anyhow, Result};
use serde_json::json;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use riskbrain::arbiter::CapArbiter;
use riskbrain::config::Config;
use riskbrain::engine::DecisionEngine;
use riskbrain::journal::Journal;
use riskbrain::logging::{json_log, obj, v_num, v_str};
use riskbrain::retry::{retry_async, RetryConfig};
use riskbrain::runner::Runner;
use riskbrain::storage::{SqliteStateStore, StateStore};
use riskbrain::stream::{EventLog, SqliteEventLog};

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::from_env();

    // The event log is the one dependency we cannot run without.
    let retry = RetryConfig::with_retries(cfg.startup_retries);
    let event_path = cfg.event_db_path.clone();
    let events: Arc<dyn EventLog> = Arc::new(
        retry_async(&retry, "open_event_log", || {
            let path = event_path.clone();
            async move { SqliteEventLog::open(&path) }
        })
        .await?,
    );

    let store = SqliteStateStore::new(&cfg.state_db_path)?;
    store.init()?;
    let store: Arc<dyn StateStore> = Arc::new(store);

    let journal = Arc::new(Journal::open(&cfg.journal_path)?);
    let recovery = Journal::recover(&cfg.journal_path)?;
    json_log(
        "journal_recovery",
        obj(&[
            ("path", v_str(&cfg.journal_path)),
            ("transitions", v_num(recovery.transitions as f64)),
            ("episodes_closed", v_num(recovery.episodes_closed as f64)),
            ("open_episode", json!(recovery.open_episode.as_ref().map(|e| e.episode_id.clone()))),
            ("skipped_lines", v_num(recovery.skipped_lines as f64)),
        ]),
    );

    let engine = DecisionEngine::builder(cfg.clone(), events.clone(), store)
        .arbiter(Some(Box::new(
            CapArbiter::from_config(&cfg).with_tracker(journal.clone()),
        )))
        .transition_logger(journal.clone())
        .cap_tracker(journal)
        .build();

    let mut runner = Runner::new(engine, events, &cfg);
    let stop = runner.stop_handle();

    json_log(
        "startup",
        obj(&[
            ("event_db", v_str(&cfg.event_db_path)),
            ("state_db", v_str(&cfg.state_db_path)),
            ("group", v_str(&cfg.consumer_group)),
            ("consumer", v_str(&cfg.consumer_name)),
            ("hard_cap_pct", v_num(cfg.hard_cap_pct)),
            ("cap_recovery_target_pct", v_num(cfg.cap_recovery_target_pct)),
        ]),
    );

    let mut worker = tokio::task::spawn_blocking(move || runner.run());

    let joined = tokio::select! {
        res = &mut worker => res,
        sig = tokio::signal::ctrl_c() => {
            sig?;
            json_log("shutdown", obj(&[("reason", v_str("ctrl_c"))]));
            stop.store(true, Ordering::SeqCst);
            worker.await
        }
    };

    let stats = joined.map_err(|e| anyhow!("consumer thread panicked: {}", e))??;
    json_log(
        "shutdown",
        obj(&[
            ("processed", v_num(stats.processed as f64)),
            ("failed", v_num(stats.failed as f64)),
            ("redelivered", v_num(stats.redelivered as f64)),
            ("read_errors", v_num(stats.read_errors as f64)),
        ]),
    );
    Ok(())
}
