//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use anyhow::{bail, Result};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, Once};

use riskbrain::config::Config;
use riskbrain::engine::{DecisionEngine, EngineBuilder, EvaluationReport};
use riskbrain::error::ExitPlanError;
use riskbrain::events::{encode_exposure, encode_session};
use riskbrain::exit::{HardExitEngine, HardExitRequest};
use riskbrain::market::StaticMarketData;
use riskbrain::model::{
    Bucket, CapRecoveryEpisode, ExposureSnapshot, Intent, OperatingMode, Position, Regime,
    SessionSnapshot,
};
use riskbrain::policy::{PolicyDecision, PolicyInput};
use riskbrain::report::{CapRecoveryTracker, RegimeTransitionLogger};
use riskbrain::signals::ExecutionSignals;
use riskbrain::storage::MemoryStateStore;
use riskbrain::stream::{EventLog, MemoryEventLog, StreamMessage};

pub const EQUITY: f64 = 1_000_000.0;

/// Keep run logs out of the working tree. Must run before the first log record.
pub fn log_to_tempdir() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        if std::env::var_os("LOG_DIR").is_none() {
            std::env::set_var("LOG_DIR", std::env::temp_dir().join("riskbrain-test-runs"));
        }
    });
}

// ---------------------------------------------------------------------------
// Snapshots
// ---------------------------------------------------------------------------

pub fn lt(symbol: &str, qty: f64, price: f64) -> Position {
    Position {
        symbol: symbol.to_string(),
        quantity: qty,
        avg_price: price,
        notional: qty * price,
        bucket: Bucket::Lt,
    }
}

pub fn snapshot(gross: f64, positions: Vec<Position>) -> ExposureSnapshot {
    ExposureSnapshot {
        gross_exposure_pct: gross,
        equity: EQUITY,
        open_orders_potential: 0.0,
        positions,
        buckets: BTreeMap::new(),
    }
}

/// One LT long of 1000 shares at $40.
pub fn single_long(gross: f64) -> ExposureSnapshot {
    snapshot(gross, vec![lt("ABC", 1000.0, 40.0)])
}

/// LT book split 90% long, 10% short of equity.
pub fn skewed_book(gross: f64) -> ExposureSnapshot {
    snapshot(gross, vec![lt("LONG", 9000.0, 100.0), lt("SHRT", -1000.0, 100.0)])
}

pub fn regular_session() -> SessionSnapshot {
    SessionSnapshot {
        regime: Regime::Regular,
        minutes_to_close: Some(120.0),
    }
}

pub fn msg(id: &str, data: riskbrain::events::Fields) -> StreamMessage {
    StreamMessage {
        message_id: id.to_string(),
        data,
    }
}

pub fn publish_exposure(log: &dyn EventLog, topic: &str, snap: &ExposureSnapshot) -> String {
    log.publish(topic, &encode_exposure(snap))
        .unwrap()
        .unwrap_or_default()
}

pub fn publish_session(log: &dyn EventLog, topic: &str, snap: &SessionSnapshot) -> String {
    log.publish(topic, &encode_session(snap))
        .unwrap()
        .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Collaborators
// ---------------------------------------------------------------------------

pub fn fixed_policy(
    mode: OperatingMode,
) -> impl Fn(&PolicyInput) -> Result<PolicyDecision> + Send + 'static {
    move |_: &PolicyInput| -> Result<PolicyDecision> { Ok(PolicyDecision::new(mode, "fixed")) }
}

pub struct FailingExit;

impl HardExitEngine for FailingExit {
    fn plan_hard_derisk(&self, _: &HardExitRequest<'_>) -> Result<Vec<Intent>, ExitPlanError> {
        Err(ExitPlanError::Unavailable("planner offline".to_string()))
    }
}

#[derive(Clone, Default)]
pub struct RecordingSignals {
    pub calls: Arc<Mutex<Vec<(String, f64)>>>,
}

impl ExecutionSignals for RecordingSignals {
    fn cancel_risk_increasing_orders(&self, reason: &str, gross_pct: f64) -> Result<()> {
        self.calls.lock().unwrap().push((reason.to_string(), gross_pct));
        Ok(())
    }
}

pub struct BrokenSignals;

impl ExecutionSignals for BrokenSignals {
    fn cancel_risk_increasing_orders(&self, _: &str, _: f64) -> Result<()> {
        bail!("control topic unavailable")
    }
}

#[derive(Default)]
pub struct RecordingReporter {
    pub transitions: Mutex<Vec<(OperatingMode, OperatingMode, String)>>,
    pub opened: Mutex<Vec<CapRecoveryEpisode>>,
    pub closed: Mutex<Vec<(String, f64)>>,
    pub adopt: Option<CapRecoveryEpisode>,
}

impl RegimeTransitionLogger for RecordingReporter {
    fn record_transition(
        &self,
        from: OperatingMode,
        to: OperatingMode,
        reason: &str,
        _: &ExposureSnapshot,
    ) {
        self.transitions
            .lock()
            .unwrap()
            .push((from, to, reason.to_string()));
    }
}

impl CapRecoveryTracker for RecordingReporter {
    fn episode_opened(&self, episode: &CapRecoveryEpisode) {
        self.opened.lock().unwrap().push(episode.clone());
    }

    fn episode_closed(&self, episode: &CapRecoveryEpisode, gross_pct: f64) {
        self.closed
            .lock()
            .unwrap()
            .push((episode.episode_id.clone(), gross_pct));
    }

    fn recovered_episode(&self) -> Option<CapRecoveryEpisode> {
        self.adopt.clone()
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub struct Harness {
    pub log: Arc<MemoryEventLog>,
    pub store: Arc<MemoryStateStore>,
    pub cfg: Config,
    next_id: u64,
}

impl Harness {
    pub fn new() -> Self {
        log_to_tempdir();
        Self {
            log: Arc::new(MemoryEventLog::new()),
            store: Arc::new(MemoryStateStore::new()),
            cfg: Config::default(),
            next_id: 0,
        }
    }

    /// Builder with empty market data so no trims or exit plans fire unless asked.
    pub fn builder(&self) -> EngineBuilder {
        DecisionEngine::builder(self.cfg.clone(), self.log.clone(), self.store.clone())
            .market_data(Arc::new(StaticMarketData::new()))
    }

    fn next(&mut self) -> String {
        self.next_id += 1;
        format!("{}-0", self.next_id)
    }

    pub fn session(&mut self, engine: &mut DecisionEngine, snap: &SessionSnapshot) -> Option<EvaluationReport> {
        let id = self.next();
        engine
            .process_session_event(&msg(&id, encode_session(snap)))
            .unwrap()
    }

    pub fn exposure(&mut self, engine: &mut DecisionEngine, snap: &ExposureSnapshot) -> Option<EvaluationReport> {
        let id = self.next();
        engine
            .process_exposure_event(&msg(&id, encode_exposure(snap)))
            .unwrap()
    }

    /// Feed a regular session and then the exposure; returns the exposure's report.
    pub fn evaluate(&mut self, engine: &mut DecisionEngine, snap: &ExposureSnapshot) -> EvaluationReport {
        if engine.context().session.is_none() {
            self.session(engine, &regular_session());
        }
        self.exposure(engine, snap).expect("full state evaluates")
    }
}
