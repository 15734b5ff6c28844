//! Decision engine: snapshot state, mode state machine, intent generation
//! and publication.
//!
//! The engine owns an [`EngineContext`] and is driven one message at a
//! time; evaluations never overlap. Collaborators are trait objects so the
//! thresholds, band logic, exit planner and arbiter can be swapped.

mod correction;
mod derisk;
mod trim_phase;

pub use correction::drift_preferences;
pub use derisk::{fallback_intent, reduction_notional};

use serde_json::{json, Value};
use std::sync::Arc;

use crate::arbiter::{CapArbiter, IntentArbiter};
use crate::band::{BandController, ShareBandController};
use crate::config::{now_ts, Config};
use crate::error::EngineError;
use crate::events::{decode_exposure, decode_session, encode_intent, intent_id};
use crate::exit::{HardExitEngine, LiquidityExitPlanner};
use crate::logging::{
    agg_increment, log, log_intent_published, log_mode_transition, obj, ts_now, v_num, v_str,
    Domain, Level, ProfileScope, Tally,
};
use crate::market::{MarketData, StoreMarketData};
use crate::model::{
    mode_label, CapRecoveryEpisode, ExposureSnapshot, Intent, IntentType, OperatingMode,
    PublishedIntent, SessionSnapshot,
};
use crate::policy::{PolicyDecision, PolicyInput, PolicyTable, ThresholdPolicy};
use crate::report::{CapRecoveryTracker, NoopReporter, RegimeTransitionLogger};
use crate::signals::{ExecutionSignals, StreamCancelSignal};
use crate::storage::StateStore;
use crate::stream::{EventLog, StreamMessage};
use crate::trim::{MeanReversionTrim, TrimEngine};

pub const EXPOSURE_KEY: &str = "exposure";
pub const SESSION_KEY: &str = "session";
pub const DECISION_KEY: &str = "decision";

/// Everything the engine knows between evaluations.
#[derive(Debug, Clone)]
pub struct EngineContext {
    pub mode: OperatingMode,
    pub mode_reason: String,
    pub exposure: Option<ExposureSnapshot>,
    pub session: Option<SessionSnapshot>,
    /// Candidates for the current cycle only; empty between evaluations.
    pub pending_intents: Vec<Intent>,
    pub active_episode: Option<CapRecoveryEpisode>,
    pub evaluations: u64,
}

impl Default for EngineContext {
    fn default() -> Self {
        Self {
            mode: OperatingMode::Normal,
            mode_reason: "startup".to_string(),
            exposure: None,
            session: None,
            pending_intents: Vec::new(),
            active_episode: None,
            evaluations: 0,
        }
    }
}

/// What one completed evaluation did.
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationReport {
    pub mode: OperatingMode,
    pub reason: String,
    pub transitioned: bool,
    pub cap_breach: bool,
    pub cancel_signalled: bool,
    pub fallback_used: bool,
    pub episode_opened: bool,
    pub episode_closed: bool,
    pub candidates: usize,
    pub published: Vec<PublishedIntent>,
    pub publish_failures: usize,
}

impl EvaluationReport {
    fn new(decision: &PolicyDecision) -> Self {
        Self {
            mode: decision.mode,
            reason: decision.reason.clone(),
            transitioned: false,
            cap_breach: false,
            cancel_signalled: false,
            fallback_used: false,
            episode_opened: false,
            episode_closed: false,
            candidates: 0,
            published: Vec::new(),
            publish_failures: 0,
        }
    }
}

pub struct DecisionEngine {
    cfg: Config,
    ctx: EngineContext,
    events: Arc<dyn EventLog>,
    store: Arc<dyn StateStore>,
    policy: Box<dyn PolicyTable>,
    band: Box<dyn BandController>,
    trim: Box<dyn TrimEngine>,
    exit: Option<Box<dyn HardExitEngine>>,
    arbiter: Option<Box<dyn IntentArbiter>>,
    market: Arc<dyn MarketData>,
    signals: Box<dyn ExecutionSignals>,
    transitions: Arc<dyn RegimeTransitionLogger>,
    cap_tracker: Arc<dyn CapRecoveryTracker>,
}

pub struct EngineBuilder {
    cfg: Config,
    events: Arc<dyn EventLog>,
    store: Arc<dyn StateStore>,
    policy: Box<dyn PolicyTable>,
    band: Box<dyn BandController>,
    trim: Box<dyn TrimEngine>,
    exit: Option<Box<dyn HardExitEngine>>,
    arbiter: Option<Box<dyn IntentArbiter>>,
    market: Arc<dyn MarketData>,
    signals: Box<dyn ExecutionSignals>,
    transitions: Arc<dyn RegimeTransitionLogger>,
    cap_tracker: Arc<dyn CapRecoveryTracker>,
}

impl EngineBuilder {
    /// Default collaborators, all configured from `cfg`.
    pub fn new(cfg: Config, events: Arc<dyn EventLog>, store: Arc<dyn StateStore>) -> Self {
        Self {
            policy: Box::new(ThresholdPolicy::from_config(&cfg)),
            band: Box::new(ShareBandController::from_config(&cfg)),
            trim: Box::new(MeanReversionTrim::from_config(&cfg)),
            exit: Some(Box::new(LiquidityExitPlanner)),
            arbiter: Some(Box::new(CapArbiter::from_config(&cfg))),
            market: Arc::new(StoreMarketData::new(store.clone())),
            signals: Box::new(StreamCancelSignal::new(events.clone(), &cfg.control_topic)),
            transitions: Arc::new(NoopReporter),
            cap_tracker: Arc::new(NoopReporter),
            cfg,
            events,
            store,
        }
    }

    pub fn policy(mut self, policy: impl PolicyTable + 'static) -> Self {
        self.policy = Box::new(policy);
        self
    }

    pub fn band_controller(mut self, band: impl BandController + 'static) -> Self {
        self.band = Box::new(band);
        self
    }

    pub fn trim_engine(mut self, trim: impl TrimEngine + 'static) -> Self {
        self.trim = Box::new(trim);
        self
    }

    pub fn exit_engine(mut self, exit: Option<Box<dyn HardExitEngine>>) -> Self {
        self.exit = exit;
        self
    }

    pub fn arbiter(mut self, arbiter: Option<Box<dyn IntentArbiter>>) -> Self {
        self.arbiter = arbiter;
        self
    }

    pub fn market_data(mut self, market: Arc<dyn MarketData>) -> Self {
        self.market = market;
        self
    }

    pub fn signals(mut self, signals: impl ExecutionSignals + 'static) -> Self {
        self.signals = Box::new(signals);
        self
    }

    pub fn transition_logger(mut self, logger: Arc<dyn RegimeTransitionLogger>) -> Self {
        self.transitions = logger;
        self
    }

    pub fn cap_tracker(mut self, tracker: Arc<dyn CapRecoveryTracker>) -> Self {
        self.cap_tracker = tracker;
        self
    }

    /// Adopts an episode left open by a previous run, if the tracker has one.
    pub fn build(self) -> DecisionEngine {
        let mut ctx = EngineContext::default();
        if let Some(episode) = self.cap_tracker.recovered_episode() {
            log(
                Level::Warn,
                Domain::System,
                "cap_recovery_episode_adopted",
                obj(&[
                    ("episode_id", v_str(&episode.episode_id)),
                    ("opened_gross_pct", v_num(episode.opened_gross_pct)),
                ]),
            );
            ctx.active_episode = Some(episode);
        }
        DecisionEngine {
            cfg: self.cfg,
            ctx,
            events: self.events,
            store: self.store,
            policy: self.policy,
            band: self.band,
            trim: self.trim,
            exit: self.exit,
            arbiter: self.arbiter,
            market: self.market,
            signals: self.signals,
            transitions: self.transitions,
            cap_tracker: self.cap_tracker,
        }
    }
}

impl DecisionEngine {
    pub fn builder(cfg: Config, events: Arc<dyn EventLog>, store: Arc<dyn StateStore>) -> EngineBuilder {
        EngineBuilder::new(cfg, events, store)
    }

    pub fn context(&self) -> &EngineContext {
        &self.ctx
    }

    pub fn mode(&self) -> OperatingMode {
        self.ctx.mode
    }

    pub fn active_episode(&self) -> Option<&CapRecoveryEpisode> {
        self.ctx.active_episode.as_ref()
    }

    pub fn pending_intents(&self) -> &[Intent] {
        &self.ctx.pending_intents
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    /// Cap recovery target, taken from the arbiter when one is configured.
    pub fn cap_recovery_target(&self) -> f64 {
        self.arbiter
            .as_ref()
            .map(|a| a.cap_recovery_target())
            .unwrap_or(self.cfg.cap_recovery_target_pct)
    }

    pub fn process_exposure_event(
        &mut self,
        msg: &StreamMessage,
    ) -> Result<Option<EvaluationReport>, EngineError> {
        let snapshot = decode_exposure(&msg.data)?;
        self.mirror(EXPOSURE_KEY, serde_json::to_value(&snapshot).unwrap_or(Value::Null));
        self.ctx.exposure = Some(snapshot);
        self.evaluate(Some(&msg.message_id))
    }

    pub fn process_session_event(
        &mut self,
        msg: &StreamMessage,
    ) -> Result<Option<EvaluationReport>, EngineError> {
        let snapshot = decode_session(&msg.data)?;
        self.mirror(SESSION_KEY, serde_json::to_value(&snapshot).unwrap_or(Value::Null));
        self.ctx.session = Some(snapshot);
        self.evaluate(Some(&msg.message_id))
    }

    /// Run one evaluation against the latest snapshots.
    ///
    /// Returns `Ok(None)` until both an exposure and a session snapshot have
    /// been seen, or while equity is not positive. A policy failure aborts
    /// the cycle and leaves the current mode in place.
    pub fn evaluate(
        &mut self,
        source_message_id: Option<&str>,
    ) -> Result<Option<EvaluationReport>, EngineError> {
        let (exposure, session) = match (&self.ctx.exposure, &self.ctx.session) {
            (Some(e), Some(s)) => (e.clone(), s.clone()),
            _ => {
                log(
                    Level::Debug,
                    Domain::Mode,
                    "evaluation_skipped",
                    obj(&[
                        ("reason", v_str("partial_state")),
                        ("have_exposure", json!(self.ctx.exposure.is_some())),
                        ("have_session", json!(self.ctx.session.is_some())),
                    ]),
                );
                return Ok(None);
            }
        };
        if !exposure.has_valid_equity() {
            log(
                Level::Warn,
                Domain::Mode,
                "evaluation_skipped",
                obj(&[("reason", v_str("non_positive_equity")), ("equity", v_num(exposure.equity))]),
            );
            return Ok(None);
        }

        let _profile = ProfileScope::with_context(
            "evaluate",
            &[("message_id", source_message_id.map(v_str).unwrap_or(Value::Null))],
        );
        self.ctx.evaluations += 1;

        let gross = exposure.gross_exposure_pct;
        let input = PolicyInput::from_snapshots(&exposure, &session);
        let mut decision = self.policy.decide(&input).map_err(EngineError::Policy)?;
        if gross >= self.cfg.hard_cap_pct && decision.mode != OperatingMode::HardDerisk {
            log(
                Level::Warn,
                Domain::Mode,
                "hard_cap_override",
                obj(&[
                    ("policy_mode", v_str(decision.mode.as_str())),
                    ("policy_reason", v_str(&decision.reason)),
                    ("gross_pct", v_num(gross)),
                ]),
            );
            decision = PolicyDecision::new(OperatingMode::HardDerisk, "hard_cap_override");
        }

        let mut report = EvaluationReport::new(&decision);
        if decision.mode != self.ctx.mode {
            self.transition(&decision, &exposure, input.potential_pct);
            report.transitioned = true;
        }

        self.ctx.pending_intents.clear();

        let target = self.cap_recovery_target();
        match decision.mode {
            OperatingMode::HardDerisk => {
                if gross >= self.cfg.hard_cap_pct {
                    report.cap_breach = true;
                    report.cancel_signalled = self.signal_cancel(gross);
                    report.episode_opened = self.open_or_extend_episode(gross, target);
                    let plan = self.plan_derisk(&exposure, &session, IntentType::CapRecovery, target);
                    report.fallback_used = plan.fallback;
                    self.ctx.pending_intents.extend(plan.intents);
                } else {
                    let plan = self.plan_derisk(
                        &exposure,
                        &session,
                        IntentType::HardDerisk,
                        self.cfg.hard_target_pct,
                    );
                    report.fallback_used = plan.fallback;
                    self.ctx.pending_intents.extend(plan.intents);
                }
            }
            OperatingMode::SoftDerisk => {
                let plan = self.plan_derisk(
                    &exposure,
                    &session,
                    IntentType::SoftDerisk,
                    self.cfg.soft_limit_pct,
                );
                report.fallback_used = plan.fallback;
                self.ctx.pending_intents.extend(plan.intents);
            }
            OperatingMode::ThrottleNewOrders => {
                log(
                    Level::Info,
                    Domain::Mode,
                    "throttle_active",
                    obj(&[("reason", v_str(&decision.reason)), ("gross_pct", v_num(gross))]),
                );
            }
            OperatingMode::Normal => {
                if let Some(intent) = self.plan_band_correction(&exposure) {
                    self.ctx.pending_intents.push(intent);
                }
            }
        }

        if decision.mode != OperatingMode::HardDerisk {
            let trims = self.plan_trims(&exposure, &session);
            self.ctx.pending_intents.extend(trims);
        }

        if let Some(episode) = self.ctx.active_episode.as_mut() {
            if gross > episode.peak_gross_pct {
                episode.peak_gross_pct = gross;
            }
        }
        report.episode_closed = self.maybe_close_episode(gross, target);

        report.candidates = self.ctx.pending_intents.len();
        if !self.ctx.pending_intents.is_empty() {
            let label = mode_label(decision.mode, report.cap_breach);
            let (published, failures) = self.publish_pending(gross, label, source_message_id);
            report.published = published;
            report.publish_failures = failures;
        }
        Ok(Some(report))
    }

    fn transition(&mut self, decision: &PolicyDecision, exposure: &ExposureSnapshot, potential_pct: f64) {
        let from = self.ctx.mode;
        log_mode_transition(
            from.as_str(),
            decision.mode.as_str(),
            &decision.reason,
            exposure.gross_exposure_pct,
            potential_pct,
        );
        self.transitions
            .record_transition(from, decision.mode, &decision.reason, exposure);
        self.ctx.mode = decision.mode;
        self.ctx.mode_reason = decision.reason.clone();
        self.mirror(
            DECISION_KEY,
            json!({
                "mode": decision.mode.as_str(),
                "reason": decision.reason,
                "previous_mode": from.as_str(),
                "timestamp": ts_now(),
            }),
        );
    }

    fn signal_cancel(&self, gross: f64) -> bool {
        match self.signals.cancel_risk_increasing_orders("hard_cap_breach", gross) {
            Ok(()) => {
                log(
                    Level::Warn,
                    Domain::Mode,
                    "cancel_risk_increasing_signalled",
                    obj(&[("gross_pct", v_num(gross))]),
                );
                true
            }
            Err(e) => {
                log(
                    Level::Error,
                    Domain::Mode,
                    "cancel_signal_failed",
                    obj(&[("gross_pct", v_num(gross)), ("error", v_str(&e.to_string()))]),
                );
                false
            }
        }
    }

    /// Returns true when a new episode was opened.
    fn open_or_extend_episode(&mut self, gross: f64, target: f64) -> bool {
        if self.ctx.active_episode.is_some() {
            return false;
        }
        let opened_ts = now_ts();
        let episode = CapRecoveryEpisode {
            episode_id: format!("CR-{}-{}", opened_ts, self.ctx.evaluations),
            opened_ts,
            opened_gross_pct: gross,
            peak_gross_pct: gross,
            target_pct: target,
        };
        log(
            Level::Warn,
            Domain::Mode,
            "cap_recovery_opened",
            obj(&[
                ("episode_id", v_str(&episode.episode_id)),
                ("gross_pct", v_num(gross)),
                ("target_pct", v_num(target)),
            ]),
        );
        self.cap_tracker.episode_opened(&episode);
        self.ctx.active_episode = Some(episode);
        true
    }

    fn maybe_close_episode(&mut self, gross: f64, target: f64) -> bool {
        let below = match &self.ctx.active_episode {
            Some(_) => gross < target,
            None => false,
        };
        if !below {
            return false;
        }
        if let Some(episode) = self.ctx.active_episode.take() {
            log(
                Level::Info,
                Domain::Mode,
                "cap_recovery_closed",
                obj(&[
                    ("episode_id", v_str(&episode.episode_id)),
                    ("gross_pct", v_num(gross)),
                    ("peak_gross_pct", v_num(episode.peak_gross_pct)),
                ]),
            );
            self.cap_tracker.episode_closed(&episode, gross);
        }
        true
    }

    /// Arbitrate and publish this cycle's candidates. Leaves
    /// `pending_intents` empty whatever happens.
    fn publish_pending(
        &mut self,
        gross: f64,
        mode: &str,
        source_message_id: Option<&str>,
    ) -> (Vec<PublishedIntent>, usize) {
        let candidates = std::mem::take(&mut self.ctx.pending_intents);
        let selected = match &self.arbiter {
            Some(arbiter) => match arbiter.arbitrate(candidates.clone(), gross, mode) {
                Ok(out) => {
                    if let Some(tracker) = arbiter.tracker() {
                        tracker.log_arbitration(&candidates, &out, gross, mode);
                    }
                    log(
                        Level::Info,
                        Domain::Arbiter,
                        "arbitrated",
                        obj(&[
                            ("mode", v_str(mode)),
                            ("input", json!(candidates.len())),
                            ("output", json!(out.len())),
                            ("gross_pct", v_num(gross)),
                        ]),
                    );
                    out
                }
                Err(e) => {
                    log(
                        Level::Error,
                        Domain::Arbiter,
                        "arbiter_failed_publishing_unfiltered",
                        obj(&[("mode", v_str(mode)), ("error", v_str(&e.to_string()))]),
                    );
                    candidates
                }
            },
            None => candidates,
        };

        let topic = self.cfg.intents_topic.clone();
        let mut published = Vec::with_capacity(selected.len());
        let mut failures = 0;
        for (index, intent) in selected.into_iter().enumerate() {
            let record = PublishedIntent {
                intent_id: intent_id(source_message_id, index, &intent),
                source_message_id: source_message_id.map(str::to_string),
                mode: mode.to_string(),
                emitted_at: ts_now(),
                intent,
            };
            match self.events.publish(&topic, &encode_intent(&record)) {
                Ok(_) => {
                    log_intent_published(
                        &record.intent_id,
                        record.intent.intent_type.as_str(),
                        &record.intent.symbol,
                        record.intent.action.as_str(),
                        record.intent.quantity,
                        source_message_id,
                    );
                    agg_increment(Tally::Intent);
                    published.push(record);
                }
                Err(source) => {
                    failures += 1;
                    let err = EngineError::Publish {
                        topic: topic.clone(),
                        source,
                    };
                    log(
                        Level::Error,
                        Domain::Stream,
                        "intent_publish_failed",
                        obj(&[
                            ("intent_id", v_str(&record.intent_id)),
                            ("error", v_str(&err.to_string())),
                        ]),
                    );
                }
            }
        }
        (published, failures)
    }

    /// Observability only; a failed write never affects the evaluation.
    fn mirror(&self, key: &'static str, value: Value) {
        if let Err(source) = self.store.set_state(key, &value) {
            let err = EngineError::Store { key, source };
            log(
                Level::Warn,
                Domain::State,
                "state_mirror_failed",
                obj(&[("error", v_str(&err.to_string()))]),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{encode_exposure, encode_session};
    use crate::model::{Bucket, Position, Regime};
    use crate::storage::MemoryStateStore;
    use crate::stream::MemoryEventLog;
    use std::collections::BTreeMap;

    fn exposure(gross: f64) -> ExposureSnapshot {
        ExposureSnapshot {
            gross_exposure_pct: gross,
            equity: 1_000_000.0,
            open_orders_potential: 0.0,
            positions: vec![Position {
                symbol: "ABC".to_string(),
                quantity: 1000.0,
                avg_price: 0.0,
                notional: 40_000.0,
                bucket: Bucket::Lt,
            }],
            buckets: BTreeMap::new(),
        }
    }

    fn msg(id: &str, data: crate::events::Fields) -> StreamMessage {
        StreamMessage {
            message_id: id.to_string(),
            data,
        }
    }

    fn engine() -> (DecisionEngine, Arc<MemoryEventLog>, Arc<MemoryStateStore>) {
        let log = Arc::new(MemoryEventLog::new());
        let store = Arc::new(MemoryStateStore::new());
        let engine = DecisionEngine::builder(Config::default(), log.clone(), store.clone()).build();
        (engine, log, store)
    }

    #[test]
    fn test_session_only_is_noop() {
        let (mut engine, log, store) = engine();
        let session = SessionSnapshot {
            regime: Regime::Regular,
            minutes_to_close: Some(60.0),
        };
        let out = engine.process_session_event(&msg("1", encode_session(&session))).unwrap();
        assert!(out.is_none());
        assert_eq!(engine.mode(), OperatingMode::Normal);
        assert!(store.get_state(DECISION_KEY).unwrap().is_none());
        assert!(log.is_empty("intents"));
    }

    #[test]
    fn test_cap_breach_with_default_collaborators() {
        let (mut engine, log, _store) = engine();
        let session = SessionSnapshot {
            regime: Regime::Regular,
            minutes_to_close: Some(60.0),
        };
        engine.process_session_event(&msg("1", encode_session(&session))).unwrap();
        let report = engine
            .process_exposure_event(&msg("2", encode_exposure(&exposure(132.0))))
            .unwrap()
            .unwrap();

        assert_eq!(report.mode, OperatingMode::HardDerisk);
        assert!(report.cap_breach);
        assert!(report.cancel_signalled);
        assert!(report.episode_opened);
        // no quotes in the store, so the planner errors and the fallback runs
        assert!(report.fallback_used);
        assert_eq!(report.published.len(), 1);
        assert_eq!(report.published[0].intent.intent_type, IntentType::CapRecovery);
        assert_eq!(report.published[0].mode, "CAP_RECOVERY");
        assert_eq!(log.len("execution_control"), 1);
        assert_eq!(log.len("intents"), 1);
        assert!(engine.pending_intents().is_empty());
    }

    #[test]
    fn test_zero_equity_is_noop() {
        let (mut engine, log, _store) = engine();
        let session = SessionSnapshot {
            regime: Regime::Regular,
            minutes_to_close: None,
        };
        engine.process_session_event(&msg("1", encode_session(&session))).unwrap();
        let mut snap = exposure(150.0);
        snap.equity = 0.0;
        assert!(engine
            .process_exposure_event(&msg("2", encode_exposure(&snap)))
            .unwrap()
            .is_none());
        assert_eq!(engine.mode(), OperatingMode::Normal);
        assert!(log.is_empty("intents"));
    }

    #[test]
    fn test_malformed_exposure_errors_without_state_change() {
        let (mut engine, _log, _store) = engine();
        let mut bad = crate::events::Fields::new();
        bad.insert("equity".to_string(), "1000".to_string());
        let err = engine.process_exposure_event(&msg("1", bad)).unwrap_err();
        assert!(matches!(err, EngineError::Decode(_)));
        assert!(engine.context().exposure.is_none());
    }
}
