use crate::exit::{HardExitRequest, RiskRules, TimeRegime};
use crate::logging::{agg_increment, log, log_fallback, obj, v_num, v_str, Domain, Level, Tally};
use crate::market::MarketView;
use crate::model::{
    one_cent_through, Action, ExposureSnapshot, Intent, IntentSpec, IntentType, SessionSnapshot,
};

use super::DecisionEngine;

pub(crate) struct DeriskPlan {
    pub intents: Vec<Intent>,
    pub fallback: bool,
}

/// Notional to shed to get from `current_pct` down to `target_pct`. Never negative.
pub fn reduction_notional(current_pct: f64, target_pct: f64, equity: f64) -> f64 {
    ((current_pct - target_pct) / 100.0 * equity).max(0.0)
}

/// Naive liquidation step: a chunk of the reduction taken from the largest
/// position, at least one share, never more than the position holds.
/// Fractional remainders under one share are never traded.
pub fn fallback_intent(
    exposure: &ExposureSnapshot,
    intent_type: IntentType,
    target_pct: f64,
    reduction: f64,
    chunk_fraction: f64,
) -> Option<Intent> {
    let pos = exposure.largest_tradable_position()?;
    let price = pos.price();
    if price <= 0.0 {
        return None;
    }
    let held = pos.quantity.abs().floor() as i64;
    let shares = ((chunk_fraction * reduction / price).floor() as i64).clamp(1, held);
    let action = Action::reducing(pos.quantity);
    let limit_price = match intent_type {
        IntentType::SoftDerisk => Some(one_cent_through(action, price)),
        _ => None,
    };
    Some(Intent::from_position(IntentSpec {
        intent_type,
        position: pos,
        action,
        quantity: shares,
        equity: exposure.equity,
        priority: intent_type.default_priority(),
        limit_price,
        reason: format!(
            "{}_fallback_target_{:.1}pct",
            intent_type.as_str().to_ascii_lowercase(),
            target_pct
        ),
    }))
}

impl DecisionEngine {
    /// HARD and CAP_RECOVERY try the exit engine first; SOFT and any
    /// planner failure or empty plan use the fallback heuristic.
    pub(crate) fn plan_derisk(
        &self,
        exposure: &ExposureSnapshot,
        session: &SessionSnapshot,
        intent_type: IntentType,
        target_pct: f64,
    ) -> DeriskPlan {
        let reduction = reduction_notional(exposure.gross_exposure_pct, target_pct, exposure.equity);
        let mode = intent_type.as_str();

        let chunk = if intent_type == IntentType::SoftDerisk {
            self.cfg.soft_chunk_fraction
        } else {
            let cause = match &self.exit {
                Some(exit) => {
                    let market = MarketView::collect(
                        self.market.as_ref(),
                        exposure
                            .positions
                            .iter()
                            .filter(|p| !p.is_flat())
                            .map(|p| p.symbol.as_str()),
                    );
                    let rules = RiskRules::from_config(&self.cfg, target_pct);
                    let request = HardExitRequest {
                        reduction_notional: reduction,
                        positions: &exposure.positions,
                        market: &market,
                        regime: TimeRegime::from_minutes(
                            session.minutes_to_close,
                            self.cfg.close_window_minutes,
                        ),
                        mode,
                        intent_type,
                        equity: exposure.equity,
                        rules: &rules,
                    };
                    match exit.plan_hard_derisk(&request) {
                        Ok(intents) if !intents.is_empty() => {
                            log(
                                Level::Info,
                                Domain::Exit,
                                "exit_plan",
                                obj(&[
                                    ("mode", v_str(mode)),
                                    ("intents", v_num(intents.len() as f64)),
                                    ("reduction_notional", v_num(reduction)),
                                ]),
                            );
                            return DeriskPlan {
                                intents,
                                fallback: false,
                            };
                        }
                        Ok(_) => "empty_plan".to_string(),
                        Err(e) => e.to_string(),
                    }
                }
                None => "no_exit_engine".to_string(),
            };
            log_fallback(mode, &cause, reduction);
            agg_increment(Tally::Fallback);
            self.cfg.hard_chunk_fraction
        };

        let intents: Vec<Intent> =
            fallback_intent(exposure, intent_type, target_pct, reduction, chunk)
                .into_iter()
                .collect();
        if intents.is_empty() {
            log(
                Level::Warn,
                Domain::Exit,
                "derisk_no_candidate",
                obj(&[("mode", v_str(mode)), ("positions", v_num(exposure.positions.len() as f64))]),
            );
        }
        DeriskPlan {
            intents,
            fallback: true,
        }
    }
}
