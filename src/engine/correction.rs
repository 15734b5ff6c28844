use crate::band::{BandInput, DriftKind};
use crate::logging::{log, obj, v_num, v_str, Domain, Level};
use crate::model::{
    one_cent_through, priority, Bucket, Direction, Effect, ExposureSnapshot, Intent, IntentSpec,
    IntentType, OrderClassification,
};

use super::DecisionEngine;

const fn lt(direction: Direction, effect: Effect) -> OrderClassification {
    OrderClassification::new(Bucket::Lt, direction, effect)
}

/// Preferred and avoided classifications for a drift.
///
/// Closing the crowded side ranks ahead of opening the thin one. At or above
/// the soft limit, corrections that would add gross are avoided outright.
pub fn drift_preferences(
    kind: DriftKind,
    gross_pct: f64,
    soft_limit_pct: f64,
) -> (Vec<OrderClassification>, Vec<OrderClassification>) {
    use Direction::*;
    use Effect::*;
    let (preferred, increasing) = match kind {
        DriftKind::ShortTooHigh => (vec![lt(Short, Decrease), lt(Long, Increase)], lt(Long, Increase)),
        DriftKind::ShortTooLow => (vec![lt(Short, Increase), lt(Long, Decrease)], lt(Short, Increase)),
        DriftKind::LongTooHigh => (vec![lt(Long, Decrease), lt(Short, Increase)], lt(Short, Increase)),
        DriftKind::LongTooLow => (vec![lt(Long, Increase), lt(Short, Decrease)], lt(Long, Increase)),
    };
    let avoided = if gross_pct >= soft_limit_pct {
        vec![increasing]
    } else {
        vec![]
    };
    (preferred, avoided)
}

impl DecisionEngine {
    /// At most one gentle LT correction per evaluation. Risk-increasing
    /// corrections that would land above the hard cap are dropped.
    pub(crate) fn plan_band_correction(&self, exposure: &ExposureSnapshot) -> Option<Intent> {
        let gross = exposure.gross_exposure_pct;
        let (long_pct, short_pct) = exposure.lt_side_pcts();
        let (kind, params) = self.band.check_band_drift(&BandInput {
            long_pct,
            short_pct,
            gross_pct: gross,
            positions: &exposure.positions,
            equity: exposure.equity,
        })?;

        let action = kind.action();
        let (preferred, avoided) = drift_preferences(kind, gross, self.cfg.soft_limit_pct);
        let position = match self
            .band
            .select_corrective_position(&exposure.positions, action, &preferred, &avoided)
        {
            Some(p) => p,
            None => {
                log(
                    Level::Debug,
                    Domain::Intent,
                    "band_no_candidate",
                    obj(&[("drift", v_str(kind.as_str()))]),
                );
                return None;
            }
        };

        let quantity = self
            .band
            .calculate_corrective_quantity(&position, &params, exposure.equity);
        if quantity <= 0 {
            return None;
        }

        let limit_price = if self.band.use_limit_orders() {
            Some(one_cent_through(action, position.price()))
        } else {
            None
        };
        let intent = Intent::from_position(IntentSpec {
            intent_type: IntentType::LtBandCorrective,
            position: &position,
            action,
            quantity,
            equity: exposure.equity,
            priority: priority::LT_BAND_CORRECTIVE,
            limit_price,
            reason: format!(
                "lt_band_{}_short_share_{:.3}",
                kind.as_str().to_ascii_lowercase(),
                params.short_share
            ),
        });

        if intent.is_risk_increasing() && gross + intent.risk_delta_gross_pct > self.cfg.hard_cap_pct {
            log(
                Level::Warn,
                Domain::Intent,
                "band_correction_rejected",
                obj(&[
                    ("symbol", v_str(&intent.symbol)),
                    ("drift", v_str(kind.as_str())),
                    ("gross_pct", v_num(gross)),
                    ("delta_pct", v_num(intent.risk_delta_gross_pct)),
                ]),
            );
            return None;
        }

        log(
            Level::Info,
            Domain::Intent,
            "band_correction",
            obj(&[
                ("symbol", v_str(&intent.symbol)),
                ("drift", v_str(kind.as_str())),
                ("classification", v_str(&intent.classification.to_string())),
                ("quantity", v_num(intent.quantity as f64)),
            ]),
        );
        Some(intent)
    }
}
