//! Hard exit planning for cap breaches and hard derisk.

use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::ExitPlanError;
use crate::market::MarketView;
use crate::model::{Action, Intent, IntentSpec, IntentType, Position};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TimeRegime {
    Late,
    Close,
}

impl TimeRegime {
    /// CLOSE inside the close window, LATE otherwise (including unknown).
    pub fn from_minutes(minutes_to_close: Option<f64>, close_window_minutes: f64) -> Self {
        match minutes_to_close {
            Some(m) if m <= close_window_minutes => TimeRegime::Close,
            _ => TimeRegime::Late,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TimeRegime::Late => "LATE",
            TimeRegime::Close => "CLOSE",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RiskRules {
    pub hard_cap_pct: f64,
    pub target_pct: f64,
    /// Largest slice of any one position taken per plan.
    pub max_position_fraction: f64,
    pub min_confidence: f64,
}

impl RiskRules {
    pub fn from_config(cfg: &Config, target_pct: f64) -> Self {
        Self {
            hard_cap_pct: cfg.hard_cap_pct,
            target_pct,
            max_position_fraction: cfg.exit_max_position_fraction,
            min_confidence: cfg.exit_min_confidence,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HardExitRequest<'a> {
    pub reduction_notional: f64,
    pub positions: &'a [Position],
    pub market: &'a MarketView,
    pub regime: TimeRegime,
    pub mode: &'a str,
    pub intent_type: IntentType,
    pub equity: f64,
    pub rules: &'a RiskRules,
}

pub trait HardExitEngine: Send {
    fn plan_hard_derisk(&self, request: &HardExitRequest<'_>) -> Result<Vec<Intent>, ExitPlanError>;
}

/// Greedy planner: biggest positions first, sized off the touch.
#[derive(Debug, Clone, Copy, Default)]
pub struct LiquidityExitPlanner;

impl HardExitEngine for LiquidityExitPlanner {
    fn plan_hard_derisk(&self, req: &HardExitRequest<'_>) -> Result<Vec<Intent>, ExitPlanError> {
        if !req.reduction_notional.is_finite() || req.reduction_notional < 0.0 {
            return Err(ExitPlanError::InvalidReduction(req.reduction_notional));
        }
        if req.reduction_notional == 0.0 {
            return Ok(vec![]);
        }

        let mut candidates: Vec<&Position> = req.positions.iter().filter(|p| !p.is_flat()).collect();
        candidates.sort_by(|a, b| b.abs_notional().total_cmp(&a.abs_notional()));

        let mut remaining = req.reduction_notional;
        let mut priced = 0usize;
        let mut intents = Vec::new();
        for pos in candidates {
            if remaining <= 0.0 {
                break;
            }
            let quote = match req.market.l1.get(&pos.symbol) {
                Some(q) if q.is_valid() => q,
                _ => continue,
            };
            priced += 1;
            let confidence = req.market.confidence.get(&pos.symbol).copied().unwrap_or(1.0);
            if confidence < req.rules.min_confidence {
                continue;
            }

            let action = Action::reducing(pos.quantity);
            let price = match action {
                Action::Sell => quote.bid,
                Action::Buy => quote.ask,
            };
            let size = pos.quantity.abs().floor() as i64;
            let slice = ((pos.quantity.abs() * req.rules.max_position_fraction).floor() as i64)
                .max(1)
                .min(size);
            let needed = (remaining / price).ceil() as i64;
            let qty = needed.min(slice);
            if qty <= 0 {
                continue;
            }
            remaining -= qty as f64 * price;

            let limit_price = match req.regime {
                TimeRegime::Close => None,
                TimeRegime::Late => Some((price * 100.0).round() / 100.0),
            };
            intents.push(Intent::from_position(IntentSpec {
                intent_type: req.intent_type,
                position: pos,
                action,
                quantity: qty,
                equity: req.equity,
                priority: req.intent_type.default_priority(),
                limit_price,
                reason: format!(
                    "{}_exit_{}_target_{:.1}pct",
                    req.mode.to_ascii_lowercase(),
                    req.regime.as_str().to_ascii_lowercase(),
                    req.rules.target_pct
                ),
            }));
        }

        if priced == 0 {
            return Err(ExitPlanError::NoMarketData);
        }
        Ok(intents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::L1Quote;
    use crate::model::Bucket;

    fn pos(symbol: &str, qty: f64, price: f64) -> Position {
        Position {
            symbol: symbol.to_string(),
            quantity: qty,
            avg_price: price,
            notional: qty * price,
            bucket: Bucket::Lt,
        }
    }

    fn rules() -> RiskRules {
        RiskRules::from_config(&Config::default(), 123.0)
    }

    fn view(quotes: &[(&str, f64, f64)]) -> MarketView {
        let mut v = MarketView::default();
        for (s, bid, ask) in quotes {
            v.l1.insert(
                s.to_string(),
                L1Quote { bid: *bid, ask: *ask, bid_size: 0.0, ask_size: 0.0 },
            );
        }
        v
    }

    fn request<'a>(
        reduction: f64,
        positions: &'a [Position],
        market: &'a MarketView,
        regime: TimeRegime,
        rules: &'a RiskRules,
    ) -> HardExitRequest<'a> {
        HardExitRequest {
            reduction_notional: reduction,
            positions,
            market,
            regime,
            mode: "CAP_RECOVERY",
            intent_type: IntentType::CapRecovery,
            equity: 1_000_000.0,
            rules,
        }
    }

    #[test]
    fn test_time_regime() {
        assert_eq!(TimeRegime::from_minutes(Some(2.0), 2.0), TimeRegime::Close);
        assert_eq!(TimeRegime::from_minutes(Some(2.5), 2.0), TimeRegime::Late);
        assert_eq!(TimeRegime::from_minutes(None, 2.0), TimeRegime::Late);
    }

    #[test]
    fn test_largest_first_and_sliced() {
        let positions = vec![pos("SMALL", 100.0, 10.0), pos("BIG", -1000.0, 50.0)];
        let market = view(&[("SMALL", 9.99, 10.01), ("BIG", 49.9, 50.1)]);
        let rules = rules();
        let intents = LiquidityExitPlanner
            .plan_hard_derisk(&request(30_000.0, &positions, &market, TimeRegime::Late, &rules))
            .unwrap();
        // BIG capped at half its size, rest from SMALL
        assert_eq!(intents[0].symbol, "BIG");
        assert_eq!(intents[0].action, Action::Buy);
        assert_eq!(intents[0].quantity, 500);
        assert_eq!(intents[0].limit_price, Some(50.1));
        assert_eq!(intents[1].symbol, "SMALL");
        assert_eq!(intents[1].action, Action::Sell);
        assert!(intents.iter().all(|i| i.intent_type == IntentType::CapRecovery));
        assert!(intents.iter().all(|i| !i.is_risk_increasing()));
    }

    #[test]
    fn test_close_regime_has_no_limit() {
        let positions = vec![pos("ABC", 1000.0, 40.0)];
        let market = view(&[("ABC", 39.9, 40.1)]);
        let rules = rules();
        let intents = LiquidityExitPlanner
            .plan_hard_derisk(&request(4_000.0, &positions, &market, TimeRegime::Close, &rules))
            .unwrap();
        assert_eq!(intents.len(), 1);
        assert_eq!(intents[0].limit_price, None);
        assert_eq!(intents[0].quantity, 101);
    }

    #[test]
    fn test_errors() {
        let positions = vec![pos("ABC", 1000.0, 40.0)];
        let empty = MarketView::default();
        let rules = rules();
        assert_eq!(
            LiquidityExitPlanner
                .plan_hard_derisk(&request(4_000.0, &positions, &empty, TimeRegime::Late, &rules))
                .unwrap_err(),
            ExitPlanError::NoMarketData
        );
        assert!(matches!(
            LiquidityExitPlanner
                .plan_hard_derisk(&request(-1.0, &positions, &empty, TimeRegime::Late, &rules)),
            Err(ExitPlanError::InvalidReduction(_))
        ));
        assert!(LiquidityExitPlanner
            .plan_hard_derisk(&request(0.0, &positions, &empty, TimeRegime::Late, &rules))
            .unwrap()
            .is_empty());
    }
}
