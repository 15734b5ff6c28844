use crate::config::Config;
use crate::market::{L1Quote, TruthPrice};
use crate::model::{priority, Action, Bucket, Intent, IntentSpec, IntentType, Position, Regime};

#[derive(Debug, Clone, Copy)]
pub struct TrimInput<'a> {
    pub position: &'a Position,
    pub equity: f64,
    pub l1: Option<L1Quote>,
    pub truth: Option<TruthPrice>,
    pub regime: Regime,
}

/// Plans trims for a single LT position. Missing market data yields no trim.
pub trait TrimEngine: Send {
    fn plan_trim(&self, input: &TrimInput<'_>) -> Vec<Intent>;
}

/// Trims a slice of an LT position once the market is stretched away from
/// the truth price in the position's favour.
#[derive(Debug, Clone)]
pub struct MeanReversionTrim {
    pub stretch_pct: f64,
    pub fraction: f64,
}

impl Default for MeanReversionTrim {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl MeanReversionTrim {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            stretch_pct: cfg.trim_stretch_pct,
            fraction: cfg.trim_fraction,
        }
    }
}

impl TrimEngine for MeanReversionTrim {
    fn plan_trim(&self, input: &TrimInput<'_>) -> Vec<Intent> {
        let pos = input.position;
        if pos.bucket != Bucket::Lt || pos.is_flat() || input.regime == Regime::Closed {
            return vec![];
        }
        let (mid, truth) = match (input.l1.and_then(|q| q.mid()), input.truth) {
            (Some(mid), Some(t)) if t.price > 0.0 => (mid, t.price),
            _ => return vec![],
        };

        let stretch = (mid - truth) / truth * 100.0;
        let action = if pos.is_long() && stretch >= self.stretch_pct {
            Action::Sell
        } else if !pos.is_long() && stretch <= -self.stretch_pct {
            Action::Buy
        } else {
            return vec![];
        };

        let size = pos.quantity.abs();
        let qty = ((size * self.fraction).ceil() as i64).max(1).min(size.floor() as i64);
        if qty <= 0 {
            return vec![];
        }

        vec![Intent::from_position(IntentSpec {
            intent_type: IntentType::LtTrim,
            position: pos,
            action,
            quantity: qty,
            equity: input.equity,
            priority: priority::LT_TRIM,
            limit_price: Some((mid * 100.0).round() / 100.0),
            reason: format!("stretch_{:.2}pct_vs_truth", stretch),
        })]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pos(qty: f64) -> Position {
        Position {
            symbol: "ABC".to_string(),
            quantity: qty,
            avg_price: 40.0,
            notional: qty * 40.0,
            bucket: Bucket::Lt,
        }
    }

    fn quote(mid: f64) -> Option<L1Quote> {
        Some(L1Quote {
            bid: mid - 0.01,
            ask: mid + 0.01,
            bid_size: 100.0,
            ask_size: 100.0,
        })
    }

    #[test]
    fn test_stretched_long_trims() {
        let p = pos(1000.0);
        let intents = MeanReversionTrim::default().plan_trim(&TrimInput {
            position: &p,
            equity: 1_000_000.0,
            l1: quote(42.0),
            truth: Some(TruthPrice { price: 40.0 }),
            regime: Regime::Regular,
        });
        assert_eq!(intents.len(), 1);
        assert_eq!(intents[0].action, Action::Sell);
        assert_eq!(intents[0].quantity, 100);
        assert_eq!(intents[0].priority, priority::LT_TRIM);
        assert!(!intents[0].is_risk_increasing());
    }

    #[test]
    fn test_stretched_short_buys_back() {
        let p = pos(-5.0);
        let intents = MeanReversionTrim::default().plan_trim(&TrimInput {
            position: &p,
            equity: 1_000_000.0,
            l1: quote(38.0),
            truth: Some(TruthPrice { price: 40.0 }),
            regime: Regime::Late,
        });
        assert_eq!(intents.len(), 1);
        assert_eq!(intents[0].action, Action::Buy);
        assert_eq!(intents[0].quantity, 1);
    }

    #[test]
    fn test_missing_data_degrades() {
        let p = pos(1000.0);
        let engine = MeanReversionTrim::default();
        let base = TrimInput {
            position: &p,
            equity: 1_000_000.0,
            l1: None,
            truth: Some(TruthPrice { price: 40.0 }),
            regime: Regime::Regular,
        };
        assert!(engine.plan_trim(&base).is_empty());
        assert!(engine.plan_trim(&TrimInput { l1: quote(42.0), truth: None, ..base }).is_empty());
        assert!(engine
            .plan_trim(&TrimInput { l1: quote(42.0), regime: Regime::Closed, ..base })
            .is_empty());
    }

    #[test]
    fn test_unstretched_holds() {
        let p = pos(1000.0);
        let intents = MeanReversionTrim::default().plan_trim(&TrimInput {
            position: &p,
            equity: 1_000_000.0,
            l1: quote(40.5),
            truth: Some(TruthPrice { price: 40.0 }),
            regime: Regime::Regular,
        });
        assert!(intents.is_empty());
    }
}
