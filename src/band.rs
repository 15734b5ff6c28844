//! LT bucket long/short band.
//!
//! The LT book is kept inside a band on the short side's share of LT gross
//! and on LT long exposure as a percent of equity. Corrections are small:
//! a fraction of the deviation, capped per step.

use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::model::{Action, Bucket, OrderClassification, Position};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DriftKind {
    ShortTooHigh,
    ShortTooLow,
    LongTooHigh,
    LongTooLow,
}

impl DriftKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DriftKind::ShortTooHigh => "SHORT_TOO_HIGH",
            DriftKind::ShortTooLow => "SHORT_TOO_LOW",
            DriftKind::LongTooHigh => "LONG_TOO_HIGH",
            DriftKind::LongTooLow => "LONG_TOO_LOW",
        }
    }

    /// SHORT_TOO_HIGH and LONG_TOO_LOW buy; the other two sell.
    pub fn action(&self) -> Action {
        match self {
            DriftKind::ShortTooHigh | DriftKind::LongTooLow => Action::Buy,
            DriftKind::ShortTooLow | DriftKind::LongTooHigh => Action::Sell,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DriftParams {
    pub long_pct: f64,
    pub short_pct: f64,
    pub short_share: f64,
    /// How far outside the band, in percent of equity.
    pub deviation_pct: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct BandInput<'a> {
    pub long_pct: f64,
    pub short_pct: f64,
    pub gross_pct: f64,
    pub positions: &'a [Position],
    pub equity: f64,
}

pub trait BandController: Send {
    fn check_band_drift(&self, input: &BandInput<'_>) -> Option<(DriftKind, DriftParams)>;

    fn select_corrective_position(
        &self,
        positions: &[Position],
        action: Action,
        preferred: &[OrderClassification],
        avoided: &[OrderClassification],
    ) -> Option<Position>;

    fn calculate_corrective_quantity(&self, position: &Position, params: &DriftParams, equity: f64) -> i64;

    fn use_limit_orders(&self) -> bool;
}

#[derive(Debug, Clone)]
pub struct ShareBandController {
    pub min_short_share: f64,
    pub max_short_share: f64,
    pub min_long_pct: f64,
    pub max_long_pct: f64,
    pub gentleness: f64,
    pub max_step_fraction: f64,
    pub use_limit_orders: bool,
}

impl Default for ShareBandController {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl ShareBandController {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            min_short_share: cfg.band_min_short_share,
            max_short_share: cfg.band_max_short_share,
            min_long_pct: cfg.band_min_long_pct,
            max_long_pct: cfg.band_max_long_pct,
            gentleness: cfg.band_gentleness,
            max_step_fraction: cfg.band_max_step_fraction,
            use_limit_orders: cfg.band_use_limit_orders,
        }
    }
}

impl BandController for ShareBandController {
    fn check_band_drift(&self, input: &BandInput<'_>) -> Option<(DriftKind, DriftParams)> {
        let total = input.long_pct + input.short_pct;
        if !total.is_finite() || total <= 0.0 || input.equity <= 0.0 {
            return None;
        }
        let share = input.short_pct / total;
        let params = |deviation_pct: f64| DriftParams {
            long_pct: input.long_pct,
            short_pct: input.short_pct,
            short_share: share,
            deviation_pct,
        };

        if share < self.min_short_share {
            Some((DriftKind::ShortTooLow, params(self.min_short_share * total - input.short_pct)))
        } else if share > self.max_short_share {
            Some((DriftKind::ShortTooHigh, params(input.short_pct - self.max_short_share * total)))
        } else if input.long_pct > self.max_long_pct {
            Some((DriftKind::LongTooHigh, params(input.long_pct - self.max_long_pct)))
        } else if input.long_pct < self.min_long_pct {
            Some((DriftKind::LongTooLow, params(self.min_long_pct - input.long_pct)))
        } else {
            None
        }
    }

    fn select_corrective_position(
        &self,
        positions: &[Position],
        action: Action,
        preferred: &[OrderClassification],
        avoided: &[OrderClassification],
    ) -> Option<Position> {
        let mut candidates: Vec<(usize, &Position)> = positions
            .iter()
            .filter(|p| p.bucket == Bucket::Lt && !p.is_flat() && p.price() > 0.0)
            .filter_map(|p| {
                let class = OrderClassification::for_position(p, action);
                if avoided.contains(&class) {
                    return None;
                }
                let rank = preferred
                    .iter()
                    .position(|c| *c == class)
                    .unwrap_or(preferred.len());
                Some((rank, p))
            })
            .collect();
        candidates.sort_by(|a, b| {
            a.0.cmp(&b.0)
                .then_with(|| b.1.abs_notional().total_cmp(&a.1.abs_notional()))
                .then_with(|| a.1.symbol.cmp(&b.1.symbol))
        });
        candidates.first().map(|(_, p)| (*p).clone())
    }

    fn calculate_corrective_quantity(&self, position: &Position, params: &DriftParams, equity: f64) -> i64 {
        let price = position.price();
        if price <= 0.0 || equity <= 0.0 || params.deviation_pct <= 0.0 {
            return 0;
        }
        let notional = params.deviation_pct / 100.0 * equity * self.gentleness;
        let shares = (notional / price).floor() as i64;
        let step_cap = ((position.quantity.abs() * self.max_step_fraction).floor() as i64).max(1);
        shares.clamp(1, step_cap)
    }

    fn use_limit_orders(&self) -> bool {
        self.use_limit_orders
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Direction, Effect};

    fn lt(symbol: &str, qty: f64, price: f64) -> Position {
        Position {
            symbol: symbol.to_string(),
            quantity: qty,
            avg_price: price,
            notional: qty * price,
            bucket: Bucket::Lt,
        }
    }

    fn input(long: f64, short: f64) -> BandInput<'static> {
        BandInput {
            long_pct: long,
            short_pct: short,
            gross_pct: long + short,
            positions: &[],
            equity: 1_000_000.0,
        }
    }

    #[test]
    fn test_drift_detection() {
        let c = ShareBandController::default();
        let (kind, params) = c.check_band_drift(&input(36.0, 4.0)).unwrap();
        assert_eq!(kind, DriftKind::ShortTooLow);
        assert!((params.short_share - 0.1).abs() < 1e-9);
        assert!((params.deviation_pct - 4.0).abs() < 1e-9);

        assert_eq!(c.check_band_drift(&input(10.0, 20.0)).unwrap().0, DriftKind::ShortTooHigh);
        assert_eq!(c.check_band_drift(&input(90.0, 30.0)).unwrap().0, DriftKind::LongTooHigh);
        assert_eq!(c.check_band_drift(&input(6.0, 2.0)).unwrap().0, DriftKind::LongTooLow);
        assert!(c.check_band_drift(&input(30.0, 10.0)).is_none());
        assert!(c.check_band_drift(&input(0.0, 0.0)).is_none());
    }

    #[test]
    fn test_selection_prefers_classification_then_size() {
        let c = ShareBandController::default();
        let positions = vec![lt("BIG", 1000.0, 50.0), lt("SHORT", -100.0, 20.0), lt("SMALL", 10.0, 50.0)];
        let short_decrease = OrderClassification::new(Bucket::Lt, Direction::Short, Effect::Decrease);
        let picked = c
            .select_corrective_position(&positions, Action::Buy, &[short_decrease], &[])
            .unwrap();
        assert_eq!(picked.symbol, "SHORT");

        let picked = c
            .select_corrective_position(&positions, Action::Buy, &[], &[short_decrease])
            .unwrap();
        assert_eq!(picked.symbol, "BIG");
    }

    #[test]
    fn test_selection_skips_mm_and_flat() {
        let c = ShareBandController::default();
        let mut mm = lt("MM1", 500.0, 10.0);
        mm.bucket = Bucket::Mm;
        let positions = vec![mm, lt("FLAT", 0.0, 10.0)];
        assert!(c.select_corrective_position(&positions, Action::Sell, &[], &[]).is_none());
    }

    #[test]
    fn test_quantity_is_gentle_and_capped() {
        let c = ShareBandController::default();
        let pos = lt("ABC", 1000.0, 40.0);
        let params = DriftParams { long_pct: 36.0, short_pct: 4.0, short_share: 0.1, deviation_pct: 4.0 };
        // 4% of 1m * 0.25 = 10_000 / 40 = 250 shares, capped at 10% of 1000
        assert_eq!(c.calculate_corrective_quantity(&pos, &params, 1_000_000.0), 100);

        let tiny = DriftParams { deviation_pct: 0.0001, ..params };
        assert_eq!(c.calculate_corrective_quantity(&pos, &tiny, 1_000_000.0), 1);

        let none = DriftParams { deviation_pct: 0.0, ..params };
        assert_eq!(c.calculate_corrective_quantity(&pos, &none, 1_000_000.0), 0);
    }
}
