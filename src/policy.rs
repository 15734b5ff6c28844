use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::model::{Bucket, ExposureSnapshot, OperatingMode, Regime, SessionSnapshot};

/// Everything the decision table is allowed to look at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyInput {
    pub regime: Regime,
    pub gross_pct: f64,
    pub potential_pct: f64,
    pub lt_current_pct: f64,
    pub lt_potential_pct: f64,
    pub mm_current_pct: f64,
    pub mm_potential_pct: f64,
    pub minutes_to_close: Option<f64>,
}

impl PolicyInput {
    pub fn from_snapshots(exposure: &ExposureSnapshot, session: &SessionSnapshot) -> Self {
        let lt = exposure.bucket(Bucket::Lt);
        let mm = exposure.bucket(Bucket::Mm);
        Self {
            regime: session.regime,
            gross_pct: exposure.gross_exposure_pct,
            potential_pct: exposure.potential_exposure_pct(),
            lt_current_pct: lt.current_pct,
            lt_potential_pct: lt.potential_pct,
            mm_current_pct: mm.current_pct,
            mm_potential_pct: mm.potential_pct,
            minutes_to_close: session.minutes_to_close,
        }
    }

    fn check_finite(&self) -> Result<()> {
        let values = [
            ("gross_pct", self.gross_pct),
            ("potential_pct", self.potential_pct),
            ("lt_current_pct", self.lt_current_pct),
            ("lt_potential_pct", self.lt_potential_pct),
            ("mm_current_pct", self.mm_current_pct),
            ("mm_potential_pct", self.mm_potential_pct),
        ];
        for (name, v) in values {
            if !v.is_finite() {
                bail!("non-finite policy input {}: {}", name, v);
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub mode: OperatingMode,
    pub reason: String,
}

impl PolicyDecision {
    pub fn new(mode: OperatingMode, reason: &str) -> Self {
        Self {
            mode,
            reason: reason.to_string(),
        }
    }
}

/// Pure mapping from a risk snapshot to an operating mode.
///
/// Implementations must be deterministic and side-effect free; the engine
/// calls this on every evaluation.
pub trait PolicyTable: Send {
    fn decide(&self, input: &PolicyInput) -> Result<PolicyDecision>;
}

impl<F> PolicyTable for F
where
    F: Fn(&PolicyInput) -> Result<PolicyDecision> + Send,
{
    fn decide(&self, input: &PolicyInput) -> Result<PolicyDecision> {
        self(input)
    }
}

/// Threshold table, checked most severe first.
#[derive(Debug, Clone)]
pub struct ThresholdPolicy {
    pub hard_cap_pct: f64,
    pub soft_limit_pct: f64,
    pub throttle_pct: f64,
    pub late_gross_limit_pct: f64,
    pub close_window_minutes: f64,
    pub lt_potential_limit_pct: f64,
    pub mm_potential_limit_pct: f64,
}

impl Default for ThresholdPolicy {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl ThresholdPolicy {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            hard_cap_pct: cfg.hard_cap_pct,
            soft_limit_pct: cfg.soft_limit_pct,
            throttle_pct: cfg.throttle_pct,
            late_gross_limit_pct: cfg.late_gross_limit_pct,
            close_window_minutes: cfg.close_window_minutes,
            lt_potential_limit_pct: cfg.lt_potential_limit_pct,
            mm_potential_limit_pct: cfg.mm_potential_limit_pct,
        }
    }

    fn near_close(&self, input: &PolicyInput) -> bool {
        match input.regime {
            Regime::Close => true,
            Regime::Late => input
                .minutes_to_close
                .map(|m| m <= self.close_window_minutes)
                .unwrap_or(false),
            _ => false,
        }
    }
}

impl PolicyTable for ThresholdPolicy {
    fn decide(&self, input: &PolicyInput) -> Result<PolicyDecision> {
        input.check_finite()?;
        use OperatingMode::*;

        let decision = if input.gross_pct >= self.hard_cap_pct {
            PolicyDecision::new(HardDerisk, "gross_at_hard_cap")
        } else if input.potential_pct >= self.hard_cap_pct {
            PolicyDecision::new(HardDerisk, "potential_at_hard_cap")
        } else if input.gross_pct >= self.soft_limit_pct {
            PolicyDecision::new(SoftDerisk, "gross_above_soft_limit")
        } else if self.near_close(input) && input.gross_pct > self.late_gross_limit_pct {
            PolicyDecision::new(SoftDerisk, "late_session_gross")
        } else if input.potential_pct >= self.soft_limit_pct {
            PolicyDecision::new(ThrottleNewOrders, "potential_above_soft_limit")
        } else if input.gross_pct >= self.throttle_pct {
            PolicyDecision::new(ThrottleNewOrders, "gross_above_throttle")
        } else if input.lt_potential_pct >= self.lt_potential_limit_pct {
            PolicyDecision::new(ThrottleNewOrders, "lt_potential_limit")
        } else if input.mm_potential_pct >= self.mm_potential_limit_pct {
            PolicyDecision::new(ThrottleNewOrders, "mm_potential_limit")
        } else {
            PolicyDecision::new(Normal, "within_limits")
        };
        Ok(decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(gross: f64, potential: f64) -> PolicyInput {
        PolicyInput {
            regime: Regime::Regular,
            gross_pct: gross,
            potential_pct: potential,
            lt_current_pct: 0.0,
            lt_potential_pct: 0.0,
            mm_current_pct: 0.0,
            mm_potential_pct: 0.0,
            minutes_to_close: Some(120.0),
        }
    }

    #[test]
    fn test_threshold_ladder() {
        let p = ThresholdPolicy::default();
        assert_eq!(p.decide(&input(132.0, 132.0)).unwrap().mode, OperatingMode::HardDerisk);
        assert_eq!(
            p.decide(&input(100.0, 131.0)).unwrap().reason,
            "potential_at_hard_cap"
        );
        assert_eq!(p.decide(&input(121.0, 121.0)).unwrap().mode, OperatingMode::SoftDerisk);
        assert_eq!(
            p.decide(&input(112.0, 112.0)).unwrap().mode,
            OperatingMode::ThrottleNewOrders
        );
        assert_eq!(p.decide(&input(80.0, 80.0)).unwrap().mode, OperatingMode::Normal);
    }

    #[test]
    fn test_late_session_tightens() {
        let p = ThresholdPolicy::default();
        let mut i = input(107.0, 107.0);
        i.regime = Regime::Late;
        i.minutes_to_close = Some(1.5);
        assert_eq!(p.decide(&i).unwrap().reason, "late_session_gross");

        i.minutes_to_close = Some(30.0);
        assert_eq!(p.decide(&i).unwrap().mode, OperatingMode::Normal);

        i.regime = Regime::Close;
        i.minutes_to_close = None;
        assert_eq!(p.decide(&i).unwrap().mode, OperatingMode::SoftDerisk);
    }

    #[test]
    fn test_bucket_potential_throttles() {
        let p = ThresholdPolicy::default();
        let mut i = input(50.0, 50.0);
        i.mm_potential_pct = 61.0;
        assert_eq!(p.decide(&i).unwrap().reason, "mm_potential_limit");
    }

    #[test]
    fn test_decide_is_idempotent() {
        let p = ThresholdPolicy::default();
        let i = input(118.0, 125.0);
        assert_eq!(p.decide(&i).unwrap(), p.decide(&i).unwrap());
    }

    #[test]
    fn test_non_finite_input_errors() {
        let p = ThresholdPolicy::default();
        assert!(p.decide(&input(f64::NAN, 10.0)).is_err());
    }

    #[test]
    fn test_closure_policy() {
        let fixed = |_: &PolicyInput| -> Result<PolicyDecision> {
            Ok(PolicyDecision::new(OperatingMode::SoftDerisk, "fixed"))
        };
        assert_eq!(fixed.decide(&input(1.0, 1.0)).unwrap().reason, "fixed");
    }
}
