use anyhow::{bail, Result};
use std::collections::HashSet;
use std::sync::Arc;

use crate::config::Config;
use crate::model::Intent;
use crate::report::ArbitrationTracker;

pub const DEFAULT_CAP_RECOVERY_TARGET: f64 = 123.0;

/// Merges one evaluation's candidate intents into the set that gets published.
pub trait IntentArbiter: Send {
    fn arbitrate(&self, intents: Vec<Intent>, gross_pct: f64, mode: &str) -> Result<Vec<Intent>>;

    fn cap_recovery_target(&self) -> f64 {
        DEFAULT_CAP_RECOVERY_TARGET
    }

    fn tracker(&self) -> Option<&dyn ArbitrationTracker> {
        None
    }
}

/// Priority-ordered, one intent per symbol, never projected past the cap.
pub struct CapArbiter {
    hard_cap_pct: f64,
    cap_recovery_target: f64,
    tracker: Option<Arc<dyn ArbitrationTracker>>,
}

impl CapArbiter {
    pub fn new(hard_cap_pct: f64, cap_recovery_target: f64) -> Self {
        Self {
            hard_cap_pct,
            cap_recovery_target,
            tracker: None,
        }
    }

    pub fn from_config(cfg: &Config) -> Self {
        Self::new(cfg.hard_cap_pct, cfg.cap_recovery_target_pct)
    }

    pub fn with_tracker(mut self, tracker: Arc<dyn ArbitrationTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }
}

impl IntentArbiter for CapArbiter {
    fn arbitrate(&self, mut intents: Vec<Intent>, gross_pct: f64, mode: &str) -> Result<Vec<Intent>> {
        if !gross_pct.is_finite() {
            bail!("cannot arbitrate against non-finite gross {}", gross_pct);
        }
        let reducing_only = matches!(mode, "HARD_DERISK" | "CAP_RECOVERY");

        // stable: equal priorities keep generation order
        intents.sort_by(|a, b| b.priority.cmp(&a.priority));

        let mut seen = HashSet::new();
        let mut projected = gross_pct;
        let mut out = Vec::with_capacity(intents.len());
        for intent in intents {
            if reducing_only && intent.is_risk_increasing() {
                continue;
            }
            if !seen.insert(intent.symbol.clone()) {
                continue;
            }
            if intent.is_risk_increasing() && projected + intent.risk_delta_gross_pct > self.hard_cap_pct {
                continue;
            }
            projected += intent.risk_delta_gross_pct;
            out.push(intent);
        }
        Ok(out)
    }

    fn cap_recovery_target(&self) -> f64 {
        self.cap_recovery_target
    }

    fn tracker(&self) -> Option<&dyn ArbitrationTracker> {
        self.tracker.as_deref()
    }
}
