//! Fire-and-forget reporting hooks driven by the engine.
//!
//! Implementations must swallow their own failures; nothing here returns a
//! `Result` because the engine never branches on reporting.

use std::sync::Arc;

use crate::model::{CapRecoveryEpisode, ExposureSnapshot, Intent, OperatingMode};

pub trait RegimeTransitionLogger: Send + Sync {
    fn record_transition(
        &self,
        from: OperatingMode,
        to: OperatingMode,
        reason: &str,
        exposure: &ExposureSnapshot,
    );
}

pub trait CapRecoveryTracker: Send + Sync {
    fn episode_opened(&self, episode: &CapRecoveryEpisode);
    fn episode_closed(&self, episode: &CapRecoveryEpisode, gross_pct: f64);

    /// Episode still open from a previous run, if the tracker persists them.
    fn recovered_episode(&self) -> Option<CapRecoveryEpisode> {
        None
    }
}

pub trait ArbitrationTracker: Send + Sync {
    fn log_arbitration(&self, input: &[Intent], output: &[Intent], gross_pct: f64, mode: &str);
}

/// Reporter that records nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopReporter;

impl RegimeTransitionLogger for NoopReporter {
    fn record_transition(&self, _: OperatingMode, _: OperatingMode, _: &str, _: &ExposureSnapshot) {}
}

impl CapRecoveryTracker for NoopReporter {
    fn episode_opened(&self, _: &CapRecoveryEpisode) {}
    fn episode_closed(&self, _: &CapRecoveryEpisode, _: f64) {}
}

impl ArbitrationTracker for NoopReporter {
    fn log_arbitration(&self, _: &[Intent], _: &[Intent], _: f64, _: &str) {}
}

impl<T: RegimeTransitionLogger + ?Sized> RegimeTransitionLogger for Arc<T> {
    fn record_transition(
        &self,
        from: OperatingMode,
        to: OperatingMode,
        reason: &str,
        exposure: &ExposureSnapshot,
    ) {
        (**self).record_transition(from, to, reason, exposure)
    }
}

impl<T: CapRecoveryTracker + ?Sized> CapRecoveryTracker for Arc<T> {
    fn episode_opened(&self, episode: &CapRecoveryEpisode) {
        (**self).episode_opened(episode)
    }

    fn episode_closed(&self, episode: &CapRecoveryEpisode, gross_pct: f64) {
        (**self).episode_closed(episode, gross_pct)
    }

    fn recovered_episode(&self) -> Option<CapRecoveryEpisode> {
        (**self).recovered_episode()
    }
}

impl<T: ArbitrationTracker + ?Sized> ArbitrationTracker for Arc<T> {
    fn log_arbitration(&self, input: &[Intent], output: &[Intent], gross_pct: f64, mode: &str) {
        (**self).log_arbitration(input, output, gross_pct, mode)
    }
}
