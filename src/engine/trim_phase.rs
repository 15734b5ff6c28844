use crate::model::{Bucket, ExposureSnapshot, Intent, SessionSnapshot};
use crate::trim::TrimInput;

use super::DecisionEngine;

impl DecisionEngine {
    /// One trim request per non-flat LT position; whatever comes back is kept as-is.
    pub(crate) fn plan_trims(&self, exposure: &ExposureSnapshot, session: &SessionSnapshot) -> Vec<Intent> {
        let mut out = Vec::new();
        for position in exposure
            .positions
            .iter()
            .filter(|p| p.bucket == Bucket::Lt && !p.is_flat())
        {
            let input = TrimInput {
                position,
                equity: exposure.equity,
                l1: self.market.l1(&position.symbol),
                truth: self.market.truth(&position.symbol),
                regime: session.regime,
            };
            out.extend(self.trim.plan_trim(&input));
        }
        out
    }
}
